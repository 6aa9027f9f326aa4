//! Once-only asynchronous work shared between concurrent callers.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::future::Future;

/// Handle to a single in-flight operation.
///
/// Clones observe the same underlying future: it runs at most once, and every
/// handle resolves to a clone of its output. The future makes progress only
/// while some handle is polled, so owners usually spawn one driver task.
pub struct SharedOperation<T: Clone> {
    inner: Shared<BoxFuture<'static, T>>,
}

impl<T> SharedOperation<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            inner: future.boxed().shared(),
        }
    }

    /// The output, once the operation has completed.
    pub fn peek(&self) -> Option<&T> {
        self.inner.peek()
    }

    pub fn is_complete(&self) -> bool {
        self.peek().is_some()
    }

    /// Whether both handles refer to the same operation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.inner.ptr_eq(&other.inner)
    }

    pub async fn wait(&self) -> T {
        self.inner.clone().await
    }

    /// Drive the operation to completion on the runtime without awaiting it.
    pub fn spawn_driver(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.await;
        });
    }
}

impl<T: Clone> Clone for SharedOperation<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> fmt::Debug for SharedOperation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedOperation")
            .field("complete", &self.inner.peek().is_some())
            .finish()
    }
}
