//! Session credential resolution and idempotent attach-by-code.

mod api;

pub use api::{AttachOutcome, CredentialApi, ReqwestCredentialApi, ViewerCredential};

use crate::session::ConnectParams;
use crate::shared::SharedOperation;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("no credentials available for session")]
    MissingCredentials,
    #[error("manager rejected credentials (status {0})")]
    Unauthorized(u16),
    #[error("session is not available")]
    NotAvailable,
    #[error("unexpected http status {0}")]
    Http(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("unsupported credential type '{0}'")]
    UnsupportedCredentialType(String),
    #[error("invalid credential configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Passcode(String),
    ViewerToken(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedCredentials {
    pub passcode: Option<String>,
    pub viewer_token: Option<String>,
}

impl ResolvedCredentials {
    /// The credential a transport should present first.
    pub fn primary(&self) -> Option<Credential> {
        self.viewer_token
            .clone()
            .map(Credential::ViewerToken)
            .or_else(|| self.passcode.clone().map(Credential::Passcode))
    }
}

/// Digest identifying one (scope, session, passcode) attach.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AttachKey(String);

impl AttachKey {
    pub fn new(scope: &str, session_id: &str, passcode: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(scope.as_bytes());
        hasher.update([0u8]);
        hasher.update(session_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(passcode.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Keeps the digest out of logs.
impl fmt::Debug for AttachKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttachKey({}..)", &self.0[..8])
    }
}

type AttachOperation = SharedOperation<Result<AttachOutcome, CredentialError>>;

#[derive(Default)]
struct AttachGateState {
    last_attach_key: Option<AttachKey>,
    in_flight: Option<(AttachKey, AttachOperation)>,
}

/// Per-session memo that collapses repeated attach-by-code calls.
#[derive(Clone, Default)]
pub struct AttachGate {
    state: Arc<Mutex<AttachGateState>>,
}

impl AttachGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_attach_key(&self) -> Option<AttachKey> {
        self.state.lock().last_attach_key.clone()
    }

    pub fn is_attaching(&self) -> bool {
        self.state.lock().in_flight.is_some()
    }

    /// Run `start` unless `key` already attached or is attaching right now.
    pub async fn attach<F, Fut>(&self, key: AttachKey, start: F) -> Result<AttachOutcome, CredentialError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AttachOutcome, CredentialError>> + Send + 'static,
    {
        let operation = {
            let mut state = self.state.lock();
            if state.last_attach_key.as_ref() == Some(&key) {
                debug!(target = "connect::credentials", attach_key = ?key, "attach memoized");
                return Ok(AttachOutcome::AlreadyAttached);
            }
            match &state.in_flight {
                Some((pending, operation)) if *pending == key => operation.clone(),
                _ => {
                    let operation = SharedOperation::new(start());
                    state.in_flight = Some((key.clone(), operation.clone()));
                    operation
                }
            }
        };

        let result = operation.wait().await;

        let mut state = self.state.lock();
        if matches!(&state.in_flight, Some((_, current)) if current.ptr_eq(&operation)) {
            state.in_flight = None;
            if result.is_ok() {
                state.last_attach_key = Some(key);
            }
        }
        result
    }
}

/// Turns [`ConnectParams`] into credentials a transport can present.
#[derive(Clone)]
pub struct CredentialResolver {
    api: Arc<dyn CredentialApi>,
}

impl CredentialResolver {
    pub fn new(api: Arc<dyn CredentialApi>) -> Self {
        Self { api }
    }

    pub async fn resolve(
        &self,
        params: &ConnectParams,
        gate: &AttachGate,
    ) -> Result<ResolvedCredentials, CredentialError> {
        let auth_token = params.cleaned_auth_token();

        if !params.overrides.is_empty() {
            let resolved = ResolvedCredentials {
                passcode: params.overrides.cleaned_passcode(),
                viewer_token: params.overrides.cleaned_viewer_token(),
            };
            if let (Some(passcode), Some(backend), Some(token)) =
                (resolved.passcode.clone(), params.backend_url.clone(), auth_token)
            {
                let key = AttachKey::new(&params.scope, &params.session_id, &passcode);
                let api = self.api.clone();
                let scope = params.scope.clone();
                let session_id = params.session_id.clone();
                let outcome = gate
                    .attach(key, move || async move {
                        api.attach_by_code(&backend, &scope, &session_id, &passcode, &token)
                            .await
                    })
                    .await;
                match outcome {
                    Ok(outcome) => debug!(
                        target = "connect::credentials",
                        session_id = %params.session_id,
                        ?outcome,
                        "attach by code"
                    ),
                    Err(err) => warn!(
                        target = "connect::credentials",
                        session_id = %params.session_id,
                        error = %err,
                        "attach by code failed; continuing with override credentials"
                    ),
                }
            }
            return Ok(resolved);
        }

        let (Some(backend), Some(token)) = (params.backend_url.as_ref(), auth_token) else {
            return Err(CredentialError::MissingCredentials);
        };

        let credential = self
            .api
            .fetch_viewer_credential(backend, &params.scope, &params.session_id, &token)
            .await?;
        let value = credential.credential.trim().to_string();
        if value.is_empty() {
            return Err(CredentialError::InvalidResponse(
                "viewer credential is empty".into(),
            ));
        }
        match credential.credential_type.as_str() {
            "viewer_token" => Ok(ResolvedCredentials {
                passcode: credential
                    .passcode
                    .map(|code| code.trim().to_string())
                    .filter(|code| !code.is_empty()),
                viewer_token: Some(value),
            }),
            "viewer_passcode" | "passcode" => Ok(ResolvedCredentials {
                passcode: Some(value),
                viewer_token: None,
            }),
            other => Err(CredentialError::UnsupportedCredentialType(other.to_string())),
        }
    }
}
