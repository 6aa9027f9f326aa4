//! Client-side core for live, resumable beach terminal sessions.
//!
//! A [`ConnectionRegistry`] multiplexes any number of UI subscribers onto one
//! transport per session, reconnects with bounded backoff when the transport
//! drops, attaches session credentials once, and keeps a row-addressed
//! [`GridStore`] consistent across reconnects and viewport resizes.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use beach_connect::config::RegistryConfig;
//! # use beach_connect::credentials::ReqwestCredentialApi;
//! # use beach_connect::registry::{ConnectionRegistry, ConnectionSnapshot};
//! # use beach_connect::session::ConnectParams;
//! # use beach_connect::transport::websocket::WebSocketConnector;
//! # async fn demo() -> anyhow::Result<()> {
//! let connector = WebSocketConnector::new("https://api.beach.sh")?;
//! let api = ReqwestCredentialApi::new()?;
//! let registry = ConnectionRegistry::new(RegistryConfig::default(), Arc::new(api), Arc::new(connector));
//!
//! let params = ConnectParams::new("pb-1", "2f1c0e4e-3d53-4a4c-9d0a-6f0f2f0ad8f1");
//! let subscription = registry.acquire(params.session_key(), params, |snapshot: &ConnectionSnapshot| {
//!     println!("{snapshot}");
//! });
//! subscription.ready().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod credentials;
pub mod grid;
pub mod listener;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod shared;
pub mod transport;

pub use grid::{GridSnapshot, GridStore, RowKind, TerminalRow};
pub use registry::{ConnectionRegistry, ConnectionSnapshot, ConnectionStatus, Subscription};
pub use session::{ConnectParams, SessionKey};
