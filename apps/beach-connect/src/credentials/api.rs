use super::CredentialError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached,
    /// The manager reported the session as already attached (HTTP 409), or
    /// this gate already attached it.
    AlreadyAttached,
}

/// Viewer credential issued by the manager for a private beach session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ViewerCredential {
    pub credential_type: String,
    pub credential: String,
    #[serde(default)]
    pub passcode: Option<String>,
    #[serde(default)]
    pub expires_at_ms: Option<i64>,
}

#[async_trait]
pub trait CredentialApi: Send + Sync {
    async fn fetch_viewer_credential(
        &self,
        backend: &Url,
        scope: &str,
        session_id: &str,
        auth_token: &str,
    ) -> Result<ViewerCredential, CredentialError>;

    async fn attach_by_code(
        &self,
        backend: &Url,
        scope: &str,
        session_id: &str,
        code: &str,
        auth_token: &str,
    ) -> Result<AttachOutcome, CredentialError>;
}

#[derive(Debug, Serialize)]
struct AttachByCodeRequest<'a> {
    session_id: &'a str,
    code: &'a str,
}

/// Manager API client over HTTP.
#[derive(Clone)]
pub struct ReqwestCredentialApi {
    client: reqwest::Client,
}

impl ReqwestCredentialApi {
    pub fn new() -> Result<Self, CredentialError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()
            .map_err(|err| CredentialError::InvalidConfig(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CredentialApi for ReqwestCredentialApi {
    async fn fetch_viewer_credential(
        &self,
        backend: &Url,
        scope: &str,
        session_id: &str,
        auth_token: &str,
    ) -> Result<ViewerCredential, CredentialError> {
        let endpoint = endpoint(
            backend,
            &["private-beaches", scope, "sessions", session_id, "viewer-credential"],
        )?;
        let response = self
            .client
            .get(endpoint)
            .bearer_auth(auth_token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status));
        }
        let payload = response.json::<ViewerCredential>().await?;
        debug!(
            target = "connect::credentials",
            session_id,
            credential_type = %payload.credential_type,
            "viewer credential fetched"
        );
        Ok(payload)
    }

    async fn attach_by_code(
        &self,
        backend: &Url,
        scope: &str,
        session_id: &str,
        code: &str,
        auth_token: &str,
    ) -> Result<AttachOutcome, CredentialError> {
        let endpoint = endpoint(
            backend,
            &["private-beaches", scope, "sessions", "attach-by-code"],
        )?;
        let response = self
            .client
            .post(endpoint)
            .bearer_auth(auth_token)
            .json(&AttachByCodeRequest { session_id, code })
            .send()
            .await?;
        match response.status() {
            StatusCode::CONFLICT => Ok(AttachOutcome::AlreadyAttached),
            status if status.is_success() => Ok(AttachOutcome::Attached),
            status => Err(status_error(status)),
        }
    }
}

fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, CredentialError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| CredentialError::InvalidConfig(format!("backend url cannot be a base: {base}")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn status_error(status: StatusCode) -> CredentialError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            CredentialError::Unauthorized(status.as_u16())
        }
        StatusCode::NOT_FOUND => CredentialError::NotAvailable,
        other => CredentialError::Http(other.as_u16()),
    }
}

impl From<reqwest::Error> for CredentialError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            CredentialError::InvalidResponse(err.to_string())
        } else {
            CredentialError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    #[derive(Clone, Default)]
    struct ManagerState {
        attach_bodies: Arc<Mutex<Vec<Value>>>,
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            == Some("Bearer manager-token")
    }

    async fn viewer_credential(
        Path((scope, session_id)): Path<(String, String)>,
        headers: HeaderMap,
    ) -> impl IntoResponse {
        if !authorized(&headers) {
            return (AxumStatus::UNAUTHORIZED, Json(json!({}))).into_response();
        }
        match scope.as_str() {
            "pb-token" => Json(json!({
                "credential_type": "viewer_token",
                "credential": format!("token-for-{session_id}"),
                "session_id": session_id,
                "private_beach_id": scope,
                "issued_at_ms": 1,
                "expires_at_ms": 2,
                "passcode": null,
            }))
            .into_response(),
            "pb-garbage" => Json(json!({ "nope": true })).into_response(),
            _ => AxumStatus::NOT_FOUND.into_response(),
        }
    }

    async fn attach(
        State(state): State<ManagerState>,
        Path(_scope): Path<String>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        if !authorized(&headers) {
            return AxumStatus::FORBIDDEN;
        }
        let code = body["code"].as_str().unwrap_or_default().to_string();
        state.attach_bodies.lock().unwrap().push(body);
        match code.as_str() {
            "TAKEN1" => AxumStatus::CONFLICT,
            "BROKEN" => AxumStatus::INTERNAL_SERVER_ERROR,
            _ => AxumStatus::OK,
        }
    }

    async fn spawn_manager() -> (Url, ManagerState) {
        let state = ManagerState::default();
        let router = Router::new()
            .route(
                "/api/private-beaches/:scope/sessions/:session_id/viewer-credential",
                get(viewer_credential),
            )
            .route(
                "/api/private-beaches/:scope/sessions/attach-by-code",
                post(attach),
            )
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        let base = Url::parse(&format!("http://{addr}/api")).expect("base url");
        (base, state)
    }

    #[test_timeout::tokio_timeout_test]
    async fn fetches_viewer_token_with_bearer_auth() {
        let (base, _state) = spawn_manager().await;
        let api = ReqwestCredentialApi::new().unwrap();
        let credential = api
            .fetch_viewer_credential(&base, "pb-token", "sess-1", "manager-token")
            .await
            .unwrap();
        assert_eq!(credential.credential_type, "viewer_token");
        assert_eq!(credential.credential, "token-for-sess-1");
        assert_eq!(credential.passcode, None);
        assert_eq!(credential.expires_at_ms, Some(2));
    }

    #[test_timeout::tokio_timeout_test]
    async fn maps_fetch_failures() {
        let (base, _state) = spawn_manager().await;
        let api = ReqwestCredentialApi::new().unwrap();

        let err = api
            .fetch_viewer_credential(&base, "pb-token", "sess-1", "wrong")
            .await
            .unwrap_err();
        assert_eq!(err, CredentialError::Unauthorized(401));

        let err = api
            .fetch_viewer_credential(&base, "pb-unknown", "sess-1", "manager-token")
            .await
            .unwrap_err();
        assert_eq!(err, CredentialError::NotAvailable);

        let err = api
            .fetch_viewer_credential(&base, "pb-garbage", "sess-1", "manager-token")
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::InvalidResponse(_)), "{err:?}");
    }

    #[test_timeout::tokio_timeout_test]
    async fn attach_treats_conflict_as_success() {
        let (base, state) = spawn_manager().await;
        let api = ReqwestCredentialApi::new().unwrap();

        let fresh = api
            .attach_by_code(&base, "pb1", "sess-1", "ABC123", "manager-token")
            .await
            .unwrap();
        assert_eq!(fresh, AttachOutcome::Attached);

        let taken = api
            .attach_by_code(&base, "pb1", "sess-1", "TAKEN1", "manager-token")
            .await
            .unwrap();
        assert_eq!(taken, AttachOutcome::AlreadyAttached);

        let err = api
            .attach_by_code(&base, "pb1", "sess-1", "BROKEN", "manager-token")
            .await
            .unwrap_err();
        assert_eq!(err, CredentialError::Http(500));

        let bodies = state.attach_bodies.lock().unwrap().clone();
        assert_eq!(bodies.len(), 3);
        assert_eq!(bodies[0], json!({ "session_id": "sess-1", "code": "ABC123" }));
    }

    #[test_timeout::tokio_timeout_test]
    async fn unreachable_manager_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let base = Url::parse(&format!("http://{addr}/")).unwrap();
        let api = ReqwestCredentialApi::new().unwrap();
        let err = api
            .fetch_viewer_credential(&base, "pb1", "sess-1", "manager-token")
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::Network(_)), "{err:?}");
    }

    #[test]
    fn endpoint_appends_segments_to_base_path() {
        let base = Url::parse("https://manager.beach.sh/api/").unwrap();
        let url = endpoint(&base, &["private-beaches", "pb 1", "sessions", "attach-by-code"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://manager.beach.sh/api/private-beaches/pb%201/sessions/attach-by-code"
        );
    }
}
