use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

/// Stable identity of a live connection.
///
/// Two UI mounts that derive the same key share one transport, so the key must
/// not depend on anything that changes across remounts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(scope: &str, session_id: &str) -> Self {
        Self(format!("{}:{}", scope.trim(), session_id.trim()))
    }

    pub fn with_credential_scope(self, credential_scope: &str) -> Self {
        let credential_scope = credential_scope.trim();
        if credential_scope.is_empty() {
            return self;
        }
        Self(format!("{}:{credential_scope}", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Credentials supplied by the caller that bypass the viewer credential fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialOverride {
    pub passcode: Option<String>,
    pub viewer_token: Option<String>,
}

impl CredentialOverride {
    pub fn passcode(code: impl Into<String>) -> Self {
        Self {
            passcode: Some(code.into()),
            viewer_token: None,
        }
    }

    pub fn viewer_token(token: impl Into<String>) -> Self {
        Self {
            passcode: None,
            viewer_token: Some(token.into()),
        }
    }

    /// Trimmed, non-empty passcode.
    pub fn cleaned_passcode(&self) -> Option<String> {
        clean(self.passcode.as_deref())
    }

    pub fn cleaned_viewer_token(&self) -> Option<String> {
        clean(self.viewer_token.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.cleaned_passcode().is_none() && self.cleaned_viewer_token().is_none()
    }

    /// Short digest distinguishing connections opened with different overrides.
    fn scope_digest(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let mut hasher = Sha256::new();
        hasher.update(self.cleaned_passcode().unwrap_or_default().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.cleaned_viewer_token().unwrap_or_default().as_bytes());
        let digest = hex::encode(hasher.finalize());
        Some(format!("ovr-{}", &digest[..12]))
    }
}

/// Everything needed to resolve credentials and open a transport for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    /// Private beach the session belongs to.
    pub scope: String,
    pub session_id: String,
    /// Manager base url used for credential fetch and attach-by-code.
    pub backend_url: Option<Url>,
    pub auth_token: Option<String>,
    pub overrides: CredentialOverride,
    pub label: Option<String>,
}

impl ConnectParams {
    pub fn new(scope: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            session_id: session_id.into(),
            backend_url: None,
            auth_token: None,
            overrides: CredentialOverride::default(),
            label: None,
        }
    }

    pub fn with_backend(mut self, backend_url: Url, auth_token: Option<String>) -> Self {
        self.backend_url = Some(backend_url);
        self.auth_token = auth_token;
        self
    }

    pub fn with_overrides(mut self, overrides: CredentialOverride) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn cleaned_auth_token(&self) -> Option<String> {
        clean(self.auth_token.as_deref())
    }

    pub fn session_key(&self) -> SessionKey {
        let key = SessionKey::new(&self.scope, &self.session_id);
        match self.overrides.scope_digest() {
            Some(scope) => key.with_credential_scope(&scope),
            None => key,
        }
    }
}

fn clean(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_without_overrides_is_scope_and_session() {
        let params = ConnectParams::new("pb1", "sess1");
        assert_eq!(params.session_key().as_str(), "pb1:sess1");
        assert_eq!(SessionKey::from("pb1:sess1"), params.session_key());
    }

    #[test]
    fn key_is_stable_across_auth_token_refresh() {
        let backend = Url::parse("http://manager.test/").unwrap();
        let first = ConnectParams::new("pb1", "sess1").with_backend(backend.clone(), Some("a".into()));
        let second = ConnectParams::new("pb1", "sess1").with_backend(backend, Some("b".into()));
        assert_eq!(first.session_key(), second.session_key());
    }

    #[test]
    fn distinct_overrides_get_distinct_keys() {
        let a = ConnectParams::new("pb1", "sess1").with_overrides(CredentialOverride::passcode("ABC123"));
        let b = ConnectParams::new("pb1", "sess1").with_overrides(CredentialOverride::passcode("XYZ789"));
        let plain = ConnectParams::new("pb1", "sess1");
        assert_ne!(a.session_key(), b.session_key());
        assert_ne!(a.session_key(), plain.session_key());
        assert!(a.session_key().as_str().starts_with("pb1:sess1:ovr-"));
    }

    #[test]
    fn blank_overrides_are_ignored() {
        let params = ConnectParams::new("pb1", "sess1").with_overrides(CredentialOverride::passcode("   "));
        assert!(params.overrides.is_empty());
        assert_eq!(params.session_key().as_str(), "pb1:sess1");
    }
}
