use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid token: {0}")]
    Invalid(String),
}

/// Identity used to authorize the push connection and API calls. The sync
/// client never validates or refreshes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    token: Arc<str>,
    user_id: Option<Arc<str>>,
}

impl Session {
    /// Opaque tokens are accepted as-is; a JWT additionally exposes its
    /// `sub` claim for logging.
    pub fn from_token(token: &str) -> Self {
        Self {
            token: Arc::from(token),
            user_id: decode_user_id(token).ok().map(Arc::from),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

pub trait SessionStore: Send + Sync {
    fn current(&self) -> Option<Session>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticSession(Option<Session>);

impl StaticSession {
    pub fn new(token: Option<&str>) -> Self {
        Self(token.filter(|t| !t.is_empty()).map(Session::from_token))
    }
}

impl SessionStore for StaticSession {
    fn current(&self) -> Option<Session> {
        self.0.clone()
    }
}

fn decode_user_id(token: &str) -> Result<String, SessionError> {
    let parts: Vec<&str> = token.splitn(3, '.').collect();
    if parts.len() != 3 {
        return Err(SessionError::Invalid("malformed JWT".into()));
    }

    let payload_bytes = base64_url_decode(parts[1])
        .map_err(|e| SessionError::Invalid(format!("base64 decode error: {e}")))?;

    let payload: serde_json::Value = serde_json::from_slice(&payload_bytes)
        .map_err(|e| SessionError::Invalid(format!("invalid JSON payload: {e}")))?;

    payload["sub"]
        .as_str()
        .filter(|sub| !sub.is_empty())
        .map(String::from)
        .ok_or_else(|| SessionError::Invalid("missing 'sub' claim".into()))
}

fn base64_url_decode(input: &str) -> Result<Vec<u8>, String> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    URL_SAFE_NO_PAD
        .decode(input)
        .map_err(|e| e.to_string())
}
