use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub mod dom;
pub mod resolver;

pub use dom::{Document, Element, ElementId, Layout};
pub use resolver::{ResolverConfig, Target, TargetResolver, TargetRule};

pub const MAX_PUSH_MESSAGE_BYTES: usize = 16 * 1024;
pub const MAX_CODE_LEN: usize = 64;
pub const MAX_CLIENT_ID_LEN: usize = 128;
pub const DEFAULT_HTTP_SERVER_URL: &str = "http://127.0.0.1:8000";
const CHANNEL_PATH: &str = "/ws/";
const PUSH_PATH: &str = "/push/";

pub type ClientId = String;

/// Frames exchanged over the push channel, tagged by the JSON `type` field.
///
/// Tags this build does not know decode as [`PushMessage::Unknown`] so newer
/// servers can add message kinds without breaking older clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum PushMessage {
    #[serde(rename = "VERIFICATION_CODE")]
    VerificationCode { code: String },
    #[serde(rename = "PING")]
    Ping,
    #[serde(other)]
    Unknown,
}

/// Message sent from the background relay to the in-page agent of the active page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum PageMessage {
    #[serde(rename = "FILL_CODE")]
    FillCode { code: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub auth_token: String,
    pub server_url: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Connected,
    Disconnected,
}

impl LinkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkStatus::Connected => "connected",
            LinkStatus::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("verification code must not be empty")]
    EmptyCode,
    #[error("verification code exceeds {MAX_CODE_LEN} chars")]
    CodeTooLong,
    #[error("push message exceeds {MAX_PUSH_MESSAGE_BYTES} bytes")]
    MessageTooLarge,
    #[error("message kind cannot be sent on the wire")]
    UnsupportedMessage,
    #[error("client id must be non-empty and <= {MAX_CLIENT_ID_LEN} chars")]
    InvalidClientId,
    #[error("auth token must not be empty")]
    EmptyToken,
    #[error("invalid server url {url}: {reason}")]
    InvalidServerUrl { url: String, reason: String },
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub fn decode_push_message(raw: &str) -> Result<PushMessage, CoreError> {
    if raw.len() > MAX_PUSH_MESSAGE_BYTES {
        return Err(CoreError::MessageTooLarge);
    }

    let message: PushMessage =
        serde_json::from_str(raw).map_err(|err| CoreError::Serialization(err.to_string()))?;
    if let PushMessage::VerificationCode { code } = &message {
        validate_code(code)?;
    }
    Ok(message)
}

pub fn encode_push_message(message: &PushMessage) -> Result<String, CoreError> {
    if matches!(message, PushMessage::Unknown) {
        return Err(CoreError::UnsupportedMessage);
    }
    serde_json::to_string(message).map_err(|err| CoreError::Serialization(err.to_string()))
}

pub fn validate_code(code: &str) -> Result<(), CoreError> {
    let code = code.trim();
    if code.is_empty() {
        return Err(CoreError::EmptyCode);
    }
    if code.chars().count() > MAX_CODE_LEN {
        return Err(CoreError::CodeTooLong);
    }
    Ok(())
}

pub fn validate_client_id(client_id: &str) -> Result<(), CoreError> {
    let valid_chars = client_id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
    if client_id.is_empty() || client_id.len() > MAX_CLIENT_ID_LEN || !valid_chars {
        return Err(CoreError::InvalidClientId);
    }
    Ok(())
}

/// Builds `<serverUrl>/ws/<clientId>?token=<authToken>`.
pub fn channel_url(credentials: &Credentials, client_id: &str) -> Result<Url, CoreError> {
    validate_client_id(client_id)?;
    if credentials.auth_token.trim().is_empty() {
        return Err(CoreError::EmptyToken);
    }

    let base = credentials.server_url.trim().trim_end_matches('/');
    let raw = format!("{base}{CHANNEL_PATH}{client_id}");
    let mut url = Url::parse(&raw).map_err(|err| CoreError::InvalidServerUrl {
        url: credentials.server_url.clone(),
        reason: err.to_string(),
    })?;
    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err(CoreError::InvalidServerUrl {
            url: credentials.server_url.clone(),
            reason: "channel url must start with ws:// or wss://".to_owned(),
        });
    }

    url.query_pairs_mut()
        .append_pair("token", &credentials.auth_token);
    Ok(url)
}

/// Normalizes a user-entered HTTP server address: adds `http://` when no
/// scheme is given and strips trailing slashes.
pub fn normalize_http_base(input: &str) -> Result<String, CoreError> {
    let trimmed = input.trim();
    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_owned()
    } else {
        format!("http://{trimmed}")
    };
    let normalized = with_scheme.trim_end_matches('/').to_owned();

    let url = Url::parse(&normalized).map_err(|err| CoreError::InvalidServerUrl {
        url: input.to_owned(),
        reason: err.to_string(),
    })?;
    if url.host_str().is_none_or(str::is_empty) {
        return Err(CoreError::InvalidServerUrl {
            url: input.to_owned(),
            reason: "missing host".to_owned(),
        });
    }
    Ok(normalized)
}

/// Maps an HTTP base to the matching channel base (`http` → `ws`, `https` → `wss`).
pub fn channel_base_from_http(http_base: &str) -> String {
    if let Some(rest) = http_base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = http_base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        http_base.to_owned()
    }
}

pub fn push_endpoint(http_base: &str, username: &str) -> String {
    format!("{}{PUSH_PATH}{username}", http_base.trim_end_matches('/'))
}
