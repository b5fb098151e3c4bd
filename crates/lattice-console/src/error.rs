use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl ApiError {
    /// Message suitable for the operator; server error text is kept verbatim.
    pub fn operator_message(&self) -> String {
        match self {
            ApiError::NotFound(message) => message.clone(),
            ApiError::Rejected { message, .. } => message.clone(),
            ApiError::Transport(err) => format!("Master unreachable: {err}"),
            ApiError::Decode(err) => format!("Unexpected response from master: {err}"),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid master url '{value}': {reason}")]
    MasterUrl { value: String, reason: String },
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("invalid value for {key}: '{value}'")]
    InvalidEnv { key: &'static str, value: String },
}
