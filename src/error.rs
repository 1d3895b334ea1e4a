use crate::models::Provider;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("{provider} authentication failed for account '{account}': {message}")]
    Auth {
        provider: Provider,
        account: String,
        message: String,
    },

    #[error("{provider} request failed with status {status}: {message}")]
    Upstream {
        provider: Provider,
        status: u16,
        message: String,
    },

    /// An SDK, transport or decoding failure with no HTTP status attached.
    #[error("{provider} request failed: {message}")]
    Request { provider: Provider, message: String },

    #[error("{provider} max retries exceeded after {attempts} attempts")]
    RetryExhausted { provider: Provider, attempts: u32 },

    #[error("all {attempted} accounts failed")]
    AllAccountsFailed { attempted: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Keyring(#[from] keyring::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),
}

impl AppError {
    pub fn request(provider: Provider, message: impl Into<String>) -> Self {
        AppError::Request {
            provider,
            message: message.into(),
        }
    }
}
