use thiserror::Error;

/// The raw message could not be split into a header block and a body.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
    #[error("malformed header block: {0}")]
    Headers(String),
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("classifier returned status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("unparsable classifier response: {0}")]
    InvalidResponse(String),
    #[error("classifier did not answer within {0:?}")]
    Timeout(std::time::Duration),
    #[error("classifier unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Raised only while loading and validating configuration at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("missing credential: {0}")]
    MissingCredential(String),
}

/// Forwarding to the next hop failed.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid envelope address '{0}'")]
    Address(String),
    #[error("invalid envelope: {0}")]
    Envelope(#[from] lettre::error::Error),
    #[error("upstream SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}
