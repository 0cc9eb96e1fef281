use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("unknown stream kind: {0}")]
    UnknownStream(String),

    #[error("stream storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("event encode/decode failed: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("consumer {0} already registered")]
    DuplicateConsumer(String),

    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(String),
}
