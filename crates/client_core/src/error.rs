use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("realtime connection is not established")]
    NotConnected,
    #[error("realtime connection closed")]
    Closed,
    #[error("failed to encode realtime request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures of the conversation command surface.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message has neither text nor audio")]
    EmptyMessage,
    #[error("media upload failed: {0:#}")]
    MediaUpload(anyhow::Error),
    #[error("local store failure: {0:#}")]
    Storage(anyhow::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
