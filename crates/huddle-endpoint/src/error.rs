use thiserror::Error;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("signaling setup failed: {0}")]
    Setup(String),
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("join rejected: {0}")]
    JoinRejected(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
}
