use crate::codec::CodecError;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Handshake timed out")]
    Timeout,
    #[error("Connection closed")]
    Closed,
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Stream error: {0}")]
    Io(#[from] std::io::Error),
}
