use chainnet_net_discovery::DiscoveryError;
use chainnet_net_transport::{CodecError, TransportError};
use chainnet_primitives::{DiscoveryKey, KeyError, PublicKey};

pub type Result<T, E = NetworkerError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum NetworkerError {
    #[error("Invalid topic: {0}")]
    InvalidTopic(KeyError),
    #[error("Unknown encoding: {0}")]
    UnknownEncoding(String),
    #[error("Unknown peer: {0}")]
    UnknownPeer(PublicKey),
    #[error("Extension {0} is not registered")]
    UnknownExtension(String),
    #[error("Authentication rejected: {0}")]
    AuthenticationRejected(String),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("Payload does not fit {encoding} encoding: {reason}")]
    Encoding {
        encoding: &'static str,
        reason: String,
    },
    #[error("Channel closed for topic {0}")]
    ChannelClosed(DiscoveryKey),
    #[error("Duplicate connection to {0}")]
    DuplicateConnection(PublicKey),
    #[error("Remote declined the connection")]
    Declined,
    #[error("Networker closed")]
    Closed,
    #[error("Config error: {0}")]
    Config(String),
}

impl From<CodecError> for NetworkerError {
    fn from(err: CodecError) -> Self {
        Self::Transport(TransportError::Codec(err))
    }
}

impl From<std::io::Error> for NetworkerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(TransportError::Io(err))
    }
}
