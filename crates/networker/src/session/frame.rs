//! Frames exchanged on a peer session.

use bytes::Bytes;
use chainnet_net_transport::{CodecError, decode_frame, encode_frame};
use chainnet_primitives::DiscoveryKey;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum SessionFrame {
    /// Acceptor's admission decision, sent once right after the handshake.
    Verdict { accepted: bool },
    /// The sender has the topic configured and is ready to attach it.
    Open { topic: DiscoveryKey },
    /// The sender no longer has the topic configured.
    Close { topic: DiscoveryKey },
    /// Replication bytes for an attached topic.
    Data { topic: DiscoveryKey, payload: Vec<u8> },
    /// Stream-wide message on a named extension.
    Extension { name: String, payload: Vec<u8> },
}

impl SessionFrame {
    pub(crate) fn encode(&self, max_frame_size: usize) -> Result<Bytes, CodecError> {
        encode_frame(self, max_frame_size)
    }

    pub(crate) fn decode(frame: &[u8], max_frame_size: usize) -> Result<Self, CodecError> {
        decode_frame(frame, max_frame_size)
    }
}
