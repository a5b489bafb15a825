//! Transport collaborators: framed duplex connections, the frame codec and the
//! authenticated handshake.

pub mod codec;
pub mod connection;
pub mod error;
pub mod handshake;

pub use codec::{CodecError, DEFAULT_MAX_FRAME_SIZE, decode_frame, encode_frame};
pub use connection::{FrameSink, FrameStream, FramedConnection};
pub use error::TransportError;
pub use handshake::{DEFAULT_HANDSHAKE_TIMEOUT, Handshake, Role, SecureConnection, SignedHandshake};
