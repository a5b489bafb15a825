//! Frame codec: postcard encoding with an upper bound on frame size.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Default upper bound for a single frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Encode `message` into a single frame.
pub fn encode_frame<T: Serialize>(message: &T, max_frame_size: usize) -> Result<Bytes, CodecError> {
    let buf = postcard::to_allocvec(message).map_err(|e| CodecError::Malformed(e.to_string()))?;
    if buf.len() > max_frame_size {
        return Err(CodecError::FrameTooLarge {
            size: buf.len(),
            limit: max_frame_size,
        });
    }
    Ok(Bytes::from(buf))
}

/// Decode a single frame. Trailing bytes are rejected.
pub fn decode_frame<T: DeserializeOwned>(frame: &[u8], max_frame_size: usize) -> Result<T, CodecError> {
    if frame.len() > max_frame_size {
        return Err(CodecError::FrameTooLarge {
            size: frame.len(),
            limit: max_frame_size,
        });
    }
    let (message, rest) =
        postcard::take_from_bytes(frame).map_err(|e| CodecError::Malformed(e.to_string()))?;
    if !rest.is_empty() {
        return Err(CodecError::Malformed(format!(
            "{} trailing bytes",
            rest.len()
        )));
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    enum Msg {
        Ping(u64),
        Blob(Vec<u8>),
    }

    #[test]
    fn test_frame_too_large_on_encode() {
        let err = encode_frame(&Msg::Blob(vec![0; 64]), 16).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { limit: 16, .. }));
    }

    #[test]
    fn test_frame_too_large_on_decode() {
        let frame = encode_frame(&Msg::Blob(vec![0; 64]), DEFAULT_MAX_FRAME_SIZE).unwrap();
        let err = decode_frame::<Msg>(&frame, 8).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { limit: 8, .. }));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut frame = encode_frame(&Msg::Ping(1), DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .to_vec();
        frame.push(0);
        assert!(matches!(
            decode_frame::<Msg>(&frame, DEFAULT_MAX_FRAME_SIZE),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(decode_frame::<Msg>(&[0xff, 0xff, 0xff], DEFAULT_MAX_FRAME_SIZE).is_err());
    }

    proptest! {
        #[test]
        fn decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode_frame::<Msg>(&data, DEFAULT_MAX_FRAME_SIZE);
        }
    }
}
