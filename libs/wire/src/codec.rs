//! Payload codecs and the per-worker encode context.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::WireError;

/// Default scratch capacity for a fresh context.
const DEFAULT_SCRATCH: usize = 4 * 1024;

/// Scratch state owned by one worker and passed along its call path.
///
/// Frames and payloads are split off the front of the scratch buffer, so the
/// allocation is reused once earlier frames have been dropped.
#[derive(Debug)]
pub struct EncodeContext {
    scratch: BytesMut,
}

impl EncodeContext {
    /// Creates a context with the default scratch capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SCRATCH)
    }

    /// Creates a context with the given scratch capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            scratch: BytesMut::with_capacity(capacity),
        }
    }

    /// Mutable access to the scratch buffer.
    pub fn scratch(&mut self) -> &mut BytesMut {
        &mut self.scratch
    }
}

impl Default for EncodeContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialization of application payloads.
///
/// The core never looks inside payloads; codecs are chosen by applications.
pub trait PayloadCodec: Send + Sync + 'static {
    /// Encodes a value.
    fn encode<T: Serialize>(&self, value: &T, ctx: &mut EncodeContext) -> Result<Bytes, WireError>;

    /// Decodes a value.
    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, WireError>;
}

/// JSON payload codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T, ctx: &mut EncodeContext) -> Result<Bytes, WireError> {
        let buf = ctx.scratch();
        // Drop anything a failed encode left behind.
        buf.clear();
        serde_json::to_writer(buf.writer(), value).map_err(WireError::Encode)?;
        Ok(buf.split().freeze())
    }

    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, WireError> {
        serde_json::from_slice(payload).map_err(WireError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Move {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_json_codec() {
        let codec = JsonCodec;
        let mut ctx = EncodeContext::new();

        let first = codec.encode(&Move { x: 1, y: 2 }, &mut ctx).unwrap();
        let second = codec.encode(&Move { x: 3, y: 4 }, &mut ctx).unwrap();

        assert_eq!(&first[..], br#"{"x":1,"y":2}"#);
        let decoded: Move = codec.decode(&second).unwrap();
        assert_eq!(decoded, Move { x: 3, y: 4 });
    }

    #[test]
    fn test_json_codec_decode_error() {
        let result: Result<Move, _> = JsonCodec.decode(b"not json");
        assert!(matches!(result, Err(WireError::Decode(_))));
    }
}
