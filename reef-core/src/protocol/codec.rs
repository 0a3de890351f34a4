//! Codec implementation for framed KV protocol I/O.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::frame::KvFrame;
use crate::error::CoreError;

/// Codec for encoding and decoding KV protocol frames.
///
/// Implements the `tokio_util::codec::{Encoder, Decoder}` traits for use
/// with tokio's framed I/O. The codec is stateless; partial frames are left
/// in the read buffer until the remainder arrives.
#[derive(Debug, Default)]
pub struct KvCodec;

impl KvCodec {
    /// Creates a new codec instance.
    pub fn new() -> Self {
        Self
    }
}

impl Encoder<KvFrame> for KvCodec {
    type Error = CoreError;

    fn encode(&mut self, item: KvFrame, dst: &mut BytesMut) -> Result<(), CoreError> {
        if item.key.len() > u16::MAX as usize {
            return Err(CoreError::Protocol(format!(
                "key length {} exceeds protocol maximum",
                item.key.len()
            )));
        }
        if item.extras.len() > u8::MAX as usize {
            return Err(CoreError::Protocol(format!(
                "extras length {} exceeds protocol maximum",
                item.extras.len()
            )));
        }

        item.write_to(dst);
        Ok(())
    }
}

impl Decoder for KvCodec {
    type Item = KvFrame;
    type Error = CoreError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<KvFrame>, CoreError> {
        KvFrame::read_from(src)
    }
}
