//! Frame type for the binary KV protocol.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::constants::*;
use crate::error::{CoreError, Result};

/// A single frame in the KV protocol.
///
/// Each frame consists of a fixed 24-byte header followed by three optional
/// sections in order: extras, key, body. All header integers are network
/// byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvFrame {
    /// Magic byte, request or response.
    pub magic: u8,
    /// Operation code.
    pub opcode: u8,
    /// Datatype bits (JSON, SNAPPY, XATTR).
    pub datatype: u8,
    /// Partition id on requests, status code on responses.
    pub vbucket_or_status: u16,
    /// Opaque echoed by the server, used for demultiplexing.
    pub opaque: u32,
    /// Compare-and-swap token.
    pub cas: u64,
    /// Command extras section.
    pub extras: Bytes,
    /// Key section.
    pub key: Bytes,
    /// Value/body section.
    pub body: Bytes,
}

impl KvFrame {
    /// Creates a request frame.
    #[allow(clippy::too_many_arguments)]
    pub fn request(
        opcode: u8,
        datatype: u8,
        vbucket: u16,
        opaque: u32,
        cas: u64,
        extras: Bytes,
        key: Bytes,
        body: Bytes,
    ) -> Self {
        Self {
            magic: MAGIC_REQUEST,
            opcode,
            datatype,
            vbucket_or_status: vbucket,
            opaque,
            cas,
            extras,
            key,
            body,
        }
    }

    /// Creates a response frame.
    #[allow(clippy::too_many_arguments)]
    pub fn response(
        opcode: u8,
        datatype: u8,
        status: u16,
        opaque: u32,
        cas: u64,
        extras: Bytes,
        key: Bytes,
        body: Bytes,
    ) -> Self {
        Self {
            magic: MAGIC_RESPONSE,
            opcode,
            datatype,
            vbucket_or_status: status,
            opaque,
            cas,
            extras,
            key,
            body,
        }
    }

    /// Returns true if this frame carries the request magic.
    pub fn is_request(&self) -> bool {
        self.magic == MAGIC_REQUEST
    }

    /// Returns true if this frame carries the response magic.
    pub fn is_response(&self) -> bool {
        self.magic == MAGIC_RESPONSE
    }

    /// Returns the status field of a response frame.
    pub fn status(&self) -> u16 {
        self.vbucket_or_status
    }

    /// Returns true if a response frame carries a success status.
    pub fn is_success(&self) -> bool {
        self.is_response() && self.vbucket_or_status == 0
    }

    /// Returns true if the SNAPPY datatype bit is set.
    pub fn is_snappy(&self) -> bool {
        self.datatype & DATATYPE_SNAPPY != 0
    }

    /// Returns the total body length (extras + key + body).
    pub fn total_body_len(&self) -> usize {
        self.extras.len() + self.key.len() + self.body.len()
    }

    /// Returns the size of this frame on the wire.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.total_body_len()
    }

    /// Writes this frame to the given buffer.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(self.wire_size());
        dst.put_u8(self.magic);
        dst.put_u8(self.opcode);
        dst.put_u16(self.key.len() as u16);
        dst.put_u8(self.extras.len() as u8);
        dst.put_u8(self.datatype);
        dst.put_u16(self.vbucket_or_status);
        dst.put_u32(self.total_body_len() as u32);
        dst.put_u32(self.opaque);
        dst.put_u64(self.cas);
        dst.put_slice(&self.extras);
        dst.put_slice(&self.key);
        dst.put_slice(&self.body);
    }

    /// Reads a frame from the given buffer.
    ///
    /// Returns `Ok(None)` if there isn't enough data for a complete frame.
    /// The sections of the returned frame are copied out of the read buffer,
    /// so the frame owns its bytes.
    pub fn read_from(src: &mut BytesMut) -> Result<Option<Self>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let magic = src[0];
        if magic != MAGIC_REQUEST && magic != MAGIC_RESPONSE {
            return Err(CoreError::Protocol(format!(
                "invalid magic byte 0x{:02x}",
                magic
            )));
        }

        let key_len = u16::from_be_bytes([src[2], src[3]]) as usize;
        let extras_len = src[4] as usize;
        let total_body = u32::from_be_bytes([src[8], src[9], src[10], src[11]]) as usize;

        if extras_len + key_len > total_body {
            return Err(CoreError::Protocol(format!(
                "frame sections exceed total body length ({} + {} > {})",
                extras_len, key_len, total_body
            )));
        }

        if src.len() < HEADER_SIZE + total_body {
            return Ok(None);
        }

        let opcode = src[1];
        let datatype = src[5];
        let vbucket_or_status = u16::from_be_bytes([src[6], src[7]]);
        let opaque = u32::from_be_bytes([src[12], src[13], src[14], src[15]]);
        let cas = u64::from_be_bytes([
            src[16], src[17], src[18], src[19], src[20], src[21], src[22], src[23],
        ]);

        src.advance(HEADER_SIZE);
        let extras = src.split_to(extras_len).freeze();
        let key = src.split_to(key_len).freeze();
        let body = src.split_to(total_body - extras_len - key_len).freeze();

        Ok(Some(Self {
            magic,
            opcode,
            datatype,
            vbucket_or_status,
            opaque,
            cas,
            extras,
            key,
            body,
        }))
    }
}
