//! Collection-aware key encoding.
//!
//! When the channel has negotiated collections, wire keys carry the
//! collection id as an unsigned LEB128 prefix ahead of the user key bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{CoreError, Result};

/// The id of the default collection.
pub const DEFAULT_COLLECTION_ID: u32 = 0;

/// Encodes a value as unsigned LEB128.
pub fn encode_leb128(mut value: u32, dst: &mut BytesMut) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decodes an unsigned LEB128 value from the front of a slice.
///
/// Returns the value and the number of bytes consumed.
pub fn decode_leb128(src: &[u8]) -> Result<(u32, usize)> {
    let mut value: u32 = 0;
    let mut shift = 0u32;
    for (i, byte) in src.iter().enumerate() {
        // The fifth byte may only carry the low four bits of a u32.
        if shift == 28 && byte & 0xf0 != 0 {
            return Err(CoreError::Protocol(
                "leb128 value overflows u32".to_string(),
            ));
        }
        value |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
        if shift > 28 {
            return Err(CoreError::Protocol(
                "leb128 value overflows u32".to_string(),
            ));
        }
    }
    Err(CoreError::Protocol("truncated leb128 value".to_string()))
}

/// A document key together with its target collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocKey {
    key: Vec<u8>,
    collection_id: u32,
}

impl DocKey {
    /// Creates a key addressing the default collection.
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            collection_id: DEFAULT_COLLECTION_ID,
        }
    }

    /// Creates a key addressing a specific collection.
    pub fn in_collection(key: impl Into<Vec<u8>>, collection_id: u32) -> Self {
        Self {
            key: key.into(),
            collection_id,
        }
    }

    /// Returns the user key bytes without any collection prefix.
    pub fn user_key(&self) -> &[u8] {
        &self.key
    }

    /// Returns the target collection id.
    pub fn collection_id(&self) -> u32 {
        self.collection_id
    }

    /// Encodes the wire form of this key.
    ///
    /// With collections negotiated the collection id is prefixed as
    /// unsigned LEB128; otherwise the user key is sent as-is.
    pub fn encode(&self, collections_enabled: bool) -> Bytes {
        if !collections_enabled {
            return Bytes::copy_from_slice(&self.key);
        }
        let mut buf = BytesMut::with_capacity(self.key.len() + 5);
        encode_leb128(self.collection_id, &mut buf);
        buf.put_slice(&self.key);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leb128_single_byte() {
        let mut buf = BytesMut::new();
        encode_leb128(0, &mut buf);
        assert_eq!(&buf[..], &[0x00]);

        let mut buf = BytesMut::new();
        encode_leb128(0x7f, &mut buf);
        assert_eq!(&buf[..], &[0x7f]);
    }

    #[test]
    fn test_leb128_multi_byte() {
        let mut buf = BytesMut::new();
        encode_leb128(0x80, &mut buf);
        assert_eq!(&buf[..], &[0x80, 0x01]);

        let mut buf = BytesMut::new();
        encode_leb128(0x5612, &mut buf);
        assert_eq!(&buf[..], &[0x92, 0xac, 0x01]);
    }

    #[test]
    fn test_leb128_roundtrip() {
        for value in [0u32, 1, 127, 128, 255, 0x1000, 0xdead, u32::MAX] {
            let mut buf = BytesMut::new();
            encode_leb128(value, &mut buf);
            let (decoded, consumed) = decode_leb128(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn test_leb128_truncated() {
        assert!(decode_leb128(&[0x80]).is_err());
        assert!(decode_leb128(&[]).is_err());
    }

    #[test]
    fn test_leb128_overflow_rejected() {
        assert!(decode_leb128(&[0xff, 0xff, 0xff, 0xff, 0x7f]).is_err());
        assert!(decode_leb128(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]).is_err());
    }

    #[test]
    fn test_key_without_collections() {
        let key = DocKey::in_collection(b"airline_10".to_vec(), 9);
        assert_eq!(&key.encode(false)[..], b"airline_10");
    }

    #[test]
    fn test_key_with_collections() {
        let key = DocKey::in_collection(b"airline_10".to_vec(), 9);
        let wire = key.encode(true);
        assert_eq!(wire[0], 0x09);
        assert_eq!(&wire[1..], b"airline_10");
    }

    #[test]
    fn test_default_collection_prefix() {
        let key = DocKey::new(b"k".to_vec());
        let wire = key.encode(true);
        assert_eq!(&wire[..], &[0x00, b'k']);
    }
}
