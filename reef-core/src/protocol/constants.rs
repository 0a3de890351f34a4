//! Constants for the binary KV protocol.

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Magic byte identifying a request frame.
pub const MAGIC_REQUEST: u8 = 0x80;

/// Magic byte identifying a response frame.
pub const MAGIC_RESPONSE: u8 = 0x81;

/// Datatype bit indicating the body is JSON.
pub const DATATYPE_JSON: u8 = 0x01;

/// Datatype bit indicating the body is Snappy-compressed.
pub const DATATYPE_SNAPPY: u8 = 0x02;

/// Datatype bit indicating the body carries extended attributes.
pub const DATATYPE_XATTR: u8 = 0x04;

/// Error map version requested during bootstrap.
pub const ERROR_MAP_VERSION: u16 = 1;

/// Partition count is always a power of two; this caps the vbucket id range.
pub const MAX_PARTITIONS: u16 = 1024;

/// Opcodes understood by the KV service.
pub mod opcode {
    /// Fetch a document.
    pub const GET: u8 = 0x00;
    /// Store a document unconditionally (upsert).
    pub const SET: u8 = 0x01;
    /// Store a document only if it does not exist (insert).
    pub const ADD: u8 = 0x02;
    /// Store a document only if it exists (replace).
    pub const REPLACE: u8 = 0x03;
    /// Remove a document.
    pub const DELETE: u8 = 0x04;
    /// Increment a counter document.
    pub const INCREMENT: u8 = 0x05;
    /// Decrement a counter document.
    pub const DECREMENT: u8 = 0x06;
    /// Append raw bytes to a document.
    pub const APPEND: u8 = 0x0e;
    /// Prepend raw bytes to a document.
    pub const PREPEND: u8 = 0x0f;
    /// Update a document's expiration.
    pub const TOUCH: u8 = 0x1c;
    /// Fetch a document and update its expiration in one step.
    pub const GET_AND_TOUCH: u8 = 0x1d;
    /// Feature negotiation.
    pub const HELLO: u8 = 0x1f;
    /// List supported SASL mechanisms.
    pub const SASL_LIST_MECHS: u8 = 0x20;
    /// Start SASL authentication.
    pub const SASL_AUTH: u8 = 0x21;
    /// Continue a multi-step SASL exchange.
    pub const SASL_STEP: u8 = 0x22;
    /// Associate the connection with a bucket.
    pub const SELECT_BUCKET: u8 = 0x89;
    /// Observe the persistence/replication state of a key.
    pub const OBSERVE: u8 = 0x92;
    /// Fetch a document and lock it.
    pub const GET_AND_LOCK: u8 = 0x94;
    /// Request the current cluster configuration.
    pub const GET_CONFIG: u8 = 0xb5;
    /// Fetch the collections manifest.
    pub const GET_COLLECTIONS_MANIFEST: u8 = 0xba;
    /// Resolve a scoped collection name to its id.
    pub const GET_COLLECTION_ID: u8 = 0xbb;
    /// Fetch a single sub-document path.
    pub const SUBDOC_GET: u8 = 0xc5;
    /// Check existence of a single sub-document path.
    pub const SUBDOC_EXISTS: u8 = 0xc6;
    /// Multi-path sub-document lookup.
    pub const SUBDOC_MULTI_LOOKUP: u8 = 0xd0;
    /// Multi-path sub-document mutation.
    pub const SUBDOC_MULTI_MUTATE: u8 = 0xd1;
    /// Request the server error map.
    pub const ERROR_MAP: u8 = 0xfe;
}

/// Sub-document operation opcodes carried inside multi lookup/mutate bodies.
pub mod subdoc_opcode {
    /// Fetch the value at a path.
    pub const GET: u8 = 0xc5;
    /// Check whether a path exists.
    pub const EXISTS: u8 = 0xc6;
    /// Add a dictionary entry, failing if the path exists.
    pub const DICT_ADD: u8 = 0xc7;
    /// Add or replace a dictionary entry.
    pub const DICT_UPSERT: u8 = 0xc8;
    /// Remove the value at a path.
    pub const DELETE: u8 = 0xc9;
    /// Replace the value at a path.
    pub const REPLACE: u8 = 0xca;
    /// Push to the end of an array.
    pub const ARRAY_PUSH_LAST: u8 = 0xcb;
    /// Push to the front of an array.
    pub const ARRAY_PUSH_FIRST: u8 = 0xcc;
    /// Insert into an array at a path index.
    pub const ARRAY_INSERT: u8 = 0xcd;
    /// Add to an array only if the value is not present.
    pub const ARRAY_ADD_UNIQUE: u8 = 0xce;
    /// Atomic counter mutation at a path.
    pub const COUNTER: u8 = 0xcf;
    /// Count the members at a path.
    pub const GET_COUNT: u8 = 0xd2;
}

/// Path flags for individual sub-document commands.
pub mod subdoc_flag {
    /// Create intermediate paths on mutation.
    pub const CREATE_PATH: u8 = 0x01;
    /// The path addresses an extended attribute.
    pub const XATTR_PATH: u8 = 0x04;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_values_distinct() {
        assert_ne!(MAGIC_REQUEST, MAGIC_RESPONSE);
    }

    #[test]
    fn test_datatype_bits_disjoint() {
        assert_eq!(DATATYPE_JSON & DATATYPE_SNAPPY, 0);
        assert_eq!(DATATYPE_JSON & DATATYPE_XATTR, 0);
        assert_eq!(DATATYPE_SNAPPY & DATATYPE_XATTR, 0);
    }

    #[test]
    fn test_header_size() {
        assert_eq!(HEADER_SIZE, 24);
    }
}
