//! Typed KV requests and their wire encoding.

use bytes::{BufMut, Bytes, BytesMut};

use super::collections::DocKey;
use super::compression::{maybe_compress, CompressionConfig};
use super::constants::{opcode, DATATYPE_SNAPPY, ERROR_MAP_VERSION};
use super::features::{ChannelContext, ServerFeature};
use super::frame::KvFrame;
use super::subdoc::SubdocCommand;
use crate::error::{CoreError, Result};

/// A typed request for the KV service.
///
/// Requests are routing-aware payload descriptions; the opaque and target
/// partition are assigned at send time by the owning endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvRequest {
    /// Fetch a document.
    Get {
        /// Target document.
        key: DocKey,
    },
    /// Store a document unconditionally.
    Upsert {
        /// Target document.
        key: DocKey,
        /// Document body.
        value: Vec<u8>,
        /// Transcoder flags stored with the document.
        flags: u32,
        /// Expiration in seconds, 0 for none.
        expiry: u32,
        /// Datatype bits describing the body.
        datatype: u8,
    },
    /// Store a document only if it does not exist.
    Insert {
        /// Target document.
        key: DocKey,
        /// Document body.
        value: Vec<u8>,
        /// Transcoder flags stored with the document.
        flags: u32,
        /// Expiration in seconds, 0 for none.
        expiry: u32,
        /// Datatype bits describing the body.
        datatype: u8,
    },
    /// Store a document only if it already exists.
    Replace {
        /// Target document.
        key: DocKey,
        /// Document body.
        value: Vec<u8>,
        /// Transcoder flags stored with the document.
        flags: u32,
        /// Expiration in seconds, 0 for none.
        expiry: u32,
        /// Datatype bits describing the body.
        datatype: u8,
        /// CAS guard, 0 for unconditional.
        cas: u64,
    },
    /// Remove a document.
    Remove {
        /// Target document.
        key: DocKey,
        /// CAS guard, 0 for unconditional.
        cas: u64,
    },
    /// Update a document's expiration.
    Touch {
        /// Target document.
        key: DocKey,
        /// New expiration in seconds.
        expiry: u32,
    },
    /// Fetch a document and update its expiration.
    GetAndTouch {
        /// Target document.
        key: DocKey,
        /// New expiration in seconds.
        expiry: u32,
    },
    /// Fetch a document and lock it against writes.
    GetAndLock {
        /// Target document.
        key: DocKey,
        /// Lock duration in seconds.
        lock_time: u32,
    },
    /// Append raw bytes to a document.
    Append {
        /// Target document.
        key: DocKey,
        /// Bytes to append.
        value: Vec<u8>,
        /// CAS guard, 0 for unconditional.
        cas: u64,
    },
    /// Prepend raw bytes to a document.
    Prepend {
        /// Target document.
        key: DocKey,
        /// Bytes to prepend.
        value: Vec<u8>,
        /// CAS guard, 0 for unconditional.
        cas: u64,
    },
    /// Increment a counter document.
    Increment {
        /// Target document.
        key: DocKey,
        /// Amount to add.
        delta: u64,
        /// Initial value if the counter does not exist.
        initial: u64,
        /// Expiration in seconds.
        expiry: u32,
    },
    /// Decrement a counter document.
    Decrement {
        /// Target document.
        key: DocKey,
        /// Amount to subtract.
        delta: u64,
        /// Initial value if the counter does not exist.
        initial: u64,
        /// Expiration in seconds.
        expiry: u32,
    },
    /// Observe the persistence state of a key.
    Observe {
        /// Target document.
        key: DocKey,
    },
    /// Request the current cluster configuration.
    GetConfig,
    /// Associate the connection with a bucket.
    SelectBucket {
        /// Bucket name.
        name: String,
    },
    /// Propose a feature set to the server.
    Hello {
        /// Client identifier echoed in server logs.
        client_name: String,
        /// Proposed features.
        features: Vec<ServerFeature>,
    },
    /// List supported SASL mechanisms.
    SaslListMechs,
    /// Start SASL authentication.
    SaslAuth {
        /// Selected mechanism name.
        mechanism: String,
        /// Initial client payload.
        payload: Vec<u8>,
    },
    /// Continue a SASL exchange.
    SaslStep {
        /// Selected mechanism name.
        mechanism: String,
        /// Continuation payload.
        payload: Vec<u8>,
    },
    /// Request the server error map.
    ErrorMap {
        /// Requested error map version.
        version: u16,
    },
    /// Fetch a single sub-document path.
    SubdocGet {
        /// Target document.
        key: DocKey,
        /// Path to fetch.
        path: String,
        /// The path addresses an extended attribute.
        xattr: bool,
    },
    /// Check existence of a single sub-document path.
    SubdocExists {
        /// Target document.
        key: DocKey,
        /// Path to check.
        path: String,
        /// The path addresses an extended attribute.
        xattr: bool,
    },
    /// Multi-path sub-document lookup.
    SubdocMultiLookup {
        /// Target document.
        key: DocKey,
        /// Ordered lookup commands.
        commands: Vec<SubdocCommand>,
        /// Document-level flags.
        doc_flags: u8,
    },
    /// Multi-path sub-document mutation.
    SubdocMultiMutate {
        /// Target document.
        key: DocKey,
        /// Ordered mutation commands.
        commands: Vec<SubdocCommand>,
        /// Document-level flags.
        doc_flags: u8,
        /// Expiration in seconds, 0 for none.
        expiry: u32,
        /// CAS guard, 0 for unconditional.
        cas: u64,
    },
    /// Fetch the collections manifest.
    GetCollectionsManifest,
    /// Resolve a scoped collection name to its id.
    GetCollectionId {
        /// Fully qualified `scope.collection` name.
        scoped_name: String,
    },
}

impl KvRequest {
    /// Returns the wire opcode for this request.
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Get { .. } => opcode::GET,
            Self::Upsert { .. } => opcode::SET,
            Self::Insert { .. } => opcode::ADD,
            Self::Replace { .. } => opcode::REPLACE,
            Self::Remove { .. } => opcode::DELETE,
            Self::Touch { .. } => opcode::TOUCH,
            Self::GetAndTouch { .. } => opcode::GET_AND_TOUCH,
            Self::GetAndLock { .. } => opcode::GET_AND_LOCK,
            Self::Append { .. } => opcode::APPEND,
            Self::Prepend { .. } => opcode::PREPEND,
            Self::Increment { .. } => opcode::INCREMENT,
            Self::Decrement { .. } => opcode::DECREMENT,
            Self::Observe { .. } => opcode::OBSERVE,
            Self::GetConfig => opcode::GET_CONFIG,
            Self::SelectBucket { .. } => opcode::SELECT_BUCKET,
            Self::Hello { .. } => opcode::HELLO,
            Self::SaslListMechs => opcode::SASL_LIST_MECHS,
            Self::SaslAuth { .. } => opcode::SASL_AUTH,
            Self::SaslStep { .. } => opcode::SASL_STEP,
            Self::ErrorMap { .. } => opcode::ERROR_MAP,
            Self::SubdocGet { .. } => opcode::SUBDOC_GET,
            Self::SubdocExists { .. } => opcode::SUBDOC_EXISTS,
            Self::SubdocMultiLookup { .. } => opcode::SUBDOC_MULTI_LOOKUP,
            Self::SubdocMultiMutate { .. } => opcode::SUBDOC_MULTI_MUTATE,
            Self::GetCollectionsManifest => opcode::GET_COLLECTIONS_MANIFEST,
            Self::GetCollectionId { .. } => opcode::GET_COLLECTION_ID,
        }
    }

    /// Returns the routing key, if this request targets a document.
    pub fn doc_key(&self) -> Option<&DocKey> {
        match self {
            Self::Get { key }
            | Self::Upsert { key, .. }
            | Self::Insert { key, .. }
            | Self::Replace { key, .. }
            | Self::Remove { key, .. }
            | Self::Touch { key, .. }
            | Self::GetAndTouch { key, .. }
            | Self::GetAndLock { key, .. }
            | Self::Append { key, .. }
            | Self::Prepend { key, .. }
            | Self::Increment { key, .. }
            | Self::Decrement { key, .. }
            | Self::Observe { key }
            | Self::SubdocGet { key, .. }
            | Self::SubdocExists { key, .. }
            | Self::SubdocMultiLookup { key, .. }
            | Self::SubdocMultiMutate { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Returns true if this is a document mutation (may carry a CAS guard).
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::Upsert { .. }
                | Self::Insert { .. }
                | Self::Replace { .. }
                | Self::Remove { .. }
                | Self::Append { .. }
                | Self::Prepend { .. }
                | Self::Increment { .. }
                | Self::Decrement { .. }
                | Self::SubdocMultiMutate { .. }
        )
    }

    /// Returns the CAS guard carried by this request, if any.
    pub fn cas(&self) -> u64 {
        match self {
            Self::Replace { cas, .. }
            | Self::Remove { cas, .. }
            | Self::Append { cas, .. }
            | Self::Prepend { cas, .. }
            | Self::SubdocMultiMutate { cas, .. } => *cas,
            _ => 0,
        }
    }

    /// Encodes this request into a wire frame.
    ///
    /// The opaque and partition are assigned by the endpoint at send time.
    /// The negotiated channel context decides collection-id key prefixing
    /// and compression eligibility.
    pub fn encode(
        &self,
        opaque: u32,
        partition: u16,
        ctx: &ChannelContext,
        compression: &CompressionConfig,
    ) -> Result<KvFrame> {
        let collections = ctx.collections_enabled();
        let mut datatype = 0u8;
        let mut extras = BytesMut::new();
        let mut key = Bytes::new();
        let mut body = Bytes::new();
        let cas = self.cas();

        match self {
            Self::Get { key: k } | Self::Observe { key: k } => {
                key = k.encode(collections);
                if matches!(self, Self::Observe { .. }) {
                    // OBSERVE carries its targets in the body.
                    let wire_key = std::mem::take(&mut key);
                    let mut buf = BytesMut::with_capacity(4 + wire_key.len());
                    buf.put_u16(partition);
                    buf.put_u16(wire_key.len() as u16);
                    buf.put_slice(&wire_key);
                    body = buf.freeze();
                }
            }
            Self::Upsert {
                key: k,
                value,
                flags,
                expiry,
                datatype: dt,
            }
            | Self::Insert {
                key: k,
                value,
                flags,
                expiry,
                datatype: dt,
            }
            | Self::Replace {
                key: k,
                value,
                flags,
                expiry,
                datatype: dt,
                ..
            } => {
                key = k.encode(collections);
                extras.put_u32(*flags);
                extras.put_u32(*expiry);
                datatype = *dt;
                body = self.compress_value(value, ctx, compression, &mut datatype);
            }
            Self::Remove { key: k, .. } => {
                key = k.encode(collections);
            }
            Self::Touch { key: k, expiry } | Self::GetAndTouch { key: k, expiry } => {
                key = k.encode(collections);
                extras.put_u32(*expiry);
            }
            Self::GetAndLock { key: k, lock_time } => {
                key = k.encode(collections);
                extras.put_u32(*lock_time);
            }
            Self::Append { key: k, value, .. } | Self::Prepend { key: k, value, .. } => {
                key = k.encode(collections);
                body = self.compress_value(value, ctx, compression, &mut datatype);
            }
            Self::Increment {
                key: k,
                delta,
                initial,
                expiry,
            }
            | Self::Decrement {
                key: k,
                delta,
                initial,
                expiry,
            } => {
                key = k.encode(collections);
                extras.put_u64(*delta);
                extras.put_u64(*initial);
                extras.put_u32(*expiry);
            }
            Self::GetConfig | Self::SaslListMechs | Self::GetCollectionsManifest => {}
            Self::SelectBucket { name } => {
                key = Bytes::copy_from_slice(name.as_bytes());
            }
            Self::Hello {
                client_name,
                features,
            } => {
                key = Bytes::copy_from_slice(client_name.as_bytes());
                let mut buf = BytesMut::with_capacity(features.len() * 2);
                for feature in features {
                    buf.put_u16(feature.code());
                }
                body = buf.freeze();
            }
            Self::SaslAuth { mechanism, payload } | Self::SaslStep { mechanism, payload } => {
                key = Bytes::copy_from_slice(mechanism.as_bytes());
                body = Bytes::copy_from_slice(payload);
            }
            Self::ErrorMap { version } => {
                let mut buf = BytesMut::with_capacity(2);
                buf.put_u16(*version);
                body = buf.freeze();
            }
            Self::SubdocGet { key: k, path, xattr }
            | Self::SubdocExists { key: k, path, xattr } => {
                key = k.encode(collections);
                extras.put_u16(path.len() as u16);
                extras.put_u8(if *xattr {
                    super::constants::subdoc_flag::XATTR_PATH
                } else {
                    0
                });
                body = Bytes::copy_from_slice(path.as_bytes());
            }
            Self::SubdocMultiLookup {
                key: k,
                commands,
                doc_flags,
            } => {
                if commands.is_empty() {
                    return Err(CoreError::InvalidArgument(
                        "multi-lookup requires at least one command".to_string(),
                    ));
                }
                key = k.encode(collections);
                if *doc_flags != 0 {
                    extras.put_u8(*doc_flags);
                }
                let mut buf = BytesMut::new();
                for command in commands {
                    command.encode_lookup(&mut buf);
                }
                body = buf.freeze();
            }
            Self::SubdocMultiMutate {
                key: k,
                commands,
                doc_flags,
                expiry,
                ..
            } => {
                if commands.is_empty() {
                    return Err(CoreError::InvalidArgument(
                        "multi-mutate requires at least one command".to_string(),
                    ));
                }
                key = k.encode(collections);
                if *doc_flags != 0 {
                    extras.put_u8(*doc_flags);
                }
                if *expiry != 0 {
                    extras.put_u32(*expiry);
                }
                let mut buf = BytesMut::new();
                for command in commands {
                    command.encode_mutation(&mut buf);
                }
                body = buf.freeze();
            }
            Self::GetCollectionId { scoped_name } => {
                body = Bytes::copy_from_slice(scoped_name.as_bytes());
            }
        }

        Ok(KvFrame::request(
            self.opcode(),
            datatype,
            partition,
            opaque,
            cas,
            extras.freeze(),
            key,
            body,
        ))
    }

    fn compress_value(
        &self,
        value: &[u8],
        ctx: &ChannelContext,
        compression: &CompressionConfig,
        datatype: &mut u8,
    ) -> Bytes {
        if ctx.snappy_enabled() {
            if let Some(compressed) = maybe_compress(value, compression) {
                *datatype |= DATATYPE_SNAPPY;
                return Bytes::from(compressed);
            }
        }
        Bytes::copy_from_slice(value)
    }
}

impl Default for KvRequest {
    fn default() -> Self {
        Self::GetConfig
    }
}

/// Builds the error map request at the negotiated version.
pub fn error_map_request() -> KvRequest {
    KvRequest::ErrorMap {
        version: ERROR_MAP_VERSION,
    }
}
