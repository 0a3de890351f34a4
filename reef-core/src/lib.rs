//! Core wire protocol and error model for the Reef document database client.
//!
//! This crate holds everything the networking runtime in `reef-client` needs
//! to talk to a Couchbase-compatible cluster: the binary KV frame codec,
//! typed request/response encoding, sub-document command handling, the
//! compression policy, the server error map, and the closed error taxonomy.

#![warn(missing_docs)]

pub mod errmap;
pub mod error;
pub mod protocol;
pub mod service;

pub use errmap::ErrorMap;
pub use error::{CoreError, ErrorContext, Result, SubDocumentErrorKind};
pub use protocol::{
    ChannelContext, CompressionConfig, DocKey, KvCodec, KvFrame, KvRequest, KvResponse,
    MutationToken, ServerFeature, Status, SubdocCommand, SubdocCommandType,
};
pub use service::ServiceType;
