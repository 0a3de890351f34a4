//! Binary KV protocol: framing, codec, typed requests and responses.

pub mod collections;
pub mod compression;
pub mod constants;
pub mod features;
pub mod frame;
pub mod request;
pub mod response;
pub mod status;
pub mod subdoc;

mod codec;

pub use codec::KvCodec;
pub use collections::DocKey;
pub use compression::CompressionConfig;
pub use features::{ChannelContext, ServerFeature};
pub use frame::KvFrame;
pub use request::KvRequest;
pub use response::{decode_response, KvResponse, MutationToken};
pub use status::Status;
pub use subdoc::{SubdocCommand, SubdocCommandType, SubdocOpResult, SubdocResult};
