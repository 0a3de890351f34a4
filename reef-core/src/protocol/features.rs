//! Feature negotiation codes and per-channel negotiated state.

use std::collections::HashSet;

/// Features proposed to and accepted by the server during HELLO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ServerFeature {
    /// The connection is secured with TLS.
    Tls = 0x02,
    /// Nagle's algorithm is disabled.
    TcpNodelay = 0x03,
    /// Mutation responses carry mutation tokens in the extras.
    MutationSeqno = 0x04,
    /// Extended attributes are accessible.
    Xattr = 0x06,
    /// Extended error codes are returned.
    Xerror = 0x07,
    /// The connection may select a bucket.
    SelectBucket = 0x08,
    /// Snappy compression is accepted in both directions.
    Snappy = 0x0a,
    /// The server flags JSON documents via the datatype.
    Json = 0x0b,
    /// The server may send unsolicited frames.
    Duplex = 0x0c,
    /// Responses may arrive out of submission order.
    UnorderedExecution = 0x0e,
    /// Alternate request framing with flexible extras.
    AltRequest = 0x10,
    /// Synchronous replication (durability) is supported.
    SyncReplication = 0x11,
    /// Keys carry collection ids.
    Collections = 0x12,
    /// Virtual attributes are readable via sub-document.
    Vattr = 0x15,
}

impl ServerFeature {
    /// Decodes a feature from its wire code.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x02 => Some(Self::Tls),
            0x03 => Some(Self::TcpNodelay),
            0x04 => Some(Self::MutationSeqno),
            0x06 => Some(Self::Xattr),
            0x07 => Some(Self::Xerror),
            0x08 => Some(Self::SelectBucket),
            0x0a => Some(Self::Snappy),
            0x0b => Some(Self::Json),
            0x0c => Some(Self::Duplex),
            0x0e => Some(Self::UnorderedExecution),
            0x10 => Some(Self::AltRequest),
            0x11 => Some(Self::SyncReplication),
            0x12 => Some(Self::Collections),
            0x15 => Some(Self::Vattr),
            _ => None,
        }
    }

    /// Returns the wire code of this feature.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// The default feature set proposed on plain data channels.
    pub fn default_set() -> Vec<ServerFeature> {
        vec![
            Self::TcpNodelay,
            Self::MutationSeqno,
            Self::Xattr,
            Self::Xerror,
            Self::SelectBucket,
            Self::Snappy,
            Self::Json,
            Self::UnorderedExecution,
            Self::SyncReplication,
            Self::Collections,
            Self::Vattr,
        ]
    }
}

/// Negotiated per-channel state consulted by the codec.
///
/// Populated once at bootstrap and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct ChannelContext {
    features: HashSet<ServerFeature>,
    bucket: Option<String>,
}

impl ChannelContext {
    /// Creates a context from the accepted feature list.
    pub fn new(features: impl IntoIterator<Item = ServerFeature>, bucket: Option<String>) -> Self {
        Self {
            features: features.into_iter().collect(),
            bucket,
        }
    }

    /// Returns true if the given feature was accepted by the server.
    pub fn has(&self, feature: ServerFeature) -> bool {
        self.features.contains(&feature)
    }

    /// Returns true if keys must carry collection id prefixes.
    pub fn collections_enabled(&self) -> bool {
        self.has(ServerFeature::Collections)
    }

    /// Returns true if mutation responses carry mutation tokens.
    pub fn mutation_tokens_enabled(&self) -> bool {
        self.has(ServerFeature::MutationSeqno)
    }

    /// Returns true if Snappy compression may be used on this channel.
    pub fn snappy_enabled(&self) -> bool {
        self.has(ServerFeature::Snappy)
    }

    /// Returns the bucket selected on this channel, if any.
    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    /// Returns the accepted features.
    pub fn features(&self) -> &HashSet<ServerFeature> {
        &self.features
    }
}
