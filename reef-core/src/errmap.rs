//! Server-provided error map.
//!
//! The error map refines how unknown or extended status codes should be
//! handled. It is loaded once per connection during bootstrap; absence is
//! non-fatal since built-in defaults apply.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{CoreError, Result};
use crate::protocol::Status;

/// Attribute marking a status as safe to retry immediately.
pub const ATTR_RETRY_NOW: &str = "retry-now";
/// Attribute marking a status as safe to retry after a delay.
pub const ATTR_RETRY_LATER: &str = "retry-later";
/// Attribute marking a temporary condition.
pub const ATTR_TEMP: &str = "temp";
/// Attribute marking an automatically retriable status.
pub const ATTR_AUTO_RETRY: &str = "auto-retry";

/// A single entry in the server error map.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ErrorCode {
    /// Short mnemonic name of the status.
    pub name: String,
    /// Human-readable description.
    #[serde(rename = "desc", default)]
    pub description: String,
    /// Behavioral attributes.
    #[serde(default)]
    pub attrs: Vec<String>,
}

impl ErrorCode {
    /// Returns true if the attributes mark this status as retriable.
    pub fn is_retriable(&self) -> bool {
        self.attrs.iter().any(|attr| {
            matches!(
                attr.as_str(),
                ATTR_RETRY_NOW | ATTR_RETRY_LATER | ATTR_TEMP | ATTR_AUTO_RETRY
            )
        })
    }

    /// Returns true if the given attribute is present.
    pub fn has_attr(&self, attr: &str) -> bool {
        self.attrs.iter().any(|a| a == attr)
    }
}

/// The decoded server error map.
///
/// Keys in the JSON document are lowercase hex status codes without a
/// leading `0x`. Unknown fields are tolerated so newer servers can extend
/// the schema without breaking older clients.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ErrorMap {
    /// Format version of the map.
    #[serde(default)]
    pub version: u16,
    /// Revision of the map contents.
    #[serde(default)]
    pub revision: u16,
    /// Status code to metadata mapping.
    #[serde(default)]
    pub errors: HashMap<String, ErrorCode>,
}

impl ErrorMap {
    /// Decodes an error map from its JSON wire form.
    pub fn from_json(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map_err(|e| CoreError::Protocol(format!("undecodable error map: {}", e)))
    }

    /// Looks up the entry for a raw status code.
    pub fn get(&self, status: u16) -> Option<&ErrorCode> {
        self.errors.get(&format!("{:x}", status))
    }

    /// Returns true if the map (or the built-in defaults, when the map has
    /// no entry) classifies the status as retriable.
    pub fn is_retriable(&self, status: Status) -> bool {
        match self.get(status.raw()) {
            Some(code) => code.is_retriable(),
            None => status.is_retriable(),
        }
    }

    /// Number of entries in the map.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Returns true if the map carries no entries.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}
