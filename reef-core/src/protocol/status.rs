//! Response status decoding.

use std::fmt;

/// Normalized response status.
///
/// The 16-bit status field on response frames maps into this enum. Codes the
/// client does not know are preserved in [`Status::Unknown`] so the server
/// error map can still classify them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The operation succeeded.
    Success,
    /// The document was not found.
    NotFound,
    /// The document exists (insert) or the CAS did not match.
    Exists,
    /// The value exceeds the server's size limit.
    TooBig,
    /// The request arguments were invalid.
    Invalid,
    /// The document was not stored.
    NotStored,
    /// The addressed partition is not owned by this node.
    NotMyVbucket,
    /// No bucket is selected on this connection.
    NoBucket,
    /// The document is locked.
    Locked,
    /// Authentication failed.
    AuthError,
    /// Authentication requires another SASL step.
    AuthContinue,
    /// The caller lacks access to the resource.
    AccessError,
    /// The node is still warming up.
    NotInitialized,
    /// The server is temporarily unable to process the request.
    TemporaryFailure,
    /// The addressed collection is unknown to this node.
    UnknownCollection,
    /// A durable write on the document is still in progress.
    SyncWriteInProgress,
    /// A durable write finished in an ambiguous state.
    SyncWriteAmbiguous,
    /// Sub-document: the path does not exist.
    SubdocPathNotFound,
    /// Sub-document: the path conflicts with document structure.
    SubdocPathMismatch,
    /// Sub-document: the path is malformed.
    SubdocPathInvalid,
    /// Sub-document: the path is too deep.
    SubdocPathTooBig,
    /// Sub-document: the document is nested too deeply.
    SubdocDocTooDeep,
    /// Sub-document: the fragment cannot be inserted at the path.
    SubdocValueCantInsert,
    /// Sub-document: the document is not JSON.
    SubdocDocNotJson,
    /// Sub-document: the path already exists.
    SubdocPathExists,
    /// Sub-document: inserting the fragment would nest too deeply.
    SubdocValueTooDeep,
    /// Sub-document: the command combination is invalid.
    SubdocInvalidCombo,
    /// Sub-document: at least one command in a multi request failed.
    SubdocMultiPathFailure,
    /// Any status not covered above; the raw code is preserved.
    Unknown(u16),
}

impl Status {
    /// Decodes the raw 16-bit status field.
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0x00 => Self::Success,
            0x01 => Self::NotFound,
            0x02 => Self::Exists,
            0x03 => Self::TooBig,
            0x04 => Self::Invalid,
            0x05 => Self::NotStored,
            0x07 => Self::NotMyVbucket,
            0x08 => Self::NoBucket,
            0x09 => Self::Locked,
            0x20 => Self::AuthError,
            0x21 => Self::AuthContinue,
            0x24 => Self::AccessError,
            0x25 => Self::NotInitialized,
            0x86 => Self::TemporaryFailure,
            0x88 => Self::UnknownCollection,
            0xa2 => Self::SyncWriteInProgress,
            0xa3 => Self::SyncWriteAmbiguous,
            0xc0 => Self::SubdocPathNotFound,
            0xc1 => Self::SubdocPathMismatch,
            0xc2 => Self::SubdocPathInvalid,
            0xc3 => Self::SubdocPathTooBig,
            0xc4 => Self::SubdocDocTooDeep,
            0xc5 => Self::SubdocValueCantInsert,
            0xc6 => Self::SubdocDocNotJson,
            0xc9 => Self::SubdocPathExists,
            0xca => Self::SubdocValueTooDeep,
            0xcb => Self::SubdocInvalidCombo,
            0xcc => Self::SubdocMultiPathFailure,
            other => Self::Unknown(other),
        }
    }

    /// Returns the raw wire value of this status.
    pub fn raw(self) -> u16 {
        match self {
            Self::Success => 0x00,
            Self::NotFound => 0x01,
            Self::Exists => 0x02,
            Self::TooBig => 0x03,
            Self::Invalid => 0x04,
            Self::NotStored => 0x05,
            Self::NotMyVbucket => 0x07,
            Self::NoBucket => 0x08,
            Self::Locked => 0x09,
            Self::AuthError => 0x20,
            Self::AuthContinue => 0x21,
            Self::AccessError => 0x24,
            Self::NotInitialized => 0x25,
            Self::TemporaryFailure => 0x86,
            Self::UnknownCollection => 0x88,
            Self::SyncWriteInProgress => 0xa2,
            Self::SyncWriteAmbiguous => 0xa3,
            Self::SubdocPathNotFound => 0xc0,
            Self::SubdocPathMismatch => 0xc1,
            Self::SubdocPathInvalid => 0xc2,
            Self::SubdocPathTooBig => 0xc3,
            Self::SubdocDocTooDeep => 0xc4,
            Self::SubdocValueCantInsert => 0xc5,
            Self::SubdocDocNotJson => 0xc6,
            Self::SubdocPathExists => 0xc9,
            Self::SubdocValueTooDeep => 0xca,
            Self::SubdocInvalidCombo => 0xcb,
            Self::SubdocMultiPathFailure => 0xcc,
            Self::Unknown(raw) => raw,
        }
    }

    /// Returns true for the success status.
    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Returns true if this is one of the sub-document statuses.
    pub fn is_subdoc(self) -> bool {
        matches!(self.raw(), 0xc0..=0xcc)
    }

    /// Returns true if the client may retry the request without an error map.
    ///
    /// The server error map refines this via its attributes; these are the
    /// built-in defaults.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::TemporaryFailure
                | Self::Locked
                | Self::NotInitialized
                | Self::SyncWriteInProgress
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(raw) => write!(f, "UNKNOWN(0x{:04x})", raw),
            other => write!(f, "{:?}", other),
        }
    }
}
