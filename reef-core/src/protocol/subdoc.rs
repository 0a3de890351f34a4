//! Sub-document command encoding and multi-operation response decoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::constants::{subdoc_flag, subdoc_opcode};
use super::status::Status;
use crate::error::{CoreError, Result};

/// Document-level flags for sub-document requests.
pub mod doc_flag {
    /// Create the document if it does not exist.
    pub const MKDOC: u8 = 0x01;
    /// Add the document, failing if it exists.
    pub const ADD: u8 = 0x02;
    /// Allow access to deleted documents.
    pub const ACCESS_DELETED: u8 = 0x04;
}

/// The type of a single sub-document operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubdocCommandType {
    /// Fetch the value at a path.
    Get,
    /// Check whether a path exists.
    Exists,
    /// Add a dictionary entry, failing if the path exists.
    DictAdd,
    /// Add or replace a dictionary entry.
    DictUpsert,
    /// Remove the value at a path.
    Delete,
    /// Replace the value at a path.
    Replace,
    /// Push to the end of an array.
    ArrayPushLast,
    /// Push to the front of an array.
    ArrayPushFirst,
    /// Insert into an array at a path index.
    ArrayInsert,
    /// Add to an array only if the value is not present.
    ArrayAddUnique,
    /// Atomic counter mutation at a path.
    Counter,
    /// Count the members at a path.
    GetCount,
}

impl SubdocCommandType {
    /// Returns the wire opcode for this command type.
    pub fn opcode(self) -> u8 {
        match self {
            Self::Get => subdoc_opcode::GET,
            Self::Exists => subdoc_opcode::EXISTS,
            Self::DictAdd => subdoc_opcode::DICT_ADD,
            Self::DictUpsert => subdoc_opcode::DICT_UPSERT,
            Self::Delete => subdoc_opcode::DELETE,
            Self::Replace => subdoc_opcode::REPLACE,
            Self::ArrayPushLast => subdoc_opcode::ARRAY_PUSH_LAST,
            Self::ArrayPushFirst => subdoc_opcode::ARRAY_PUSH_FIRST,
            Self::ArrayInsert => subdoc_opcode::ARRAY_INSERT,
            Self::ArrayAddUnique => subdoc_opcode::ARRAY_ADD_UNIQUE,
            Self::Counter => subdoc_opcode::COUNTER,
            Self::GetCount => subdoc_opcode::GET_COUNT,
        }
    }

    /// Returns true if this command mutates the document.
    pub fn is_mutation(self) -> bool {
        !matches!(self, Self::Get | Self::Exists | Self::GetCount)
    }
}

/// A single sub-document command.
///
/// A multi request carries an ordered list of these; order is preserved on
/// the wire and mirrored in the per-operation response vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubdocCommand {
    /// The operation type.
    pub command_type: SubdocCommandType,
    /// UTF-8 path inside the document.
    pub path: String,
    /// Value fragment for mutations; empty for lookups.
    pub fragment: Vec<u8>,
    /// Create intermediate paths on mutation.
    pub create_parent: bool,
    /// The path addresses an extended attribute.
    pub xattr: bool,
}

impl SubdocCommand {
    /// Creates a lookup command with no fragment.
    pub fn lookup(command_type: SubdocCommandType, path: impl Into<String>, xattr: bool) -> Self {
        Self {
            command_type,
            path: path.into(),
            fragment: Vec::new(),
            create_parent: false,
            xattr,
        }
    }

    /// Creates a mutation command.
    pub fn mutation(
        command_type: SubdocCommandType,
        path: impl Into<String>,
        fragment: impl Into<Vec<u8>>,
        create_parent: bool,
        xattr: bool,
    ) -> Self {
        Self {
            command_type,
            path: path.into(),
            fragment: fragment.into(),
            create_parent,
            xattr,
        }
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.xattr {
            flags |= subdoc_flag::XATTR_PATH;
        }
        if self.create_parent {
            flags |= subdoc_flag::CREATE_PATH;
        }
        flags
    }

    /// Encodes this command for a multi-mutate body.
    ///
    /// Layout: `opcode(u8) | flags(u8) | path-len(u16) | value-len(u32) |
    /// path-bytes | value-bytes`.
    pub fn encode_mutation(&self, dst: &mut BytesMut) {
        let path = self.path.as_bytes();
        dst.reserve(8 + path.len() + self.fragment.len());
        dst.put_u8(self.command_type.opcode());
        dst.put_u8(self.flags());
        dst.put_u16(path.len() as u16);
        dst.put_u32(self.fragment.len() as u32);
        dst.put_slice(path);
        dst.put_slice(&self.fragment);
    }

    /// Encodes this command for a multi-lookup body.
    ///
    /// Lookups carry no fragment: `opcode(u8) | flags(u8) | path-len(u16) |
    /// path-bytes`.
    pub fn encode_lookup(&self, dst: &mut BytesMut) {
        let path = self.path.as_bytes();
        dst.reserve(4 + path.len());
        dst.put_u8(self.command_type.opcode());
        dst.put_u8(self.flags());
        dst.put_u16(path.len() as u16);
        dst.put_slice(path);
    }
}

/// Decodes a multi-mutate body back into commands.
///
/// Used by tests and mock servers to verify what was sent.
pub fn decode_mutation_commands(mut body: Bytes) -> Result<Vec<SubdocCommand>> {
    let mut commands = Vec::new();
    while body.has_remaining() {
        if body.remaining() < 8 {
            return Err(CoreError::Protocol(
                "truncated sub-document command header".to_string(),
            ));
        }
        let opcode = body.get_u8();
        let flags = body.get_u8();
        let path_len = body.get_u16() as usize;
        let value_len = body.get_u32() as usize;
        if body.remaining() < path_len + value_len {
            return Err(CoreError::Protocol(
                "truncated sub-document command payload".to_string(),
            ));
        }
        let path = String::from_utf8(body.split_to(path_len).to_vec())
            .map_err(|_| CoreError::Protocol("sub-document path is not UTF-8".to_string()))?;
        let fragment = body.split_to(value_len).to_vec();

        let command_type = command_type_from_opcode(opcode)?;
        commands.push(SubdocCommand {
            command_type,
            path,
            fragment,
            create_parent: flags & subdoc_flag::CREATE_PATH != 0,
            xattr: flags & subdoc_flag::XATTR_PATH != 0,
        });
    }
    Ok(commands)
}

fn command_type_from_opcode(opcode: u8) -> Result<SubdocCommandType> {
    let command_type = match opcode {
        subdoc_opcode::GET => SubdocCommandType::Get,
        subdoc_opcode::EXISTS => SubdocCommandType::Exists,
        subdoc_opcode::DICT_ADD => SubdocCommandType::DictAdd,
        subdoc_opcode::DICT_UPSERT => SubdocCommandType::DictUpsert,
        subdoc_opcode::DELETE => SubdocCommandType::Delete,
        subdoc_opcode::REPLACE => SubdocCommandType::Replace,
        subdoc_opcode::ARRAY_PUSH_LAST => SubdocCommandType::ArrayPushLast,
        subdoc_opcode::ARRAY_PUSH_FIRST => SubdocCommandType::ArrayPushFirst,
        subdoc_opcode::ARRAY_INSERT => SubdocCommandType::ArrayInsert,
        subdoc_opcode::ARRAY_ADD_UNIQUE => SubdocCommandType::ArrayAddUnique,
        subdoc_opcode::COUNTER => SubdocCommandType::Counter,
        subdoc_opcode::GET_COUNT => SubdocCommandType::GetCount,
        other => {
            return Err(CoreError::Protocol(format!(
                "unknown sub-document opcode 0x{:02x}",
                other
            )))
        }
    };
    Ok(command_type)
}

/// The outcome of a single operation within a multi request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubdocOpResult {
    /// Per-operation status.
    pub status: Status,
    /// Returned value bytes; empty for mutations without a result.
    pub value: Bytes,
}

/// The decoded outcome of a multi lookup or mutate request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubdocResult {
    /// Effective frame-level status after per-operation reconciliation.
    pub status: Status,
    /// Per-operation results, in command order.
    pub ops: Vec<SubdocOpResult>,
}

/// Decodes the per-operation records from a multi response body.
///
/// Layout per record: `status(u16) | value-len(u32) | value-bytes`. The
/// records are self-delimiting; one record arrives per sent command.
pub fn decode_op_records(mut body: Bytes) -> Result<Vec<SubdocOpResult>> {
    let mut ops = Vec::new();
    while body.has_remaining() {
        if body.remaining() < 6 {
            return Err(CoreError::Protocol(
                "truncated sub-document response record".to_string(),
            ));
        }
        let status = Status::from_raw(body.get_u16());
        let value_len = body.get_u32() as usize;
        if body.remaining() < value_len {
            return Err(CoreError::Protocol(
                "truncated sub-document response value".to_string(),
            ));
        }
        let value = body.split_to(value_len);
        ops.push(SubdocOpResult { status, value });
    }
    Ok(ops)
}

/// Reconciles the frame-level status with the per-operation statuses.
///
/// With `SUBDOC_MULTI_PATH_FAILURE` on a single-command request the failed
/// command's status is surfaced directly; with multiple commands partial
/// success is reported as success and callers inspect the per-operation
/// vector. Whole-document failures pass through unchanged.
pub fn reconcile_status(frame_status: Status, ops: &[SubdocOpResult]) -> Status {
    // A rejected command combination is a client-side encoding bug, not a
    // server condition to recover from.
    debug_assert!(
        frame_status != Status::SubdocInvalidCombo,
        "multi request encoded an invalid command combination"
    );

    if frame_status == Status::SubdocDocNotJson || frame_status == Status::SubdocDocTooDeep {
        return frame_status;
    }

    let failed: Vec<Status> = ops
        .iter()
        .map(|op| op.status)
        .filter(|s| !s.is_success())
        .collect();

    if frame_status == Status::SubdocMultiPathFailure {
        if ops.len() == 1 && failed.len() == 1 {
            failed[0]
        } else {
            Status::Success
        }
    } else if ops.len() == 1 && failed.len() == 1 {
        failed[0]
    } else {
        frame_status
    }
}

/// Decodes a multi-mutate response body and reconciles the frame status
/// with the per-operation statuses.
///
/// Whole-document failures (`SUBDOC_DOC_NOT_JSON`, `SUBDOC_DOC_TOO_DEEP`)
/// carry an empty per-operation vector.
pub fn decode_multi_mutate(
    frame_status: Status,
    body: Bytes,
    command_count: usize,
) -> Result<SubdocResult> {
    if frame_status == Status::SubdocDocNotJson || frame_status == Status::SubdocDocTooDeep {
        return Ok(SubdocResult {
            status: frame_status,
            ops: Vec::new(),
        });
    }

    let ops = decode_op_records(body)?;
    if !ops.is_empty() && ops.len() != command_count {
        return Err(CoreError::Protocol(format!(
            "sub-document response carries {} records for {} commands",
            ops.len(),
            command_count
        )));
    }

    let status = reconcile_status(frame_status, &ops);
    Ok(SubdocResult { status, ops })
}

/// Decodes a multi-lookup response body.
///
/// Lookups permit partial success: the per-operation vector always carries
/// one record per command and the frame status reconciles the same way as
/// mutations.
pub fn decode_multi_lookup(
    frame_status: Status,
    body: Bytes,
    command_count: usize,
) -> Result<SubdocResult> {
    decode_multi_mutate(frame_status, body, command_count)
}
