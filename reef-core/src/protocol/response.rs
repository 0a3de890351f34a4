//! Response decoding and mutation token extraction.

use bytes::{Buf, Bytes};

use super::compression::decompress;
use super::constants::opcode;
use super::features::ChannelContext;
use super::frame::KvFrame;
use super::status::Status;
use super::subdoc::{self, SubdocOpResult};
use crate::error::{CoreError, Result};

/// A mutation token proving a durability checkpoint for a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationToken {
    /// Bucket the mutation was applied to.
    pub bucket: Option<String>,
    /// Partition the mutation landed on.
    pub partition: u16,
    /// Partition epoch UUID.
    pub partition_uuid: u64,
    /// Sequence number of the mutation within the partition.
    pub seqno: u64,
}

/// A decoded KV response.
///
/// The response owns its bytes; nothing borrows into the read buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvResponse {
    /// Normalized status.
    pub status: Status,
    /// Opcode echoed from the request.
    pub opcode: u8,
    /// Opaque echoed from the request.
    pub opaque: u32,
    /// CAS of the affected document, 0 when absent.
    pub cas: u64,
    /// Datatype bits of the body as received.
    pub datatype: u8,
    /// Transcoder flags for document reads, when present in the extras.
    pub flags: Option<u32>,
    /// Response body, decompressed if the server sent it Snappy-compressed.
    pub value: Bytes,
    /// Mutation token, when negotiated and carried in the extras.
    pub mutation_token: Option<MutationToken>,
    /// Per-operation results for multi sub-document responses, in command
    /// order; empty for every other opcode.
    pub subdoc_ops: Vec<SubdocOpResult>,
    /// Resolved collection id for `GET_COLLECTION_ID` responses.
    pub collection_id: Option<u32>,
}

impl KvResponse {
    /// Interprets the body as a big-endian counter value.
    pub fn value_as_counter(&self) -> Result<u64> {
        if self.value.len() != 8 {
            return Err(CoreError::Protocol(format!(
                "counter response body has length {}, expected 8",
                self.value.len()
            )));
        }
        let mut buf = self.value.clone();
        Ok(buf.get_u64())
    }
}

/// Returns true if the response opcode belongs to a document read.
fn is_read_opcode(op: u8) -> bool {
    matches!(
        op,
        opcode::GET | opcode::GET_AND_TOUCH | opcode::GET_AND_LOCK
    )
}

/// Returns true if the response opcode belongs to a document mutation.
fn is_mutation_opcode(op: u8) -> bool {
    matches!(
        op,
        opcode::SET
            | opcode::ADD
            | opcode::REPLACE
            | opcode::DELETE
            | opcode::APPEND
            | opcode::PREPEND
            | opcode::INCREMENT
            | opcode::DECREMENT
            | opcode::SUBDOC_MULTI_MUTATE
    )
}

/// Extracts a mutation token from the response extras.
///
/// Layout: `partition-uuid(u64) | seqno(u64)`. Only present when the channel
/// negotiated mutation tokens and the mutation succeeded.
pub fn extract_mutation_token(
    frame: &KvFrame,
    ctx: &ChannelContext,
    partition: u16,
) -> Option<MutationToken> {
    if !ctx.mutation_tokens_enabled() || frame.extras.len() < 16 {
        return None;
    }
    let mut extras = frame.extras.clone();
    Some(MutationToken {
        bucket: ctx.bucket().map(|b| b.to_string()),
        partition,
        partition_uuid: extras.get_u64(),
        seqno: extras.get_u64(),
    })
}

/// Decodes a response frame into a typed response.
///
/// The partition is the one the request was sent to; the response header
/// reuses that field for the status.
pub fn decode_response(
    frame: &KvFrame,
    ctx: &ChannelContext,
    partition: u16,
) -> Result<KvResponse> {
    if !frame.is_response() {
        return Err(CoreError::Protocol(
            "attempted to decode a request frame as a response".to_string(),
        ));
    }

    let mut status = Status::from_raw(frame.status());

    let value = if frame.is_snappy() && !frame.body.is_empty() {
        Bytes::from(decompress(&frame.body)?)
    } else {
        frame.body.clone()
    };

    // Multi sub-document responses carry one record per sent command; the
    // frame status is reconciled against the per-operation statuses.
    let subdoc_ops = if matches!(
        frame.opcode,
        opcode::SUBDOC_MULTI_LOOKUP | opcode::SUBDOC_MULTI_MUTATE
    ) && status != Status::SubdocDocNotJson
        && status != Status::SubdocDocTooDeep
    {
        let ops = subdoc::decode_op_records(value.clone())?;
        status = subdoc::reconcile_status(status, &ops);
        ops
    } else {
        Vec::new()
    };

    let flags = if is_read_opcode(frame.opcode) && frame.extras.len() >= 4 {
        Some(u32::from_be_bytes([
            frame.extras[0],
            frame.extras[1],
            frame.extras[2],
            frame.extras[3],
        ]))
    } else {
        None
    };

    let mutation_token = if is_mutation_opcode(frame.opcode) && status.is_success() {
        extract_mutation_token(frame, ctx, partition)
    } else {
        None
    };

    // GET_COLLECTION_ID extras: manifest-uid(u64) | collection-id(u32).
    let collection_id = if frame.opcode == opcode::GET_COLLECTION_ID
        && status.is_success()
        && frame.extras.len() >= 12
    {
        Some(u32::from_be_bytes([
            frame.extras[8],
            frame.extras[9],
            frame.extras[10],
            frame.extras[11],
        ]))
    } else {
        None
    };

    Ok(KvResponse {
        status,
        opcode: frame.opcode,
        opaque: frame.opaque,
        cas: frame.cas,
        datatype: frame.datatype,
        flags,
        value,
        mutation_token,
        subdoc_ops,
        collection_id,
    })
}
