//! Request planning: building tag service requests, packing as many
//! operations as fit into Multiple Service Packets under the negotiated
//! payload budget, demoting over-size operations to the fragmented
//! services, and splitting multi-service replies back apart.
//!
//! Everything here is synchronous and side-effect free; the I/O loops
//! that execute a plan live on [`crate::LogixClient`].

use bytes::{Buf, BufMut};

use crate::cip::{
    class_code, service, type_code, MULTISERVICE_REPLY_OVERHEAD, SERVICE_REPLY_OVERHEAD,
    STRUCTURE_TYPE_MARKER,
};
use crate::eip::ServiceReply;
use crate::epath::{logical_request_path, tag_request_path};
use crate::error::{EipError, Result};
use crate::types::{CipType, TagValue};

/// What a single user operation does on the wire.
#[derive(Debug, Clone)]
pub enum OperationKind {
    Read,
    /// Write with the value already encoded for the target type.
    Write { value: Vec<u8> },
    /// Single-bit write folded into a Read-Modify-Write.
    WriteBit { set: bool },
}

/// One resolved user operation, ready for planning.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Index into the caller's argument list; results are returned in
    /// this order.
    pub request_id: usize,
    /// The reference exactly as the user spelled it.
    pub user_tag: String,
    /// The name addressed on the PLC.
    pub plc_tag: String,
    pub elements: u16,
    /// Descriptor for one element.
    pub element_type: CipType,
    pub data_type_name: String,
    /// Symbol instance for instance-id addressing, when permitted.
    pub instance_id: Option<u32>,
    /// Bit number for BOOL-array or packed-bit access.
    pub bit: Option<u32>,
    /// BOOL count requested from a BOOL array.
    pub bool_elements: Option<u16>,
    pub kind: OperationKind,
    /// Set when request parsing or value encoding already failed; the
    /// operation is skipped and the error surfaces in its result.
    pub error: Option<String>,
}

impl Operation {
    /// Wire size of one element; structures use their template size.
    pub fn element_size(&self) -> usize {
        self.element_type.wire_size().unwrap_or(0)
    }

    /// Expected reply payload for a read: data plus the service reply
    /// header and the type prefix.
    fn expected_reply_size(&self) -> usize {
        let data = self.element_size() * self.elements as usize;
        let type_prefix = match &self.element_type {
            CipType::Struct(_) => 4,
            _ => 2,
        };
        SERVICE_REPLY_OVERHEAD + 2 + type_prefix + data
    }

    fn request_path(&self, use_instance_ids: bool) -> Result<Vec<u8>> {
        let instance = if use_instance_ids { self.instance_id } else { None };
        tag_request_path(&self.plc_tag, instance)
    }

    /// Data-type prefix for write requests: elementary code or the
    /// structure marker plus template handle.
    fn write_type_prefix(&self) -> Vec<u8> {
        match &self.element_type {
            CipType::Struct(s) => {
                let mut prefix = Vec::with_capacity(4);
                prefix.put_u16_le(STRUCTURE_TYPE_MARKER);
                prefix.put_u16_le(s.handle);
                prefix
            }
            CipType::Elementary(e) => vec![e.code(), 0x00],
            // strings stand alone only in generic messages; tags are
            // always templates
            _ => vec![type_code::DWORD, 0x00],
        }
    }
}

/// Builds a plain Read Tag request.
pub fn read_request(op: &Operation, use_instance_ids: bool) -> Result<Vec<u8>> {
    let path = op.request_path(use_instance_ids)?;
    let mut message = Vec::with_capacity(1 + path.len() + 2);
    message.push(service::READ_TAG);
    message.extend_from_slice(&path);
    message.put_u16_le(op.elements);
    Ok(message)
}

/// Builds a Read Tag Fragmented request at the given byte offset.
pub fn read_fragmented_request(
    op: &Operation,
    use_instance_ids: bool,
    offset: u32,
) -> Result<Vec<u8>> {
    let path = op.request_path(use_instance_ids)?;
    let mut message = Vec::with_capacity(1 + path.len() + 6);
    message.push(service::READ_TAG_FRAGMENTED);
    message.extend_from_slice(&path);
    message.put_u16_le(op.elements);
    message.put_u32_le(offset);
    Ok(message)
}

/// Builds a Write Tag request carrying the full encoded value.
pub fn write_request(op: &Operation, use_instance_ids: bool, value: &[u8]) -> Result<Vec<u8>> {
    let path = op.request_path(use_instance_ids)?;
    let prefix = op.write_type_prefix();
    let mut message = Vec::with_capacity(1 + path.len() + prefix.len() + 2 + value.len());
    message.push(service::WRITE_TAG);
    message.extend_from_slice(&path);
    message.extend_from_slice(&prefix);
    message.put_u16_le(op.elements);
    message.extend_from_slice(value);
    Ok(message)
}

/// Builds one Write Tag Fragmented chunk.
pub fn write_fragmented_request(
    op: &Operation,
    use_instance_ids: bool,
    offset: u32,
    chunk: &[u8],
) -> Result<Vec<u8>> {
    let path = op.request_path(use_instance_ids)?;
    let prefix = op.write_type_prefix();
    let mut message = Vec::with_capacity(1 + path.len() + prefix.len() + 6 + chunk.len());
    message.push(service::WRITE_TAG_FRAGMENTED);
    message.extend_from_slice(&path);
    message.extend_from_slice(&prefix);
    message.put_u16_le(op.elements);
    message.put_u32_le(offset);
    message.extend_from_slice(chunk);
    Ok(message)
}

/// One coalesced Read-Modify-Write request: all single-bit writes to the
/// same tag collapse into one masked update.
#[derive(Debug, Clone)]
pub struct BitWrite {
    pub plc_tag: String,
    pub instance_id: Option<u32>,
    /// Host word width in bytes.
    pub mask_size: usize,
    pub or_mask: u64,
    pub and_mask: u64,
    /// Every operation answered by this request.
    pub request_ids: Vec<usize>,
}

impl BitWrite {
    pub fn new(plc_tag: &str, instance_id: Option<u32>, mask_size: usize) -> Self {
        BitWrite {
            plc_tag: plc_tag.to_string(),
            instance_id,
            mask_size,
            or_mask: 0,
            and_mask: u64::MAX,
            request_ids: Vec::new(),
        }
    }

    pub fn set_bit(&mut self, bit: u32, set: bool, request_id: usize) {
        let bit = bit as usize % (self.mask_size * 8);
        if set {
            self.or_mask |= 1 << bit;
        } else {
            self.and_mask &= !(1 << bit);
        }
        self.request_ids.push(request_id);
    }

    pub fn build_message(&self, use_instance_ids: bool) -> Result<Vec<u8>> {
        let instance = if use_instance_ids { self.instance_id } else { None };
        let path = tag_request_path(&self.plc_tag, instance)?;
        let mut message = Vec::with_capacity(1 + path.len() + 2 + self.mask_size * 2);
        message.push(service::READ_MODIFY_WRITE_TAG);
        message.extend_from_slice(&path);
        message.put_u16_le(self.mask_size as u16);
        message.extend_from_slice(&self.or_mask.to_le_bytes()[..self.mask_size]);
        message.extend_from_slice(&self.and_mask.to_le_bytes()[..self.mask_size]);
        Ok(message)
    }
}

/// One wire request produced by the planner.
#[derive(Debug, Clone)]
pub enum PlannedRequest {
    /// A Multiple Service Packet carrying the listed operations.
    Multi(Vec<usize>),
    /// One plain request on its own frame (Micro800, or a lone op).
    Single(usize),
    /// Over-budget read, paged via Read Tag Fragmented.
    FragmentedRead(usize),
    /// Over-budget write, paged via Write Tag Fragmented.
    FragmentedWrite(usize),
    /// Coalesced single-bit writes.
    BitWrite(BitWrite),
}

/// Packs operations into the fewest frames that respect `budget` on both
/// the request and reply side. Operations keep their submission order
/// inside and across bins.
pub fn plan_requests(
    ops: &[Operation],
    budget: usize,
    use_multi: bool,
    use_instance_ids: bool,
) -> Result<Vec<PlannedRequest>> {
    let mut multi: Vec<PlannedRequest> = Vec::new();
    let mut fragmented: Vec<PlannedRequest> = Vec::new();
    let mut bit_writes: Vec<BitWrite> = Vec::new();

    let mut group: Vec<usize> = Vec::new();
    let mut group_request = MULTISERVICE_REPLY_OVERHEAD;
    let mut group_reply = MULTISERVICE_REPLY_OVERHEAD;

    for op in ops {
        if op.error.is_some() {
            continue;
        }

        if let OperationKind::WriteBit { set } = op.kind {
            match bit_writes.iter_mut().find(|w| w.plc_tag == op.plc_tag) {
                Some(existing) => existing.set_bit(op.bit.unwrap_or(0), set, op.request_id),
                None => {
                    let mut write =
                        BitWrite::new(&op.plc_tag, op.instance_id, op.element_size().max(1));
                    write.set_bit(op.bit.unwrap_or(0), set, op.request_id);
                    bit_writes.push(write);
                }
            }
            continue;
        }

        let (request_size, reply_size) = match &op.kind {
            OperationKind::Read => {
                let message = read_request(op, use_instance_ids)?;
                (message.len(), op.expected_reply_size() + message.len())
            }
            OperationKind::Write { value } => {
                let message = write_request(op, use_instance_ids, value)?;
                (message.len(), SERVICE_REPLY_OVERHEAD + 2)
            }
            OperationKind::WriteBit { .. } => unreachable!(),
        };

        // an operation that cannot fit alone goes to the fragmented
        // services; a reply that cannot fit does too
        if request_size + MULTISERVICE_REPLY_OVERHEAD > budget
            || reply_size + MULTISERVICE_REPLY_OVERHEAD > budget
        {
            fragmented.push(match op.kind {
                OperationKind::Read => PlannedRequest::FragmentedRead(op.request_id),
                _ => PlannedRequest::FragmentedWrite(op.request_id),
            });
            continue;
        }

        if !use_multi {
            multi.push(PlannedRequest::Single(op.request_id));
            continue;
        }

        // each entry also costs an offset-table slot in the request
        if !group.is_empty()
            && (group_request + request_size + 2 > budget || group_reply + reply_size > budget)
        {
            multi.push(PlannedRequest::Multi(std::mem::take(&mut group)));
            group_request = MULTISERVICE_REPLY_OVERHEAD;
            group_reply = MULTISERVICE_REPLY_OVERHEAD;
        }
        group.push(op.request_id);
        group_request += request_size + 2;
        group_reply += reply_size;
    }

    if !group.is_empty() {
        multi.push(PlannedRequest::Multi(group));
    }

    // a multi packet wrapping a single op gains nothing
    for planned in &mut multi {
        if let PlannedRequest::Multi(ids) = planned {
            if ids.len() == 1 {
                *planned = PlannedRequest::Single(ids[0]);
            }
        }
    }

    multi.extend(fragmented);
    multi.extend(bit_writes.into_iter().map(PlannedRequest::BitWrite));
    Ok(multi)
}

/// Builds the Multiple Service Packet wrapping the given messages.
pub fn multi_service_request(messages: &[Vec<u8>]) -> Result<Vec<u8>> {
    let path = logical_request_path(class_code::MESSAGE_ROUTER, 1, None)?;
    let count = messages.len();
    let mut message = Vec::with_capacity(
        1 + path.len() + 2 + 2 * count + messages.iter().map(Vec::len).sum::<usize>(),
    );
    message.push(service::MULTIPLE_SERVICE_PACKET);
    message.extend_from_slice(&path);
    message.put_u16_le(count as u16);

    let mut offset = 2 + 2 * count;
    for embedded in messages {
        message.put_u16_le(offset as u16);
        offset += embedded.len();
    }
    for embedded in messages {
        message.extend_from_slice(embedded);
    }
    Ok(message)
}

/// Splits a Multiple Service Packet reply into its per-entry replies,
/// in request order.
pub fn parse_multi_service_reply(data: &[u8]) -> Result<Vec<ServiceReply>> {
    let mut cursor = data;
    if cursor.remaining() < 2 {
        return Err(EipError::Framing("multi-service reply too short".into()));
    }
    let count = cursor.get_u16_le() as usize;
    if cursor.remaining() < count * 2 {
        return Err(EipError::Framing("multi-service offset table truncated".into()));
    }
    let offsets: Vec<usize> = (0..count).map(|_| cursor.get_u16_le() as usize).collect();

    let mut replies = Vec::with_capacity(count);
    for (i, &start) in offsets.iter().enumerate() {
        let end = offsets.get(i + 1).copied().unwrap_or(data.len());
        if start > end || end > data.len() {
            return Err(EipError::Framing(format!(
                "multi-service entry {i} has invalid bounds {start}..{end}"
            )));
        }
        replies.push(ServiceReply::parse(&data[start..end])?);
    }
    Ok(replies)
}

/// Decodes the payload of a read reply: the type prefix, then `elements`
/// values of the operation's element type. Returns the value and the
/// reported type name.
pub fn decode_read_reply(data: &[u8], op: &Operation) -> Result<(TagValue, String)> {
    let mut cursor = data;
    if cursor.remaining() < 2 {
        return Err(EipError::Framing("read reply missing type code".into()));
    }
    let reply_type = cursor.get_u16_le();
    if reply_type == STRUCTURE_TYPE_MARKER {
        if cursor.remaining() < 2 {
            return Err(EipError::Framing("read reply missing structure handle".into()));
        }
        let handle = cursor.get_u16_le();
        if let CipType::Struct(expected) = &op.element_type {
            if expected.handle != handle {
                return Err(EipError::DataValue(format!(
                    "structure handle 0x{:04X} does not match template {} (0x{:04X}); \
                     the data type may have been edited online",
                    handle, expected.name, expected.handle
                )));
            }
        }
    }

    let value = op
        .element_type
        .decode_elements(&mut cursor, op.elements as usize)?;
    Ok((value, op.data_type_name.clone()))
}

/// Expected total read size in bytes, the termination condition for the
/// fragmented read loop.
pub fn expected_read_bytes(op: &Operation) -> usize {
    op.element_size() * op.elements as usize
}
