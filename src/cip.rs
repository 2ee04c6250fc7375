//! CIP and EtherNet/IP protocol constants.
//!
//! Service, class and status codes follow ODVA CIP Volume 1/2. Only the
//! values this driver actually puts on the wire are defined here.

use lazy_static::lazy_static;
use std::collections::HashMap;

/// Encapsulation header is always 24 bytes.
pub const ENCAP_HEADER_LEN: usize = 24;

/// EtherNet/IP port.
pub const EIP_DEFAULT_PORT: u16 = 44818;

/// Encapsulation commands (EtherNet/IP spec §2-3).
pub mod encap_command {
    pub const NOP: u16 = 0x0000;
    pub const LIST_IDENTITY: u16 = 0x0063;
    pub const REGISTER_SESSION: u16 = 0x0065;
    pub const UNREGISTER_SESSION: u16 = 0x0066;
    pub const SEND_RR_DATA: u16 = 0x006F;
    pub const SEND_UNIT_DATA: u16 = 0x0070;
}

/// Common Packet Format item type codes.
pub mod cpf_item {
    pub const NULL_ADDRESS: u16 = 0x0000;
    pub const CONNECTED_ADDRESS: u16 = 0x00A1;
    pub const CONNECTED_DATA: u16 = 0x00B1;
    pub const UNCONNECTED_DATA: u16 = 0x00B2;
    pub const SEQUENCED_ADDRESS: u16 = 0x8002;
}

/// CIP service codes.
pub mod service {
    pub const GET_ATTRIBUTES_ALL: u8 = 0x01;
    pub const GET_ATTRIBUTE_LIST: u8 = 0x03;
    pub const SET_ATTRIBUTE_LIST: u8 = 0x04;
    pub const GET_ATTRIBUTE_SINGLE: u8 = 0x0E;
    pub const MULTIPLE_SERVICE_PACKET: u8 = 0x0A;
    pub const READ_TAG: u8 = 0x4C;
    pub const WRITE_TAG: u8 = 0x4D;
    pub const READ_MODIFY_WRITE_TAG: u8 = 0x4E;
    pub const READ_TAG_FRAGMENTED: u8 = 0x52;
    pub const WRITE_TAG_FRAGMENTED: u8 = 0x53;
    pub const GET_INSTANCE_ATTRIBUTE_LIST: u8 = 0x55;

    /// Connection Manager services.
    pub const FORWARD_CLOSE: u8 = 0x4E;
    pub const UNCONNECTED_SEND: u8 = 0x52;
    pub const FORWARD_OPEN: u8 = 0x54;
    pub const LARGE_FORWARD_OPEN: u8 = 0x5B;

    /// Set in the service byte of every reply.
    pub const REPLY_MASK: u8 = 0x80;
}

/// CIP object class codes.
pub mod class_code {
    pub const IDENTITY_OBJECT: u16 = 0x01;
    pub const MESSAGE_ROUTER: u16 = 0x02;
    pub const CONNECTION_MANAGER: u16 = 0x06;
    pub const PROGRAM_NAME: u16 = 0x64;
    pub const SYMBOL_OBJECT: u16 = 0x6B;
    pub const TEMPLATE_OBJECT: u16 = 0x6C;
    pub const WALL_CLOCK_TIME: u16 = 0x8B;
}

/// Elementary CIP data type codes.
pub mod type_code {
    pub const BOOL: u8 = 0xC1;
    pub const SINT: u8 = 0xC2;
    pub const INT: u8 = 0xC3;
    pub const DINT: u8 = 0xC4;
    pub const LINT: u8 = 0xC5;
    pub const USINT: u8 = 0xC6;
    pub const UINT: u8 = 0xC7;
    pub const UDINT: u8 = 0xC8;
    pub const ULINT: u8 = 0xC9;
    pub const REAL: u8 = 0xCA;
    pub const LREAL: u8 = 0xCB;
    pub const STRING: u8 = 0xD0;
    pub const BYTE: u8 = 0xD1;
    pub const WORD: u8 = 0xD2;
    pub const DWORD: u8 = 0xD3;
    pub const LWORD: u8 = 0xD4;
    pub const SHORT_STRING: u8 = 0xDA;
}

/// Marker prefix of a structured read reply / write request data type:
/// `0xA0 0x02` followed by the 16-bit structure handle.
pub const STRUCTURE_TYPE_MARKER: u16 = 0x02A0;

/// CIP general status codes used for control flow.
pub const STATUS_SUCCESS: u8 = 0x00;
pub const STATUS_PATH_SEGMENT_ERROR: u8 = 0x04;
pub const STATUS_PARTIAL_TRANSFER: u8 = 0x06;
pub const STATUS_SERVICE_NOT_SUPPORTED: u8 = 0x08;
pub const STATUS_TOO_MUCH_DATA: u8 = 0x15;
pub const STATUS_INVALID_PARAMETER: u8 = 0x20;

/// Fixed overhead assumed for a multi-service reply when packing
/// (service header + count + offset table slack).
pub const MULTISERVICE_REPLY_OVERHEAD: usize = 10;

/// Per-entry reply overhead: service + reserved + status + ext-status size.
pub const SERVICE_REPLY_OVERHEAD: usize = 2;

/// Symbol Instance Addressing not supported below firmware v21.
pub const MIN_VER_INSTANCE_IDS: u8 = 21;
/// ExternalAccess symbol attribute added in firmware v18.
pub const MIN_VER_EXTERNAL_ACCESS: u8 = 18;

/// Catalog number prefix identifying Micro800 PLCs.
pub const MICRO800_PREFIX: &str = "2080";

/// Template member records are 8 bytes: info (u16), type (u16), offset (u32).
pub const TEMPLATE_MEMBER_INFO_LEN: usize = 8;

/// Reading a template skips a 23-byte header the object itself prepends.
pub const TEMPLATE_HEADER_ADJUST: u32 = 23;

/// Unconnected Send / Forward Open timing constants (CIP Vol 1, 3-5.5).
pub const PRIORITY_TICK_TIME: u8 = 0x0A;
pub const TIMEOUT_TICKS: u8 = 0x05;
pub const TIMEOUT_MULTIPLIER: u8 = 0x07;
/// Class 3, application trigger, direction server->client.
pub const TRANSPORT_CLASS: u8 = 0xA3;
/// Fixed O->T / T->O RPI in microseconds; not meaningful for class 3.
pub const CONNECTION_RPI_US: u32 = 0x0020_4001;
/// Network parameter base: point-to-point, low priority, variable size.
pub const NET_PARAMS_BASE: u16 = 0b0100_0010_0000_0000;

/// Payload sizes negotiated by the two Forward Open flavors.
pub const EXTENDED_CONNECTION_SIZE: u16 = 4000;
pub const STANDARD_CONNECTION_SIZE: u16 = 500;

/// `software_control` bit marking a base (non-alias) tag.
pub const BASE_TAG_BIT: u32 = 1 << 26;

/// External access values reported by symbol attribute 10.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalAccess {
    ReadWrite,
    ReadOnly,
    NoAccess,
    Unknown,
}

impl ExternalAccess {
    pub fn from_attribute(value: Option<u8>) -> Self {
        match value {
            Some(0) => ExternalAccess::ReadWrite,
            Some(1) => ExternalAccess::ReadOnly,
            Some(3) => ExternalAccess::NoAccess,
            _ => ExternalAccess::Unknown,
        }
    }
}

/// Human-readable message for a CIP general status code (ODVA table).
pub fn cip_status_message(status: u8) -> &'static str {
    match status {
        0x00 => "Success",
        0x01 => "Connection failure",
        0x02 => "Resource unavailable",
        0x03 => "Invalid parameter value",
        0x04 => "Path segment error",
        0x05 => "Path destination unknown",
        0x06 => "Partial transfer",
        0x07 => "Connection lost",
        0x08 => "Service not supported",
        0x09 => "Invalid attribute value",
        0x0A => "Attribute list error",
        0x0B => "Already in requested mode/state",
        0x0C => "Object state conflict",
        0x0D => "Object already exists",
        0x0E => "Attribute not settable",
        0x0F => "Privilege violation",
        0x10 => "Device state conflict",
        0x11 => "Reply data too large",
        0x12 => "Fragmentation of a primitive value",
        0x13 => "Not enough data",
        0x14 => "Attribute not supported",
        0x15 => "Too much data",
        0x16 => "Object does not exist",
        0x17 => "Service fragmentation sequence not in progress",
        0x18 => "No stored attribute data",
        0x19 => "Store operation failure",
        0x1A => "Routing failure, request packet too large",
        0x1B => "Routing failure, response packet too large",
        0x1C => "Missing attribute list entry data",
        0x1D => "Invalid attribute value list",
        0x1E => "Embedded service error",
        0x1F => "Vendor specific error",
        0x20 => "Invalid parameter",
        0x21 => "Write-once value or medium already written",
        0x22 => "Invalid reply received",
        0x23 => "Buffer overflow",
        0x24 => "Invalid message format",
        0x25 => "Key failure in path",
        0x26 => "Path size invalid",
        0x27 => "Unexpected attribute in list",
        0x28 => "Invalid member ID",
        0x29 => "Member not settable",
        0x2A => "Group 2 only server general failure",
        0x2B => "Unknown Modbus error",
        0x2C => "Attribute not gettable",
        _ => "Unknown CIP status",
    }
}

lazy_static! {
    /// Extended status words with specific meanings, keyed by
    /// (general status, extended status).
    static ref EXTENDED_STATUS: HashMap<(u8, u16), &'static str> = {
        let mut m = HashMap::new();
        m.insert((0x01, 0x0100), "Connection in use or duplicate forward open");
        m.insert((0x01, 0x0103), "Transport class and trigger combination not supported");
        m.insert((0x01, 0x0106), "Ownership conflict");
        m.insert((0x01, 0x0107), "Target connection not found");
        m.insert((0x01, 0x0108), "Invalid network connection parameter");
        m.insert((0x01, 0x0109), "Invalid connection size");
        m.insert((0x01, 0x0110), "Target for connection not configured");
        m.insert((0x01, 0x0111), "RPI not supported");
        m.insert((0x01, 0x0113), "Out of connections");
        m.insert((0x01, 0x0114), "Vendor ID or product code mismatch");
        m.insert((0x01, 0x0115), "Product type mismatch");
        m.insert((0x01, 0x0116), "Revision mismatch");
        m.insert((0x01, 0x011A), "Target object out of connections");
        m.insert((0x01, 0x0203), "Connection timed out");
        m.insert((0x01, 0x0204), "Unconnected request timed out");
        m.insert((0x01, 0x0205), "Parameter error in unconnected request service");
        m.insert((0x01, 0x0206), "Message too large for unconnected_send service");
        m.insert((0x01, 0x0301), "No buffer memory available");
        m.insert((0x01, 0x0302), "Network bandwidth not available for data");
        m.insert((0x01, 0x0311), "Port not available");
        m.insert((0x01, 0x0312), "Link address not valid");
        m.insert((0x01, 0x0315), "Invalid segment in connection path");
        m.insert((0x01, 0x0317), "Connection schedule not specified");
        m.insert((0x01, 0x0318), "Link address to self invalid");
        m.insert((0x05, 0x0000), "Class or instance not supported");
        m.insert((0xFF, 0x2104), "Address out of range");
        m.insert((0xFF, 0x2105), "Attempt to access beyond the end of data object");
        m.insert((0xFF, 0x2107), "Data type is invalid or not supported");
        m
    };
}

/// Best-effort extended status lookup; falls back to the raw word.
pub fn extended_status_message(status: u8, extended: u16) -> String {
    match EXTENDED_STATUS.get(&(status, extended)) {
        Some(msg) => (*msg).to_string(),
        None => format!("extended status 0x{:04X}", extended),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_messages() {
        assert_eq!(cip_status_message(0x04), "Path segment error");
        assert_eq!(cip_status_message(0x06), "Partial transfer");
        assert_eq!(cip_status_message(0xE0), "Unknown CIP status");
    }

    #[test]
    fn test_extended_status_lookup() {
        assert_eq!(
            extended_status_message(0x01, 0x0109),
            "Invalid connection size"
        );
        assert_eq!(extended_status_message(0x01, 0x9999), "extended status 0x9999");
    }

    #[test]
    fn test_external_access_mapping() {
        assert_eq!(ExternalAccess::from_attribute(Some(0)), ExternalAccess::ReadWrite);
        assert_eq!(ExternalAccess::from_attribute(Some(1)), ExternalAccess::ReadOnly);
        assert_eq!(ExternalAccess::from_attribute(Some(3)), ExternalAccess::NoAccess);
        assert_eq!(ExternalAccess::from_attribute(None), ExternalAccess::Unknown);
    }
}
