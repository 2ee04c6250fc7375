//! Generic CIP messaging: caller-specified service, class, instance and
//! attribute, the same surface a MSG instruction offers in Logix.
//!
//! The builders here are pure; [`crate::LogixClient::generic_message`]
//! routes the encoded request through the connected session or a one-shot
//! Unconnected Send.

use bytes::BufMut;

use crate::cip::{class_code, service, PRIORITY_TICK_TIME, TIMEOUT_TICKS};
use crate::epath::{encode_padded_epath, logical_request_path, Segment};
use crate::error::Result;
use crate::types::CipType;

/// Parameters for one generic message, built fluent-style:
///
/// ```
/// use logix_cip::generic::MessageParams;
/// use logix_cip::cip::{service, class_code};
///
/// let params = MessageParams::new(service::GET_ATTRIBUTES_ALL, class_code::IDENTITY_OBJECT, 1)
///     .name("identity")
///     .unconnected();
/// assert!(!params.connected);
/// ```
#[derive(Debug, Clone)]
pub struct MessageParams {
    pub service: u8,
    pub class_code: u16,
    pub instance: u32,
    pub attribute: Option<u16>,
    pub request_data: Vec<u8>,
    /// Decoder applied to the reply data; `None` returns raw bytes.
    pub response_type: Option<CipType>,
    /// Route through the established CIP connection (Forward Open).
    pub connected: bool,
    /// Unconnected only: wrap in an Unconnected Send with a route path.
    pub unconnected_send: bool,
    /// Route for the Unconnected Send wrapper; `None` uses the
    /// connection path the client was opened with.
    pub route_path: Option<Vec<Segment>>,
    /// Label echoed in the returned result, useful for tracking.
    pub name: String,
}

impl MessageParams {
    pub fn new(service: u8, class_code: u16, instance: u32) -> Self {
        MessageParams {
            service,
            class_code,
            instance,
            attribute: None,
            request_data: Vec::new(),
            response_type: None,
            connected: true,
            unconnected_send: false,
            route_path: None,
            name: "generic".to_string(),
        }
    }

    pub fn attribute(mut self, attribute: u16) -> Self {
        self.attribute = Some(attribute);
        self
    }

    pub fn request_data(mut self, data: Vec<u8>) -> Self {
        self.request_data = data;
        self
    }

    pub fn response_type(mut self, typ: CipType) -> Self {
        self.response_type = Some(typ);
        self
    }

    pub fn unconnected(mut self) -> Self {
        self.connected = false;
        self
    }

    pub fn unconnected_send(mut self) -> Self {
        self.connected = false;
        self.unconnected_send = true;
        self
    }

    pub fn route_path(mut self, route: Vec<Segment>) -> Self {
        self.route_path = Some(route);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Encodes the bare Message Router request:
    /// service byte, request path, request data.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let path = logical_request_path(self.class_code, self.instance, self.attribute)?;
        let mut message = Vec::with_capacity(1 + path.len() + self.request_data.len());
        message.push(self.service);
        message.extend_from_slice(&path);
        message.extend_from_slice(&self.request_data);
        Ok(message)
    }
}

/// Wraps a message in an Unconnected Send (`0x52` on the Connection
/// Manager) carrying the route to the target processor.
pub fn wrap_unconnected_send(message: &[u8], route: &[Segment]) -> Result<Vec<u8>> {
    let route_path = encode_padded_epath(route, true, true)?;
    let mut wrapped = Vec::with_capacity(12 + message.len() + route_path.len());
    wrapped.push(service::UNCONNECTED_SEND);
    wrapped.extend_from_slice(&logical_request_path(
        class_code::CONNECTION_MANAGER,
        1,
        None,
    )?);
    wrapped.push(PRIORITY_TICK_TIME);
    wrapped.push(TIMEOUT_TICKS);
    wrapped.put_u16_le(message.len() as u16);
    wrapped.extend_from_slice(message);
    if message.len() % 2 != 0 {
        wrapped.push(0x00);
    }
    // route path already carries its word count + reserved pad byte
    wrapped.extend_from_slice(&route_path);
    Ok(wrapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epath::PortSegment;

    #[test]
    fn test_encode_identity_request() {
        let message = MessageParams::new(service::GET_ATTRIBUTES_ALL, class_code::IDENTITY_OBJECT, 1)
            .encode()
            .unwrap();
        assert_eq!(message, vec![0x01, 0x02, 0x20, 0x01, 0x24, 0x01]);
    }

    #[test]
    fn test_encode_with_attribute_and_data() {
        let message = MessageParams::new(service::GET_ATTRIBUTE_SINGLE, 0x6C, 0x01A2)
            .attribute(4)
            .request_data(vec![0xAA, 0xBB])
            .encode()
            .unwrap();
        assert_eq!(
            message,
            vec![0x0E, 0x04, 0x20, 0x6C, 0x25, 0x00, 0xA2, 0x01, 0x30, 0x04, 0xAA, 0xBB]
        );
    }

    #[test]
    fn test_unconnected_send_wrapping() {
        let inner = vec![0x01, 0x02, 0x20, 0x01, 0x24, 0x01];
        let route = vec![Segment::Port(PortSegment::backplane(1))];
        let wrapped = wrap_unconnected_send(&inner, &route).unwrap();

        assert_eq!(wrapped[0], 0x52);
        assert_eq!(&wrapped[1..6], &[0x02, 0x20, 0x06, 0x24, 0x01]);
        assert_eq!(wrapped[6], PRIORITY_TICK_TIME);
        assert_eq!(wrapped[7], TIMEOUT_TICKS);
        assert_eq!(&wrapped[8..10], &(inner.len() as u16).to_le_bytes());
        assert_eq!(&wrapped[10..16], inner.as_slice());
        // even-length message: no pad, then route path with length + pad
        assert_eq!(&wrapped[16..], &[0x01, 0x00, 0x01, 0x01]);
    }

    #[test]
    fn test_unconnected_send_pads_odd_message() {
        let inner = vec![0x0E, 0x02, 0x20, 0x01, 0x24];
        let route = vec![Segment::Port(PortSegment::backplane(0))];
        let wrapped = wrap_unconnected_send(&inner, &route).unwrap();
        let msg_end = 10 + inner.len();
        assert_eq!(wrapped[msg_end], 0x00);
    }
}
