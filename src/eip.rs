//! EtherNet/IP encapsulation framing and Common Packet Format plumbing.
//!
//! Every exchange is a 24-byte little-endian header followed by `length`
//! bytes of command-specific payload. `SendRRData` / `SendUnitData`
//! payloads carry a CPF item list; the CIP message itself rides in an
//! Unconnected Data (0x00B2) or Connected Data (0x00B1) item.

use bytes::{Buf, BufMut};
use log::trace;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::cip::{cpf_item, ENCAP_HEADER_LEN};
use crate::error::{EipError, Result};

/// The fixed 24-byte encapsulation header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncapsulationHeader {
    pub command: u16,
    pub length: u16,
    pub session: u32,
    pub status: u32,
    pub context: [u8; 8],
    pub options: u32,
}

impl EncapsulationHeader {
    pub fn encode(&self) -> [u8; ENCAP_HEADER_LEN] {
        let mut buf = [0u8; ENCAP_HEADER_LEN];
        buf[0..2].copy_from_slice(&self.command.to_le_bytes());
        buf[2..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.session.to_le_bytes());
        buf[8..12].copy_from_slice(&self.status.to_le_bytes());
        buf[12..20].copy_from_slice(&self.context);
        buf[20..24].copy_from_slice(&self.options.to_le_bytes());
        buf
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < ENCAP_HEADER_LEN {
            return Err(EipError::Framing(format!(
                "encapsulation header truncated: {} bytes",
                buf.len()
            )));
        }
        let command = buf.get_u16_le();
        let length = buf.get_u16_le();
        let session = buf.get_u32_le();
        let status = buf.get_u32_le();
        let mut context = [0u8; 8];
        buf.copy_to_slice(&mut context);
        let options = buf.get_u32_le();
        Ok(EncapsulationHeader {
            command,
            length,
            session,
            status,
            context,
            options,
        })
    }
}

/// Builds a complete frame: header plus payload.
pub fn build_frame(command: u16, session: u32, context: [u8; 8], payload: &[u8]) -> Vec<u8> {
    let header = EncapsulationHeader {
        command,
        length: payload.len() as u16,
        session,
        status: 0,
        context,
        options: 0,
    };
    let mut frame = Vec::with_capacity(ENCAP_HEADER_LEN + payload.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(payload);
    frame
}

/// SendRRData payload: interface handle + timeout + CPF
/// `[Null Address, Unconnected Data(message)]`.
pub fn rr_data_payload(message: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16 + message.len());
    payload.put_u32_le(0); // interface handle, 0 for CIP
    payload.put_u16_le(10); // encapsulation timeout, seconds
    payload.put_u16_le(2); // item count
    payload.put_u16_le(cpf_item::NULL_ADDRESS);
    payload.put_u16_le(0);
    payload.put_u16_le(cpf_item::UNCONNECTED_DATA);
    payload.put_u16_le(message.len() as u16);
    payload.extend_from_slice(message);
    payload
}

/// SendUnitData payload: CPF `[Connected Address(O->T connection id),
/// Connected Data(sequence + message)]`.
pub fn unit_data_payload(connection_id: u32, sequence: u16, message: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(24 + message.len());
    payload.put_u32_le(0);
    payload.put_u16_le(10);
    payload.put_u16_le(2);
    payload.put_u16_le(cpf_item::CONNECTED_ADDRESS);
    payload.put_u16_le(4);
    payload.put_u32_le(connection_id);
    payload.put_u16_le(cpf_item::CONNECTED_DATA);
    payload.put_u16_le((message.len() + 2) as u16);
    payload.put_u16_le(sequence);
    payload.extend_from_slice(message);
    payload
}

/// One parsed CPF item.
#[derive(Debug, Clone)]
pub struct CpfItem {
    pub type_id: u16,
    pub data: Vec<u8>,
}

/// Parses the CPF item list out of a SendRRData/SendUnitData payload.
pub fn parse_cpf(payload: &[u8]) -> Result<Vec<CpfItem>> {
    let mut buf = payload;
    if buf.len() < 8 {
        return Err(EipError::Framing("CPF payload too short".into()));
    }
    buf.advance(4); // interface handle
    buf.advance(2); // timeout
    let count = buf.get_u16_le() as usize;

    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.len() < 4 {
            return Err(EipError::Framing("CPF item header truncated".into()));
        }
        let type_id = buf.get_u16_le();
        let len = buf.get_u16_le() as usize;
        if buf.len() < len {
            return Err(EipError::Framing(format!(
                "CPF item 0x{:04X} truncated: need {}, have {}",
                type_id,
                len,
                buf.len()
            )));
        }
        let data = buf[..len].to_vec();
        buf.advance(len);
        items.push(CpfItem { type_id, data });
    }
    Ok(items)
}

/// Pulls the CIP message out of the Unconnected Data item.
pub fn unconnected_message(items: &[CpfItem]) -> Result<Vec<u8>> {
    items
        .iter()
        .find(|item| item.type_id == cpf_item::UNCONNECTED_DATA)
        .map(|item| item.data.clone())
        .ok_or_else(|| EipError::Framing("no Unconnected Data item in reply".into()))
}

/// Pulls `(sequence, CIP message)` out of the Connected Data item.
pub fn connected_message(items: &[CpfItem]) -> Result<(u16, Vec<u8>)> {
    let item = items
        .iter()
        .find(|item| item.type_id == cpf_item::CONNECTED_DATA)
        .ok_or_else(|| EipError::Framing("no Connected Data item in reply".into()))?;
    if item.data.len() < 2 {
        return Err(EipError::Framing("Connected Data item missing sequence".into()));
    }
    let sequence = u16::from_le_bytes([item.data[0], item.data[1]]);
    Ok((sequence, item.data[2..].to_vec()))
}

/// A parsed Message Router reply: service, general status, extended
/// status and the remaining reply data.
#[derive(Debug, Clone)]
pub struct ServiceReply {
    pub service: u8,
    pub status: u8,
    pub extended: Option<u16>,
    pub data: Vec<u8>,
}

impl ServiceReply {
    pub fn parse(message: &[u8]) -> Result<Self> {
        if message.len() < 4 {
            return Err(EipError::Framing("service reply too short".into()));
        }
        let service = message[0] & !crate::cip::service::REPLY_MASK;
        let status = message[2];
        let ext_words = message[3] as usize;
        let data_start = 4 + ext_words * 2;
        if message.len() < data_start {
            return Err(EipError::Framing("extended status truncated".into()));
        }
        let extended = if ext_words > 0 {
            Some(u16::from_le_bytes([message[4], message[5]]))
        } else {
            None
        };
        Ok(ServiceReply {
            service,
            status,
            extended,
            data: message[data_start..].to_vec(),
        })
    }

    pub fn ok(&self) -> bool {
        self.status == crate::cip::STATUS_SUCCESS
    }

    /// Error for a non-success status, allowing the caller to treat
    /// `0x06` (partial transfer) as flow control instead.
    pub fn status_error(&self) -> Option<EipError> {
        if self.ok() {
            None
        } else {
            Some(EipError::cip(self.status, self.extended))
        }
    }
}

/// Writes a frame and flushes it, bounded by `deadline`.
pub async fn write_frame(stream: &mut TcpStream, frame: &[u8], deadline: Duration) -> Result<()> {
    trace!("SEND {} bytes", frame.len());
    match timeout(deadline, stream.write_all(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(EipError::Io(e)),
        Err(_) => Err(EipError::Timeout(deadline)),
    }
}

/// Reads exactly one frame: the 24-byte header, then `length` payload
/// bytes. Short reads block until the deadline expires.
pub async fn read_frame(
    stream: &mut TcpStream,
    deadline: Duration,
) -> Result<(EncapsulationHeader, Vec<u8>)> {
    let mut raw_header = [0u8; ENCAP_HEADER_LEN];
    match timeout(deadline, stream.read_exact(&mut raw_header)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return Err(EipError::Io(e)),
        Err(_) => return Err(EipError::Timeout(deadline)),
    }
    let header = EncapsulationHeader::decode(&raw_header)?;

    let mut payload = vec![0u8; header.length as usize];
    if header.length > 0 {
        match timeout(deadline, stream.read_exact(&mut payload)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(EipError::Io(e)),
            Err(_) => return Err(EipError::Timeout(deadline)),
        }
    }
    trace!(
        "RECV command=0x{:04X} length={} status=0x{:08X}",
        header.command,
        header.length,
        header.status
    );
    Ok((header, payload))
}

/// Checks the encapsulation-level status of a reply header and that it
/// answers the command we sent.
pub fn check_reply_header(header: &EncapsulationHeader, expected_command: u16) -> Result<()> {
    if header.command != expected_command {
        return Err(EipError::Framing(format!(
            "reply command 0x{:04X} does not match request 0x{:04X}",
            header.command, expected_command
        )));
    }
    if header.status != 0 {
        return Err(EipError::Connection(format!(
            "encapsulation status 0x{:08X}",
            header.status
        )));
    }
    Ok(())
}

/// RegisterSession command data: protocol version 1, option flags 0.
pub fn register_session_data() -> Vec<u8> {
    vec![0x01, 0x00, 0x00, 0x00]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cip::encap_command;

    #[test]
    fn test_header_roundtrip() {
        let header = EncapsulationHeader {
            command: encap_command::SEND_RR_DATA,
            length: 42,
            session: 0xDEADBEEF,
            status: 0,
            context: *b"_logix__",
            options: 0,
        };
        let encoded = header.encode();
        assert_eq!(encoded.len(), 24);
        assert_eq!(EncapsulationHeader::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn test_header_layout_is_little_endian() {
        let header = EncapsulationHeader {
            command: 0x0065,
            length: 4,
            session: 0,
            status: 0,
            context: [0; 8],
            options: 0,
        };
        let encoded = header.encode();
        assert_eq!(&encoded[..4], &[0x65, 0x00, 0x04, 0x00]);
    }

    #[test]
    fn test_rr_data_payload_layout() {
        let message = [0x4C, 0x02, 0x91, 0x01];
        let payload = rr_data_payload(&message);
        // interface(4) + timeout(2) + count(2) + null item(4) + data item hdr(4)
        assert_eq!(payload.len(), 16 + message.len());
        assert_eq!(&payload[6..8], &[0x02, 0x00]); // two items
        assert_eq!(&payload[8..10], &[0x00, 0x00]); // null address
        assert_eq!(&payload[12..14], &[0xB2, 0x00]); // unconnected data
        assert_eq!(&payload[14..16], &[0x04, 0x00]); // message length
        assert_eq!(&payload[16..], &message);
    }

    #[test]
    fn test_unit_data_payload_carries_sequence() {
        let payload = unit_data_payload(0x11223344, 7, &[0xAA]);
        let items = parse_cpf(&payload).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].type_id, cpf_item::CONNECTED_ADDRESS);
        assert_eq!(items[0].data, 0x11223344u32.to_le_bytes());
        let (seq, msg) = connected_message(&items).unwrap();
        assert_eq!(seq, 7);
        assert_eq!(msg, vec![0xAA]);
    }

    #[test]
    fn test_parse_cpf_rejects_truncated_item() {
        let mut payload = rr_data_payload(&[1, 2, 3, 4]);
        payload.truncate(payload.len() - 2);
        assert!(matches!(parse_cpf(&payload), Err(EipError::Framing(_))));
    }

    #[test]
    fn test_service_reply_parse() {
        // read tag reply, status 0, DINT type + value
        let msg = [0xCC, 0x00, 0x00, 0x00, 0xC4, 0x00, 0x2A, 0x00, 0x00, 0x00];
        let reply = ServiceReply::parse(&msg).unwrap();
        assert_eq!(reply.service, 0x4C);
        assert!(reply.ok());
        assert_eq!(reply.data.len(), 6);
    }

    #[test]
    fn test_service_reply_extended_status() {
        let msg = [0xD2, 0x00, 0x01, 0x01, 0x09, 0x01];
        let reply = ServiceReply::parse(&msg).unwrap();
        assert_eq!(reply.status, 0x01);
        assert_eq!(reply.extended, Some(0x0109));
        assert!(reply.data.is_empty());
        assert!(matches!(
            reply.status_error(),
            Some(EipError::Cip { status: 0x01, extended: Some(0x0109) })
        ));
    }

    #[tokio::test]
    async fn test_read_frame_over_loopback() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let frame = build_frame(encap_command::REGISTER_SESSION, 0x55, [0u8; 8], &[1, 0, 0, 0]);
            // split the frame to exercise short-read handling
            sock.write_all(&frame[..10]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            sock.write_all(&frame[10..]).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (header, payload) = read_frame(&mut client, Duration::from_secs(2)).await.unwrap();
        assert_eq!(header.command, encap_command::REGISTER_SESSION);
        assert_eq!(header.session, 0x55);
        assert_eq!(payload, vec![1, 0, 0, 0]);
        server.await.unwrap();
    }
}
