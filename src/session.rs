//! EtherNet/IP session and CIP connection management: RegisterSession,
//! ListIdentity, Forward Open / Forward Close and the sequenced
//! connected transport.

use bytes::BufMut;
use log::{debug, info, warn};
use rand::Rng;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::cip::{
    class_code, encap_command, service, CONNECTION_RPI_US, EIP_DEFAULT_PORT,
    EXTENDED_CONNECTION_SIZE, NET_PARAMS_BASE, STANDARD_CONNECTION_SIZE,
    STATUS_SERVICE_NOT_SUPPORTED, STATUS_INVALID_PARAMETER, STATUS_TOO_MUCH_DATA,
    TIMEOUT_MULTIPLIER, TIMEOUT_TICKS, TRANSPORT_CLASS, PRIORITY_TICK_TIME,
};
use crate::eip::{
    build_frame, check_reply_header, connected_message, parse_cpf, read_frame,
    register_session_data, rr_data_payload, unconnected_message, unit_data_payload, write_frame,
    ServiceReply,
};
use crate::epath::{encode_padded_epath, message_router_path, Segment};
use crate::error::{EipError, Result};
use crate::generic::MessageParams;

/// Identity of the target device, from ListIdentity or the Identity
/// Object. Numeric vendor/product codes are surfaced as-is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityObject {
    pub vendor_id: u16,
    pub product_type: u16,
    pub product_code: u16,
    pub revision_major: u8,
    pub revision_minor: u8,
    pub status: u16,
    pub serial: String,
    pub product_name: String,
    pub state: Option<u8>,
}

impl IdentityObject {
    /// Decodes the identity fields shared by ListIdentity replies and
    /// Identity Object `Get_Attributes_All` replies.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < 15 {
            return Err(EipError::Framing("identity object truncated".into()));
        }
        let vendor_id = u16::from_le_bytes([buf[0], buf[1]]);
        let product_type = u16::from_le_bytes([buf[2], buf[3]]);
        let product_code = u16::from_le_bytes([buf[4], buf[5]]);
        let revision_major = buf[6];
        let revision_minor = buf[7];
        let status = u16::from_le_bytes([buf[8], buf[9]]);
        let serial = u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]);
        let name_len = buf[14] as usize;
        if buf.len() < 15 + name_len {
            return Err(EipError::Framing("identity product name truncated".into()));
        }
        let product_name = String::from_utf8_lossy(&buf[15..15 + name_len]).into_owned();
        buf = &buf[15 + name_len..];
        let state = buf.first().copied();
        Ok(IdentityObject {
            vendor_id,
            product_type,
            product_code,
            revision_major,
            revision_minor,
            status,
            serial: format!("{serial:08x}"),
            product_name,
            state,
        })
    }

    pub fn is_micro800(&self) -> bool {
        self.product_name.starts_with(crate::cip::MICRO800_PREFIX)
    }
}

/// State of an open CIP connection (Forward Open result).
#[derive(Debug, Clone, Copy)]
pub struct CipConnection {
    /// O->T connection id, carried in the Connected Address CPF item.
    pub ot_connection_id: u32,
    /// T->O connection id we proposed.
    pub to_connection_id: u32,
    /// Negotiated per-direction payload budget in bytes.
    pub connection_size: u16,
    /// True when the Large Forward Open variant succeeded.
    pub extended: bool,
}

/// One registered EtherNet/IP session over one TCP socket.
///
/// All operations take `&mut self`; a session is owned by exactly one
/// client and never shared.
#[derive(Debug)]
pub struct Session {
    stream: TcpStream,
    session_handle: u32,
    context: [u8; 8],
    timeout: Duration,
    sequence: u16,
    connection: Option<CipConnection>,
    // connection identity material, randomized per session
    connection_id: u32,
    connection_serial: u16,
    vendor_id: u16,
    originator_serial: u32,
    invalid: bool,
}

impl Session {
    /// Opens the TCP connection and registers the session.
    pub async fn connect(host: &str, port: Option<u16>, deadline: Duration) -> Result<Session> {
        let addr = format!("{}:{}", host, port.unwrap_or(EIP_DEFAULT_PORT));
        debug!("connecting to {addr}");
        let stream = match timeout(deadline, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(EipError::Connection(format!("connect to {addr}: {e}"))),
            Err(_) => return Err(EipError::Timeout(deadline)),
        };
        stream
            .set_nodelay(true)
            .map_err(|e| EipError::Connection(format!("set_nodelay: {e}")))?;

        let mut rng = rand::thread_rng();
        let mut session = Session {
            stream,
            session_handle: 0,
            context: *b"_logix__",
            timeout: deadline,
            sequence: 0,
            connection: None,
            connection_id: rng.gen(),
            connection_serial: rng.gen(),
            vendor_id: 0x1009,
            originator_serial: rng.gen(),
            invalid: false,
        };
        session.register().await?;
        Ok(session)
    }

    pub fn session_handle(&self) -> u32 {
        self.session_handle
    }

    pub fn connection(&self) -> Option<&CipConnection> {
        self.connection.as_ref()
    }

    /// Negotiated payload budget; zero before a Forward Open.
    pub fn connection_size(&self) -> usize {
        self.connection.map(|c| c.connection_size as usize).unwrap_or(0)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some() && !self.invalid
    }

    fn check_usable(&self) -> Result<()> {
        if self.invalid {
            return Err(EipError::Connection(
                "connection invalidated by a previous failure; re-open required".into(),
            ));
        }
        Ok(())
    }

    /// Connected sends use a free-running 16-bit sequence; zero is
    /// skipped so a fresh reply can never match a stale default.
    fn next_sequence(&mut self) -> u16 {
        self.sequence = self.sequence.wrapping_add(1);
        if self.sequence == 0 {
            self.sequence = 1;
        }
        self.sequence
    }

    async fn exchange(&mut self, command: u16, payload: &[u8]) -> Result<Vec<u8>> {
        self.check_usable()?;
        let frame = build_frame(command, self.session_handle, self.context, payload);
        match self.exchange_frames(command, &frame).await {
            Ok(reply) => Ok(reply),
            Err(err) => {
                if err.is_fatal() {
                    self.invalid = true;
                }
                Err(err)
            }
        }
    }

    async fn exchange_frames(&mut self, command: u16, frame: &[u8]) -> Result<Vec<u8>> {
        write_frame(&mut self.stream, frame, self.timeout).await?;
        let (header, reply) = read_frame(&mut self.stream, self.timeout).await?;
        check_reply_header(&header, command)?;
        Ok(reply)
    }

    async fn register(&mut self) -> Result<()> {
        let frame = build_frame(
            encap_command::REGISTER_SESSION,
            0,
            self.context,
            &register_session_data(),
        );
        write_frame(&mut self.stream, &frame, self.timeout).await?;
        let (header, _) = read_frame(&mut self.stream, self.timeout).await?;
        check_reply_header(&header, encap_command::REGISTER_SESSION)?;
        if header.session == 0 {
            return Err(EipError::Connection("no session handle assigned".into()));
        }
        self.session_handle = header.session;
        info!("session 0x{:08X} registered", self.session_handle);
        Ok(())
    }

    /// Best-effort UnRegisterSession; the target closes the socket.
    pub async fn unregister(&mut self) -> Result<()> {
        let frame = build_frame(
            encap_command::UNREGISTER_SESSION,
            self.session_handle,
            self.context,
            &[],
        );
        write_frame(&mut self.stream, &frame, self.timeout).await?;
        self.session_handle = 0;
        info!("session unregistered");
        Ok(())
    }

    /// Identifies the target via the ListIdentity command.
    pub async fn list_identity(&mut self) -> Result<IdentityObject> {
        let reply = self.exchange(encap_command::LIST_IDENTITY, &[]).await?;
        if reply.len() < 6 {
            return Err(EipError::Framing("ListIdentity reply too short".into()));
        }
        let count = u16::from_le_bytes([reply[0], reply[1]]);
        if count == 0 {
            return Err(EipError::Framing("ListIdentity reply carries no items".into()));
        }
        let item_len = u16::from_le_bytes([reply[4], reply[5]]) as usize;
        if reply.len() < 6 + item_len {
            return Err(EipError::Framing("ListIdentity item truncated".into()));
        }
        // item data: encapsulation version (2) + sockaddr (16), then identity
        let item = &reply[6..6 + item_len];
        if item.len() < 18 {
            return Err(EipError::Framing("ListIdentity item too short".into()));
        }
        let identity = IdentityObject::decode(&item[18..])?;
        debug!("target identity: {:?}", identity.product_name);
        Ok(identity)
    }

    /// Sends an unconnected (UCMM) message and returns the Message
    /// Router reply.
    pub async fn send_rr_data(&mut self, message: &[u8]) -> Result<ServiceReply> {
        let payload = rr_data_payload(message);
        let reply = self.exchange(encap_command::SEND_RR_DATA, &payload).await?;
        let items = parse_cpf(&reply)?;
        let message = unconnected_message(&items)?;
        ServiceReply::parse(&message)
    }

    /// Sends a connected message with the next sequence number and
    /// enforces that the reply matches it.
    pub async fn send_unit_data(&mut self, message: &[u8]) -> Result<ServiceReply> {
        let connection = self
            .connection
            .ok_or_else(|| EipError::Connection("no CIP connection open".into()))?;
        let sequence = self.next_sequence();
        let payload = unit_data_payload(connection.ot_connection_id, sequence, message);
        let reply = self.exchange(encap_command::SEND_UNIT_DATA, &payload).await?;
        let items = parse_cpf(&reply)?;
        let (reply_sequence, message) = connected_message(&items)?;
        if reply_sequence != sequence {
            self.invalid = true;
            return Err(EipError::Framing(format!(
                "stale reply: sequence {reply_sequence} does not match request {sequence}"
            )));
        }
        ServiceReply::parse(&message)
    }

    /// Opens the CIP connection, preferring the Large Forward Open and
    /// falling back to the standard service when the target rejects it.
    pub async fn forward_open(&mut self, route: &[Segment], large_packets: bool) -> Result<()> {
        if self.connection.is_some() {
            return Ok(());
        }
        if large_packets {
            info!("attempting Large Forward Open ({} bytes)", EXTENDED_CONNECTION_SIZE);
            match self.try_forward_open(route, true).await {
                Ok(connection) => {
                    self.connection = Some(connection);
                    return Ok(());
                }
                Err(EipError::Cip { status, .. })
                    if matches!(
                        status,
                        STATUS_SERVICE_NOT_SUPPORTED | STATUS_INVALID_PARAMETER | STATUS_TOO_MUCH_DATA
                    ) =>
                {
                    warn!(
                        "Large Forward Open rejected (status 0x{status:02X}), retrying standard"
                    );
                }
                Err(other) => return Err(other),
            }
        }
        let connection = self.try_forward_open(route, false).await?;
        self.connection = Some(connection);
        Ok(())
    }

    async fn try_forward_open(&mut self, route: &[Segment], extended: bool) -> Result<CipConnection> {
        let connection_size = if extended {
            EXTENDED_CONNECTION_SIZE
        } else {
            STANDARD_CONNECTION_SIZE
        };

        let mut data = Vec::with_capacity(48);
        data.push(PRIORITY_TICK_TIME);
        data.push(TIMEOUT_TICKS);
        data.put_u32_le(0); // O->T connection id, assigned by the target
        data.put_u32_le(self.connection_id); // T->O connection id
        data.put_u16_le(self.connection_serial);
        data.put_u16_le(self.vendor_id);
        data.put_u32_le(self.originator_serial);
        data.push(TIMEOUT_MULTIPLIER);
        data.extend_from_slice(&[0x00, 0x00, 0x00]); // reserved
        data.put_u32_le(CONNECTION_RPI_US);
        put_net_params(&mut data, connection_size, extended);
        data.put_u32_le(CONNECTION_RPI_US);
        put_net_params(&mut data, connection_size, extended);
        data.push(TRANSPORT_CLASS);

        let mut full_route: Vec<Segment> = route.to_vec();
        full_route.extend(message_router_path());
        data.extend_from_slice(&encode_padded_epath(&full_route, true, false)?);

        let open_service = if extended {
            service::LARGE_FORWARD_OPEN
        } else {
            service::FORWARD_OPEN
        };
        let message = MessageParams::new(open_service, class_code::CONNECTION_MANAGER, 1)
            .request_data(data)
            .encode()?;

        let reply = self.send_rr_data(&message).await?;
        if let Some(err) = reply.status_error() {
            return Err(err);
        }
        if reply.data.len() < 8 {
            return Err(EipError::Framing("Forward Open reply too short".into()));
        }
        let ot_connection_id =
            u32::from_le_bytes([reply.data[0], reply.data[1], reply.data[2], reply.data[3]]);
        let to_connection_id =
            u32::from_le_bytes([reply.data[4], reply.data[5], reply.data[6], reply.data[7]]);
        info!(
            "{}Forward Open succeeded, O->T id 0x{:08X}, payload {} bytes",
            if extended { "Large " } else { "" },
            ot_connection_id,
            connection_size
        );
        Ok(CipConnection {
            ot_connection_id,
            to_connection_id,
            connection_size,
            extended,
        })
    }

    /// Best-effort Forward Close.
    pub async fn forward_close(&mut self, route: &[Segment]) -> Result<()> {
        if self.connection.take().is_none() {
            return Ok(());
        }
        let mut data = Vec::with_capacity(16);
        data.push(PRIORITY_TICK_TIME);
        data.push(TIMEOUT_TICKS);
        data.put_u16_le(self.connection_serial);
        data.put_u16_le(self.vendor_id);
        data.put_u32_le(self.originator_serial);

        let mut full_route: Vec<Segment> = route.to_vec();
        full_route.extend(message_router_path());
        data.extend_from_slice(&encode_padded_epath(&full_route, true, true)?);

        let message = MessageParams::new(service::FORWARD_CLOSE, class_code::CONNECTION_MANAGER, 1)
            .request_data(data)
            .encode()?;
        let reply = self.send_rr_data(&message).await?;
        if let Some(err) = reply.status_error() {
            warn!("Forward Close failed: {err}");
            return Err(err);
        }
        info!("Forward Close succeeded");
        Ok(())
    }
}

fn put_net_params(data: &mut Vec<u8>, connection_size: u16, extended: bool) {
    if extended {
        data.put_u32_le(((NET_PARAMS_BASE as u32) << 16) | connection_size as u32);
    } else {
        data.put_u16_le(NET_PARAMS_BASE | (connection_size & 0x01FF));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_decode() {
        let mut raw = Vec::new();
        raw.put_u16_le(0x0001); // vendor
        raw.put_u16_le(0x000E); // product type
        raw.put_u16_le(0x00A7); // product code
        raw.push(32); // major
        raw.push(11); // minor
        raw.put_u16_le(0x3060); // status
        raw.put_u32_le(0x00C0FFEE); // serial
        raw.push(10);
        raw.extend_from_slice(b"1756-L83E/");
        raw.push(0x03); // state

        let identity = IdentityObject::decode(&raw).unwrap();
        assert_eq!(identity.vendor_id, 1);
        assert_eq!(identity.revision_major, 32);
        assert_eq!(identity.revision_minor, 11);
        assert_eq!(identity.serial, "00c0ffee");
        assert_eq!(identity.product_name, "1756-L83E/");
        assert_eq!(identity.state, Some(3));
        assert!(!identity.is_micro800());
    }

    #[test]
    fn test_micro800_detection() {
        let identity = IdentityObject {
            product_name: "2080-LC50-48QWB".to_string(),
            ..Default::default()
        };
        assert!(identity.is_micro800());
    }

    #[test]
    fn test_net_params_standard_packs_9_bit_size() {
        let mut buf = Vec::new();
        put_net_params(&mut buf, 500, false);
        let word = u16::from_le_bytes([buf[0], buf[1]]);
        assert_eq!(word & 0x01FF, 500 & 0x01FF);
        assert_eq!(word & !0x01FF, NET_PARAMS_BASE);
    }

    #[test]
    fn test_net_params_extended_carries_full_size() {
        let mut buf = Vec::new();
        put_net_params(&mut buf, 4000, true);
        let word = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(word & 0xFFFF, 4000);
        assert_eq!(word >> 16, NET_PARAMS_BASE as u32);
    }
}
