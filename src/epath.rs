//! CIP padded EPATH construction and route-string parsing.
//!
//! A route string uses `/` (or `\`) separated hops: `backplane`/`bp` and
//! `enet` are symbols for the standard port numbers, links are slot
//! numbers or IP addresses. Two shortcuts are accepted: a bare IP
//! (`10.20.30.40`, target in slot 0) and `IP/slot`.

use crate::cip::class_code;
use crate::error::{EipError, Result};

const PORT_BACKPLANE: u16 = 1;
const PORT_ENET: u16 = 2;

/// ANSI Extended Symbolic segment type.
const SEGMENT_ANSI_SYMBOL: u8 = 0x91;

/// Maximum request path length, in 16-bit words (path size is a u8).
const MAX_PATH_WORDS: usize = 255;

/// One routing hop: a port and either a slot number or an address string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSegment {
    pub port: u16,
    pub link: Link,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Link {
    Slot(u8),
    Address(String),
}

impl PortSegment {
    pub fn backplane(slot: u8) -> Self {
        PortSegment {
            port: PORT_BACKPLANE,
            link: Link::Slot(slot),
        }
    }

    pub fn enet(address: &str) -> Self {
        PortSegment {
            port: PORT_ENET,
            link: Link::Address(address.to_string()),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let extended_link = matches!(self.link, Link::Address(_));
        let extended_port = self.port > 14;

        let mut first = if extended_port { 0x0F } else { self.port as u8 };
        if extended_link {
            first |= 0x10;
        }
        out.push(first);

        if let Link::Address(ref addr) = self.link {
            out.push(addr.len() as u8);
        }
        if extended_port {
            out.extend_from_slice(&self.port.to_le_bytes());
        }
        match self.link {
            Link::Slot(slot) => out.push(slot),
            Link::Address(ref addr) => {
                out.extend_from_slice(addr.as_bytes());
                if out.len() % 2 != 0 {
                    out.push(0x00);
                }
            }
        }
    }
}

/// Logical and symbolic EPATH segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Port(PortSegment),
    ClassId(u16),
    InstanceId(u32),
    AttributeId(u16),
    /// Array subscript (logical member/element segment).
    ElementId(u32),
    /// ANSI extended symbolic segment carrying a tag or member name.
    Symbolic(String),
}

impl Segment {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Segment::Port(port) => port.encode(out),
            Segment::ClassId(id) => {
                if *id <= 0xFF {
                    out.push(0x20);
                    out.push(*id as u8);
                } else {
                    out.push(0x21);
                    out.push(0x00);
                    out.extend_from_slice(&id.to_le_bytes());
                }
            }
            Segment::InstanceId(id) => match *id {
                0..=0xFF => {
                    out.push(0x24);
                    out.push(*id as u8);
                }
                0x100..=0xFFFF => {
                    out.push(0x25);
                    out.push(0x00);
                    out.extend_from_slice(&(*id as u16).to_le_bytes());
                }
                _ => {
                    out.push(0x26);
                    out.push(0x00);
                    out.extend_from_slice(&id.to_le_bytes());
                }
            },
            Segment::AttributeId(id) => {
                if *id <= 0xFF {
                    out.push(0x30);
                    out.push(*id as u8);
                } else {
                    out.push(0x31);
                    out.push(0x00);
                    out.extend_from_slice(&id.to_le_bytes());
                }
            }
            Segment::ElementId(id) => match *id {
                0..=0xFF => {
                    out.push(0x28);
                    out.push(*id as u8);
                }
                0x100..=0xFFFF => {
                    out.push(0x29);
                    out.push(0x00);
                    out.extend_from_slice(&(*id as u16).to_le_bytes());
                }
                _ => {
                    out.push(0x2A);
                    out.push(0x00);
                    out.extend_from_slice(&id.to_le_bytes());
                }
            },
            Segment::Symbolic(name) => {
                out.push(SEGMENT_ANSI_SYMBOL);
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
                if name.len() % 2 != 0 {
                    out.push(0x00);
                }
            }
        }
    }
}

/// Encodes segments into a padded EPATH.
///
/// `with_length` prepends the path size in words; `pad_length` inserts
/// the reserved pad byte after it (Unconnected Send route paths).
pub fn encode_padded_epath(
    segments: &[Segment],
    with_length: bool,
    pad_length: bool,
) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    for segment in segments {
        segment.encode(&mut body);
    }
    if body.len() % 2 != 0 {
        // every defined segment is word aligned already
        return Err(EipError::PathSyntax("encoded path is not word aligned".into()));
    }
    let words = body.len() / 2;
    if words > MAX_PATH_WORDS {
        return Err(EipError::PathTooLong { words });
    }

    let mut out = Vec::with_capacity(body.len() + 2);
    if with_length {
        out.push(words as u8);
        if pad_length {
            out.push(0x00);
        }
    }
    out.extend_from_slice(&body);
    Ok(out)
}

/// Message Router path appended to every Forward Open / Close route.
pub fn message_router_path() -> Vec<Segment> {
    vec![
        Segment::ClassId(class_code::MESSAGE_ROUTER),
        Segment::InstanceId(1),
    ]
}

/// A parsed connection path: target host, optional explicit TCP port and
/// the CIP routing segments past the Ethernet module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionPath {
    pub host: String,
    pub port: Option<u16>,
    pub route: Vec<Segment>,
}

/// Parses `"ip[:port][/route...]"` with the slot and bare-IP shortcuts.
pub fn parse_connection_path(path: &str) -> Result<ConnectionPath> {
    let normalized = path.replace('\\', "/").replace(',', "/");
    let mut hops = normalized.split('/');
    let target = hops
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EipError::PathSyntax(format!("empty connection path: {path:?}")))?;

    let (host, port) = match target.split_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .ok()
                .filter(|p| *p > 0)
                .ok_or_else(|| EipError::PathSyntax(format!("invalid port in {target:?}")))?;
            (host.to_string(), Some(port))
        }
        None => (target.to_string(), None),
    };
    if !is_ip_like(&host) {
        return Err(EipError::PathSyntax(format!("invalid target address {host:?}")));
    }

    let rest: Vec<&str> = hops.collect();
    let route = parse_cip_route(&rest)?;
    Ok(ConnectionPath { host, port, route })
}

/// Parses routing hops into port segments. An empty route defaults to
/// `backplane/0`; a single token is treated as a slot number.
pub fn parse_cip_route(tokens: &[&str]) -> Result<Vec<Segment>> {
    if tokens.is_empty() {
        return Ok(vec![Segment::Port(PortSegment::backplane(0))]);
    }
    if tokens.len() == 1 {
        let slot = parse_slot(tokens[0])?;
        return Ok(vec![Segment::Port(PortSegment::backplane(slot))]);
    }
    if tokens.len() % 2 != 0 {
        return Err(EipError::PathSyntax(format!(
            "route must contain port/link pairs, got {} segments",
            tokens.len()
        )));
    }

    let mut route = Vec::with_capacity(tokens.len() / 2);
    for pair in tokens.chunks(2) {
        let port = parse_port(pair[0])?;
        let link = if is_ip_like(pair[1]) && pair[1].contains('.') {
            Link::Address(pair[1].to_string())
        } else {
            Link::Slot(parse_slot(pair[1])?)
        };
        route.push(Segment::Port(PortSegment { port, link }));
    }
    Ok(route)
}

fn parse_port(token: &str) -> Result<u16> {
    match token.to_ascii_lowercase().as_str() {
        "backplane" | "bp" => Ok(PORT_BACKPLANE),
        "enet" => Ok(PORT_ENET),
        other => other
            .parse()
            .map_err(|_| EipError::PathSyntax(format!("invalid port token {token:?}"))),
    }
}

fn parse_slot(token: &str) -> Result<u8> {
    token
        .parse()
        .map_err(|_| EipError::PathSyntax(format!("invalid slot {token:?}")))
}

fn is_ip_like(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
}

/// Splits `"name[1,2]"` into the member name and its subscripts.
fn split_member(member: &str) -> Result<(&str, Vec<u32>)> {
    match member.find('[') {
        None => Ok((member, Vec::new())),
        Some(open) => {
            if !member.ends_with(']') {
                return Err(EipError::PathSyntax(format!("unterminated subscript in {member:?}")));
            }
            let name = &member[..open];
            let indices = member[open + 1..member.len() - 1]
                .split(',')
                .map(|idx| {
                    idx.trim()
                        .parse()
                        .map_err(|_| EipError::PathSyntax(format!("invalid subscript in {member:?}")))
                })
                .collect::<Result<Vec<u32>>>()?;
            if indices.is_empty() || indices.len() > 3 {
                return Err(EipError::PathSyntax(format!(
                    "subscript must have 1-3 dimensions: {member:?}"
                )));
            }
            Ok((name, indices))
        }
    }
}

/// Builds the request path for a tag reference, symbolic by default or
/// Symbol Object instance addressing when `instance_id` is given.
///
/// `tag` is the PLC-side name, members separated by dots, any member may
/// carry subscripts. Program-scoped names keep the `Program:x` prefix as
/// the first symbolic segment.
pub fn tag_request_path(tag: &str, instance_id: Option<u32>) -> Result<Vec<u8>> {
    let mut segments = Vec::new();
    let mut members = split_tag_members(tag);

    let base = members.remove(0);
    let (base_name, base_indices) = split_member(&base)?;
    if base_name.is_empty() {
        return Err(EipError::PathSyntax(format!("empty tag name in {tag:?}")));
    }

    match instance_id {
        Some(id) => {
            segments.push(Segment::ClassId(class_code::SYMBOL_OBJECT));
            segments.push(Segment::InstanceId(id));
        }
        None => segments.push(Segment::Symbolic(base_name.to_string())),
    }
    for idx in base_indices {
        segments.push(Segment::ElementId(idx));
    }

    for member in members {
        let (name, indices) = split_member(&member)?;
        if name.is_empty() {
            return Err(EipError::PathSyntax(format!("empty member name in {tag:?}")));
        }
        segments.push(Segment::Symbolic(name.to_string()));
        for idx in indices {
            segments.push(Segment::ElementId(idx));
        }
    }

    encode_padded_epath(&segments, true, false)
}

/// Splits a tag reference on member dots, keeping a `Program:x.y` prefix
/// together with its first member.
fn split_tag_members(tag: &str) -> Vec<String> {
    let mut parts: Vec<String> = tag.split('.').map(str::to_string).collect();
    if parts.len() > 1 && parts[0].starts_with("Program:") {
        let first = format!("{}.{}", parts[0], parts[1]);
        parts.splice(0..2, [first]);
    }
    parts
}

/// Request path to a class/instance (and optional attribute).
pub fn logical_request_path(
    class: u16,
    instance: u32,
    attribute: Option<u16>,
) -> Result<Vec<u8>> {
    let mut segments = vec![Segment::ClassId(class), Segment::InstanceId(instance)];
    if let Some(attr) = attribute {
        segments.push(Segment::AttributeId(attr));
    }
    encode_padded_epath(&segments, true, false)
}
