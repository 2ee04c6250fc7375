use std::time::Duration;
use thiserror::Error;

use crate::cip::{cip_status_message, extended_status_message};

/// Errors surfaced by the driver.
///
/// Fatal variants (`Io`, `Connection`, `Framing`, `Timeout`) invalidate the
/// connection; the client must be re-opened before further use. Per-tag
/// failures inside a batched read/write are reported through the `error`
/// field of the returned [`crate::Tag`] instead of failing the whole call.
#[derive(Debug, Error)]
pub enum EipError {
    /// Underlying socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TCP connect, session registration or Forward Open failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed encapsulation header or Common Packet Format payload.
    #[error("protocol framing error: {0}")]
    Framing(String),

    /// A send or receive exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The route or tag path string could not be parsed.
    #[error("invalid path: {0}")]
    PathSyntax(String),

    /// The encoded EPATH exceeds the per-message limit of 255 words.
    #[error("encoded path is {words} words, limit is 255")]
    PathTooLong { words: usize },

    /// Non-zero CIP general status in a reply.
    #[error("{}", cip_error_display(.status, .extended))]
    Cip { status: u8, extended: Option<u16> },

    /// A value cannot be represented in the target CIP type.
    #[error("data value error: {0}")]
    DataValue(String),

    /// Tag name or template not present in the uploaded definitions.
    #[error("unknown tag or data type: {0}")]
    TypeLookup(String),

    /// Planner precondition violated (bad element count, value length, ...).
    #[error("request error: {0}")]
    Request(String),
}

impl EipError {
    pub fn cip(status: u8, extended: Option<u16>) -> Self {
        EipError::Cip { status, extended }
    }

    /// True when the error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EipError::Io(_) | EipError::Connection(_) | EipError::Framing(_) | EipError::Timeout(_)
        )
    }
}

fn cip_error_display(status: &u8, extended: &Option<u16>) -> String {
    match extended {
        Some(ext) => format!(
            "CIP error 0x{:02X} ({}) - {}",
            status,
            cip_status_message(*status),
            extended_status_message(*status, *ext),
        ),
        None => format!(
            "CIP error 0x{:02X} ({})",
            status,
            cip_status_message(*status)
        ),
    }
}

pub type Result<T> = std::result::Result<T, EipError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cip_error_message_includes_status_text() {
        let err = EipError::cip(0x04, None);
        assert_eq!(err.to_string(), "CIP error 0x04 (Path segment error)");
    }

    #[test]
    fn test_cip_error_with_extended_status() {
        let err = EipError::cip(0x01, Some(0x0100));
        let msg = err.to_string();
        assert!(msg.contains("0x01"));
        assert!(msg.contains("Connection failure"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(EipError::Connection("refused".into()).is_fatal());
        assert!(EipError::Framing("short header".into()).is_fatal());
        assert!(!EipError::cip(0x05, None).is_fatal());
        assert!(!EipError::Request("bad count".into()).is_fatal());
    }
}
