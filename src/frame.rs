//! Message-level types exchanged with a [`crate::transport::Transport`].

use std::fmt;

/// Normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Local-only code for a connection that dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// An application payload submitted through [`crate::ConnectionManager::send`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self::Binary(bytes.to_vec())
    }
}

/// A single message on an already-framed channel.
///
/// `Ping`/`Pong` are control frames and never reach the application; the default heartbeat
/// uses them as its out-of-band probe and acknowledgment.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseReason>),
}

impl From<Payload> for Frame {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Text(text) => Self::Text(text),
            Payload::Binary(bytes) => Self::Binary(bytes),
        }
    }
}

/// Close code and reason reported when a channel closes.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    #[must_use]
    pub fn new<S: Into<String>>(code: u16, reason: S) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn normal() -> Self {
        Self::new(NORMAL_CLOSURE, "")
    }

    #[must_use]
    pub fn abnormal<S: Into<String>>(reason: S) -> Self {
        Self::new(ABNORMAL_CLOSURE, reason)
    }

    #[must_use]
    pub fn heartbeat_timeout() -> Self {
        Self::abnormal("heartbeat timeout")
    }

    /// `1000`, the only code that is not reported through `on_error`.
    #[must_use]
    pub const fn is_normal(&self) -> bool {
        self.code == NORMAL_CLOSURE
    }

    /// Codes 1005, 1006 and 1015 are reserved for local reporting and may not appear in a close
    /// frame on the wire.
    #[must_use]
    pub const fn is_sendable(&self) -> bool {
        !matches!(self.code, 1005 | 1006 | 1015)
    }

    /// Human readable meaning of the standard close codes.
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self.code {
            1000 => "normal closure",
            1001 => "endpoint going away",
            1002 => "protocol error",
            1003 => "unsupported data type",
            1005 => "no status received",
            1006 => "connection dropped without a close frame",
            1007 => "invalid UTF-8 payload",
            1008 => "policy violation",
            1009 => "message too big",
            1010 => "server did not negotiate a required extension",
            1011 => "internal server error",
            1012 => "service restart",
            1013 => "try again later (server overloaded)",
            1014 => "bad gateway",
            1015 => "TLS handshake failure",
            3000..=3999 => "registered application code",
            4000..=4999 => "private application code",
            _ => "unknown close code",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{} ({})", self.code, self.description())
        } else {
            write!(f, "{} ({}): {}", self.code, self.description(), self.reason)
        }
    }
}

/// Page/app visibility as reported by the embedding environment.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_closure_is_not_an_error() {
        assert!(CloseReason::normal().is_normal());
        assert!(!CloseReason::new(1011, "boom").is_normal());
    }

    #[test]
    fn reserved_codes_are_not_sendable() {
        assert!(!CloseReason::heartbeat_timeout().is_sendable());
        assert!(!CloseReason::new(1005, "").is_sendable());
        assert!(CloseReason::new(1001, "bye").is_sendable());
    }

    #[test]
    fn display_includes_description_and_reason() {
        let reason = CloseReason::new(1012, "deploy");

        assert_eq!(reason.to_string(), "1012 (service restart): deploy");
        assert_eq!(
            CloseReason::normal().to_string(),
            "1000 (normal closure)"
        );
        assert_eq!(
            CloseReason::new(4001, "").description(),
            "private application code"
        );
    }

    #[test]
    fn payload_into_frame_keeps_framing() {
        assert_eq!(Frame::from(Payload::from("a")), Frame::Text("a".to_owned()));
        assert_eq!(
            Frame::from(Payload::from(vec![1_u8, 2])),
            Frame::Binary(vec![1, 2])
        );
        assert_eq!(Payload::from("abc").len(), 3);
    }
}
