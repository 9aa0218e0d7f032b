use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use crate::frame::CloseReason;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Error related to invalid configuration or arguments
    Validation,
    /// Error related to WebSocket connections and their lifecycle
    WebSocket,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// Invalid configuration, surfaced when a [`crate::ConnectionManager`] is constructed.
#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

/// WebSocket error variants.
///
/// None of these are returned from the lifecycle methods while the controller is alive: they
/// reach the caller through [`crate::EventHandler::on_error`], except
/// [`WsError::ConnectionClosed`] which `send`/`connect` return after `close()`.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(Box<dyn StdError + Send + Sync + 'static>),
    /// Error parsing a WebSocket message
    MessageParse(serde_json::Error),
    /// The controller was closed and no longer accepts work
    ConnectionClosed,
    /// No heartbeat acknowledgment arrived in time
    HeartbeatTimeout {
        /// How long the watchdog waited for the acknowledgment
        after: Duration,
    },
    /// The channel closed with a code other than normal closure
    AbnormalClose(CloseReason),
    /// The controller fell behind its channel and missed events
    Lagged {
        /// Number of events that were missed
        count: u64,
    },
    /// The outbound queue was full while disconnected
    QueueOverflow {
        /// Configured capacity of the queue
        capacity: usize,
        /// Whether the oldest payload was dropped (`true`) or the new one rejected
        dropped_oldest: bool,
    },
    /// `max_attempts` consecutive reconnects failed
    ReconnectExhausted {
        /// Number of attempts that were made
        attempts: u32,
    },
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::MessageParse(e) => write!(f, "Failed to parse WebSocket message: {e}"),
            Self::ConnectionClosed => write!(f, "WebSocket connection closed"),
            Self::HeartbeatTimeout { after } => {
                write!(f, "No heartbeat acknowledgment within {after:?}")
            }
            Self::AbnormalClose(reason) => write!(f, "WebSocket closed abnormally: {reason}"),
            Self::Lagged { count } => write!(f, "Connection lagged, missed {count} events"),
            Self::QueueOverflow {
                capacity,
                dropped_oldest: true,
            } => write!(
                f,
                "Outbound queue full ({capacity}), dropped the oldest payload"
            ),
            Self::QueueOverflow { capacity, .. } => {
                write!(f, "Outbound queue full ({capacity}), rejected payload")
            }
            Self::ReconnectExhausted { attempts } => {
                write!(f, "Gave up reconnecting after {attempts} attempts")
            }
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e.as_ref()),
            Self::MessageParse(e) => Some(e),
            _ => None,
        }
    }
}

impl From<WsError> for Error {
    fn from(e: WsError) -> Self {
        Error::with_source(Kind::WebSocket, e)
    }
}

#[cfg(feature = "tungstenite")]
impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::with_source(Kind::WebSocket, WsError::Connection(Box::new(e)))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Validation, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_display_should_succeed() {
        let error = Error::validation("endpoint must not be empty");

        assert_eq!(error.kind(), Kind::Validation);
        assert_eq!(
            error.to_string(),
            "Validation: invalid: endpoint must not be empty"
        );
    }

    #[test]
    fn downcast_should_expose_source() {
        let error = Error::validation("bad");

        let validation = error.downcast_ref::<Validation>();
        assert!(validation.is_some(), "source should downcast to Validation");
        assert_eq!(validation.map(|v| v.reason.as_str()), Some("bad"));
    }

    #[test]
    fn ws_error_converts_to_websocket_kind() {
        let error: Error = WsError::ConnectionClosed.into();

        assert_eq!(error.kind(), Kind::WebSocket);
        assert!(matches!(
            error.downcast_ref::<WsError>(),
            Some(WsError::ConnectionClosed)
        ));
    }

    #[test]
    fn abnormal_close_display_includes_code() {
        let error = WsError::AbnormalClose(CloseReason::new(1011, "server error"));

        assert!(error.to_string().contains("1011"));
    }

    #[test]
    fn queue_overflow_display_names_policy() {
        let dropped = WsError::QueueOverflow {
            capacity: 2,
            dropped_oldest: true,
        };
        let rejected = WsError::QueueOverflow {
            capacity: 2,
            dropped_oldest: false,
        };

        assert!(dropped.to_string().contains("dropped the oldest"));
        assert!(rejected.to_string().contains("rejected"));
    }

    #[test]
    fn url_parse_error_is_validation() {
        let error: Error = url::Url::parse("not a url").unwrap_err().into();

        assert_eq!(error.kind(), Kind::Validation);
    }
}
