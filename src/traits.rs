//! Extension points of a [`crate::ConnectionManager`].

use std::marker::PhantomData;

use secrecy::SecretString;
use serde::de::DeserializeOwned;

use crate::error::{Error, WsError};
use crate::frame::{CloseReason, Payload};

/// Message parser trait for converting inbound payloads to messages.
///
/// May return an empty vec to drop a payload. A parse error is reported through
/// [`EventHandler::on_error`] and leaves the connection open.
///
/// # Example
///
/// ```
/// use resilient_ws::{MessageParser, Payload};
///
/// pub struct UpperParser;
///
/// impl MessageParser<String> for UpperParser {
///     fn parse(&self, payload: &Payload) -> resilient_ws::Result<Vec<String>> {
///         Ok(vec![String::from_utf8_lossy(payload.as_bytes()).to_uppercase()])
///     }
/// }
/// ```
pub trait MessageParser<M>: Send + Sync + 'static {
    fn parse(&self, payload: &Payload) -> crate::Result<Vec<M>>;
}

/// Decodes every inbound payload as JSON.
///
/// A payload that does not decode as a single `M` but is a JSON array is decoded as a batch,
/// yielding one message per element.
pub struct JsonParser<M>(PhantomData<fn() -> M>);

impl<M> JsonParser<M> {
    #[must_use]
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<M> Default for JsonParser<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: DeserializeOwned + 'static> MessageParser<M> for JsonParser<M> {
    fn parse(&self, payload: &Payload) -> crate::Result<Vec<M>> {
        let bytes = payload.as_bytes();

        match serde_json::from_slice::<M>(bytes) {
            Ok(message) => Ok(vec![message]),
            Err(e) if bytes.trim_ascii_start().starts_with(b"[") => {
                serde_json::from_slice::<Vec<M>>(bytes)
                    .map_err(|_batch| WsError::MessageParse(e).into())
            }
            Err(e) => Err(WsError::MessageParse(e).into()),
        }
    }
}

/// Hands payloads through untouched.
#[expect(
    clippy::exhaustive_structs,
    reason = "Unit parser is passed by name, like `()` for the handler"
)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RawParser;

impl MessageParser<Payload> for RawParser {
    fn parse(&self, payload: &Payload) -> crate::Result<Vec<Payload>> {
        Ok(vec![payload.clone()])
    }
}

/// Lifecycle callbacks. Every method defaults to a no-op.
///
/// Callbacks run on the manager's own task, never concurrently with each other, and never
/// after [`crate::ConnectionManager::close`] has returned.
pub trait EventHandler<M>: Send + 'static {
    /// The channel opened; queued payloads were already flushed.
    fn on_open(&mut self) {}

    fn on_message(&mut self, message: M) {
        _ = message;
    }

    fn on_close(&mut self, reason: &CloseReason) {
        _ = reason;
    }

    fn on_error(&mut self, error: &Error) {
        _ = error;
    }
}

impl<M> EventHandler<M> for () {}

/// Capability to fetch the current connection token.
///
/// `None` means the token is not available yet; connecting is deferred and retried.
pub trait CredentialLookup: Send + Sync + 'static {
    fn token(&self) -> Option<SecretString>;
}

impl<F> CredentialLookup for F
where
    F: Fn() -> Option<SecretString> + Send + Sync + 'static,
{
    fn token(&self) -> Option<SecretString> {
        self()
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::error::Kind;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Tick {
        price: u32,
    }

    #[test]
    fn json_parser_decodes_single_object() {
        let parser = JsonParser::<Tick>::new();

        let messages = parser.parse(&Payload::from(r#"{"price": 5}"#)).unwrap();
        assert_eq!(messages, vec![Tick { price: 5 }]);
    }

    #[test]
    fn json_parser_splits_arrays_into_batches() {
        let parser = JsonParser::<Tick>::new();

        let messages = parser
            .parse(&Payload::from(r#" [{"price": 1}, {"price": 2}]"#))
            .unwrap();
        assert_eq!(messages, vec![Tick { price: 1 }, Tick { price: 2 }]);
    }

    #[test]
    fn json_parser_keeps_arrays_whole_for_values() {
        let parser = JsonParser::<serde_json::Value>::new();

        let messages = parser.parse(&Payload::from("[1, 2]")).unwrap();
        assert_eq!(messages, vec![serde_json::json!([1, 2])]);
    }

    #[test]
    fn json_parser_reports_malformed_payload() {
        let parser = JsonParser::<Tick>::new();

        let error = parser.parse(&Payload::from("pong")).unwrap_err();
        assert_eq!(error.kind(), Kind::WebSocket);
        assert!(matches!(
            error.downcast_ref::<WsError>(),
            Some(WsError::MessageParse(_))
        ));
    }

    #[test]
    fn closures_are_credential_lookups() {
        let lookup = || Some(SecretString::from("token"));

        assert!(lookup.token().is_some());
    }
}
