//! The socket primitive consumed by every [`crate::channel::Channel`].
//!
//! A [`Transport`] performs the handshake and hands back an already-framed [`Socket`]. The
//! default [`TungsteniteTransport`] (feature `tungstenite`) speaks real WebSocket; tests and
//! embedders can plug in anything that yields [`Frame`]s.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream};
use secrecy::SecretString;
use url::Url;

use crate::Result;
use crate::error::Error;
use crate::frame::Frame;

pub type BoxSink = Pin<Box<dyn Sink<Frame, Error = Error> + Send>>;
pub type BoxStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// Both halves of an established connection.
#[non_exhaustive]
pub struct Socket {
    pub sink: BoxSink,
    pub stream: BoxStream,
}

impl Socket {
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<Frame, Error = Error> + Send + 'static,
        St: Stream<Item = Result<Frame>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket").finish_non_exhaustive()
    }
}

/// Everything a transport needs to open one connection.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub url: Url,
    /// Connection-scoped token, sent as the WebSocket subprotocol
    pub token: Option<SecretString>,
    pub binary_mode: bool,
}

impl ConnectRequest {
    #[must_use]
    pub fn new(url: Url, token: Option<SecretString>, binary_mode: bool) -> Self {
        Self {
            url,
            token,
            binary_mode,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, request: &ConnectRequest) -> Result<Socket>;
}

#[cfg(feature = "tungstenite")]
pub use tungstenite::TungsteniteTransport;

#[cfg(feature = "tungstenite")]
mod tungstenite {
    use futures::{StreamExt as _, SinkExt as _, future};
    use secrecy::ExposeSecret as _;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    use super::{ConnectRequest, Socket, Transport, async_trait};
    use crate::Result;
    use crate::error::{Error, Kind};
    use crate::frame::{CloseReason, Frame};

    /// [`Transport`] over `tokio-tungstenite`, with TLS from the native root store.
    #[non_exhaustive]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TungsteniteTransport;

    #[async_trait]
    impl Transport for TungsteniteTransport {
        async fn connect(&self, request: &ConnectRequest) -> Result<Socket> {
            let mut http = request.url.as_str().into_client_request()?;
            if let Some(token) = &request.token {
                let value = HeaderValue::from_str(token.expose_secret())
                    .map_err(|e| Error::with_source(Kind::Validation, e))?;
                http.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
            }

            let (ws_stream, _) = connect_async(http).await?;
            let (write, read) = ws_stream.split();

            let sink = write.with(|frame: Frame| future::ready(Ok::<_, Error>(to_message(frame))));
            let stream = read.filter_map(|message| {
                future::ready(match message {
                    Ok(message) => from_message(message).map(Ok),
                    Err(e) => Some(Err(Error::from(e))),
                })
            });

            Ok(Socket::new(sink, stream))
        }
    }

    fn to_message(frame: Frame) -> Message {
        match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(bytes) => Message::Binary(bytes.into()),
            Frame::Ping(bytes) => Message::Ping(bytes.into()),
            Frame::Pong(bytes) => Message::Pong(bytes.into()),
            Frame::Close(reason) => Message::Close(reason.map(|reason| CloseFrame {
                code: reason.code.into(),
                reason: reason.reason.into(),
            })),
        }
    }

    fn from_message(message: Message) -> Option<Frame> {
        match message {
            Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
            Message::Binary(bytes) => Some(Frame::Binary(bytes.to_vec())),
            Message::Ping(bytes) => Some(Frame::Ping(bytes.to_vec())),
            Message::Pong(bytes) => Some(Frame::Pong(bytes.to_vec())),
            Message::Close(frame) => Some(Frame::Close(frame.map(|frame| {
                CloseReason::new(u16::from(frame.code), frame.reason.as_str())
            }))),
            // Raw frames only show up when writing, never when reading
            Message::Frame(_) => None,
        }
    }

}
