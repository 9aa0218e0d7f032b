#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod queue;
pub mod reconnect;
pub mod registry;
pub mod traits;
pub mod transport;

pub use config::Config;
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{Error, WsError};
pub use frame::{CloseReason, Frame, Payload, Visibility};
pub use reconnect::ReadyCallback;
pub use registry::Registry;
pub use traits::{CredentialLookup, EventHandler, JsonParser, MessageParser, RawParser};

pub type Result<T> = std::result::Result<T, Error>;
