//! Process-wide cache of open channels keyed by endpoint and token.
//!
//! Managers with the same identity share one physical connection. The registry only holds
//! [`Weak`] references: a channel lives as long as some manager holds it, and the last
//! [`Registry::release`] closes it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::{DashMap, Entry};
use secrecy::{ExposeSecret as _, SecretString};
use url::Url;

use crate::channel::Channel;
use crate::frame::CloseReason;
use crate::traits::CredentialLookup;
use crate::transport::{ConnectRequest, Transport};

/// Endpoint plus connection-scoped token; two managers share a channel iff these are equal.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    url: String,
    token: Option<String>,
}

impl Identity {
    #[must_use]
    pub fn new(url: &Url, token: Option<&SecretString>) -> Self {
        Self {
            url: url.as_str().to_owned(),
            token: token.map(|token| token.expose_secret().to_owned()),
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)?;
        if self.token.is_some() {
            f.write_str(" (authenticated)")?;
        }
        Ok(())
    }
}

/// Outcome of [`Registry::acquire`].
#[non_exhaustive]
#[derive(Debug)]
pub enum Acquire {
    /// Attached to a new or already open channel
    Ready(Arc<Channel>),
    /// The credential lookup has no token yet; try again later
    Deferred,
}

pub struct Registry {
    transport: Arc<dyn Transport>,
    channels: DashMap<Identity, Weak<Channel>>,
    next_id: AtomicU64,
}

impl Registry {
    #[must_use]
    pub fn new<T: Transport>(transport: T) -> Self {
        Self::with_transport(Arc::new(transport))
    }

    #[must_use]
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            channels: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Attach to the live channel for this endpoint and token, opening one if needed.
    ///
    /// Entries whose channel is gone or already closing are replaced.
    pub fn acquire(
        &self,
        url: &Url,
        credentials: Option<&dyn CredentialLookup>,
        binary_mode: bool,
    ) -> Acquire {
        let token = match credentials {
            Some(lookup) => match lookup.token() {
                Some(token) => Some(token),
                None => return Acquire::Deferred,
            },
            None => None,
        };
        let identity = Identity::new(url, token.as_ref());

        // Attaching under the entry lock keeps a concurrent last release from closing the
        // channel we are about to hand out.
        let channel = match self.channels.entry(identity.clone()) {
            Entry::Occupied(mut entry) => {
                if let Some(channel) = entry.get().upgrade().filter(|c| !c.is_terminal()) {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(%identity, channel = channel.id(), "Reusing channel");
                    channel.attach();
                    channel
                } else {
                    let channel = self.open(identity, url, token, binary_mode);
                    channel.attach();
                    entry.insert(Arc::downgrade(&channel));
                    channel
                }
            }
            Entry::Vacant(entry) => {
                let channel = self.open(identity, url, token, binary_mode);
                channel.attach();
                entry.insert(Arc::downgrade(&channel));
                channel
            }
        };

        Acquire::Ready(channel)
    }

    /// Detach one manager from `channel`; the last one closes it normally.
    ///
    /// The entry is only removed if it still points at `channel`, never at a newer channel
    /// opened under the same identity.
    pub fn release(&self, identity: &Identity, channel: &Arc<Channel>) {
        let remaining = match self.channels.entry(identity.clone()) {
            Entry::Occupied(entry) => {
                let remaining = channel.detach();
                if remaining == 0 && std::ptr::eq(entry.get().as_ptr(), Arc::as_ptr(channel)) {
                    entry.remove();
                }
                remaining
            }
            Entry::Vacant(_) => channel.detach(),
        };

        if remaining == 0 {
            #[cfg(feature = "tracing")]
            tracing::debug!(%identity, channel = channel.id(), "Last manager detached, closing");
            channel.close(CloseReason::normal());
        }
    }

    /// Number of live, non-closing channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels
            .iter()
            .filter(|entry| entry.value().upgrade().is_some_and(|c| !c.is_terminal()))
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn open(
        &self,
        identity: Identity,
        url: &Url,
        token: Option<SecretString>,
        binary_mode: bool,
    ) -> Arc<Channel> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "tracing")]
        tracing::debug!(%identity, channel = id, "Opening channel");

        let request = ConnectRequest::new(url.clone(), token, binary_mode);
        Channel::spawn(id, identity, Arc::clone(&self.transport), request)
    }
}

#[cfg(feature = "tungstenite")]
impl Default for Registry {
    fn default() -> Self {
        Self::new(crate::transport::TungsteniteTransport)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("channels", &self.channels.len())
            .finish_non_exhaustive()
    }
}
