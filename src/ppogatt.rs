//! Reliable byte-stream transport over GATT notifications and writes
//! (PPoGATT).
//!
//! Each remote PPoGATT service instance gets its own [`transport`] client.
//! Clients are owned by the GATT core, which feeds them read, subscription,
//! and notification results for the service's characteristics. Sessions are
//! reported to a [`SessionLayer`] implemented by the embedder.

use std::fmt::{Debug, Display, Formatter};
use std::num::NonZeroU32;

use tracing::{error, warn};

pub use {meta::*, packet::*, seq::Seq};
pub(crate) use transport::{Fate, Io, Transport};
pub use transport::{Initiator, Phase};

use crate::config::PPoGattConfig;
use crate::gatt::{CharRef, ServiceRef};
use crate::le::{Addr, ConnHandle};
use crate::util::name_of;
use crate::uuid::Uuid;

mod meta;
mod packet;
mod seq;
mod transport;

#[cfg(test)]
mod tests;

/// Error type returned by the PPoGATT transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("malformed packet")]
    MalformedPacket,
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    #[error("malformed metadata")]
    MalformedMeta,
    #[error("incompatible protocol versions {min}..={max}")]
    IncompatibleVersion { min: u8, max: u8 },
    #[error("invalid application identifier")]
    InvalidApp,
    #[error("unknown session")]
    UnknownSession,
    #[error("session is not open")]
    NotOpen,
    #[error("transmit queue is full")]
    QueueFull,
}

/// Common PPoGATT result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Session identifier, unique for the lifetime of the client core.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct SessionId(NonZeroU32);

impl SessionId {
    /// Returns the raw identifier.
    #[inline(always)]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl Debug for SessionId {
    #[allow(clippy::use_self)]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", name_of!(SessionId), self.0)
    }
}

impl Display for SessionId {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Session owner advertised by the remote metadata.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SessionKind {
    /// System session of the remote operating system.
    System,
    /// Session of the identified remote application.
    App(Uuid),
}

/// Session layer notification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionEvent {
    Opened {
        id: SessionId,
        peer: Addr,
        kind: SessionKind,
    },
    Closed {
        id: SessionId,
    },
    Received {
        id: SessionId,
        data: Vec<u8>,
    },
}

/// Consumer of reliable PPoGATT sessions. Callbacks run with the connection
/// lock held and may call back into the client.
pub trait SessionLayer: Debug + Send + Sync {
    /// A session was opened after a successful reset handshake.
    fn opened(&self, id: SessionId, peer: Addr, kind: SessionKind);

    /// A session was closed by a reset, a failure, or a disconnect.
    fn closed(&self, id: SessionId);

    /// In-order stream data was received.
    fn received(&self, id: SessionId, data: &[u8]);
}

impl SessionEvent {
    /// Delivers the event to a session layer.
    pub(crate) fn deliver(self, l: &dyn SessionLayer) {
        match self {
            Self::Opened { id, peer, kind } => l.opened(id, peer, kind),
            Self::Closed { id } => l.closed(id),
            Self::Received { id, ref data } => l.received(id, data),
        }
    }
}

/// All PPoGATT clients of the core.
#[derive(Debug, Default)]
pub(crate) struct Clients {
    list: Vec<Transport>,
    /// Characteristics of every client, including detached ones.
    chars: Vec<(CharRef, SessionId)>,
    last_id: u32,
    guard: DisconnectGuard,
}

impl Clients {
    /// Creates a client for a newly discovered PPoGATT service.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        peer: Addr,
        link: ConnHandle,
        service: ServiceRef,
        data: CharRef,
        meta: CharRef,
        mtu: u16,
        cfg: &PPoGattConfig,
    ) -> SessionId {
        self.last_id = self.last_id.wrapping_add(1).max(1);
        let id = SessionId(match NonZeroU32::new(self.last_id) {
            Some(nz) => nz,
            None => unreachable!(),
        });
        let t = Transport::new(id, peer, link, service, data, meta, mtu, cfg.clone());
        self.list.push(t);
        self.chars.extend([(data, id), (meta, id)]);
        id
    }

    /// Returns whether a service already has a client.
    pub fn has_service(&self, s: ServiceRef) -> bool {
        self.list.iter().any(|t| t.service() == s)
    }

    /// Returns the client that owns a characteristic.
    pub fn owner(&self, chr: CharRef) -> Option<SessionId> {
        self.chars.iter().find(|c| c.0 == chr).map(|c| c.1)
    }

    /// Returns the client of a session.
    pub fn get(&self, id: SessionId) -> Option<&Transport> {
        self.list.iter().find(|t| t.id() == id)
    }

    /// Returns the identifiers of all clients matching a predicate.
    pub fn ids(&self, mut f: impl FnMut(&Transport) -> bool) -> Vec<SessionId> {
        (self.list.iter()).filter(|&t| f(t)).map(Transport::id).collect()
    }

    /// Removes a client while it is being driven. The caller must return it
    /// with [`Self::attach`] or [`Self::forget`] it.
    pub fn detach(&mut self, id: SessionId) -> Option<Transport> {
        let i = self.list.iter().position(|t| t.id() == id)?;
        Some(self.list.swap_remove(i))
    }

    /// Returns a detached client.
    pub fn attach(&mut self, t: Transport) {
        self.list.push(t);
    }

    /// Releases the characteristics of a detached client.
    pub fn forget(&mut self, id: SessionId) {
        self.chars.retain(|c| c.1 != id);
    }

    /// Removes all clients matching a predicate.
    pub fn remove(&mut self, mut f: impl FnMut(&Transport) -> bool) -> Vec<Transport> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < self.list.len() {
            if f(&self.list[i]) {
                let t = self.list.swap_remove(i);
                self.forget(t.id());
                out.push(t);
            } else {
                i += 1;
            }
        }
        out
    }

    /// Updates the MTU of all clients on a link.
    pub fn set_mtu(&mut self, link: ConnHandle, mtu: u16) {
        (self.list.iter_mut())
            .filter(|t| t.link() == link)
            .for_each(|t| t.set_mtu(mtu));
    }

    /// Returns whether a forced disconnect of `peer` is still allowed.
    pub fn allow_disconnect(&mut self, peer: Addr, cfg: &PPoGattConfig) -> bool {
        self.guard.allow(peer, cfg)
    }
}

/// System-wide limit on forced disconnects.
#[derive(Debug, Default)]
struct DisconnectGuard {
    count: u32,
}

impl DisconnectGuard {
    fn allow(&mut self, peer: Addr, cfg: &PPoGattConfig) -> bool {
        self.count = self.count.saturating_add(1);
        if self.count > cfg.max_disconnects {
            if self.count == cfg.max_disconnects + 1 {
                error!("Too many PPoGATT disconnects, no longer recovering links");
            }
            return false;
        }
        if self.count <= cfg.disconnect_log_limit {
            warn!("Disconnecting {peer} after repeated PPoGATT resets");
        }
        true
    }
}
