//! Live connection table.

use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::att::{Handle, DEFAULT_MTU};
use crate::host::{BondId, ConnParams, ConnectEvent, VersionInfo};
use crate::le::{Addr, ConnHandle, Irk, Role};

use super::discovery::Discovery;
use super::subscribe::Subscription;
use super::tree::{Service, ServiceTree};
use super::*;

/// State of one live LE link.
#[derive(Debug)]
pub struct Connection {
    pub(crate) serial: u16,
    peer: Addr,
    link: ConnHandle,
    role: Role,
    pub(crate) encrypted: bool,
    pub(crate) gateway: bool,
    pub(crate) mtu: u16,
    bond: Option<BondId>,
    irk: Option<Irk>,
    pub(crate) name: Option<String>,
    pub(crate) version: Option<VersionInfo>,
    pub(crate) params: Option<ConnParams>,
    pub(crate) param_request: Option<ConnParams>,
    connected_at: Instant,
    pub(crate) tree: ServiceTree,
    pub(crate) discovery: Discovery,
    pub(crate) subs: Vec<Subscription>,
    /// Remote Service Changed characteristic the kernel is subscribed to.
    pub(crate) svc_changed: Option<CharRef>,
    pub(crate) warned_unknown_ntf: bool,
}

impl Connection {
    fn new(serial: u16, ev: &ConnectEvent, now: Instant) -> Self {
        Self {
            serial,
            peer: ev.peer,
            link: ev.link,
            role: Role::from_master(ev.is_master),
            encrypted: ev.encrypted,
            gateway: false,
            mtu: DEFAULT_MTU,
            bond: ev.bond,
            irk: ev.irk,
            name: None,
            version: None,
            params: None,
            param_request: None,
            connected_at: now,
            tree: ServiceTree::default(),
            discovery: Discovery::default(),
            subs: Vec::new(),
            svc_changed: None,
            warned_unknown_ntf: false,
        }
    }

    /// Returns the remote device address.
    #[inline(always)]
    #[must_use]
    pub const fn peer(&self) -> Addr {
        self.peer
    }

    /// Returns the driver's link identifier.
    #[inline(always)]
    #[must_use]
    pub const fn link(&self) -> ConnHandle {
        self.link
    }

    /// Returns the local role.
    #[inline(always)]
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Returns whether the link is encrypted.
    #[inline(always)]
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Returns whether the remote device is the gateway.
    #[inline(always)]
    #[must_use]
    pub const fn is_gateway(&self) -> bool {
        self.gateway
    }

    /// Returns the negotiated ATT MTU.
    #[inline(always)]
    #[must_use]
    pub const fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Returns the bonding identifier.
    #[inline(always)]
    #[must_use]
    pub const fn bond(&self) -> Option<BondId> {
        self.bond
    }

    /// Returns the remote identity resolving key.
    #[inline(always)]
    #[must_use]
    pub const fn irk(&self) -> Option<&Irk> {
        self.irk.as_ref()
    }

    /// Returns the remote device name, if it was read.
    #[inline]
    #[must_use]
    pub fn device_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Sets the remote device name.
    #[inline]
    pub fn set_device_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    /// Returns the remote controller version information.
    #[inline(always)]
    #[must_use]
    pub const fn version(&self) -> Option<VersionInfo> {
        self.version
    }

    /// Returns the current connection parameters.
    #[inline(always)]
    #[must_use]
    pub const fn conn_params(&self) -> Option<ConnParams> {
        self.params
    }

    /// Returns the outstanding connection parameter request.
    #[inline(always)]
    #[must_use]
    pub const fn pending_conn_params(&self) -> Option<ConnParams> {
        self.param_request
    }

    /// Returns the time elapsed since the connection was established.
    #[inline]
    #[must_use]
    pub fn uptime(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.connected_at)
    }

    /// Returns whether service discovery is queued or running.
    #[inline]
    #[must_use]
    pub fn is_discovering(&self) -> bool {
        self.discovery.is_busy()
    }

    /// Returns the reference of characteristic `i` in slot `slot`.
    #[inline]
    pub(crate) fn char_ref(&self, slot: u16, i: usize) -> CharRef {
        CharRef::from_key(self.tree.service_ref(self.serial, slot).key().with_chr(i))
    }

    /// Resolves a service reference.
    pub(crate) fn service(&self, k: Key) -> Option<&Service> {
        (k.serial == self.serial)
            .then(|| self.tree.get(k.slot, k.epoch))
            .flatten()
    }

    /// Resolves an attribute reference to its handle.
    pub(crate) fn att_handle(&self, r: AttRef) -> Option<Handle> {
        let k = r.key();
        let s = self.service(k)?;
        match (k.chr_idx()?, k.desc_idx()) {
            (i, None) => s.value_handle(i),
            (i, Some(j)) => s.desc_handle(i, j),
        }
    }
}

/// Table of live connections, at most one per remote address.
#[derive(Debug, Default)]
pub struct Registry {
    conns: Vec<Connection>,
    last_serial: u16,
}

impl Registry {
    /// Adds a new connection.
    pub(crate) fn add(&mut self, ev: &ConnectEvent, now: Instant) -> Result<&mut Connection> {
        if self.by_addr(ev.peer).is_some() || self.by_link(ev.link).is_some() {
            return Err(Error::AlreadyInState);
        }
        let serial = self.alloc_serial().ok_or(Error::NoResources)?;
        debug!("New connection {} to {} (serial {serial})", ev.link, ev.peer);
        self.conns.push(Connection::new(serial, ev, now));
        let i = self.conns.len() - 1;
        Ok(&mut self.conns[i])
    }

    /// Removes a connection. Everything it owns is dropped with it.
    pub(crate) fn remove(&mut self, link: ConnHandle) -> Option<Connection> {
        let i = self.conns.iter().position(|c| c.link == link)?;
        Some(self.conns.swap_remove(i))
    }

    fn alloc_serial(&mut self) -> Option<u16> {
        for _ in 0..Key::MAX_SERIAL {
            self.last_serial = self.last_serial % Key::MAX_SERIAL + 1;
            let s = self.last_serial;
            if self.conns.iter().all(|c| c.serial != s) {
                return Some(s);
            }
        }
        None
    }

    /// Returns the number of live connections.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Returns whether there are no live connections.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Returns an iterator over all connections.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.conns.iter()
    }

    /// Calls `f` for every connection.
    #[inline]
    pub fn for_each(&mut self, f: impl FnMut(&mut Connection)) {
        self.conns.iter_mut().for_each(f);
    }

    /// Returns the first connection matching a predicate.
    #[inline]
    pub fn find(&self, mut f: impl FnMut(&Connection) -> bool) -> Option<&Connection> {
        self.conns.iter().find(|&c| f(c))
    }

    /// Returns the connection to the specified device.
    #[inline]
    #[must_use]
    pub fn by_addr(&self, peer: Addr) -> Option<&Connection> {
        self.find(|c| c.peer == peer)
    }

    /// Returns the connection to the specified device.
    #[inline]
    pub fn by_addr_mut(&mut self, peer: Addr) -> Option<&mut Connection> {
        self.conns.iter_mut().find(|c| c.peer == peer)
    }

    /// Returns the connection with the specified link identifier.
    #[inline]
    #[must_use]
    pub fn by_link(&self, link: ConnHandle) -> Option<&Connection> {
        self.find(|c| c.link == link)
    }

    /// Returns the connection with the specified link identifier.
    #[inline]
    pub fn by_link_mut(&mut self, link: ConnHandle) -> Option<&mut Connection> {
        self.conns.iter_mut().find(|c| c.link == link)
    }

    /// Returns the connection to the device with the specified identity key.
    #[inline]
    #[must_use]
    pub fn by_irk(&self, irk: &Irk) -> Option<&Connection> {
        self.find(|c| c.irk.as_ref() == Some(irk))
    }

    /// Returns the connection that produced a reference.
    #[inline]
    pub(crate) fn by_key(&self, k: Key) -> Option<&Connection> {
        self.find(|c| c.serial == k.serial)
    }

    /// Returns the connection that produced a reference.
    #[inline]
    pub(crate) fn by_key_mut(&mut self, k: Key) -> Option<&mut Connection> {
        self.conns.iter_mut().find(|c| c.serial == k.serial)
    }

    /// Resolves a service reference.
    pub(crate) fn service(&self, r: ServiceRef) -> Option<(&Connection, &Service)> {
        let k = r.key();
        let c = self.by_key(k)?;
        Some((c, c.service(k)?))
    }

    /// Resolves a characteristic reference.
    pub(crate) fn characteristic(&self, r: CharRef) -> Option<(&Connection, &Service, usize)> {
        let k = r.key();
        let c = self.by_key(k)?;
        let s = c.service(k)?;
        let i = k.chr_idx().filter(|&i| i < s.chars.len())?;
        Some((c, s, i))
    }

    /// Resolves a descriptor reference.
    pub(crate) fn descriptor(&self, r: DescRef) -> Option<(&Connection, &Service, usize, usize)> {
        let (c, s, i) = self.characteristic(r.characteristic())?;
        let j = (r.key().desc_idx()).filter(|&j| j < s.chars[i].descs.len())?;
        Some((c, s, i, j))
    }

    /// Resolves any attribute reference to its connection and handle.
    pub(crate) fn att(&self, r: AttRef) -> Option<(&Connection, Handle)> {
        let c = self.by_key(r.key())?;
        Some((c, c.att_handle(r)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::le::RawAddr;

    fn event(n: u8) -> ConnectEvent {
        ConnectEvent::new(
            Addr::Public(RawAddr::from([n, 0, 0, 0, 0, 0])),
            ConnHandle::new(u16::from(n)).unwrap(),
            false,
        )
    }

    #[test]
    fn add_remove() {
        let now = Instant::now();
        let mut r = Registry::default();
        let irk = Irk::new([7; 16]);
        let s1 = r.add(&event(1).with_irk(irk), now).unwrap().serial;
        let s2 = r.add(&event(2), now).unwrap().serial;
        assert_ne!(s1, s2);
        assert_eq!(r.add(&event(1), now).unwrap_err(), Error::AlreadyInState);
        assert_eq!(r.len(), 2);

        let peer = event(1).peer;
        assert_eq!(r.by_irk(&irk).map(Connection::peer), Some(peer));
        assert_eq!(r.by_link(event(2).link).map(Connection::peer), Some(event(2).peer));
        assert_eq!(r.by_addr(peer).map(Connection::mtu), Some(DEFAULT_MTU));
        r.for_each(|c| c.set_device_name("watch"));
        assert!(r.iter().all(|c| c.device_name() == Some("watch")));

        assert!(r.remove(event(1).link).is_some());
        assert!(r.remove(event(1).link).is_none());
        assert!(r.by_irk(&irk).is_none());
        // Serials are not reused immediately
        assert!(r.add(&event(1), now).unwrap().serial > s2);
    }
}
