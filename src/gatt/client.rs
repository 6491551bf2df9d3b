use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Poll};

use parking_lot::ReentrantMutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::att::{ErrorCode, Handle, HandleRange};
use crate::config::Config;
use crate::host::{BondStore, ConnParams, ConnectEvent, Driver, OpId, VersionInfo};
use crate::le::{Addr, ConnHandle};
use crate::ppogatt::{self, Fate, Io, Phase, SessionId, SessionLayer, Transport};
use crate::uuid::{Uuid, PPOGATT_DATA, PPOGATT_META, PPOGATT_SERVICE};

use super::ntf::{NtfBuffers, Push};
use super::ops::Ops;
use super::*;

/// Maximum number of kernel notifications routed per drain pass.
const KERNEL_DRAIN_BUDGET: usize = 32;

/// Input for a PPoGATT client, queued while the state is being modified and
/// handled before the state lock is released.
#[derive(Debug)]
pub(crate) enum PPoInput {
    Start { id: SessionId },
    Meta { chr: CharRef, result: Result<Vec<u8>> },
    Subscribed { chr: CharRef, typ: SubType, result: Result<()> },
    Data { chr: CharRef, data: Vec<u8> },
}

/// State protected by the connection lock.
#[derive(Debug)]
pub(crate) struct State {
    pub(super) cfg: Arc<Config>,
    pub(super) drv: Arc<dyn Driver>,
    pub(super) bonds: Option<Arc<dyn BondStore>>,
    pub(super) ntf: Arc<NtfBuffers>,
    pub(super) reg: Registry,
    pub(super) ops: Ops,
    pub(super) ppo: ppogatt::Clients,
    pub(super) deferred: VecDeque<PPoInput>,
    fx: Vec<Effect>,
}

impl State {
    /// Queues an event for a calling context.
    #[inline]
    pub(super) fn emit(&mut self, ctx: Context, ev: Event) {
        self.fx.push(Effect::Event(ctx, ev));
    }

    /// Queues an event for both calling contexts.
    pub(super) fn broadcast(&mut self, ev: &Event) {
        for ctx in enum_iterator::all::<Context>() {
            self.emit(ctx, ev.clone());
        }
    }

    /// Returns the kernel-side consumer of an attribute.
    pub(super) fn kernel_client(&self, att: AttRef) -> KernelClient {
        let chr = att.characteristic();
        if self.ppo.owner(chr).is_some() {
            return KernelClient::PPoGatt;
        }
        match self.reg.by_key(chr.key()) {
            Some(c) if c.svc_changed == Some(chr) => KernelClient::ServiceChanged,
            _ => KernelClient::External,
        }
    }

    /// Creates PPoGATT clients for newly announced services.
    pub(super) fn ppogatt_add_services(&mut self, peer: Addr, services: &[ServiceRef]) {
        for &sref in services {
            let Some((c, s)) = self.reg.service(sref) else {
                continue;
            };
            if s.uuid != PPOGATT_SERVICE || self.ppo.has_service(sref) {
                continue;
            }
            let find = |u: Uuid| s.chars.iter().position(|ch| ch.uuid == u);
            let (Some(data), Some(meta)) = (find(PPOGATT_DATA), find(PPOGATT_META)) else {
                warn!("PPoGATT service {sref:?} on {peer} lacks required characteristics");
                continue;
            };
            let (data, meta) = (
                CharRef::from_key(sref.key().with_chr(data)),
                CharRef::from_key(sref.key().with_chr(meta)),
            );
            let (link, mtu) = (c.link(), c.mtu());
            let id = (self.ppo).add(peer, link, sref, data, meta, mtu, &self.cfg.ppogatt);
            debug!("New PPoGATT client {id} for {sref:?} on {peer}");
            self.deferred.push_back(PPoInput::Start { id });
        }
    }

    /// Destroys PPoGATT clients of removed services.
    pub(super) fn ppogatt_remove_services(
        &mut self,
        peer: Addr,
        mut f: impl FnMut(ServiceRef) -> bool,
    ) {
        for mut t in (self.ppo).remove(|t| t.peer() == peer && f(t.service())) {
            debug!("Removing PPoGATT client {}", t.id());
            if let Some(ev) = t.close() {
                self.fx.push(Effect::Session(ev));
            }
        }
    }

    /// Runs `f` on a detached PPoGATT client and handles its outcome.
    fn drive<R>(
        &mut self,
        id: SessionId,
        f: impl FnOnce(&mut Transport, &mut dyn Io) -> R,
    ) -> Option<R> {
        let mut t = self.ppo.detach(id)?;
        let r = f(&mut t, &mut GattIo(self));
        match t.fate() {
            None => self.ppo.attach(t),
            Some(fate) => self.ppogatt_failed(t, fate),
        }
        Some(r)
    }

    /// Destroys a failed PPoGATT client.
    fn ppogatt_failed(&mut self, mut t: Transport, fate: Fate) {
        let (id, peer, link) = (t.id(), t.peer(), t.link());
        warn!("PPoGATT client {id} on {peer} failed ({fate:?})");
        if let Some(ev) = t.close() {
            self.fx.push(Effect::Session(ev));
        }
        // Confirmation is routed to the forgotten client and dropped
        if let Err(e) = self.subscribe(t.data(), SubType::None, Context::Kernel) {
            trace!("PPoGATT unsubscribe skipped: {e}");
        }
        self.ppo.forget(id);
        if fate == Fate::Disconnect && self.ppo.allow_disconnect(peer, &self.cfg.ppogatt) {
            self.drv.disconnect(link);
        }
    }

    /// Feeds queued inputs to their PPoGATT clients.
    fn run_deferred(&mut self, now: Instant) {
        while let Some(input) = self.deferred.pop_front() {
            match input {
                PPoInput::Start { id } => {
                    self.drive(id, |t, io| t.start(io));
                }
                PPoInput::Meta { chr, result } => {
                    let Some(id) = self.ppo.owner(chr) else { continue };
                    let res = result.as_deref().map_err(|&e| e);
                    self.drive(id, |t, io| t.on_meta(io, res, now));
                }
                PPoInput::Subscribed { chr, typ, result } => {
                    let Some(id) = self.ppo.owner(chr) else { continue };
                    if typ == SubType::Notifications {
                        self.drive(id, |t, io| t.on_subscribed(io, result, now));
                    }
                }
                PPoInput::Data { chr, data } => {
                    let Some(id) = self.ppo.owner(chr) else {
                        trace!("Dropping PPoGATT data for removed {chr:?}");
                        continue;
                    };
                    self.drive(id, |t, io| t.on_packet(io, &data, now));
                }
            }
        }
    }

    /// Drives timers of all PPoGATT clients.
    fn ppogatt_tick(&mut self, now: Instant) {
        for id in self.ppo.ids(|_| true) {
            self.drive(id, |t, io| t.tick(io, now));
        }
    }
}

/// GATT services used by PPoGATT clients, operating in the kernel context.
struct GattIo<'a>(&'a mut State);

impl Io for GattIo<'_> {
    fn read_meta(&mut self, meta: CharRef) -> Result<()> {
        self.0.read(meta.into(), Context::Kernel)
    }

    fn subscribe(&mut self, data: CharRef) -> Result<()> {
        (self.0).subscribe(data, SubType::Notifications, Context::Kernel)
    }

    fn write(&mut self, data: CharRef, pkt: &[u8]) -> Result<()> {
        self.0.write_without_response(data, pkt)
    }

    fn session(&mut self, ev: ppogatt::SessionEvent) {
        self.0.fx.push(Effect::Session(ev));
    }
}

/// GATT client core.
///
/// The radio driver reports link and GATT events through the `on_*` methods.
/// Both calling contexts issue requests with the remaining methods and receive
/// results through their [`EventSink`]. All methods may be called from any
/// thread, including from within sink and session layer callbacks.
#[derive(Debug)]
pub struct Client {
    state: ReentrantMutex<RefCell<State>>,
    ntf: Arc<NtfBuffers>,
    sinks: PerContext<Arc<dyn EventSink>>,
    session: Arc<dyn SessionLayer>,
    cfg: Arc<Config>,
}

impl Client {
    /// Creates a client core without any connections.
    #[must_use]
    pub fn new(
        cfg: Config,
        drv: Arc<dyn Driver>,
        sinks: PerContext<Arc<dyn EventSink>>,
        session: Arc<dyn SessionLayer>,
    ) -> Self {
        let cfg = Arc::new(cfg);
        let ntf = Arc::new(NtfBuffers::new(PerContext::new(
            cfg.kernel_ntf_buffer,
            cfg.app_ntf_buffer,
        )));
        let st = State {
            cfg: Arc::clone(&cfg),
            drv,
            bonds: None,
            ntf: Arc::clone(&ntf),
            reg: Registry::default(),
            ops: Ops::default(),
            ppo: ppogatt::Clients::default(),
            deferred: VecDeque::new(),
            fx: Vec::new(),
        };
        Self {
            state: ReentrantMutex::new(RefCell::new(st)),
            ntf,
            sinks,
            session,
            cfg,
        }
    }

    /// Sets the bonding database used for the gateway flag.
    #[must_use]
    pub fn with_bond_store(mut self, bonds: Arc<dyn BondStore>) -> Self {
        self.state.get_mut().get_mut().bonds = Some(bonds);
        self
    }

    /// Returns the configuration.
    #[inline(always)]
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Runs `f` with the state locked and delivers the effects it produced.
    /// Effects are delivered with the lock held, but without the state borrow,
    /// so that receivers may call back into the client.
    fn with_state_at<R>(&self, now: Instant, f: impl FnOnce(&mut State) -> R) -> R {
        let g = self.state.lock();
        let (r, fx) = {
            let mut st = g.borrow_mut();
            let r = f(&mut st);
            st.run_deferred(now);
            (r, std::mem::take(&mut st.fx))
        };
        for e in fx {
            match e {
                Effect::Event(ctx, ev) => self.sinks[ctx].event(ctx, ev),
                Effect::Session(ev) => ev.deliver(self.session.as_ref()),
            }
        }
        r
    }

    #[inline]
    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        self.with_state_at(Instant::now(), f)
    }

    /// Runs `f` with the state locked, without any side effects.
    #[inline]
    fn read_state<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        let g = self.state.lock();
        let st = g.borrow();
        f(&st)
    }

    // Driver callbacks

    /// Registers a new connection.
    pub fn on_connected(&self, ev: &ConnectEvent) -> Result<()> {
        self.with_state(|st| {
            let bonds = st.bonds.clone();
            let c = st.reg.add(ev, Instant::now())?;
            if let (Some(b), Some(bond)) = (bonds, c.bond()) {
                c.gateway = b.is_gateway(bond);
            }
            info!(
                "Connected to {} ({}, {:?}, gateway: {})",
                ev.peer,
                ev.link,
                c.role(),
                c.gateway
            );
            Ok(())
        })
    }

    /// Destroys a connection and everything it owns. Outstanding operations
    /// are abandoned without events.
    pub fn on_disconnected(&self, link: ConnHandle) {
        self.with_state(|st| {
            let Some(peer) = st.reg.by_link(link).map(Connection::peer) else {
                debug!("Disconnect of unknown {link}");
                return;
            };
            info!("Disconnected from {peer} ({link})");
            st.cleanup_subscriptions_conn(link, false);
            st.ops.discard_link(link);
            st.ppogatt_remove_services(peer, |_| true);
            st.reg.remove(link);
        });
    }

    /// Updates the link encryption state.
    pub fn on_encryption_changed(&self, link: ConnHandle, encrypted: bool) {
        self.update(link, |c| c.encrypted = encrypted);
    }

    /// Updates the negotiated ATT MTU.
    pub fn on_mtu_changed(&self, link: ConnHandle, mtu: u16) {
        self.with_state(|st| {
            if let Some(c) = st.reg.by_link_mut(link) {
                debug!("MTU of {link} is {mtu}");
                c.mtu = mtu;
                st.ppo.set_mtu(link, mtu);
            }
        });
    }

    /// Records the remote device name.
    pub fn on_device_name(&self, link: ConnHandle, name: &str) {
        self.update(link, |c| c.set_device_name(name));
    }

    /// Records the remote controller version.
    pub fn on_version(&self, link: ConnHandle, v: VersionInfo) {
        self.update(link, |c| c.version = Some(v));
    }

    /// Records new connection parameters.
    pub fn on_conn_params_updated(&self, link: ConnHandle, p: ConnParams) {
        self.update(link, |c| {
            c.params = Some(p);
            c.param_request = None;
        });
    }

    fn update(&self, link: ConnHandle, f: impl FnOnce(&mut Connection)) {
        self.with_state(|st| match st.reg.by_link_mut(link) {
            Some(c) => f(c),
            None => debug!("Update for unknown {link}"),
        });
    }

    /// Adds a service found by the running discovery job.
    pub fn on_service_discovered(&self, link: ConnHandle, s: DiscoveredService) {
        self.with_state(|st| st.on_service_discovered(link, s));
    }

    /// Completes the running discovery job.
    pub fn on_discovery_complete(
        &self,
        link: ConnHandle,
        res: std::result::Result<(), ErrorCode>,
    ) {
        let now = Instant::now();
        self.with_state_at(now, |st| st.on_discovery_complete(link, res, now));
    }

    /// Completes a read operation.
    pub fn on_read_response(
        &self,
        link: ConnHandle,
        op: OpId,
        res: std::result::Result<&[u8], ErrorCode>,
    ) {
        self.with_state(|st| st.on_read_response(link, op, res));
    }

    /// Completes a write operation.
    pub fn on_write_response(
        &self,
        link: ConnHandle,
        op: OpId,
        res: std::result::Result<(), ErrorCode>,
    ) {
        self.with_state(|st| st.on_write_response(link, op, res));
    }

    /// Delivers a notification or indication value. If a context's buffer is
    /// full, the caller waits for the consumer to free space unless it already
    /// holds the connection lock.
    pub fn on_notification(&self, link: ConnHandle, hdl: Handle, val: &[u8]) {
        let now = Instant::now();
        let targets = self.with_state_at(now, |st| st.notification_targets(link, hdl, val, now));
        if targets.is_empty() {
            return;
        }
        let block = (!self.state.is_owned_by_current_thread()).then(|| self.cfg.ntf_block());
        for (ctx, chr) in targets {
            match self.ntf.push(ctx, chr, val, block) {
                Push::Queued { signal: true } if ctx == Context::App => {
                    self.sinks[ctx].event(ctx, Event::NotificationsPending);
                }
                Push::Queued { .. } => {}
                Push::Dropped => debug!("Dropped {ctx} notification for {chr:?}"),
                Push::Inactive => trace!("{ctx} unsubscribed from {chr:?}"),
            }
        }
    }

    /// Resumes PPoGATT transmission on a link after the driver freed buffers.
    pub fn on_tx_available(&self, link: ConnHandle) {
        let now = Instant::now();
        self.with_state_at(now, |st| {
            for id in st.ppo.ids(|t| t.link() == link) {
                st.drive(id, |t, io| t.on_tx_available(io, now));
            }
        });
    }

    // Connection registry

    /// Runs `f` with exclusive access to the connection table.
    pub fn with_registry<R>(&self, f: impl FnOnce(&mut Registry) -> R) -> R {
        self.with_state(|st| f(&mut st.reg))
    }

    /// Returns whether a device is connected.
    #[must_use]
    pub fn is_connected(&self, peer: Addr) -> bool {
        self.read_state(|st| st.reg.by_addr(peer).is_some())
    }

    /// Marks a device as the gateway. The flag is persisted if the device is
    /// bonded.
    pub fn set_gateway(&self, peer: Addr, gateway: bool) -> Result<()> {
        self.with_state(|st| {
            let c = st.reg.by_addr_mut(peer).ok_or(Error::NotConnected)?;
            c.gateway = gateway;
            if let (Some(b), Some(bond)) = (&st.bonds, c.bond()) {
                b.set_gateway(bond, gateway);
            }
            Ok(())
        })
    }

    /// Returns whether a device is the gateway.
    #[must_use]
    pub fn is_gateway(&self, peer: Addr) -> bool {
        self.read_state(|st| st.reg.by_addr(peer).map_or(false, Connection::is_gateway))
    }

    /// Returns whether the link to a device is encrypted.
    pub fn is_encrypted(&self, peer: Addr) -> Result<bool> {
        self.conn(peer, Connection::is_encrypted)
    }

    /// Returns the ATT MTU of the link to a device.
    pub fn mtu(&self, peer: Addr) -> Result<u16> {
        self.conn(peer, Connection::mtu)
    }

    /// Copies the device name into `out`, truncating it if necessary. Returns
    /// the number of bytes copied.
    pub fn device_name(&self, peer: Addr, out: &mut [u8]) -> Result<usize> {
        self.conn(peer, |c| {
            let name = c.device_name().unwrap_or_default().as_bytes();
            let n = name.len().min(out.len());
            out[..n].copy_from_slice(&name[..n]);
            n
        })
    }

    /// Requests new connection parameters.
    pub fn request_conn_params(&self, peer: Addr, p: ConnParams) -> Result<()> {
        self.with_state(|st| {
            let c = st.reg.by_addr_mut(peer).ok_or(Error::NotConnected)?;
            st.drv.update_conn_params(c.link(), p)?;
            c.param_request = Some(p);
            Ok(())
        })
    }

    fn conn<R>(&self, peer: Addr, f: impl FnOnce(&Connection) -> R) -> Result<R> {
        self.read_state(|st| st.reg.by_addr(peer).map(f).ok_or(Error::NotConnected))
    }

    // Service discovery

    /// Discovers all services of a device. If the services are already known,
    /// they are announced again.
    pub fn discover_all(&self, peer: Addr) -> Result<()> {
        let now = Instant::now();
        self.with_state_at(now, |st| st.discover_all(peer, now))
    }

    /// Rediscovers part of the remote database.
    pub fn discover_range(&self, peer: Addr, r: HandleRange) -> Result<()> {
        let now = Instant::now();
        self.with_state_at(now, |st| st.discover_range(peer, r, now))
    }

    /// Drops all services of a device and discovers them again.
    pub fn rediscover_all(&self, peer: Addr) -> Result<()> {
        let now = Instant::now();
        self.with_state_at(now, |st| st.rediscover_all(peer, true, now))
    }

    // Service tree queries

    /// Returns the announced services of a device, ordered by handle.
    #[must_use]
    pub fn services(&self, peer: Addr) -> Vec<ServiceRef> {
        self.read_state(|st| {
            let Some(c) = st.reg.by_addr(peer) else {
                return Vec::new();
            };
            let pending = c.tree.pending_generation();
            (c.tree.sorted().into_iter())
                .filter(|(_, s)| s.generation != pending)
                .map(|(i, _)| c.tree.service_ref(c.serial, i))
                .collect()
        })
    }

    /// Returns the service UUID.
    #[must_use]
    pub fn service_uuid(&self, s: ServiceRef) -> Option<Uuid> {
        self.read_state(|st| st.reg.service(s).map(|(_, s)| s.uuid))
    }

    /// Returns the attribute handle range of a service.
    #[must_use]
    pub fn service_range(&self, s: ServiceRef) -> Option<HandleRange> {
        self.read_state(|st| st.reg.service(s).map(|(_, s)| s.range))
    }

    /// Returns all characteristics of a service.
    #[must_use]
    pub fn characteristics(&self, s: ServiceRef) -> Option<Vec<CharRef>> {
        self.read_state(|st| {
            let (_, svc) = st.reg.service(s)?;
            let k = s.key();
            Some((0..svc.chars.len()).map(|i| CharRef::from_key(k.with_chr(i))).collect())
        })
    }

    /// Finds characteristics by UUID. The result has one entry per requested
    /// UUID, which is `None` if the service has no such characteristic.
    #[must_use]
    pub fn find_characteristics(&self, s: ServiceRef, uuids: &[Uuid]) -> Vec<Option<CharRef>> {
        self.read_state(|st| {
            let Some((_, svc)) = st.reg.service(s) else {
                return vec![None; uuids.len()];
            };
            (uuids.iter())
                .map(|&u| {
                    let i = svc.chars.iter().position(|c| c.uuid == u)?;
                    Some(CharRef::from_key(s.key().with_chr(i)))
                })
                .collect()
        })
    }

    /// Returns all descriptors of a characteristic.
    #[must_use]
    pub fn descriptors(&self, chr: CharRef) -> Option<Vec<DescRef>> {
        self.read_state(|st| {
            let (_, s, i) = st.reg.characteristic(chr)?;
            let k = chr.key();
            Some((0..s.chars[i].descs.len()).map(|j| DescRef::from_key(k.with_desc(j))).collect())
        })
    }

    /// Returns the characteristic UUID.
    #[must_use]
    pub fn characteristic_uuid(&self, chr: CharRef) -> Option<Uuid> {
        self.read_state(|st| st.reg.characteristic(chr).map(|(_, s, i)| s.chars[i].uuid))
    }

    /// Returns the characteristic properties.
    #[must_use]
    pub fn characteristic_properties(&self, chr: CharRef) -> Option<CharProps> {
        self.read_state(|st| st.reg.characteristic(chr).map(|(_, s, i)| s.chars[i].props))
    }

    /// Returns the descriptor UUID.
    #[must_use]
    pub fn descriptor_uuid(&self, d: DescRef) -> Option<Uuid> {
        self.read_state(|st| st.reg.descriptor(d).map(|(_, s, i, j)| s.chars[i].descs[j].uuid))
    }

    /// Returns the service containing a live characteristic.
    #[must_use]
    pub fn service_of(&self, chr: CharRef) -> Option<ServiceRef> {
        self.read_state(|st| st.reg.characteristic(chr).map(|_| chr.service()))
    }

    /// Returns the characteristic containing a live descriptor.
    #[must_use]
    pub fn characteristic_of(&self, d: DescRef) -> Option<CharRef> {
        self.read_state(|st| st.reg.descriptor(d).map(|_| d.characteristic()))
    }

    /// Returns the device that owns a live service.
    #[must_use]
    pub fn device_of(&self, s: ServiceRef) -> Option<Addr> {
        self.read_state(|st| st.reg.service(s).map(|(c, _)| c.peer()))
    }

    // GATT operations

    /// Reads a characteristic value or descriptor. The result is reported with
    /// [`Event::ReadResponse`].
    pub fn read(&self, att: impl Into<AttRef>, ctx: Context) -> Result<()> {
        let att = att.into();
        self.with_state(|st| st.read(att, ctx))
    }

    /// Writes a characteristic value or descriptor. The result is reported
    /// with [`Event::WriteResponse`].
    pub fn write(&self, att: impl Into<AttRef>, val: &[u8], ctx: Context) -> Result<()> {
        let att = att.into();
        self.with_state(|st| st.write(att, val, ctx))
    }

    /// Writes a characteristic value without response.
    pub fn write_without_response(&self, chr: CharRef, val: &[u8]) -> Result<()> {
        self.with_state(|st| st.write_without_response(chr, val))
    }

    /// Reads a descriptor.
    #[inline]
    pub fn read_descriptor(&self, d: DescRef, ctx: Context) -> Result<()> {
        self.read(d, ctx)
    }

    /// Writes a descriptor.
    #[inline]
    pub fn write_descriptor(&self, d: DescRef, val: &[u8], ctx: Context) -> Result<()> {
        self.write(d, val, ctx)
    }

    /// Consumes the oldest read result of a context.
    ///
    /// # Panics
    ///
    /// Panics if the oldest result belongs to another attribute or does not
    /// fit into `out`.
    pub fn consume_read(&self, ctx: Context, att: impl Into<AttRef>, out: &mut [u8]) -> Result<usize> {
        let att = att.into();
        self.with_state(|st| st.ops.consume_read(ctx, att, out))
    }

    /// Returns the number of outstanding operations of a context.
    #[must_use]
    pub fn pending_ops(&self, ctx: Context) -> usize {
        self.read_state(|st| st.ops.pending(ctx))
    }

    // Subscriptions

    /// Changes the notification subscription of a context. The result is
    /// reported with [`Event::Subscribed`].
    pub fn subscribe(&self, chr: CharRef, typ: SubType, ctx: Context) -> Result<()> {
        self.with_state(|st| st.subscribe(chr, typ, ctx))
    }

    /// Returns the subscription type of a context.
    #[must_use]
    pub fn subscription(&self, chr: CharRef, ctx: Context) -> SubType {
        self.read_state(|st| st.subscription(chr, ctx))
    }

    /// Releases everything held by a calling context that went away:
    /// subscriptions, outstanding operations, read results, and buffered
    /// notifications. Nothing is reported for the discarded operations.
    pub fn cleanup_context(&self, ctx: Context) {
        info!("Cleaning up {ctx} context");
        self.with_state(|st| {
            st.cleanup_subscriptions_ctx(ctx);
            st.ops.discard_ctx(ctx);
        });
    }

    // Notification consumption

    /// Returns the header of the next buffered notification.
    #[must_use]
    pub fn next_notification_header(&self, ctx: Context) -> Option<NotificationHeader> {
        self.ntf.peek(ctx)
    }

    /// Consumes the next buffered notification. The record is removed even if
    /// `out` is too small, in which case the value is truncated.
    pub fn consume_notification(&self, ctx: Context, out: &mut [u8]) -> Result<Consumed> {
        self.ntf.consume(ctx, out)
    }

    /// Requests another wake-up if notifications remain. Returns whether one
    /// was scheduled.
    pub fn reschedule_notifications(&self, ctx: Context) -> bool {
        let more = self.ntf.reschedule(ctx);
        if more && ctx == Context::App {
            self.sinks[ctx].event(ctx, Event::NotificationsPending);
        }
        more
    }

    /// Waits until notifications are available for a context.
    pub async fn notifications_ready(&self, ctx: Context) {
        self.ntf.ready(ctx).await;
    }

    /// Returns the number of notifications dropped for lack of buffer space.
    #[must_use]
    pub fn dropped_notifications(&self, ctx: Context) -> u64 {
        self.ntf.dropped(ctx)
    }

    /// Routes buffered kernel notifications to PPoGATT clients or the kernel
    /// sink. Returns whether records remain.
    pub fn process_kernel_notifications(&self) -> bool {
        for _ in 0..KERNEL_DRAIN_BUDGET {
            let Some((chr, value, more)) = self.ntf.consume_vec(Context::Kernel) else {
                return false;
            };
            self.with_state(|st| match st.kernel_client(chr.into()) {
                KernelClient::PPoGatt => st.deferred.push_back(PPoInput::Data { chr, data: value }),
                _ => st.emit(Context::Kernel, Event::Notification { chr, value }),
            });
            if !more {
                return false;
            }
        }
        self.ntf.reschedule(Context::Kernel)
    }

    // PPoGATT

    /// Queues data for transmission on an open PPoGATT session.
    pub fn ppogatt_send(&self, id: SessionId, data: &[u8]) -> ppogatt::Result<()> {
        let now = Instant::now();
        self.with_state_at(now, |st| {
            (st.drive(id, |t, io| t.send(io, data, now))).unwrap_or(Err(ppogatt::Error::UnknownSession))
        })
    }

    /// Returns the PPoGATT clients of a device.
    #[must_use]
    pub fn ppogatt_sessions(&self, peer: Addr) -> Vec<SessionId> {
        self.read_state(|st| st.ppo.ids(|t| t.peer() == peer))
    }

    /// Returns the state of a PPoGATT client.
    #[must_use]
    pub fn ppogatt_phase(&self, id: SessionId) -> Option<Phase> {
        self.read_state(|st| st.ppo.get(id).map(Transport::phase))
    }

    // Timers

    /// Handles discovery and PPoGATT timeouts.
    #[inline]
    pub fn tick(&self) {
        self.tick_at(Instant::now());
    }

    /// Handles timeouts that expired at `now`.
    pub fn tick_at(&self, now: Instant) {
        self.with_state_at(now, |st| {
            st.poll_discovery(now);
            st.ppogatt_tick(now);
        });
    }

    /// Starts background tasks that drive timers and drain kernel
    /// notifications.
    #[must_use]
    pub fn spawn(self: &Arc<Self>) -> ClientTask {
        ClientTask::new(Arc::clone(self))
    }
}

/// Background tasks of a [`Client`]. The tasks are stopped when this handle is
/// dropped.
#[derive(Debug)]
pub struct ClientTask {
    h: tokio::task::JoinHandle<()>,
    c: CancellationToken,
    _g: tokio_util::sync::DropGuard,
}

impl ClientTask {
    fn new(cl: Arc<Client>) -> Self {
        let c = CancellationToken::new();
        Self {
            h: tokio::spawn(Self::run(cl, c.clone())),
            c: c.clone(),
            _g: c.drop_guard(),
        }
    }

    /// Stops the tasks and waits for them to finish.
    pub async fn stop(self) {
        self.c.cancel();
        if let Err(e) = self.h.await {
            warn!("Client task failed: {e}");
        }
    }

    async fn run(cl: Arc<Client>, c: CancellationToken) {
        debug!("Client task started");
        let mut tick = tokio::time::interval(cl.cfg.tick());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                t = tick.tick() => cl.tick_at(t),
                _ = cl.notifications_ready(Context::Kernel) => {
                    while cl.process_kernel_notifications() {
                        tokio::task::yield_now().await;
                    }
                }
                _ = c.cancelled() => {
                    debug!("Client task terminating");
                    return;
                }
            }
        }
    }
}

impl Future for ClientTask {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        if let Err(e) = ready!(Pin::new(&mut self.h).poll(cx)) {
            warn!("Client task failed: {e}");
        }
        Poll::Ready(())
    }
}
