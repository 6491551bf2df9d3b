//! PPoGATT client state machine for one remote service instance.

use std::collections::VecDeque;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::PPoGattConfig;
use crate::gatt::{self, CharRef, ServiceRef};
use crate::le::{Addr, ConnHandle};

use super::*;

/// Fixed window size of protocol version 0.
const V0_WINDOW: u8 = 4;

/// ATT write command header size.
const ATT_WRITE_HDR: u16 = 3;

/// Transport phase.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Waiting for the metadata read.
    ReadingMeta,
    /// Waiting for the data characteristic subscription.
    SubscribingData,
    /// Reset handshake in progress. The session is closed.
    AwaitingResetComplete(Initiator),
    /// Session is open and data flows in both directions.
    Open,
}

/// Side that started a reset.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Initiator {
    Local,
    Remote,
}

/// Terminal outcome of a failed transport.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub(crate) enum Fate {
    /// Drop the client but keep the link.
    Destroy,
    /// Drop the client and ask the driver to disconnect the link.
    Disconnect,
}

/// Request to repeat on the next tick after resource exhaustion.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Retry {
    Meta,
    Subscribe,
}

/// GATT services used by the transport.
pub(crate) trait Io {
    /// Reads the metadata characteristic.
    fn read_meta(&mut self, meta: CharRef) -> gatt::Result<()>;
    /// Subscribes to notifications of the data characteristic.
    fn subscribe(&mut self, data: CharRef) -> gatt::Result<()>;
    /// Writes a packet to the data characteristic without response.
    fn write(&mut self, data: CharRef, pkt: &[u8]) -> gatt::Result<()>;
    /// Reports a session layer event.
    fn session(&mut self, ev: SessionEvent);
}

/// PPoGATT client.
#[derive(Debug)]
pub(crate) struct Transport {
    id: SessionId,
    peer: Addr,
    link: ConnHandle,
    service: ServiceRef,
    data: CharRef,
    meta: CharRef,
    cfg: PPoGattConfig,
    mtu: u16,
    phase: Phase,
    fate: Option<Fate>,
    retry: Option<Retry>,
    version: u8,
    kind: SessionKind,
    session_open: bool,
    rx_window: u8,
    tx_window: u8,
    /// Pending reset request or reset complete.
    ctl: Option<PacketType>,
    stalled: bool,
    resets: u8,

    next_tx: Seq,
    next_ack: Seq,
    /// Payload length of each outstanding packet, indexed by sequence number.
    inflight: [u16; Seq::MODULUS as usize],
    /// Unacknowledged bytes. The first `sent` bytes are in flight.
    tx_queue: VecDeque<u8>,
    sent: usize,
    ack_deadline: Option<Instant>,
    ack_timeouts: u8,

    next_rx: Seq,
    unacked_rx: u8,
    ack_due: bool,
    rx_ack_deadline: Option<Instant>,
}

impl Transport {
    /// Creates a client for a discovered PPoGATT service.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: SessionId,
        peer: Addr,
        link: ConnHandle,
        service: ServiceRef,
        data: CharRef,
        meta: CharRef,
        mtu: u16,
        cfg: PPoGattConfig,
    ) -> Self {
        Self {
            id,
            peer,
            link,
            service,
            data,
            meta,
            cfg,
            mtu,
            phase: Phase::ReadingMeta,
            fate: None,
            retry: None,
            version: 0,
            kind: SessionKind::System,
            session_open: false,
            rx_window: V0_WINDOW,
            tx_window: V0_WINDOW,
            ctl: None,
            stalled: false,
            resets: 0,
            next_tx: Seq::default(),
            next_ack: Seq::default(),
            inflight: [0; Seq::MODULUS as usize],
            tx_queue: VecDeque::new(),
            sent: 0,
            ack_deadline: None,
            ack_timeouts: 0,
            next_rx: Seq::default(),
            unacked_rx: 0,
            ack_due: false,
            rx_ack_deadline: None,
        }
    }

    #[inline(always)]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[inline(always)]
    pub const fn peer(&self) -> Addr {
        self.peer
    }

    #[inline(always)]
    pub const fn link(&self) -> ConnHandle {
        self.link
    }

    #[inline(always)]
    pub const fn service(&self) -> ServiceRef {
        self.service
    }

    /// Returns the data characteristic.
    #[inline(always)]
    pub const fn data(&self) -> CharRef {
        self.data
    }

    #[inline(always)]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    #[inline(always)]
    pub const fn fate(&self) -> Option<Fate> {
        self.fate
    }

    /// Returns the negotiated `(rx, tx)` windows.
    #[cfg(test)]
    pub const fn windows(&self) -> (u8, u8) {
        (self.rx_window, self.tx_window)
    }

    /// Returns the oldest unacknowledged and the next transmit sequence
    /// numbers.
    #[cfg(test)]
    pub const fn tx_seq(&self) -> (Seq, Seq) {
        (self.next_ack, self.next_tx)
    }

    /// Returns the payload length of an outstanding packet or 0 if the slot
    /// is free.
    #[cfg(test)]
    pub fn inflight(&self, s: Seq) -> u16 {
        self.inflight[usize::from(s.get())]
    }

    /// Updates the link MTU.
    #[inline]
    pub fn set_mtu(&mut self, mtu: u16) {
        self.mtu = mtu;
    }

    /// Window size requested from the remote device.
    fn desired_window(&self) -> u8 {
        let w = if self.mtu <= self.cfg.small_mtu {
            self.cfg.small_mtu_window
        } else {
            self.cfg.window
        };
        w.clamp(1, Seq::MODULUS - 1)
    }

    /// Maximum data packet payload.
    fn max_payload(&self) -> usize {
        let n = self.mtu.saturating_sub(ATT_WRITE_HDR);
        usize::from(n).saturating_sub(HDR_LEN).max(1)
    }

    /// Starts the handshake by reading the metadata characteristic.
    pub fn start(&mut self, io: &mut dyn Io) {
        self.phase = Phase::ReadingMeta;
        match io.read_meta(self.meta) {
            Ok(()) => {}
            Err(e) if e.is_transient() => self.retry = Some(Retry::Meta),
            Err(e) => {
                warn!("PPoGATT metadata read on {} failed: {e}", self.peer);
                self.fail(io, Fate::Destroy);
            }
        }
    }

    /// Handles the metadata read response.
    pub fn on_meta(&mut self, io: &mut dyn Io, res: gatt::Result<&[u8]>, now: Instant) {
        if self.phase != Phase::ReadingMeta {
            debug!("Unexpected PPoGATT metadata response in {:?}", self.phase);
            return;
        }
        let b = match res {
            Ok(b) => b,
            Err(e) if e.is_transient() => {
                self.retry = Some(Retry::Meta);
                return;
            }
            Err(e) => {
                warn!("PPoGATT metadata read on {} failed: {e}", self.peer);
                return self.fail(io, Fate::Destroy);
            }
        };
        let meta = match Meta::parse(b) {
            Ok(m) => m,
            Err(e) => {
                warn!("Invalid PPoGATT metadata from {}: {e}", self.peer);
                return self.fail(io, Fate::Destroy);
            }
        };
        self.version = match meta.negotiate() {
            Ok(v) => v,
            Err(e) => {
                warn!("Rejecting PPoGATT service on {}: {e}", self.peer);
                return self.fail(io, Fate::Destroy);
            }
        };
        self.kind = meta.kind;
        debug!(
            "PPoGATT {:?} on {} using version {} (session type {:?})",
            self.kind, self.peer, self.version, meta.session_type
        );
        self.phase = Phase::SubscribingData;
        self.subscribe(io, now);
    }

    fn subscribe(&mut self, io: &mut dyn Io, now: Instant) {
        match io.subscribe(self.data) {
            Ok(()) => {}
            Err(gatt::Error::AlreadyInState) => self.on_subscribed(io, Ok(()), now),
            Err(e) if e.is_transient() => self.retry = Some(Retry::Subscribe),
            Err(e) => {
                warn!("PPoGATT data subscription on {} failed: {e}", self.peer);
                self.fail(io, Fate::Destroy);
            }
        }
    }

    /// Handles the data characteristic subscription confirmation.
    pub fn on_subscribed(&mut self, io: &mut dyn Io, res: gatt::Result<()>, now: Instant) {
        if self.phase != Phase::SubscribingData {
            return;
        }
        if let Err(e) = res {
            warn!("PPoGATT data subscription on {} failed: {e}", self.peer);
            return self.fail(io, Fate::Destroy);
        }
        self.reset(io, now);
    }

    /// Handles a packet received on the data characteristic.
    pub fn on_packet(&mut self, io: &mut dyn Io, b: &[u8], now: Instant) {
        if matches!(self.phase, Phase::ReadingMeta | Phase::SubscribingData) {
            debug!("Dropping PPoGATT packet received before subscription");
            return;
        }
        let pkt = match Packet::parse(b) {
            Ok(pkt) => pkt,
            Err(e) => {
                warn!("Invalid PPoGATT packet from {}: {e}", self.peer);
                return;
            }
        };
        trace!("PPoGATT rx {:?} {}", pkt.typ, pkt.seq);
        match pkt.typ {
            PacketType::ResetRequest => self.on_reset_request(io, pkt, now),
            PacketType::ResetComplete => self.on_reset_complete(io, pkt, now),
            PacketType::Ack => self.on_ack(io, pkt.seq, now),
            PacketType::Data => self.on_data(io, pkt, now),
        }
    }

    /// Queues data for transmission.
    pub fn send(&mut self, io: &mut dyn Io, data: &[u8], now: Instant) -> Result<()> {
        if self.phase != Phase::Open {
            return Err(Error::NotOpen);
        }
        if self.tx_queue.len() + data.len() > self.cfg.tx_queue_capacity {
            return Err(Error::QueueFull);
        }
        self.tx_queue.extend(data);
        self.pump(io, now);
        Ok(())
    }

    /// Resumes transmission after the driver freed buffer space.
    pub fn on_tx_available(&mut self, io: &mut dyn Io, now: Instant) {
        self.stalled = false;
        self.pump(io, now);
    }

    /// Handles timers and deferred retries.
    pub fn tick(&mut self, io: &mut dyn Io, now: Instant) {
        match self.retry.take() {
            Some(Retry::Meta) => self.start(io),
            Some(Retry::Subscribe) => self.subscribe(io, now),
            None => {}
        }
        if self.fate.is_some() {
            return;
        }
        if self.ack_deadline.map_or(false, |d| d <= now) {
            self.ack_deadline = None;
            match self.phase {
                Phase::AwaitingResetComplete(_) => {
                    warn!("PPoGATT reset on {} timed out", self.peer);
                    self.reset(io, now);
                }
                Phase::Open => self.on_ack_timeout(io, now),
                _ => {}
            }
        }
        if self.rx_ack_deadline.map_or(false, |d| d <= now) {
            self.rx_ack_deadline = None;
            self.ack_due = true;
        }
        self.pump(io, now);
    }

    /// Closes the session without notifying the remote device. Returns the
    /// session layer event to deliver, if any.
    pub fn close(&mut self) -> Option<SessionEvent> {
        self.session_open.then(|| {
            self.session_open = false;
            SessionEvent::Closed { id: self.id }
        })
    }

    /// Starts a locally initiated reset.
    fn reset(&mut self, io: &mut dyn Io, now: Instant) {
        self.resets += 1;
        if self.resets > self.cfg.max_resets {
            warn!("Too many PPoGATT resets on {}", self.peer);
            return self.fail(io, Fate::Disconnect);
        }
        debug!("PPoGATT reset #{} on {}", self.resets, self.peer);
        self.close_session(io);
        self.clear_stream();
        self.phase = Phase::AwaitingResetComplete(Initiator::Local);
        self.ctl = Some(PacketType::ResetRequest);
        self.ack_deadline = Some(now + self.cfg.ack_timeout());
        self.pump(io, now);
    }

    fn on_reset_request(&mut self, io: &mut dyn Io, pkt: Packet, now: Instant) {
        match ResetRequest::parse(pkt.payload) {
            Ok(r) => debug!("Remote PPoGATT reset request (version {})", r.version),
            Err(_) => debug!("Remote PPoGATT reset request"),
        }
        self.close_session(io);
        self.clear_stream();
        self.phase = Phase::AwaitingResetComplete(Initiator::Remote);
        self.ctl = Some(PacketType::ResetComplete);
        self.ack_deadline = Some(now + self.cfg.ack_timeout());
        self.pump(io, now);
    }

    fn on_reset_complete(&mut self, io: &mut dyn Io, pkt: Packet, now: Instant) {
        let Phase::AwaitingResetComplete(initiator) = self.phase else {
            warn!("Unexpected PPoGATT reset complete from {}", self.peer);
            return self.reset(io, now);
        };
        let want = self.desired_window();
        if self.version >= ENHANCED_VERSION {
            let Ok(rc) = ResetComplete::parse(pkt.payload) else {
                warn!("Invalid PPoGATT reset complete from {}", self.peer);
                return self.reset(io, now);
            };
            self.tx_window = want.min(rc.rx_window);
            self.rx_window = want.min(rc.tx_window);
        } else {
            (self.rx_window, self.tx_window) = (V0_WINDOW, V0_WINDOW);
        }
        if initiator == Initiator::Local {
            self.ctl = Some(PacketType::ResetComplete);
        }
        info!(
            "PPoGATT session {} open on {} (rx window {}, tx window {})",
            self.id, self.peer, self.rx_window, self.tx_window
        );
        self.phase = Phase::Open;
        self.ack_deadline = None;
        self.session_open = true;
        io.session(SessionEvent::Opened {
            id: self.id,
            peer: self.peer,
            kind: self.kind,
        });
        self.pump(io, now);
    }

    fn on_ack(&mut self, io: &mut dyn Io, seq: Seq, now: Instant) {
        if self.phase != Phase::Open {
            debug!("Ignoring PPoGATT ack {seq} in {:?}", self.phase);
            return;
        }
        let outstanding = self.next_tx.since(self.next_ack);
        if seq.since(self.next_ack) < outstanding {
            let mut s = self.next_ack;
            loop {
                let n = std::mem::take(&mut self.inflight[usize::from(s.get())]);
                let n = usize::from(n);
                self.tx_queue.drain(..n);
                self.sent -= n;
                if s == seq {
                    break;
                }
                s = s.next();
            }
            self.next_ack = seq.next();
            self.ack_timeouts = 0;
            self.resets = 0;
            self.ack_deadline = (self.next_ack != self.next_tx)
                .then(|| now + self.cfg.ack_timeout());
            self.pump(io, now);
        } else if seq == self.next_ack.prev() {
            debug!("Duplicate PPoGATT ack {seq}");
        } else {
            warn!(
                "PPoGATT ack {seq} outside of window {}..{}",
                self.next_ack, self.next_tx
            );
            self.reset(io, now);
        }
    }

    fn on_data(&mut self, io: &mut dyn Io, pkt: Packet, now: Instant) {
        if self.phase != Phase::Open {
            debug!("Dropping PPoGATT data in {:?}", self.phase);
            return;
        }
        if pkt.seq != self.next_rx {
            trace!("Out-of-order PPoGATT data {} (expected {})", pkt.seq, self.next_rx);
            return;
        }
        self.next_rx = self.next_rx.next();
        if !pkt.payload.is_empty() {
            io.session(SessionEvent::Received {
                id: self.id,
                data: pkt.payload.to_vec(),
            });
        }
        self.unacked_rx += 1;
        let threshold = (self.rx_window / self.cfg.ack_divisor.max(1)).max(1);
        if self.version < ENHANCED_VERSION || self.unacked_rx >= threshold {
            self.ack_due = true;
            self.rx_ack_deadline = None;
        } else if self.rx_ack_deadline.is_none() {
            self.rx_ack_deadline = Some(now + self.cfg.ack_latency());
        }
        self.pump(io, now);
    }

    fn on_ack_timeout(&mut self, io: &mut dyn Io, now: Instant) {
        self.ack_timeouts += 1;
        if self.ack_timeouts > self.cfg.max_ack_timeouts {
            warn!("PPoGATT ack timeout limit reached on {}", self.peer);
            return self.reset(io, now);
        }
        warn!(
            "PPoGATT ack timeout on {}, resending from {}",
            self.peer, self.next_ack
        );
        self.next_tx = self.next_ack;
        self.inflight = [0; Seq::MODULUS as usize];
        self.sent = 0;
        self.pump(io, now);
    }

    /// Sends as many packets as allowed, in priority order.
    fn pump(&mut self, io: &mut dyn Io, now: Instant) {
        for _ in 0..self.cfg.max_packets_per_pass {
            if self.fate.is_some() || self.stalled {
                return;
            }
            let r = if let Some(typ) = self.ctl {
                self.send_ctl(io, typ)
            } else if self.ack_due {
                self.send_ack(io)
            } else if self.can_send_data() {
                self.send_data(io, now)
            } else {
                return;
            };
            match r {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    trace!("PPoGATT transmit stalled on {}", self.peer);
                    self.stalled = true;
                }
                Err(e) => {
                    warn!("PPoGATT write on {} failed: {e}", self.peer);
                    self.fail(io, Fate::Destroy);
                }
            }
        }
    }

    fn send_ctl(&mut self, io: &mut dyn Io, typ: PacketType) -> gatt::Result<()> {
        let payload = match typ {
            PacketType::ResetRequest => {
                ResetRequest::new(self.version, &self.cfg.serial_number).encode()
            }
            _ if self.version >= ENHANCED_VERSION => {
                let w = self.desired_window();
                ResetComplete {
                    rx_window: w,
                    tx_window: w,
                }
                .encode()
            }
            _ => structbuf::StructBuf::default(),
        };
        let pkt = Packet::new(typ, Seq::default(), payload.as_ref()).encode();
        io.write(self.data, pkt.as_ref())?;
        self.ctl = None;
        Ok(())
    }

    fn send_ack(&mut self, io: &mut dyn Io) -> gatt::Result<()> {
        let pkt = Packet::new(PacketType::Ack, self.next_rx.prev(), &[]).encode();
        io.write(self.data, pkt.as_ref())?;
        self.ack_due = false;
        self.unacked_rx = 0;
        self.rx_ack_deadline = None;
        Ok(())
    }

    fn can_send_data(&self) -> bool {
        self.phase == Phase::Open
            && self.next_tx.since(self.next_ack) < self.tx_window
            && self.sent < self.tx_queue.len()
    }

    fn send_data(&mut self, io: &mut dyn Io, now: Instant) -> gatt::Result<()> {
        let n = (self.tx_queue.len() - self.sent).min(self.max_payload());
        let payload: Vec<u8> = (self.tx_queue.range(self.sent..self.sent + n))
            .copied()
            .collect();
        let seq = self.next_tx;
        io.write(self.data, Packet::new(PacketType::Data, seq, &payload).encode().as_ref())?;
        #[allow(clippy::cast_possible_truncation)]
        {
            self.inflight[usize::from(seq.get())] = n as u16;
        }
        self.sent += n;
        if seq == self.next_ack {
            self.ack_deadline = Some(now + self.cfg.ack_timeout());
        }
        self.next_tx = seq.next();
        Ok(())
    }

    fn close_session(&mut self, io: &mut dyn Io) {
        if let Some(ev) = self.close() {
            io.session(ev);
        }
    }

    /// Resets all stream state.
    fn clear_stream(&mut self) {
        self.ctl = None;
        self.next_tx = Seq::default();
        self.next_ack = Seq::default();
        self.inflight = [0; Seq::MODULUS as usize];
        self.tx_queue.clear();
        self.sent = 0;
        self.ack_deadline = None;
        self.ack_timeouts = 0;
        self.next_rx = Seq::default();
        self.unacked_rx = 0;
        self.ack_due = false;
        self.rx_ack_deadline = None;
    }

    fn fail(&mut self, io: &mut dyn Io, fate: Fate) {
        self.close_session(io);
        self.fate = self.fate.max(Some(fate));
    }
}
