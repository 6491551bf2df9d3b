use std::num::NonZeroU32;

use tokio::time::{Duration, Instant};

use crate::gatt::{self, Key};
use crate::host;
use crate::le::RawAddr;

use super::*;

const SERIAL: &str = "Q402445E00AA";

#[derive(Debug, Default)]
struct MockIo {
    reads: usize,
    subscribes: usize,
    pkts: Vec<Vec<u8>>,
    events: Vec<SessionEvent>,
    full: bool,
    read_err: Option<gatt::Error>,
}

impl Io for MockIo {
    fn read_meta(&mut self, _: CharRef) -> gatt::Result<()> {
        self.reads += 1;
        self.read_err.take().map_or(Ok(()), Err)
    }

    fn subscribe(&mut self, _: CharRef) -> gatt::Result<()> {
        self.subscribes += 1;
        Ok(())
    }

    fn write(&mut self, _: CharRef, pkt: &[u8]) -> gatt::Result<()> {
        if self.full {
            return Err(gatt::Error::Host(host::Error::OutOfResources));
        }
        self.pkts.push(pkt.to_vec());
        Ok(())
    }

    fn session(&mut self, ev: SessionEvent) {
        self.events.push(ev);
    }
}

impl MockIo {
    /// Removes and returns all written packets as `(type, seq, payload)`.
    fn take(&mut self) -> Vec<(PacketType, u8, Vec<u8>)> {
        (self.pkts.drain(..))
            .map(|b| {
                let p = Packet::parse(&b).unwrap();
                (p.typ, p.seq.get(), p.payload.to_vec())
            })
            .collect()
    }
}

fn app() -> Uuid {
    Uuid::new(0x0123_4567_89AB_CDEF_0123_4567_89AB_CDEF).unwrap()
}

fn peer() -> Addr {
    Addr::Public(RawAddr::from([1, 2, 3, 4, 5, 6]))
}

fn id() -> SessionId {
    SessionId(NonZeroU32::new(1).unwrap())
}

fn transport(mtu: u16) -> Transport {
    let k = Key::service(1, 0, 0);
    let cfg = PPoGattConfig {
        serial_number: SERIAL.to_owned(),
        ..PPoGattConfig::default()
    };
    Transport::new(
        id(),
        peer(),
        ConnHandle::new(1).unwrap(),
        ServiceRef::from_key(k),
        CharRef::from_key(k.with_chr(0)),
        CharRef::from_key(k.with_chr(1)),
        mtu,
        cfg,
    )
}

fn meta(max: u8) -> Vec<u8> {
    let mut v = vec![0, max];
    v.extend(app().to_be_bytes());
    v
}

fn pkt(typ: PacketType, seq: u8, payload: &[u8]) -> Vec<u8> {
    Packet::new(typ, Seq::new(seq), payload).encode().as_ref().to_vec()
}

/// Runs the handshake up to the reset request.
fn subscribed(t: &mut Transport, io: &mut MockIo, version: u8, now: Instant) {
    t.start(io);
    t.on_meta(io, Ok(meta(version).as_slice()), now);
    t.on_subscribed(io, Ok(()), now);
    let p = io.take();
    assert_eq!(p.len(), 1);
    assert_eq!((p[0].0, p[0].1), (PacketType::ResetRequest, 0));
}

/// Opens a session with the specified remote windows.
fn open(mtu: u16, version: u8, remote: [u8; 2]) -> (Transport, MockIo, Instant) {
    let now = Instant::now();
    let (mut t, mut io) = (transport(mtu), MockIo::default());
    subscribed(&mut t, &mut io, version, now);
    let payload: &[u8] = if version == 0 { &[] } else { &remote };
    t.on_packet(&mut io, &pkt(PacketType::ResetComplete, 0, payload), now);
    assert_eq!(t.phase(), Phase::Open);
    let p = io.take();
    assert_eq!(p.len(), 1);
    assert_eq!(p[0].0, PacketType::ResetComplete);
    io.events.clear();
    (t, io, now)
}

#[test]
fn handshake() {
    let now = Instant::now();
    let (mut t, mut io) = (transport(23), MockIo::default());
    t.start(&mut io);
    assert_eq!((io.reads, t.phase()), (1, Phase::ReadingMeta));

    t.on_meta(&mut io, Ok(meta(1).as_slice()), now);
    assert_eq!((io.subscribes, t.phase()), (1, Phase::SubscribingData));
    assert!(io.pkts.is_empty());

    t.on_subscribed(&mut io, Ok(()), now);
    assert_eq!(t.phase(), Phase::AwaitingResetComplete(Initiator::Local));
    let p = io.take();
    let mut want = vec![1];
    want.extend(SERIAL.bytes());
    assert_eq!(p, [(PacketType::ResetRequest, 0, want)]);

    // Remote can receive 20 packets and send 8
    t.on_packet(&mut io, &pkt(PacketType::ResetComplete, 0, &[20, 8]), now);
    assert_eq!(t.phase(), Phase::Open);
    assert_eq!(t.windows(), (8, 20));
    assert_eq!(io.take(), [(PacketType::ResetComplete, 0, vec![25, 25])]);
    assert_eq!(
        io.events,
        [SessionEvent::Opened {
            id: id(),
            peer: peer(),
            kind: SessionKind::App(app()),
        }]
    );
}

#[test]
fn large_mtu_window() {
    let (t, ..) = open(185, 1, [31, 31]);
    assert_eq!(t.windows(), (12, 12));
    let (t, ..) = open(185, 0, [0, 0]);
    assert_eq!(t.windows(), (4, 4));
}

#[test]
fn window_and_cumulative_ack() {
    let (mut t, mut io, now) = open(185, 1, [4, 4]);
    assert_eq!(t.windows().1, 4);
    for i in 0..4 {
        t.send(&mut io, &[i; 10], now).unwrap();
    }
    let p = io.take();
    assert_eq!(p.len(), 4);
    assert!(p.iter().enumerate().all(|(i, p)| p.0 == PacketType::Data && usize::from(p.1) == i));

    // Window is full
    t.send(&mut io, &[4; 10], now).unwrap();
    assert!(io.take().is_empty());

    t.on_packet(&mut io, &pkt(PacketType::Ack, 0, &[]), now);
    assert_eq!(t.tx_seq(), (Seq::new(1), Seq::new(5)));
    assert_eq!(io.take(), [(PacketType::Data, 4, vec![4; 10])]);
    assert_eq!(t.inflight(Seq::new(0)), 0);
    for s in 1..=4 {
        assert_eq!(t.inflight(Seq::new(s)), 10);
    }

    // Cumulative ack frees the rest
    t.on_packet(&mut io, &pkt(PacketType::Ack, 4, &[]), now);
    assert_eq!(t.tx_seq(), (Seq::new(5), Seq::new(5)));
    assert!((0..5).all(|s| t.inflight(Seq::new(s)) == 0));
}

#[test]
fn ack_timeout_rollback_then_reset() {
    let (mut t, mut io, now) = open(185, 1, [4, 4]);
    t.send(&mut io, b"hello", now).unwrap();
    assert_eq!(io.take(), [(PacketType::Data, 0, b"hello".to_vec())]);

    let timeout = Duration::from_secs(5);
    t.tick(&mut io, now + timeout - Duration::from_millis(1));
    assert!(io.take().is_empty());

    for n in 1..=2 {
        t.tick(&mut io, now + timeout * n);
        assert_eq!(io.take(), [(PacketType::Data, 0, b"hello".to_vec())]);
        assert_eq!(t.phase(), Phase::Open);
    }

    t.tick(&mut io, now + timeout * 3);
    let p = io.take();
    assert_eq!(p.len(), 1);
    assert_eq!((p[0].0, p[0].1), (PacketType::ResetRequest, 0));
    assert_eq!(t.phase(), Phase::AwaitingResetComplete(Initiator::Local));
    assert_eq!(io.events, [SessionEvent::Closed { id: id() }]);
    assert!(t.send(&mut io, b"x", now).is_err());
}

#[test]
fn duplicate_ack_ignored() {
    let (mut t, mut io, now) = open(185, 1, [4, 4]);
    t.send(&mut io, &[1], now).unwrap();
    t.send(&mut io, &[2], now).unwrap();
    t.on_packet(&mut io, &pkt(PacketType::Ack, 0, &[]), now);
    io.take();
    t.on_packet(&mut io, &pkt(PacketType::Ack, 0, &[]), now);
    assert_eq!(t.phase(), Phase::Open);
    assert_eq!(t.tx_seq(), (Seq::new(1), Seq::new(2)));
    assert!(io.take().is_empty());
}

#[test]
fn ack_outside_window_resets() {
    let (mut t, mut io, now) = open(185, 1, [4, 4]);
    t.send(&mut io, &[1], now).unwrap();
    io.take();
    t.on_packet(&mut io, &pkt(PacketType::Ack, 7, &[]), now);
    assert_eq!(t.phase(), Phase::AwaitingResetComplete(Initiator::Local));
    assert_eq!(io.take()[0].0, PacketType::ResetRequest);
    assert_eq!(io.events, [SessionEvent::Closed { id: id() }]);
}

#[test]
fn remote_reset() {
    let (mut t, mut io, now) = open(185, 1, [8, 8]);
    let mut req = vec![1];
    req.extend(b"PHONE0000000");
    t.on_packet(&mut io, &pkt(PacketType::ResetRequest, 0, &req), now);
    assert_eq!(t.phase(), Phase::AwaitingResetComplete(Initiator::Remote));
    assert_eq!(io.take(), [(PacketType::ResetComplete, 0, vec![12, 12])]);
    assert_eq!(io.events, [SessionEvent::Closed { id: id() }]);

    t.on_packet(&mut io, &pkt(PacketType::ResetComplete, 0, &[6, 6]), now);
    assert_eq!(t.phase(), Phase::Open);
    assert_eq!(t.windows(), (6, 6));
    // Remote-initiated reset is not answered twice
    assert!(io.take().is_empty());
    assert!(matches!(io.events[1], SessionEvent::Opened { .. }));
}

#[test]
fn v0_acks_immediately() {
    let (mut t, mut io, now) = open(23, 0, [0, 0]);
    t.on_packet(&mut io, &pkt(PacketType::Data, 0, b"abc"), now);
    assert_eq!(
        io.events,
        [SessionEvent::Received {
            id: id(),
            data: b"abc".to_vec(),
        }]
    );
    assert_eq!(io.take(), [(PacketType::Ack, 0, vec![])]);
}

#[test]
fn v1_coalesced_acks() {
    // Receive window of 8 acks every 4 packets
    let (mut t, mut io, now) = open(185, 1, [8, 8]);
    for s in 0..3 {
        t.on_packet(&mut io, &pkt(PacketType::Data, s, &[s]), now);
    }
    assert!(io.take().is_empty());
    t.tick(&mut io, now + Duration::from_millis(199));
    assert!(io.take().is_empty());
    t.tick(&mut io, now + Duration::from_millis(200));
    assert_eq!(io.take(), [(PacketType::Ack, 2, vec![])]);

    for s in 3..7 {
        t.on_packet(&mut io, &pkt(PacketType::Data, s, &[s]), now);
    }
    assert_eq!(io.take(), [(PacketType::Ack, 6, vec![])]);
    assert_eq!(io.events.len(), 7);
}

#[test]
fn out_of_order_data_dropped() {
    let (mut t, mut io, now) = open(23, 0, [0, 0]);
    t.on_packet(&mut io, &pkt(PacketType::Data, 1, b"late"), now);
    assert!(io.events.is_empty());
    assert!(io.take().is_empty());
    t.on_packet(&mut io, &pkt(PacketType::Data, 0, b"ok"), now);
    assert_eq!(io.events.len(), 1);
}

#[test]
fn reset_cap() {
    let now = Instant::now();
    let (mut t, mut io) = (transport(23), MockIo::default());
    subscribed(&mut t, &mut io, 1, now);
    let timeout = Duration::from_secs(5);
    for n in 1..=2 {
        t.tick(&mut io, now + timeout * n);
        assert_eq!(io.take()[0].0, PacketType::ResetRequest);
        assert_eq!(t.fate(), None);
    }
    t.tick(&mut io, now + timeout * 3);
    assert_eq!(t.fate(), Some(Fate::Disconnect));
    assert!(io.take().is_empty());
}

#[test]
fn stalled_transmit() {
    let (mut t, mut io, now) = open(185, 1, [4, 4]);
    io.full = true;
    t.send(&mut io, &[1, 2, 3], now).unwrap();
    assert!(io.pkts.is_empty());
    io.full = false;
    t.tick(&mut io, now);
    assert!(io.pkts.is_empty());
    t.on_tx_available(&mut io, now);
    assert_eq!(io.take(), [(PacketType::Data, 0, vec![1, 2, 3])]);
}

#[test]
fn large_writes_are_split() {
    let (mut t, mut io, now) = open(23, 1, [4, 4]);
    t.send(&mut io, &[9; 40], now).unwrap();
    let p = io.take();
    let lens: Vec<_> = p.iter().map(|p| p.2.len()).collect();
    assert_eq!(lens, [19, 19, 2]);
}

#[test]
fn meta_failures() {
    let now = Instant::now();
    let (mut t, mut io) = (transport(23), MockIo::default());
    io.read_err = Some(gatt::Error::NoResources);
    t.start(&mut io);
    assert_eq!((io.reads, t.fate()), (1, None));
    t.tick(&mut io, now);
    assert_eq!(io.reads, 2);

    t.on_meta(&mut io, Err(gatt::Error::Att(crate::att::ErrorCode::ReadNotPermitted)), now);
    assert_eq!(t.fate(), Some(Fate::Destroy));

    let (mut t, mut io) = (transport(23), MockIo::default());
    t.start(&mut io);
    t.on_meta(&mut io, Ok(&[2, 3][..]), now);
    assert_eq!(t.fate(), Some(Fate::Destroy));
    assert_eq!(io.subscribes, 0);

    let (mut t, mut io) = (transport(23), MockIo::default());
    t.start(&mut io);
    let mut m = meta(3);
    m[0] = 2;
    t.on_meta(&mut io, Ok(m.as_slice()), now);
    assert_eq!(t.fate(), Some(Fate::Destroy));
}

#[test]
fn disconnect_ceiling() {
    let cfg = PPoGattConfig::default();
    let mut c = Clients::default();
    for _ in 0..cfg.max_disconnects {
        assert!(c.allow_disconnect(peer(), &cfg));
    }
    assert!(!c.allow_disconnect(peer(), &cfg));
    assert!(!c.allow_disconnect(peer(), &cfg));
}
