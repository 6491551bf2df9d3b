//! Per-context notification ring buffers.
//!
//! Each calling context owns one bounded byte ring shared by all of its
//! subscriptions. Records are stored as `chr:u64le len:u16le payload`. The
//! rings have their own lock, which may be taken while the connection lock is
//! held but never the other way around.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tracing::{trace, warn};

use super::*;

/// Record header size.
const HDR: usize = 8 + 2;

/// Metadata of the next buffered notification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NotificationHeader {
    pub chr: CharRef,
    pub len: usize,
}

/// Result of consuming one notification record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Consumed {
    pub chr: CharRef,
    /// Number of bytes copied into the caller's buffer.
    pub len: usize,
    /// Whether the payload did not fit and was cut short.
    pub truncated: bool,
    /// Whether more records remain.
    pub more: bool,
}

/// Outcome of writing a notification into a ring.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Push {
    /// Record was queued. `signal` is set if the consumer must be notified.
    Queued { signal: bool },
    /// Record did not fit and was dropped.
    Dropped,
    /// The context has no active subscriptions.
    Inactive,
}

#[derive(Debug, Default)]
struct Ring {
    buf: VecDeque<u8>,
    cap: usize,
    refs: usize,
    pending: bool,
    dropped: u64,
}

impl Ring {
    #[inline]
    fn free(&self) -> usize {
        self.cap.saturating_sub(self.buf.len())
    }

    fn push(&mut self, chr: CharRef, data: &[u8]) {
        #[allow(clippy::cast_possible_truncation)]
        let len = data.len() as u16;
        self.buf.extend(chr.raw().to_le_bytes());
        self.buf.extend(len.to_le_bytes());
        self.buf.extend(data);
    }

    fn peek(&self) -> Option<NotificationHeader> {
        if self.buf.len() < HDR {
            return None;
        }
        let mut h = [0; HDR];
        (h.iter_mut().zip(self.buf.iter())).for_each(|(d, &s)| *d = s);
        let (raw, len) = h.split_at(8);
        Some(NotificationHeader {
            chr: CharRef::from_raw(u64::from_le_bytes(raw.try_into().ok()?))?,
            len: usize::from(u16::from_le_bytes(len.try_into().ok()?)),
        })
    }

    /// Removes the next record, copying as much of its payload as fits.
    fn pop(&mut self, out: &mut [u8]) -> Option<Consumed> {
        let hdr = self.peek()?;
        self.buf.drain(..HDR);
        let len = hdr.len.min(self.buf.len());
        let mut n = 0;
        for (d, s) in out.iter_mut().zip(self.buf.drain(..len)) {
            *d = s;
            n += 1;
        }
        if self.buf.is_empty() {
            self.pending = false;
        }
        Some(Consumed {
            chr: hdr.chr,
            len: n,
            truncated: n < hdr.len,
            more: !self.buf.is_empty(),
        })
    }

    fn clear(&mut self) {
        self.buf = VecDeque::new();
        self.pending = false;
    }
}

/// Notification rings of both calling contexts.
#[derive(Debug)]
pub(crate) struct NtfBuffers {
    rings: Mutex<PerContext<Ring>>,
    space: Condvar,
    wake: PerContext<Notify>,
}

impl NtfBuffers {
    /// Creates inactive rings with the specified capacities.
    pub fn new(cap: PerContext<usize>) -> Self {
        let ring = |cap| Ring {
            cap,
            ..Ring::default()
        };
        Self {
            rings: Mutex::new(PerContext::new(ring(cap[Context::Kernel]), ring(cap[Context::App]))),
            space: Condvar::new(),
            wake: PerContext::default(),
        }
    }

    /// Adds a subscription reference, allocating the ring on first use.
    pub fn acquire(&self, ctx: Context) {
        let mut g = self.rings.lock();
        let r = &mut g[ctx];
        r.refs += 1;
        if r.refs == 1 {
            trace!("Allocating {ctx} notification buffer");
            r.buf = VecDeque::with_capacity(r.cap);
        }
    }

    /// Drops a subscription reference, freeing the ring when none remain.
    pub fn release(&self, ctx: Context) {
        let mut g = self.rings.lock();
        let r = &mut g[ctx];
        r.refs = r.refs.saturating_sub(1);
        if r.refs == 0 {
            trace!("Freeing {ctx} notification buffer");
            r.clear();
            self.space.notify_all();
        }
    }

    /// Frees the ring regardless of its reference count.
    pub fn reset(&self, ctx: Context) {
        let mut g = self.rings.lock();
        g[ctx].refs = 0;
        g[ctx].clear();
        self.space.notify_all();
    }

    /// Returns the number of subscriptions using the ring.
    #[cfg(test)]
    pub fn refs(&self, ctx: Context) -> usize {
        self.rings.lock()[ctx].refs
    }

    /// Returns the number of notifications dropped for lack of space.
    pub fn dropped(&self, ctx: Context) -> u64 {
        self.rings.lock()[ctx].dropped
    }

    /// Writes a record, waiting up to `block` for the consumer to free space.
    pub fn push(&self, ctx: Context, chr: CharRef, data: &[u8], block: Option<Duration>) -> Push {
        let need = HDR + data.len();
        let mut g = self.rings.lock();
        if g[ctx].refs == 0 {
            return Push::Inactive;
        }
        if need > g[ctx].cap || data.len() > usize::from(u16::MAX) {
            warn!("{ctx} notification of {} bytes can never fit", data.len());
            g[ctx].dropped += 1;
            return Push::Dropped;
        }
        if g[ctx].free() < need {
            if let Some(t) = block {
                let deadline = Instant::now() + t;
                while g[ctx].refs > 0 && g[ctx].free() < need {
                    if self.space.wait_until(&mut g, deadline).timed_out() {
                        break;
                    }
                }
            }
            if g[ctx].refs == 0 {
                return Push::Inactive;
            }
            if g[ctx].free() < need {
                g[ctx].dropped += 1;
                warn!("{ctx} notification buffer full, dropped {chr:?}");
                return Push::Dropped;
            }
        }
        let r = &mut g[ctx];
        r.push(chr, data);
        let signal = !r.pending;
        r.pending = true;
        drop(g);
        if signal {
            self.wake[ctx].notify_one();
        }
        Push::Queued { signal }
    }

    /// Returns the header of the next record without consuming it.
    pub fn peek(&self, ctx: Context) -> Option<NotificationHeader> {
        self.rings.lock()[ctx].peek()
    }

    /// Consumes the next record. The record is removed even if the buffer is
    /// too small, in which case the payload is truncated.
    pub fn consume(&self, ctx: Context, out: &mut [u8]) -> Result<Consumed> {
        let c = self.rings.lock()[ctx].pop(out).ok_or(Error::Empty)?;
        self.space.notify_all();
        Ok(c)
    }

    /// Consumes the next record into a new vector.
    pub fn consume_vec(&self, ctx: Context) -> Option<(CharRef, Vec<u8>, bool)> {
        let mut g = self.rings.lock();
        let mut v = vec![0; g[ctx].peek()?.len];
        let c = g[ctx].pop(&mut v)?;
        drop(g);
        self.space.notify_all();
        v.truncate(c.len);
        Some((c.chr, v, c.more))
    }

    /// Marks the context as pending again if records remain. Returns whether
    /// the consumer was signalled.
    pub fn reschedule(&self, ctx: Context) -> bool {
        let mut g = self.rings.lock();
        let r = &mut g[ctx];
        if r.buf.is_empty() {
            r.pending = false;
            return false;
        }
        r.pending = true;
        drop(g);
        self.wake[ctx].notify_one();
        true
    }

    /// Waits until the context is signalled.
    pub async fn ready(&self, ctx: Context) {
        self.wake[ctx].notified().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn chr(n: u16) -> CharRef {
        CharRef::from_key(Key::service(1, 0, 0).with_chr(usize::from(n)))
    }

    #[test]
    fn records() {
        let b = NtfBuffers::new(PerContext::new(64, 64));
        assert_eq!(b.push(Context::App, chr(0), &[1], None), Push::Inactive);
        b.acquire(Context::App);
        assert_eq!(
            b.push(Context::App, chr(0), &[1, 2, 3], None),
            Push::Queued { signal: true }
        );
        assert_eq!(
            b.push(Context::App, chr(1), &[4, 5], None),
            Push::Queued { signal: false }
        );
        assert_eq!(
            b.peek(Context::App),
            Some(NotificationHeader { chr: chr(0), len: 3 })
        );
        assert_eq!(b.peek(Context::Kernel), None);

        // Undersized buffer still consumes the record
        let mut out = [0; 2];
        let c = b.consume(Context::App, &mut out).unwrap();
        assert_eq!((c.chr, c.len, c.truncated, c.more), (chr(0), 2, true, true));
        assert_eq!(out, [1, 2]);

        let c = b.consume(Context::App, &mut out).unwrap();
        assert_eq!((c.chr, c.len, c.truncated, c.more), (chr(1), 2, false, false));
        assert_eq!(out, [4, 5]);
        assert_eq!(b.consume(Context::App, &mut out), Err(Error::Empty));

        // Drained ring signals again
        assert_eq!(
            b.push(Context::App, chr(2), &[], None),
            Push::Queued { signal: true }
        );
        assert!(b.reschedule(Context::App));
        assert_eq!(b.consume_vec(Context::App), Some((chr(2), vec![], false)));
        assert!(!b.reschedule(Context::App));

        b.release(Context::App);
        assert_eq!(b.refs(Context::App), 0);
        assert_eq!(b.push(Context::App, chr(0), &[1], None), Push::Inactive);
    }

    #[test]
    fn drop_when_full() {
        let b = NtfBuffers::new(PerContext::new(32, 32));
        b.acquire(Context::Kernel);
        assert_eq!(
            b.push(Context::Kernel, chr(0), &[0; 33], None),
            Push::Dropped
        );
        assert!(matches!(
            b.push(Context::Kernel, chr(0), &[7; 20], None),
            Push::Queued { .. }
        ));
        let t = Duration::from_millis(10);
        assert_eq!(b.push(Context::Kernel, chr(1), &[8; 4], Some(t)), Push::Dropped);
        assert_eq!(b.dropped(Context::Kernel), 2);
        // Existing record is intact
        let (c, v, more) = b.consume_vec(Context::Kernel).unwrap();
        assert_eq!((c, v, more), (chr(0), vec![7; 20], false));
    }

    #[test]
    fn back_pressure() {
        let b = Arc::new(NtfBuffers::new(PerContext::new(64, 64)));
        b.acquire(Context::App);
        b.push(Context::App, chr(0), &[1; 40], None);
        let w = {
            let b = Arc::clone(&b);
            thread::spawn(move || {
                b.push(Context::App, chr(1), &[2; 40], Some(Duration::from_secs(10)))
            })
        };
        thread::sleep(Duration::from_millis(50));
        let mut out = [0; 40];
        let c = b.consume(Context::App, &mut out).unwrap();
        assert_eq!((c.chr, out), (chr(0), [1; 40]));
        assert!(matches!(w.join().unwrap(), Push::Queued { .. }));
        let c = b.consume(Context::App, &mut out).unwrap();
        assert_eq!((c.chr, c.more, out), (chr(1), false, [2; 40]));
        assert_eq!(b.dropped(Context::App), 0);
    }
}
