//! GATT read/write dispatch and response correlation.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use crate::att::{ErrorCode, MAX_VAL_LEN};
use crate::host::OpId;
use crate::le::ConnHandle;

use super::client::{PPoInput, State};
use super::*;

/// Maximum number of outstanding operations per calling context.
const MAX_PENDING: usize = 32;

/// Operation subtype.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum OpKind {
    Read,
    Write,
    /// CCCD write issued by the subscription manager. `prev` is the remote
    /// type before the write.
    Cccd { prev: SubType },
}

/// Correlation record of an outstanding operation.
#[derive(Clone, Copy, Debug)]
pub(crate) struct OpRecord {
    pub ctx: Context,
    pub kind: OpKind,
    pub att: AttRef,
    pub link: ConnHandle,
}

/// Read result waiting to be consumed.
#[derive(Debug)]
struct ReadResult {
    att: AttRef,
    link: ConnHandle,
    val: Vec<u8>,
}

/// Outstanding operations and unconsumed read results.
#[derive(Debug)]
pub(crate) struct Ops {
    next: OpId,
    records: HashMap<OpId, OpRecord>,
    reads: PerContext<VecDeque<ReadResult>>,
}

impl Default for Ops {
    fn default() -> Self {
        Self {
            next: match OpId::new(1) {
                Some(id) => id,
                None => unreachable!(),
            },
            records: HashMap::new(),
            reads: PerContext::default(),
        }
    }
}

impl Ops {
    /// Allocates a correlation record.
    pub fn alloc(&mut self, rec: OpRecord) -> Result<OpId> {
        let n = self.records.values().filter(|r| r.ctx == rec.ctx).count();
        if n >= MAX_PENDING && !matches!(rec.kind, OpKind::Cccd { .. }) {
            return Err(Error::NoResources);
        }
        while self.records.contains_key(&self.next) {
            self.next = self.next.next();
        }
        let id = self.next;
        self.next = id.next();
        self.records.insert(id, rec);
        Ok(id)
    }

    /// Removes and returns a correlation record.
    #[inline]
    pub fn take(&mut self, id: OpId) -> Option<OpRecord> {
        self.records.remove(&id)
    }

    /// Returns the number of outstanding operations.
    #[inline]
    pub fn pending(&self, ctx: Context) -> usize {
        self.records.values().filter(|r| r.ctx == ctx).count()
    }

    /// Discards all records and read results of a calling context.
    pub fn discard_ctx(&mut self, ctx: Context) {
        self.records.retain(|_, r| r.ctx != ctx);
        self.reads[ctx].clear();
    }

    /// Discards all records and unconsumed read results for a link.
    pub fn discard_link(&mut self, link: ConnHandle) {
        self.records.retain(|_, r| r.link != link);
        for ctx in enum_iterator::all::<Context>() {
            self.reads[ctx].retain(|r| r.link != link);
        }
    }

    /// Consumes the oldest read result.
    ///
    /// # Panics
    ///
    /// Panics if the result belongs to a different attribute or does not fit
    /// into `out`. Both indicate a defect in the consumer.
    pub fn consume_read(&mut self, ctx: Context, att: AttRef, out: &mut [u8]) -> Result<usize> {
        let r = self.reads[ctx].pop_front().ok_or(Error::Empty)?;
        assert_eq!(r.att, att, "out-of-order read result consumption");
        assert!(
            out.len() >= r.val.len(),
            "read result of {} bytes consumed with a {}-byte buffer",
            r.val.len(),
            out.len()
        );
        out[..r.val.len()].copy_from_slice(&r.val);
        Ok(r.val.len())
    }
}

impl State {
    /// Reads a characteristic value or descriptor.
    pub fn read(&mut self, att: AttRef, ctx: Context) -> Result<()> {
        let (link, hdl) = self.resolve(att, CharProps::READ)?;
        let op = (self.ops).alloc(OpRecord {
            ctx,
            kind: OpKind::Read,
            att,
            link,
        })?;
        self.drv.read(link, hdl, op).map_err(|e| {
            self.ops.take(op);
            Error::from(e)
        })
    }

    /// Writes a characteristic value or descriptor with response.
    pub fn write(&mut self, att: AttRef, val: &[u8], ctx: Context) -> Result<()> {
        if val.len() > MAX_VAL_LEN {
            return Err(Error::InvalidParameter);
        }
        let (link, hdl) = self.resolve(att, CharProps::WRITE)?;
        let op = (self.ops).alloc(OpRecord {
            ctx,
            kind: OpKind::Write,
            att,
            link,
        })?;
        self.drv.write(link, hdl, val, op).map_err(|e| {
            self.ops.take(op);
            Error::from(e)
        })
    }

    /// Writes a characteristic value without response.
    pub fn write_without_response(&mut self, chr: CharRef, val: &[u8]) -> Result<()> {
        let (link, hdl) = self.resolve(chr.into(), CharProps::WRITE_WITHOUT_RESPONSE)?;
        let mtu = (self.reg.by_link(link)).map_or(crate::att::DEFAULT_MTU, Connection::mtu);
        if val.len() > usize::from(mtu.saturating_sub(3)) {
            return Err(Error::InvalidParameter);
        }
        Ok(self.drv.write_without_response(link, hdl, val)?)
    }

    /// Resolves an attribute reference and checks characteristic properties.
    fn resolve(&self, att: AttRef, need: CharProps) -> Result<(ConnHandle, crate::att::Handle)> {
        let (c, hdl) = self.reg.att(att).ok_or(Error::InvalidParameter)?;
        if let AttRef::Char(r) = att {
            let (_, s, i) = self.reg.characteristic(r).ok_or(Error::InvalidParameter)?;
            if !s.chars[i].props.intersects(need) {
                return Err(Error::NotSupported);
            }
        }
        Ok((c.link(), hdl))
    }

    /// Handles a read completion.
    pub fn on_read_response(
        &mut self,
        link: ConnHandle,
        op: OpId,
        res: std::result::Result<&[u8], ErrorCode>,
    ) {
        let Some(rec) = self.ops.take(op) else {
            debug!("Read response for unknown or abandoned {op}");
            return;
        };
        if rec.link != link {
            warn!("Read response for {op} on {link}, expected {}", rec.link);
        }
        let res = res.map_err(Error::Att);
        if rec.ctx == Context::Kernel && self.kernel_client(rec.att) == KernelClient::PPoGatt {
            self.deferred.push_back(PPoInput::Meta {
                chr: rec.att.characteristic(),
                result: res.map(<[u8]>::to_vec),
            });
            return;
        }
        let len = match res {
            Ok(v) if !v.is_empty() => {
                self.ops.reads[rec.ctx].push_back(ReadResult {
                    att: rec.att,
                    link: rec.link,
                    val: v.to_vec(),
                });
                v.len()
            }
            _ => 0,
        };
        let result = res.map(|_| ());
        self.emit(rec.ctx, Event::ReadResponse {
            att: rec.att,
            len,
            result,
        });
    }

    /// Handles a write completion.
    pub fn on_write_response(
        &mut self,
        link: ConnHandle,
        op: OpId,
        res: std::result::Result<(), ErrorCode>,
    ) {
        let Some(rec) = self.ops.take(op) else {
            debug!("Write response for unknown or abandoned {op}");
            return;
        };
        if rec.link != link {
            warn!("Write response for {op} on {link}, expected {}", rec.link);
        }
        let res = res.map_err(Error::Att);
        match rec.kind {
            OpKind::Cccd { prev } => {
                self.on_cccd_written(op, rec.att.characteristic(), prev, res);
            }
            _ => self.emit(rec.ctx, Event::WriteResponse {
                att: rec.att,
                result: res,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn att(n: usize) -> AttRef {
        CharRef::from_key(Key::service(1, 0, 0).with_chr(n)).into()
    }

    #[test]
    fn alloc_limit() {
        let link = link();
        let mut ops = Ops::default();
        let rec = |ctx, kind| OpRecord {
            ctx,
            kind,
            att: att(0),
            link,
        };
        let ids: Vec<_> = (0..MAX_PENDING)
            .map(|_| ops.alloc(rec(Context::App, OpKind::Read)).unwrap())
            .collect();
        assert_eq!(
            ops.alloc(rec(Context::App, OpKind::Read)).unwrap_err(),
            Error::NoResources
        );
        assert!(ops.alloc(rec(Context::Kernel, OpKind::Write)).is_ok());
        assert_eq!(ops.take(ids[0]).map(|r| r.ctx), Some(Context::App));
        assert!(ops.take(ids[0]).is_none());
        ops.discard_ctx(Context::App);
        assert_eq!(ops.pending(Context::App), 0);
        assert_eq!(ops.pending(Context::Kernel), 1);
        ops.discard_link(link);
        assert_eq!(ops.pending(Context::Kernel), 0);
    }

    fn link() -> ConnHandle {
        ConnHandle::new(1).unwrap()
    }

    #[test]
    fn read_fifo() {
        let mut ops = Ops::default();
        ops.reads[Context::App].push_back(ReadResult {
            att: att(0),
            link: link(),
            val: vec![1, 2],
        });
        ops.reads[Context::App].push_back(ReadResult {
            att: att(1),
            link: link(),
            val: vec![3],
        });
        let mut out = [0; 4];
        assert_eq!(ops.consume_read(Context::App, att(0), &mut out), Ok(2));
        assert_eq!(out[..2], [1, 2]);
        assert_eq!(ops.consume_read(Context::App, att(1), &mut out), Ok(1));
        assert_eq!(
            ops.consume_read(Context::App, att(1), &mut out),
            Err(Error::Empty)
        );
    }

    #[test]
    #[should_panic(expected = "out-of-order")]
    fn read_out_of_order() {
        let mut ops = Ops::default();
        ops.reads[Context::Kernel].push_back(ReadResult {
            att: att(0),
            link: link(),
            val: vec![1],
        });
        let _ = ops.consume_read(Context::Kernel, att(1), &mut [0; 1]);
    }

    #[test]
    fn discard_link_drops_reads() {
        let other = ConnHandle::new(2).unwrap();
        let mut ops = Ops::default();
        for (link, n) in [(link(), 0), (other, 1), (link(), 2)] {
            ops.reads[Context::App].push_back(ReadResult {
                att: att(n),
                link,
                val: vec![1],
            });
        }
        ops.discard_link(link());
        assert_eq!(ops.consume_read(Context::App, att(1), &mut [0; 1]), Ok(1));
        assert_eq!(
            ops.consume_read(Context::App, att(1), &mut [0; 1]),
            Err(Error::Empty)
        );
    }
}
