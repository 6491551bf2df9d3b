//! Notification and indication subscriptions.
//!
//! One remote CCCD is shared by both calling contexts. The value written to
//! it is the prevailing type of all interested contexts, and it is only
//! written when that type changes.

use std::ops::RangeBounds;

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::att::{Handle, HandleRange};
use crate::host::{Driver, OpId};
use crate::le::ConnHandle;
use crate::uuid::CLIENT_CHARACTERISTIC_CONFIGURATION;

use super::client::{PPoInput, State};
use super::ops::{OpKind, OpRecord, Ops};
use super::*;

/// Subscription state of one context.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct CtxSub {
    pub typ: SubType,
    /// Outstanding CCCD write requested by this context.
    pub pending: Option<PendingWrite>,
}

/// CCCD write waiting for its response on behalf of one context.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct PendingWrite {
    pub op: OpId,
    /// Context type before the request.
    pub was: SubType,
}

/// Characteristic with at least one interested context.
#[derive(Debug)]
pub(crate) struct Subscription {
    pub chr: CharRef,
    pub value: Handle,
    pub cccd: Handle,
    pub ctx: PerContext<CtxSub>,
    /// Type most recently written to the remote CCCD.
    pub remote: SubType,
    /// Most recent CCCD write that is still outstanding.
    pub latest: Option<OpId>,
}

impl Subscription {
    #[inline]
    fn prevailing(&self) -> SubType {
        SubType::prevailing(self.ctx.iter().map(|(_, s)| s.typ))
    }

    /// Returns whether no context is subscribed or waiting for a response.
    #[inline]
    fn is_idle(&self) -> bool {
        (self.ctx.iter()).all(|(_, s)| !s.typ.is_some() && s.pending.is_none())
    }
}

/// Writes `sub.remote` to the remote CCCD. `prev` is the type being
/// replaced. Best-effort writes are issued without a context.
fn write_cccd(
    ops: &mut Ops,
    drv: &dyn Driver,
    link: ConnHandle,
    sub: &Subscription,
    prev: SubType,
    ctx: Option<Context>,
) -> Result<OpId> {
    let rec = OpRecord {
        ctx: ctx.unwrap_or(Context::Kernel),
        kind: OpKind::Cccd { prev },
        att: sub.chr.into(),
        link,
    };
    let op = ops.alloc(rec)?;
    let val = sub.remote.cccd().bits().to_le_bytes();
    debug!("Writing {:?} to CCCD of {:?} ({op})", sub.remote, sub.chr);
    match drv.write(link, sub.cccd, &val, op) {
        Ok(()) => Ok(op),
        Err(e) => {
            ops.take(op);
            Err(Error::from(e))
        }
    }
}

impl State {
    /// Changes the subscription of one context.
    pub fn subscribe(&mut self, chr: CharRef, typ: SubType, ctx: Context) -> Result<()> {
        let (c, s, i) = self.reg.characteristic(chr).ok_or(Error::InvalidParameter)?;
        if typ.is_some() && !s.chars[i].props.contains(typ.required_prop()) {
            return Err(Error::NotSupported);
        }
        let link = c.link();
        let value = s.value_handle(i).ok_or(Error::InvalidParameter)?;
        let cccd = (s.find_desc(i, CLIENT_CHARACTERISTIC_CONFIGURATION))
            .and_then(|j| s.desc_handle(i, j))
            .ok_or(Error::NotSupported)?;

        let Self {
            reg, ops, drv, ntf, ..
        } = self;
        let conn = reg.by_key_mut(chr.key()).ok_or(Error::InvalidParameter)?;
        let p = match conn.subs.iter().position(|s| s.chr == chr) {
            Some(p) => p,
            None if typ.is_some() => {
                conn.subs.push(Subscription {
                    chr,
                    value,
                    cccd,
                    ctx: PerContext::default(),
                    remote: SubType::None,
                    latest: None,
                });
                conn.subs.len() - 1
            }
            None => return Err(Error::AlreadyInState),
        };
        let sub = &mut conn.subs[p];
        let cur = sub.ctx[ctx];
        if cur.pending.is_some() {
            return Err(Error::InProgress);
        }
        if cur.typ == typ {
            return Err(Error::AlreadyInState);
        }
        sub.ctx[ctx].typ = typ;
        let prevailing = sub.prevailing();
        let wrote = prevailing != sub.remote;
        if wrote {
            let prev = sub.remote;
            sub.remote = prevailing;
            match write_cccd(ops, drv.as_ref(), link, sub, prev, Some(ctx)) {
                Ok(op) => {
                    sub.ctx[ctx].pending = Some(PendingWrite { op, was: cur.typ });
                    sub.latest = Some(op);
                }
                Err(e) => {
                    sub.ctx[ctx] = cur;
                    sub.remote = prev;
                    if sub.is_idle() {
                        conn.subs.swap_remove(p);
                    }
                    return Err(e);
                }
            }
        }
        match (cur.typ.is_some(), typ.is_some()) {
            (false, true) => ntf.acquire(ctx),
            (true, false) => ntf.release(ctx),
            _ => {}
        }
        if conn.subs[p].is_idle() {
            conn.subs.swap_remove(p);
        }
        if !wrote {
            self.confirm_subscription(ctx, chr, typ, Ok(()));
        }
        Ok(())
    }

    /// Returns the subscription type of a context.
    pub fn subscription(&self, chr: CharRef, ctx: Context) -> SubType {
        (self.reg.by_key(chr.key()))
            .and_then(|c| c.subs.iter().find(|s| s.chr == chr))
            .map_or(SubType::None, |s| s.ctx[ctx].typ)
    }

    /// Handles the completion of CCCD write `op`. Only the context that
    /// requested this write is settled. The remote type is reverted on
    /// failure unless a newer write has replaced it.
    pub(super) fn on_cccd_written(
        &mut self,
        op: OpId,
        chr: CharRef,
        prev: SubType,
        res: Result<()>,
    ) {
        let Some(conn) = self.reg.by_key_mut(chr.key()) else {
            return;
        };
        let Some(p) = conn.subs.iter().position(|s| s.chr == chr) else {
            debug!("CCCD response for {chr:?} without a subscription");
            return;
        };
        let sub = &mut conn.subs[p];
        if sub.latest == Some(op) {
            sub.latest = None;
            if let Err(e) = res {
                warn!("CCCD write for {chr:?} failed: {e}");
                sub.remote = prev;
            }
        } else if let Err(e) = res {
            warn!("Superseded CCCD write for {chr:?} failed: {e}");
        }
        let owner = (sub.ctx.iter())
            .find_map(|(ctx, s)| s.pending.filter(|w| w.op == op).map(|w| (ctx, w)));
        let Some((ctx, w)) = owner else {
            if sub.is_idle() {
                conn.subs.swap_remove(p);
            }
            return;
        };
        let s = &mut sub.ctx[ctx];
        let typ = s.typ;
        s.pending = None;
        if res.is_err() {
            s.typ = w.was;
            match (typ.is_some(), w.was.is_some()) {
                (true, false) => self.ntf.release(ctx),
                (false, true) => self.ntf.acquire(ctx),
                _ => {}
            }
        }
        if sub.is_idle() {
            conn.subs.swap_remove(p);
        }
        self.confirm_subscription(ctx, chr, typ, res);
    }

    /// Delivers a subscription confirmation to its owner.
    fn confirm_subscription(&mut self, ctx: Context, chr: CharRef, typ: SubType, result: Result<()>) {
        if ctx == Context::Kernel {
            match self.kernel_client(chr.into()) {
                KernelClient::PPoGatt => {
                    self.deferred
                        .push_back(PPoInput::Subscribed { chr, typ, result });
                    return;
                }
                KernelClient::ServiceChanged => {
                    if let Err(e) = result {
                        warn!("Service Changed subscription failed: {e}");
                    }
                    return;
                }
                KernelClient::External => {}
            }
        }
        self.emit(ctx, Event::Subscribed { chr, typ, result });
    }

    /// Unsubscribes every characteristic of a context. The remote CCCD is
    /// updated where the prevailing type changes.
    pub fn cleanup_subscriptions_ctx(&mut self, ctx: Context) {
        let Self { reg, ops, drv, .. } = self;
        reg.for_each(|conn| {
            let link = conn.link();
            conn.subs.retain_mut(|sub| {
                sub.ctx[ctx] = CtxSub::default();
                let prevailing = sub.prevailing();
                if prevailing != sub.remote {
                    let prev = sub.remote;
                    sub.remote = prevailing;
                    match write_cccd(ops, drv.as_ref(), link, sub, prev, None) {
                        Ok(op) => sub.latest = Some(op),
                        Err(e) => debug!("Best-effort CCCD write for {:?} failed: {e}", sub.chr),
                    }
                }
                !sub.is_idle()
            });
        });
        self.ntf.reset(ctx);
    }

    /// Drops all subscriptions of a connection. If `unsubscribe` is set, the
    /// remote CCCDs are cleared on a best-effort basis.
    pub(super) fn cleanup_subscriptions_conn(&mut self, link: ConnHandle, unsubscribe: bool) {
        let Self {
            reg, ops, drv, ntf, ..
        } = self;
        let Some(conn) = reg.by_link_mut(link) else {
            return;
        };
        for mut sub in conn.subs.drain(..) {
            for (ctx, s) in sub.ctx.iter() {
                if s.typ.is_some() {
                    ntf.release(ctx);
                }
            }
            if unsubscribe && sub.remote.is_some() {
                let prev = sub.remote;
                sub.remote = SubType::None;
                if let Err(e) = write_cccd(ops, drv.as_ref(), link, &sub, prev, None) {
                    debug!("Best-effort CCCD write for {:?} failed: {e}", sub.chr);
                }
            }
        }
        conn.svc_changed = None;
    }

    /// Drops subscriptions of characteristics whose value handle lies in a
    /// range removed from the remote database.
    pub(super) fn cleanup_subscriptions_range(&mut self, link: ConnHandle, r: HandleRange) {
        let Self { reg, ntf, .. } = self;
        let Some(conn) = reg.by_link_mut(link) else {
            return;
        };
        conn.subs.retain(|sub| {
            if !r.contains(&sub.value) {
                return true;
            }
            debug!("Dropping subscription of removed {:?}", sub.chr);
            for (ctx, s) in sub.ctx.iter() {
                if s.typ.is_some() {
                    ntf.release(ctx);
                }
            }
            false
        });
        if (conn.svc_changed)
            .and_then(|c| conn.att_handle(c.into()))
            .map_or(true, |h| r.contains(&h))
        {
            conn.svc_changed = None;
        }
    }

    /// Returns the contexts that must receive a notification, handling
    /// Service Changed indications in place.
    pub(super) fn notification_targets(
        &mut self,
        link: ConnHandle,
        hdl: Handle,
        val: &[u8],
        now: tokio::time::Instant,
    ) -> SmallVec<[(Context, CharRef); 2]> {
        let mut t = SmallVec::new();
        let Some(conn) = self.reg.by_link_mut(link) else {
            debug!("Notification for unknown {link}");
            return t;
        };
        let Some(sub) = conn.subs.iter().find(|s| s.value == hdl) else {
            // Remote devices may remember CCCD state from an earlier connection
            if !conn.warned_unknown_ntf {
                warn!("Notification for unsubscribed {hdl} on {link}");
                conn.warned_unknown_ntf = true;
            }
            return t;
        };
        let chr = sub.chr;
        t.extend((sub.ctx.iter()).filter_map(|(ctx, s)| s.typ.is_some().then_some((ctx, chr))));
        if conn.svc_changed == Some(chr) {
            let peer = conn.peer();
            self.on_service_changed(peer, val, now);
            t.clear();
        }
        t
    }
}
