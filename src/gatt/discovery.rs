//! Service discovery job queue.
//!
//! Jobs run one at a time per connection in FIFO order. A job that times out
//! or fails is retried transparently until the retry budget is exhausted. When
//! the queue drains, the discovery generation advances and the services found
//! by this round are announced.

use std::collections::VecDeque;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::att::{ErrorCode, HandleRange};
use crate::le::{Addr, ConnHandle};
use crate::uuid::{GENERIC_ATTRIBUTE_SERVICE, SERVICE_CHANGED};

use super::client::State;
use super::tree::Service;
use super::*;

/// Discovery job running against the driver.
#[derive(Clone, Copy, Debug)]
struct Job {
    range: HandleRange,
    deadline: Instant,
    retries: u8,
}

/// Per-connection discovery state.
#[derive(Debug, Default)]
pub(crate) struct Discovery {
    queue: VecDeque<HandleRange>,
    active: Option<Job>,
}

impl Discovery {
    /// Returns whether a job is queued or running.
    #[inline]
    pub fn is_busy(&self) -> bool {
        self.active.is_some() || !self.queue.is_empty()
    }

    /// Returns whether a full-range job is queued or running.
    fn has_full(&self) -> bool {
        self.jobs().any(HandleRange::is_all)
    }

    /// Returns the ranges of all queued and running jobs.
    fn jobs(&self) -> impl Iterator<Item = HandleRange> + '_ {
        (self.active.iter().map(|j| j.range)).chain(self.queue.iter().copied())
    }

    /// Returns the number of queued jobs, including the running one.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.jobs().count()
    }
}

impl State {
    /// Discovers all services of a device. Existing services are announced
    /// again without talking to the remote device.
    pub fn discover_all(&mut self, peer: Addr, now: Instant) -> Result<()> {
        let c = self.reg.by_addr_mut(peer).ok_or(Error::NotConnected)?;
        if c.discovery.is_busy() {
            return Err(Error::InProgress);
        }
        if !c.tree.is_empty() {
            let services = (c.tree.sorted().into_iter())
                .map(|(i, _)| c.tree.service_ref(c.serial, i))
                .collect();
            self.broadcast(&Event::ServicesAdded { peer, services });
            return Ok(());
        }
        let link = c.link();
        c.discovery.queue.push_back(HandleRange::ALL);
        self.run_next_job(link, now);
        Ok(())
    }

    /// Rediscovers a handle range after a remote database change. Services
    /// overlapping the range are removed immediately.
    pub fn discover_range(&mut self, peer: Addr, r: HandleRange, now: Instant) -> Result<()> {
        if r.is_all() {
            return self.rediscover_all(peer, false, now);
        }
        let c = self.reg.by_addr(peer).ok_or(Error::NotConnected)?;
        let link = c.link();
        if c.discovery.has_full() {
            debug!("{r:?} rediscovery folded into full discovery of {peer}");
            return Ok(());
        }
        self.remove_services(link, r);

        let Some(c) = self.reg.by_link_mut(link) else {
            return Ok(());
        };
        let d = &mut c.discovery;
        if d.queue.iter().any(|q| q.covers(r)) {
            debug!("{r:?} rediscovery already queued for {peer}");
            return Ok(());
        }
        d.queue.retain(|q| !r.covers(*q));
        match d.active {
            Some(job) if job.range.overlaps(r) => {
                // Restart the running job so that nothing it already reported
                // from the changed range survives
                d.active = None;
                d.queue.push_front(job.range);
                if !job.range.covers(r) {
                    d.queue.push_back(r);
                }
                self.drv.stop_discovery(link);
                self.discard_pending(link, job.range);
            }
            _ => d.queue.push_back(r),
        }
        self.run_next_job(link, now);
        Ok(())
    }

    /// Cancels all discovery jobs, invalidates the service tree, and starts
    /// discovery from scratch. If `unsubscribe` is set, remote subscriptions
    /// are cleared first.
    pub fn rediscover_all(&mut self, peer: Addr, unsubscribe: bool, now: Instant) -> Result<()> {
        let c = self.reg.by_addr_mut(peer).ok_or(Error::NotConnected)?;
        let link = c.link();
        let running = c.discovery.active.take().is_some();
        c.discovery.queue.clear();
        if running {
            self.drv.stop_discovery(link);
        }
        self.cleanup_subscriptions_conn(link, unsubscribe);
        self.ppogatt_remove_services(peer, |_| true);
        let Some(c) = self.reg.by_link_mut(link) else {
            return Ok(());
        };
        let announced = c.tree.generation;
        let had = (c.tree.iter()).any(|(_, s)| generation_le(s.generation, announced));
        c.tree.clear();
        c.discovery.queue.push_back(HandleRange::ALL);
        if had {
            info!("Invalidating all services of {peer}");
            self.broadcast(&Event::ServicesInvalidated { peer });
        }
        self.run_next_job(link, now);
        Ok(())
    }

    /// Handles a Service Changed indication.
    pub(super) fn on_service_changed(&mut self, peer: Addr, val: &[u8], now: Instant) {
        let r = match *val {
            [s0, s1, e0, e1] => {
                HandleRange::from_raw(u16::from_le_bytes([s0, s1]), u16::from_le_bytes([e0, e1]))
            }
            _ => None,
        };
        let Some(r) = r else {
            warn!("Invalid Service Changed value from {peer}: {val:02X?}");
            return;
        };
        info!("Service Changed {r:?} on {peer}");
        if let Err(e) = self.discover_range(peer, r, now) {
            warn!("Failed to rediscover {r:?} on {peer}: {e}");
        }
    }

    /// Adds a service reported by the driver for the running job.
    pub fn on_service_discovered(&mut self, link: ConnHandle, d: DiscoveredService) {
        let Some(c) = self.reg.by_link(link) else {
            warn!("Service discovered for unknown {link}");
            return;
        };
        match c.discovery.active {
            Some(job) if job.range.covers(d.range) => {}
            Some(job) => {
                warn!("Discovered {:?} outside of job {:?}", d.range, job.range);
                return;
            }
            None => {
                warn!("Discovered {:?} without a running job on {link}", d.range);
                return;
            }
        }
        self.remove_services(link, d.range);
        let Some(c) = self.reg.by_link_mut(link) else {
            return;
        };
        debug!("Discovered service {} {:?} on {link}", d.uuid, d.range);
        let s = Service::new(d, c.tree.pending_generation());
        if c.tree.insert(s).is_none() {
            warn!("Service table of {link} is full");
        }
    }

    /// Handles completion of the running job.
    pub fn on_discovery_complete(
        &mut self,
        link: ConnHandle,
        res: std::result::Result<(), ErrorCode>,
        now: Instant,
    ) {
        let Some(c) = self.reg.by_link_mut(link) else {
            return;
        };
        let Some(job) = c.discovery.active.take() else {
            debug!("Discovery completion without a running job on {link}");
            return;
        };
        match res {
            Ok(()) => self.run_next_job(link, now),
            Err(e) => self.retry_job(link, job, Error::Att(e), now),
        }
    }

    /// Retries jobs whose deadline has passed.
    pub(super) fn poll_discovery(&mut self, now: Instant) {
        let expired: Vec<_> = (self.reg.iter())
            .filter_map(|c| {
                let job = c.discovery.active?;
                (job.deadline <= now).then_some((c.link(), job))
            })
            .collect();
        for (link, job) in expired {
            warn!("Discovery of {:?} on {link} timed out", job.range);
            if let Some(c) = self.reg.by_link_mut(link) {
                c.discovery.active = None;
            }
            self.drv.stop_discovery(link);
            self.retry_job(link, job, Error::DiscoveryTimeout, now);
        }
    }

    /// Starts the next queued job or finishes the discovery round.
    fn run_next_job(&mut self, link: ConnHandle, now: Instant) {
        let Some(c) = self.reg.by_link_mut(link) else {
            return;
        };
        if c.discovery.active.is_some() {
            return;
        }
        match c.discovery.queue.pop_front() {
            Some(range) => self.start_job(link, range, 0, now),
            None => self.finish_discovery(link),
        }
    }

    /// Issues a discovery request to the driver.
    fn start_job(&mut self, link: ConnHandle, range: HandleRange, retries: u8, now: Instant) {
        let Some(c) = self.reg.by_link_mut(link) else {
            return;
        };
        let job = Job {
            range,
            deadline: now + self.cfg.discovery_timeout(),
            retries,
        };
        c.discovery.active = Some(job);
        debug!("Discovering {range:?} on {link} (retry {retries})");
        if let Err(e) = self.drv.discover(link, range) {
            warn!("Failed to start discovery on {link}: {e}");
            if let Some(c) = self.reg.by_link_mut(link) {
                c.discovery.active = None;
            }
            self.retry_job(link, job, e.into(), now);
        }
    }

    /// Retries a failed job or gives up on the whole round.
    fn retry_job(&mut self, link: ConnHandle, job: Job, err: Error, now: Instant) {
        self.discard_pending(link, job.range);
        if job.retries < self.cfg.discovery_max_retries {
            self.start_job(link, job.range, job.retries + 1, now);
        } else {
            self.discovery_failed(link, err);
        }
    }

    /// Reports a terminal discovery failure.
    fn discovery_failed(&mut self, link: ConnHandle, err: Error) {
        self.discard_pending(link, HandleRange::ALL);
        let Some(c) = self.reg.by_link_mut(link) else {
            return;
        };
        c.discovery = Discovery::default();
        let peer = c.peer();
        warn!("Service discovery of {peer} failed: {err}");
        self.broadcast(&Event::DiscoveryFailed { peer, err });
        if self.cfg.disconnect_on_discovery_failure {
            self.drv.disconnect(link);
        }
    }

    /// Advances the discovery generation and announces the new services.
    fn finish_discovery(&mut self, link: ConnHandle) {
        let Some(c) = self.reg.by_link_mut(link) else {
            return;
        };
        c.tree.generation = c.tree.pending_generation();
        let generation = c.tree.generation;
        let services: Vec<_> = (c.tree.sorted().into_iter())
            .filter(|(_, s)| s.generation == generation)
            .map(|(i, _)| c.tree.service_ref(c.serial, i))
            .collect();
        let peer = c.peer();
        info!(
            "Discovery of {peer} complete: {} new services (generation {generation})",
            services.len()
        );
        self.subscribe_service_changed(link);
        self.ppogatt_add_services(peer, &services);
        self.broadcast(&Event::ServicesAdded { peer, services });
    }

    /// Subscribes the kernel to the remote Service Changed characteristic.
    fn subscribe_service_changed(&mut self, link: ConnHandle) {
        let Some(c) = self.reg.by_link_mut(link) else {
            return;
        };
        if c.svc_changed.is_some() {
            return;
        }
        let found = (c.tree.iter())
            .filter(|(_, s)| s.uuid == GENERIC_ATTRIBUTE_SERVICE)
            .find_map(|(slot, s)| {
                let i = s.chars.iter().position(|ch| ch.uuid == SERVICE_CHANGED)?;
                Some(c.char_ref(slot, i))
            });
        let Some(chr) = found else {
            return;
        };
        c.svc_changed = Some(chr);
        match self.subscribe(chr, SubType::Indications, Context::Kernel) {
            Ok(()) | Err(Error::AlreadyInState) => {}
            Err(e) => {
                debug!("Not subscribing to Service Changed on {link}: {e}");
                if let Some(c) = self.reg.by_link_mut(link) {
                    c.svc_changed = None;
                }
            }
        }
    }

    /// Removes services overlapping a range. Services that were already
    /// announced are reported as removed.
    fn remove_services(&mut self, link: ConnHandle, r: HandleRange) {
        let Some(c) = self.reg.by_link(link) else {
            return;
        };
        let (peer, announced) = (c.peer(), c.tree.generation);
        let victims: Vec<_> = (c.tree.overlapping(r).into_iter())
            .filter_map(|i| {
                let s = c.tree.get(i, c.tree.epoch(i))?;
                Some((i, s.range, generation_le(s.generation, announced)))
            })
            .map(|(i, range, old)| (i, range, old, c.tree.service_ref(c.serial, i)))
            .collect();
        for (i, range, old, sref) in victims {
            self.cleanup_subscriptions_range(link, range);
            self.ppogatt_remove_services(peer, |s| s == sref);
            if let Some(c) = self.reg.by_link_mut(link) {
                c.tree.remove(i);
            }
            if old {
                debug!("Removed service {sref:?} of {peer}");
                self.broadcast(&Event::ServiceRemoved { peer, service: sref });
            }
        }
    }

    /// Drops services found by the current round within a range.
    fn discard_pending(&mut self, link: ConnHandle, r: HandleRange) {
        let Some(c) = self.reg.by_link_mut(link) else {
            return;
        };
        let pending = c.tree.pending_generation();
        let slots: Vec<_> = (c.tree.iter())
            .filter(|(_, s)| s.generation == pending && r.covers(s.range))
            .map(|(i, _)| i)
            .collect();
        for i in slots {
            c.tree.remove(i);
        }
    }
}

/// Returns whether generation `a` is not newer than `b`.
#[inline]
const fn generation_le(a: u16, b: u16) -> bool {
    #[allow(clippy::cast_possible_wrap)]
    let d = b.wrapping_sub(a) as i16;
    d >= 0
}
