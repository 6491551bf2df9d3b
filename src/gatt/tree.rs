//! Discovered attribute database of one connection.

use std::ops::RangeBounds;

use smallvec::SmallVec;
use tracing::warn;

use crate::att::{Handle, HandleRange};
use crate::uuid::Uuid;

use super::{CharProps, Key, ServiceRef};

/// Service as reported by the radio driver's discovery procedure.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub range: HandleRange,
    pub characteristics: Vec<DiscoveredChar>,
}

impl DiscoveredService {
    /// Creates a service without characteristics.
    #[inline]
    #[must_use]
    pub const fn new(uuid: Uuid, range: HandleRange) -> Self {
        Self {
            uuid,
            range,
            characteristics: Vec::new(),
        }
    }

    /// Appends a characteristic.
    #[inline]
    #[must_use]
    pub fn with_char(mut self, c: DiscoveredChar) -> Self {
        self.characteristics.push(c);
        self
    }
}

/// Characteristic as reported by the radio driver.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct DiscoveredChar {
    pub uuid: Uuid,
    pub props: CharProps,
    /// Characteristic value handle.
    pub value: Handle,
    pub descriptors: Vec<DiscoveredDesc>,
}

impl DiscoveredChar {
    /// Creates a characteristic without descriptors.
    #[inline]
    #[must_use]
    pub const fn new(uuid: Uuid, props: CharProps, value: Handle) -> Self {
        Self {
            uuid,
            props,
            value,
            descriptors: Vec::new(),
        }
    }

    /// Appends a descriptor.
    #[inline]
    #[must_use]
    pub fn with_desc(mut self, uuid: impl Into<Uuid>, handle: Handle) -> Self {
        self.descriptors.push(DiscoveredDesc {
            uuid: uuid.into(),
            handle,
        });
        self
    }
}

/// Descriptor as reported by the radio driver.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct DiscoveredDesc {
    pub uuid: Uuid,
    pub handle: Handle,
}

/// Immutable service subtree. Attribute handles are stored as offsets from
/// the service declaration handle.
#[derive(Clone, Debug)]
pub(crate) struct Service {
    pub uuid: Uuid,
    pub range: HandleRange,
    /// Discovery generation that produced this service.
    pub generation: u16,
    pub chars: SmallVec<[Characteristic; 4]>,
}

#[derive(Clone, Debug)]
pub(crate) struct Characteristic {
    pub uuid: Uuid,
    pub props: CharProps,
    value: u16,
    pub descs: SmallVec<[Descriptor; 2]>,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Descriptor {
    pub uuid: Uuid,
    off: u16,
}

impl Service {
    /// Converts a discovered service, dropping any attribute that lies
    /// outside of the service range.
    pub fn new(d: DiscoveredService, generation: u16) -> Self {
        let mut chars = SmallVec::with_capacity(d.characteristics.len());
        for c in d.characteristics {
            let Some(value) = in_range(d.range, c.value) else {
                warn!("Characteristic {} outside of {:?}", c.uuid, d.range);
                continue;
            };
            let descs = (c.descriptors.into_iter())
                .filter_map(|dd| {
                    let off = in_range(d.range, dd.handle);
                    if off.is_none() {
                        warn!("Descriptor {} outside of {:?}", dd.uuid, d.range);
                    }
                    off.map(|off| Descriptor { uuid: dd.uuid, off })
                })
                .take(Key::MAX_IDX)
                .collect();
            chars.push(Characteristic {
                uuid: c.uuid,
                props: c.props,
                value,
                descs,
            });
            if chars.len() == Key::MAX_IDX {
                warn!("Too many characteristics in service {}", d.uuid);
                break;
            }
        }
        Self {
            uuid: d.uuid,
            range: d.range,
            generation,
            chars,
        }
    }

    /// Returns the handle of the attribute at the specified offset.
    #[inline]
    fn handle(&self, off: u16) -> Handle {
        self.range.start().offset(off).unwrap_or(Handle::MAX)
    }

    /// Returns the value handle of characteristic `i`.
    #[inline]
    pub fn value_handle(&self, i: usize) -> Option<Handle> {
        (self.chars.get(i)).map(|c| self.handle(c.value))
    }

    /// Returns the handle of descriptor `j` of characteristic `i`.
    #[inline]
    pub fn desc_handle(&self, i: usize, j: usize) -> Option<Handle> {
        let d = self.chars.get(i)?.descs.get(j)?;
        Some(self.handle(d.off))
    }

    /// Returns the index of the first descriptor of characteristic `i` with
    /// the specified UUID.
    pub fn find_desc(&self, i: usize, uuid: impl Into<Uuid>) -> Option<usize> {
        let uuid = uuid.into();
        (self.chars.get(i)?.descs.iter()).position(|d| d.uuid == uuid)
    }
}

#[inline]
fn in_range(r: HandleRange, h: Handle) -> Option<u16> {
    r.contains(&h).then(|| h.offset_from(r.start())).flatten()
}

/// Slot of the service table. The epoch changes whenever the slot is vacated,
/// which invalidates all references into the previous occupant.
#[derive(Debug, Default)]
struct Slot {
    epoch: u16,
    svc: Option<Service>,
}

/// Per-connection service table.
#[derive(Debug, Default)]
pub(crate) struct ServiceTree {
    slots: Vec<Slot>,
    /// Generation of the last successful discovery.
    pub generation: u16,
}

impl ServiceTree {
    /// Returns the generation assigned to services found by the discovery in
    /// progress.
    #[inline]
    pub fn pending_generation(&self) -> u16 {
        self.generation.wrapping_add(1)
    }

    /// Returns whether the tree has no services.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.svc.is_none())
    }

    /// Inserts a service, returning its slot index or `None` if the table is
    /// full.
    pub fn insert(&mut self, s: Service) -> Option<u16> {
        let i = match self.slots.iter().position(|s| s.svc.is_none()) {
            Some(i) => i,
            None if self.slots.len() < Key::MAX_SLOTS => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
            None => return None,
        };
        self.slots[i].svc = Some(s);
        #[allow(clippy::cast_possible_truncation)]
        Some(i as u16)
    }

    /// Removes the service in slot `i`.
    pub fn remove(&mut self, i: u16) -> Option<Service> {
        let slot = self.slots.get_mut(usize::from(i))?;
        let s = slot.svc.take();
        if s.is_some() {
            slot.epoch = slot.epoch.wrapping_add(1);
        }
        s
    }

    /// Removes all services, returning the slots that were occupied.
    pub fn clear(&mut self) -> Vec<u16> {
        let live = self.iter().map(|(i, _)| i).collect::<Vec<_>>();
        for &i in &live {
            self.remove(i);
        }
        live
    }

    /// Returns the service in slot `i`, validating the slot epoch.
    #[inline]
    pub fn get(&self, i: u16, epoch: u16) -> Option<&Service> {
        let slot = self.slots.get(usize::from(i))?;
        (slot.epoch == epoch).then_some(slot.svc.as_ref()).flatten()
    }

    /// Returns the current epoch of slot `i`.
    #[inline]
    pub fn epoch(&self, i: u16) -> u16 {
        self.slots.get(usize::from(i)).map_or(0, |s| s.epoch)
    }

    /// Returns an iterator over occupied slots ordered by slot index.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &Service)> {
        (self.slots.iter().enumerate()).filter_map(|(i, s)| {
            #[allow(clippy::cast_possible_truncation)]
            s.svc.as_ref().map(|svc| (i as u16, svc))
        })
    }

    /// Returns occupied slots ordered by starting handle.
    pub fn sorted(&self) -> Vec<(u16, &Service)> {
        let mut v: Vec<_> = self.iter().collect();
        v.sort_unstable_by_key(|(_, s)| s.range.start());
        v
    }

    /// Returns the slots of services that overlap `r`.
    pub fn overlapping(&self, r: HandleRange) -> Vec<u16> {
        (self.iter())
            .filter_map(|(i, s)| s.range.overlaps(r).then_some(i))
            .collect()
    }

    /// Returns the reference of the service in slot `i`.
    #[inline]
    pub fn service_ref(&self, serial: u16, i: u16) -> ServiceRef {
        ServiceRef::from_key(Key::service(serial, i, self.epoch(i)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uuid::{Uuid16, CLIENT_CHARACTERISTIC_CONFIGURATION};

    fn hdl(h: u16) -> Handle {
        Handle::new(h).unwrap()
    }

    fn svc(start: u16, end: u16) -> DiscoveredService {
        let u = Uuid16::new(0x180D).unwrap().as_uuid();
        DiscoveredService::new(u, HandleRange::from_raw(start, end).unwrap()).with_char(
            DiscoveredChar::new(
                Uuid16::new(0x2A37).unwrap().as_uuid(),
                CharProps::NOTIFY,
                hdl(start + 2),
            )
            .with_desc(CLIENT_CHARACTERISTIC_CONFIGURATION, hdl(start + 3))
            .with_desc(CLIENT_CHARACTERISTIC_CONFIGURATION, hdl(end + 1)),
        )
    }

    #[test]
    fn service_offsets() {
        let s = Service::new(svc(0x10, 0x14), 1);
        assert_eq!(s.value_handle(0), Some(hdl(0x12)));
        assert_eq!(s.desc_handle(0, 0), Some(hdl(0x13)));
        // Descriptor outside of the range is dropped
        assert_eq!(s.desc_handle(0, 1), None);
        assert_eq!(s.find_desc(0, CLIENT_CHARACTERISTIC_CONFIGURATION), Some(0));
    }

    #[test]
    fn slot_reuse() {
        let mut t = ServiceTree::default();
        let a = t.insert(Service::new(svc(0x10, 0x14), 1)).unwrap();
        let b = t.insert(Service::new(svc(0x20, 0x24), 1)).unwrap();
        assert_eq!((a, b), (0, 1));
        let e = t.epoch(a);
        assert!(t.get(a, e).is_some());
        assert!(t.remove(a).is_some());
        assert!(t.get(a, e).is_none());
        assert_eq!(t.insert(Service::new(svc(0x30, 0x34), 2)), Some(a));
        assert!(t.get(a, e).is_none());
        assert!(t.get(a, e.wrapping_add(1)).is_some());
        assert_eq!(t.overlapping(HandleRange::from_raw(0x14, 0x20).unwrap()), [b]);
        assert_eq!(t.sorted()[0].0, b);
        assert_eq!(t.clear().len(), 2);
        assert!(t.is_empty());
    }
}
