//! Opaque attribute references handed to calling contexts.
//!
//! A reference packs the connection serial, the service slot and its epoch,
//! and the characteristic/descriptor indices into a `u64` with the top bit
//! set. Resolving a reference re-validates every component against the
//! current connection state, so stale or forged values fail closed.

use std::fmt::{Debug, Formatter};
use std::num::NonZeroU64;

use crate::util::name_of;

const FLAG: u64 = 1 << 63;
const SERIAL_SHIFT: u32 = 48;
const EPOCH_SHIFT: u32 = 32;
const SLOT_SHIFT: u32 = 20;
const CHR_SHIFT: u32 = 10;

const SERIAL_MASK: u64 = (1 << 15) - 1;
const EPOCH_MASK: u64 = (1 << 16) - 1;
const SLOT_MASK: u64 = (1 << 12) - 1;
const IDX_MASK: u64 = (1 << 10) - 1;

/// Unpacked reference components.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct Key {
    pub serial: u16,
    pub epoch: u16,
    pub slot: u16,
    /// Characteristic index + 1, or 0.
    pub chr: u16,
    /// Descriptor index + 1, or 0.
    pub desc: u16,
}

impl Key {
    /// Maximum connection serial.
    pub const MAX_SERIAL: u16 = SERIAL_MASK as u16;
    /// Maximum number of service slots per connection.
    pub const MAX_SLOTS: usize = SLOT_MASK as usize + 1;
    /// Maximum number of characteristics per service and descriptors per
    /// characteristic.
    pub const MAX_IDX: usize = IDX_MASK as usize;

    /// Returns a service key.
    #[inline]
    #[must_use]
    pub const fn service(serial: u16, slot: u16, epoch: u16) -> Self {
        Self {
            serial,
            epoch,
            slot,
            chr: 0,
            desc: 0,
        }
    }

    /// Returns the key of characteristic `i` within this service.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_chr(mut self, i: usize) -> Self {
        self.chr = i as u16 + 1;
        self
    }

    /// Returns the key of descriptor `i` within this characteristic.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_desc(mut self, i: usize) -> Self {
        self.desc = i as u16 + 1;
        self
    }

    /// Returns the characteristic index, if any.
    #[inline]
    #[must_use]
    pub const fn chr_idx(self) -> Option<usize> {
        match self.chr {
            0 => None,
            i => Some(i as usize - 1),
        }
    }

    /// Returns the descriptor index, if any.
    #[inline]
    #[must_use]
    pub const fn desc_idx(self) -> Option<usize> {
        match self.desc {
            0 => None,
            i => Some(i as usize - 1),
        }
    }

    /// Returns the key of the containing service.
    #[inline]
    #[must_use]
    pub const fn service_key(self) -> Self {
        Self::service(self.serial, self.slot, self.epoch)
    }

    /// Packs the key. The flag bit guarantees a non-zero result.
    #[inline]
    #[must_use]
    fn pack(self) -> NonZeroU64 {
        let v = FLAG
            | (u64::from(self.serial) & SERIAL_MASK) << SERIAL_SHIFT
            | (u64::from(self.epoch) & EPOCH_MASK) << EPOCH_SHIFT
            | (u64::from(self.slot) & SLOT_MASK) << SLOT_SHIFT
            | (u64::from(self.chr) & IDX_MASK) << CHR_SHIFT
            | u64::from(self.desc) & IDX_MASK;
        match NonZeroU64::new(v) {
            Some(nz) => nz,
            None => unreachable!(),
        }
    }

    /// Unpacks a raw value. Returns `None` if the flag bit is clear.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    fn unpack(v: u64) -> Option<Self> {
        (v & FLAG != 0).then_some(Self {
            serial: (v >> SERIAL_SHIFT & SERIAL_MASK) as u16,
            epoch: (v >> EPOCH_SHIFT & EPOCH_MASK) as u16,
            slot: (v >> SLOT_SHIFT & SLOT_MASK) as u16,
            chr: (v >> CHR_SHIFT & IDX_MASK) as u16,
            desc: (v & IDX_MASK) as u16,
        })
    }
}

macro_rules! opaque_ref {
    ($(#[$doc:meta])* $t:ident, |$k:ident| $shape:expr) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
        #[repr(transparent)]
        pub struct $t(NonZeroU64);

        impl $t {
            /// Reconstructs a reference from its raw value, checking only its
            /// shape. Whether it refers to a live object is decided when it is
            /// used.
            #[inline]
            #[must_use]
            pub fn from_raw(v: u64) -> Option<Self> {
                Key::unpack(v).filter(|$k| $shape).map(Self::from_key)
            }

            /// Returns the raw reference value.
            #[inline(always)]
            #[must_use]
            pub const fn raw(self) -> u64 {
                self.0.get()
            }

            #[inline(always)]
            pub(crate) fn from_key(k: Key) -> Self {
                Self(k.pack())
            }

            #[inline(always)]
            pub(crate) fn key(self) -> Key {
                Key::unpack(self.0.get()).unwrap_or_default()
            }
        }

        impl Debug for $t {
            #[allow(clippy::use_self)]
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({:#018X})", name_of!($t), self.0.get())
            }
        }
    };
}

opaque_ref! {
    /// Opaque service reference.
    ServiceRef, |k| k.chr == 0 && k.desc == 0
}

opaque_ref! {
    /// Opaque characteristic reference.
    CharRef, |k| k.chr != 0 && k.desc == 0
}

opaque_ref! {
    /// Opaque descriptor reference.
    DescRef, |k| k.chr != 0 && k.desc != 0
}

impl CharRef {
    /// Returns the reference of the containing service.
    #[inline]
    #[must_use]
    pub fn service(self) -> ServiceRef {
        ServiceRef::from_key(self.key().service_key())
    }
}

impl DescRef {
    /// Returns the reference of the containing characteristic.
    #[inline]
    #[must_use]
    pub fn characteristic(self) -> CharRef {
        let k = self.key();
        CharRef::from_key(Key { desc: 0, ..k })
    }
}

/// Reference to a readable/writable attribute.
#[allow(clippy::exhaustive_enums)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AttRef {
    Char(CharRef),
    Desc(DescRef),
}

impl AttRef {
    /// Reconstructs a reference from its raw value.
    #[must_use]
    pub fn from_raw(v: u64) -> Option<Self> {
        (DescRef::from_raw(v).map(Self::Desc)).or_else(|| CharRef::from_raw(v).map(Self::Char))
    }

    /// Returns the raw reference value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        match self {
            Self::Char(r) => r.raw(),
            Self::Desc(r) => r.raw(),
        }
    }

    /// Returns the characteristic this attribute belongs to.
    #[inline]
    #[must_use]
    pub fn characteristic(self) -> CharRef {
        match self {
            Self::Char(r) => r,
            Self::Desc(r) => r.characteristic(),
        }
    }

    #[inline]
    pub(crate) fn key(self) -> Key {
        match self {
            Self::Char(r) => r.key(),
            Self::Desc(r) => r.key(),
        }
    }
}

impl From<CharRef> for AttRef {
    #[inline]
    fn from(r: CharRef) -> Self {
        Self::Char(r)
    }
}

impl From<DescRef> for AttRef {
    #[inline]
    fn from(r: DescRef) -> Self {
        Self::Desc(r)
    }
}
