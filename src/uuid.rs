//! Bluetooth UUIDs and the assigned numbers used by this crate.

use std::fmt::{Debug, Display, Formatter};
use std::num::{NonZeroU128, NonZeroU16};

const SHIFT: u32 = u128::BITS - u32::BITS;
const BASE: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;
const MASK_16: u128 = !((u16::MAX as u128) << SHIFT);

/// 16- or 128-bit UUID ([Vol 3] Part B, Section 2.5.1).
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Uuid(NonZeroU128);

impl Uuid {
    /// UUID size in bytes.
    pub const BYTES: usize = std::mem::size_of::<Self>();

    /// Creates a UUID from a `u128`.
    #[inline]
    #[must_use]
    pub const fn new(v: u128) -> Option<Self> {
        match NonZeroU128::new(v) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Creates a UUID from its big-endian (textual order) byte representation.
    #[inline]
    #[must_use]
    pub const fn from_be_bytes(b: [u8; Self::BYTES]) -> Option<Self> {
        Self::new(u128::from_be_bytes(b))
    }

    /// Creates a UUID from the little-endian byte order used on the air.
    #[inline]
    #[must_use]
    pub const fn from_le_bytes(b: [u8; Self::BYTES]) -> Option<Self> {
        Self::new(u128::from_le_bytes(b))
    }

    /// Converts an assigned 16-bit Bluetooth SIG UUID to `u16`.
    #[inline]
    #[must_use]
    pub fn as_u16(self) -> Option<u16> {
        #[allow(clippy::cast_possible_truncation)]
        let v = (self.0.get() >> SHIFT) as u16;
        (self.0.get() & MASK_16 == BASE && v > 0).then_some(v)
    }

    /// Returns the UUID as a big-endian byte array.
    #[inline]
    #[must_use]
    pub const fn to_be_bytes(self) -> [u8; Self::BYTES] {
        self.0.get().to_be_bytes()
    }
}

impl From<Uuid16> for Uuid {
    #[inline]
    fn from(u: Uuid16) -> Self {
        u.as_uuid()
    }
}

impl From<Uuid> for u128 {
    #[inline]
    fn from(u: Uuid) -> Self {
        u.0.get()
    }
}

impl Debug for Uuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        #[allow(clippy::cast_possible_truncation)]
        if let Some(v) = self.as_u16() {
            write!(f, "{v:#06X}")
        } else {
            let v = self.0.get();
            write!(
                f,
                "{:08X}-{:04X}-{:04X}-{:04X}-{:012X}",
                (v >> 96) as u32,
                (v >> 80) as u16,
                (v >> 64) as u16,
                (v >> 48) as u16,
                (v & ((1 << 48) - 1)) as u64
            )
        }
    }
}

impl Display for Uuid {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// 16-bit Bluetooth SIG UUID.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Uuid16(NonZeroU16);

impl Uuid16 {
    /// Creates a 16-bit SIG UUID from a `u16`.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Option<Self> {
        match NonZeroU16::new(v) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Creates a 16-bit SIG UUID from a non-zero constant.
    ///
    /// # Panics
    ///
    /// Panics if `v` is zero.
    #[inline]
    #[must_use]
    pub(crate) const fn sig(v: u16) -> Self {
        match Self::new(v) {
            Some(u) => u,
            None => panic!("zero UUID"),
        }
    }

    /// Returns 128-bit UUID representation.
    #[inline]
    #[must_use]
    pub const fn as_uuid(self) -> Uuid {
        match Uuid::new((self.0.get() as u128) << SHIFT | BASE) {
            Some(u) => u,
            None => unreachable!(),
        }
    }

    /// Returns the raw 16-bit UUID value.
    #[inline(always)]
    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0.get()
    }
}

impl Debug for Uuid16 {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06X}", self.0.get())
    }
}

impl PartialEq<Uuid16> for Uuid {
    #[inline]
    fn eq(&self, other: &Uuid16) -> bool {
        *self == other.as_uuid()
    }
}

/// Generic Attribute service ([Assigned Numbers] Section 3.4.2).
pub const GENERIC_ATTRIBUTE_SERVICE: Uuid16 = Uuid16::sig(0x1801);
/// Service Changed characteristic ([Vol 3] Part G, Section 7.1).
pub const SERVICE_CHANGED: Uuid16 = Uuid16::sig(0x2A05);
/// Client Characteristic Configuration descriptor ([Vol 3] Part G,
/// Section 3.3.3.3).
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid16 = Uuid16::sig(0x2902);

/// PPoGATT service.
pub const PPOGATT_SERVICE: Uuid = ppogatt_uuid(0x1000_0000);
/// PPoGATT data characteristic (write without response + notify).
pub const PPOGATT_DATA: Uuid = ppogatt_uuid(0x1000_0001);
/// PPoGATT metadata characteristic (read).
pub const PPOGATT_META: Uuid = ppogatt_uuid(0x1000_0002);

/// Returns a UUID in the PPoGATT vendor base.
const fn ppogatt_uuid(hi: u32) -> Uuid {
    const PPOGATT_BASE: u128 = 0x00000000_328E_0FBB_C642_1AA6699BDADA;
    match Uuid::new((hi as u128) << SHIFT | PPOGATT_BASE) {
        Some(u) => u,
        None => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sig_uuid() {
        let u = CLIENT_CHARACTERISTIC_CONFIGURATION.as_uuid();
        assert_eq!(u.as_u16(), Some(0x2902));
        assert_eq!(u, CLIENT_CHARACTERISTIC_CONFIGURATION);
        assert_eq!(format!("{u}"), "0x2902");
        assert_eq!(PPOGATT_SERVICE.as_u16(), None);
    }

    #[test]
    fn ppogatt_uuids() {
        assert_eq!(
            PPOGATT_DATA.to_string(),
            "10000001-328E-0FBB-C642-1AA6699BDADA"
        );
        let b = PPOGATT_META.to_be_bytes();
        assert_eq!(b[..4], [0x10, 0x00, 0x00, 0x02]);
        assert_eq!(Uuid::from_be_bytes(b), Some(PPOGATT_META));
        assert_eq!(Uuid::from_be_bytes([0; 16]), None);
    }
}
