//! LE link-level identity types.

use std::fmt::{Debug, Display, Formatter};
use std::num::NonZeroU16;

use crate::util::name_of;

/// Bluetooth device address ([Vol 6] Part B, Section 1.3).
#[allow(clippy::exhaustive_enums)]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Addr {
    Public(RawAddr),
    Random(RawAddr),
}

impl Addr {
    /// Constructs a peer address from type and raw components.
    #[inline]
    #[must_use]
    pub fn peer(typ: u8, raw: RawAddr) -> Option<Self> {
        // [Vol 4] Part E, Sections 7.7.65.1 and 7.7.65.10
        match typ {
            0x00 | 0x02 => Some(Self::Public(raw)),
            0x01 | 0x03 => Some(Self::Random(raw)),
            _ => None,
        }
    }

    /// Returns the raw 48-bit address.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> RawAddr {
        match self {
            Self::Public(addr) | Self::Random(addr) => addr,
        }
    }
}

impl Display for Addr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Public(ref a) => write!(f, "{a}"),
            Self::Random(ref a) => write!(f, "{a} (random)"),
        }
    }
}

/// 48-bit untyped device address stored in little-endian byte order.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct RawAddr([u8; 6]);

impl From<[u8; 6]> for RawAddr {
    #[inline]
    fn from(v: [u8; 6]) -> Self {
        Self(v)
    }
}

impl AsRef<[u8]> for RawAddr {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl Debug for RawAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // [Vol 3] Part C, Section 3.2.1.3
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[5], self.0[4], self.0[3], self.0[2], self.0[1], self.0[0]
        )
    }
}

impl Display for RawAddr {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Opaque low-level connection identifier assigned by the radio driver
/// ([Vol 4] Part E, Section 5.4.2).
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct ConnHandle(NonZeroU16);

impl ConnHandle {
    /// Number of meaningful bits.
    pub(crate) const BITS: u16 = 12;
    /// Maximum valid connection handle.
    const MAX: u16 = 0xEFF;

    /// Wraps a raw connection handle. Returns `None` if the handle is invalid.
    #[inline]
    #[must_use]
    pub fn new(mut v: u16) -> Option<Self> {
        v &= (1 << Self::BITS) - 1;
        if v > Self::MAX {
            return None;
        }
        // v can't be 0xFFFF, so !v is never 0
        NonZeroU16::new(!v).map(Self)
    }
}

impl From<ConnHandle> for u16 {
    #[inline]
    fn from(cn: ConnHandle) -> Self {
        !cn.0.get()
    }
}

impl Debug for ConnHandle {
    #[allow(clippy::use_self)]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:#05X})", name_of!(ConnHandle), u16::from(*self))
    }
}

impl Display for ConnHandle {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Identity Resolving Key distributed during bonding ([Vol 3] Part H,
/// Section 2.4.2.1).
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct Irk([u8; 16]);

impl Irk {
    /// Wraps raw key bytes.
    #[inline(always)]
    #[must_use]
    pub const fn new(k: [u8; 16]) -> Self {
        Self(k)
    }

    /// Returns the key bytes.
    #[inline(always)]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Debug for Irk {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // Key material is never logged
        f.write_str("Irk(..)")
    }
}

/// Local role in the connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Master,
    Slave,
}

impl Role {
    /// Returns the role for the driver's `is_master` flag.
    #[inline(always)]
    #[must_use]
    pub const fn from_master(is_master: bool) -> Self {
        if is_master {
            Self::Master
        } else {
            Self::Slave
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_handle() {
        let h = ConnHandle::new(0x0040).unwrap();
        assert_eq!(u16::from(h), 0x0040);
        assert_eq!(u16::from(ConnHandle::new(0).unwrap()), 0);
        assert!(ConnHandle::new(0x0F00).is_none());
        // Flag bits are ignored
        assert_eq!(ConnHandle::new(0x3001), ConnHandle::new(0x0001));
    }

    #[test]
    fn addr_fmt() {
        let a = Addr::Public(RawAddr::from([1, 2, 3, 4, 5, 6]));
        assert_eq!(a.to_string(), "06:05:04:03:02:01");
        assert_eq!(Addr::peer(0x01, a.raw()), Some(Addr::Random(a.raw())));
        assert_eq!(Addr::peer(0x07, a.raw()), None);
    }
}
