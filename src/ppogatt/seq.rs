use std::fmt::{Debug, Display, Formatter};

/// PPoGATT sequence number (modulo 32).
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct Seq(u8);

impl Seq {
    /// Number of distinct sequence numbers.
    pub const MODULUS: u8 = 32;

    /// Creates a sequence number, reducing `v` modulo 32.
    #[inline(always)]
    #[must_use]
    pub const fn new(v: u8) -> Self {
        Self(v % Self::MODULUS)
    }

    /// Returns the raw value.
    #[inline(always)]
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Returns the following sequence number.
    #[inline(always)]
    #[must_use]
    pub const fn next(self) -> Self {
        Self::new(self.0 + 1)
    }

    /// Returns the preceding sequence number.
    #[inline(always)]
    #[must_use]
    pub const fn prev(self) -> Self {
        Self::new(self.0 + Self::MODULUS - 1)
    }

    /// Returns the number of steps from `base` to `self`.
    #[inline(always)]
    #[must_use]
    pub const fn since(self, base: Self) -> u8 {
        self.0.wrapping_sub(base.0) % Self::MODULUS
    }
}

impl Debug for Seq {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl Display for Seq {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic() {
        for v in 0..Seq::MODULUS {
            let n = Seq::new(v);
            assert_eq!(n.prev().next(), n);
            assert_eq!(n.next().prev(), n);
            assert_eq!(n.next().since(n), 1);
            assert_eq!(n.since(n), 0);
        }
        assert_eq!(Seq::new(31).next(), Seq::new(0));
        assert_eq!(Seq::new(0).prev(), Seq::new(31));
        assert_eq!(Seq::new(2).since(Seq::new(30)), 4);
        assert_eq!(Seq::new(33), Seq::new(1));
    }
}
