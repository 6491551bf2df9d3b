use bitflags::bitflags;

bitflags! {
    /// Characteristic properties ([Vol 3] Part G, Section 3.3.1.1).
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    #[repr(transparent)]
    pub struct CharProps: u8 {
        /// Permits broadcasts of the Characteristic Value using Server
        /// Characteristic Configuration Descriptor.
        const BROADCAST = 0x01;
        /// Permits reads of the Characteristic Value.
        const READ = 0x02;
        /// Permit writes of the Characteristic Value without response.
        const WRITE_WITHOUT_RESPONSE = 0x04;
        /// Permits writes of the Characteristic Value with response.
        const WRITE = 0x08;
        /// Permits notifications of a Characteristic Value without
        /// acknowledgment.
        const NOTIFY = 0x10;
        /// Permits indications of a Characteristic Value with acknowledgment.
        const INDICATE = 0x20;
        /// Permits signed writes to the Characteristic Value.
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        /// Additional characteristic properties are defined in the
        /// Characteristic Extended Properties Descriptor.
        const EXTENDED_PROPERTIES = 0x80;
    }
}

bitflags! {
    /// Client Characteristic Configuration descriptor value
    /// ([Vol 3] Part G, Section 3.3.3.3).
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    #[repr(transparent)]
    pub struct Cccd: u16 {
        /// The Characteristic Value shall be notified.
        const NOTIFY = 1 << 0;
        /// The Characteristic Value shall be indicated.
        const INDICATE = 1 << 1;
    }
}

/// Subscription type requested by a calling context.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    Hash,
    PartialEq,
    num_enum::IntoPrimitive,
    num_enum::TryFromPrimitive,
)]
#[repr(u8)]
pub enum SubType {
    #[default]
    None = 0,
    Notifications = 1,
    Indications = 2,
}

impl SubType {
    /// Returns the type that must be written to the remote CCCD so that every
    /// interested context is served. Notifications dominate indications.
    #[must_use]
    pub fn prevailing(types: impl IntoIterator<Item = Self>) -> Self {
        let all = (types.into_iter()).fold(Cccd::empty(), |acc, t| acc | t.cccd());
        if all.contains(Cccd::NOTIFY) {
            Self::Notifications
        } else if all.contains(Cccd::INDICATE) {
            Self::Indications
        } else {
            Self::None
        }
    }

    /// Returns the CCCD value for this type.
    #[inline]
    #[must_use]
    pub const fn cccd(self) -> Cccd {
        match self {
            Self::None => Cccd::empty(),
            Self::Notifications => Cccd::NOTIFY,
            Self::Indications => Cccd::INDICATE,
        }
    }

    /// Returns whether this is a real subscription.
    #[inline(always)]
    #[must_use]
    pub const fn is_some(self) -> bool {
        !matches!(self, Self::None)
    }

    /// Returns the characteristic property required by this type.
    #[inline]
    #[must_use]
    pub const fn required_prop(self) -> CharProps {
        match self {
            Self::None => CharProps::empty(),
            Self::Notifications => CharProps::NOTIFY,
            Self::Indications => CharProps::INDICATE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prevailing() {
        use SubType::*;
        assert_eq!(SubType::prevailing([]), None);
        assert_eq!(SubType::prevailing([None, None]), None);
        assert_eq!(SubType::prevailing([Indications, None]), Indications);
        assert_eq!(SubType::prevailing([Indications, Notifications]), Notifications);
        assert_eq!(SubType::prevailing([Notifications, None]), Notifications);
        assert_eq!(Indications.cccd().bits(), 2);
        assert_eq!(SubType::try_from(1).unwrap(), Notifications);
    }
}
