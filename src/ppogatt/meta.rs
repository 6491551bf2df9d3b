use std::ops::RangeInclusive;

use structbuf::Unpack;

use crate::uuid::Uuid;

use super::{Error, Result, SessionKind};

/// Protocol versions implemented locally.
pub const VERSIONS: RangeInclusive<u8> = 0..=1;

/// First version with coalesced acks and negotiated windows.
pub(crate) const ENHANCED_VERSION: u8 = 1;

/// Contents of the remote metadata characteristic:
/// `min_version:u8 max_version:u8 app_uuid:[u8; 16] [session_type:u8]`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Meta {
    pub min_version: u8,
    pub max_version: u8,
    pub kind: SessionKind,
    pub session_type: Option<u8>,
}

impl Meta {
    /// Parses and validates the metadata value.
    pub fn parse(b: &[u8]) -> Result<Self> {
        let mut p = b.unpack();
        let (min_version, max_version) = (p.u8(), p.u8());
        // UUID is stored in big-endian order
        let uuid = p.u128().swap_bytes();
        if !p.is_ok() || min_version > max_version {
            return Err(Error::MalformedMeta);
        }
        let session_type = b.get(2 + Uuid::BYTES).copied();
        let kind = match uuid {
            0 => SessionKind::System,
            u128::MAX => return Err(Error::InvalidApp),
            v => SessionKind::App(Uuid::new(v).ok_or(Error::InvalidApp)?),
        };
        Ok(Self {
            min_version,
            max_version,
            kind,
            session_type,
        })
    }

    /// Returns the highest version supported by both sides.
    pub fn negotiate(&self) -> Result<u8> {
        let v = self.max_version.min(*VERSIONS.end());
        if v < self.min_version || v < *VERSIONS.start() {
            return Err(Error::IncompatibleVersion {
                min: self.min_version,
                max: self.max_version,
            });
        }
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uuid::PPOGATT_DATA;

    fn meta(min: u8, max: u8, uuid: [u8; 16]) -> Vec<u8> {
        let mut v = vec![min, max];
        v.extend(uuid);
        v
    }

    #[test]
    fn parse() {
        let m = Meta::parse(&meta(0, 1, [0; 16])).unwrap();
        assert_eq!(m.kind, SessionKind::System);
        assert_eq!(m.session_type, None);
        assert_eq!(m.negotiate(), Ok(1));

        let mut b = meta(0, 5, PPOGATT_DATA.to_be_bytes());
        b.push(2);
        let m = Meta::parse(&b).unwrap();
        assert_eq!(m.kind, SessionKind::App(PPOGATT_DATA));
        assert_eq!(m.session_type, Some(2));
        assert_eq!(m.negotiate(), Ok(1));

        assert_eq!(Meta::parse(&meta(0, 0, [0; 16])).unwrap().negotiate(), Ok(0));
        assert_eq!(
            Meta::parse(&meta(2, 3, [0; 16])).unwrap().negotiate(),
            Err(Error::IncompatibleVersion { min: 2, max: 3 })
        );
        assert_eq!(Meta::parse(&meta(0, 1, [0xFF; 16])), Err(Error::InvalidApp));
        assert_eq!(Meta::parse(&meta(1, 0, [0; 16])), Err(Error::MalformedMeta));
        assert_eq!(Meta::parse(&[0, 1, 2]), Err(Error::MalformedMeta));
    }
}
