use structbuf::{Pack, StructBuf, Unpack};

use super::{Error, Result, Seq};

/// Packet header size.
pub(crate) const HDR_LEN: usize = 1;
/// Serial number length in a reset request.
pub const SERIAL_LEN: usize = 12;

/// PPoGATT packet type (low 3 bits of the header byte).
#[derive(
    Clone, Copy, Debug, Eq, Hash, PartialEq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Ack = 1,
    ResetRequest = 2,
    ResetComplete = 3,
}

crate::util::impl_display_via_debug! { PacketType }

/// PPoGATT packet: `type:3 seq:5` header byte followed by the payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Packet<'a> {
    pub typ: PacketType,
    pub seq: Seq,
    pub payload: &'a [u8],
}

impl<'a> Packet<'a> {
    /// Creates a packet.
    #[inline]
    #[must_use]
    pub const fn new(typ: PacketType, seq: Seq, payload: &'a [u8]) -> Self {
        Self { typ, seq, payload }
    }

    /// Parses a received packet.
    pub fn parse(b: &'a [u8]) -> Result<Self> {
        let mut p = b.unpack();
        let hdr = p.u8();
        if !p.is_ok() {
            return Err(Error::MalformedPacket);
        }
        let typ = PacketType::try_from(hdr & 0x07).map_err(|_| Error::UnknownType(hdr & 0x07))?;
        Ok(Self {
            typ,
            seq: Seq::new(hdr >> 3),
            payload: &b[HDR_LEN..],
        })
    }

    /// Returns the header byte.
    #[inline]
    #[must_use]
    pub fn header(&self) -> u8 {
        self.seq.get() << 3 | u8::from(self.typ)
    }

    /// Encodes the packet.
    #[must_use]
    pub fn encode(&self) -> StructBuf {
        let mut b = StructBuf::new(HDR_LEN + self.payload.len());
        b.append().u8(self.header()).put(self.payload);
        b
    }
}

/// Reset request payload: `version:u8 serial:[u8; 12]`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResetRequest {
    pub version: u8,
    pub serial: [u8; SERIAL_LEN],
}

impl ResetRequest {
    /// Creates a request, padding or truncating the serial number to 12
    /// bytes.
    #[must_use]
    pub fn new(version: u8, serial: &str) -> Self {
        let mut s = [b'0'; SERIAL_LEN];
        (s.iter_mut().zip(serial.bytes())).for_each(|(d, c)| *d = c);
        Self { version, serial: s }
    }

    /// Parses a request payload.
    pub fn parse(b: &[u8]) -> Result<Self> {
        let (&version, serial) = b.split_first().ok_or(Error::MalformedPacket)?;
        let serial = (serial.get(..SERIAL_LEN))
            .and_then(|s| s.try_into().ok())
            .ok_or(Error::MalformedPacket)?;
        Ok(Self { version, serial })
    }

    /// Returns the encoded payload.
    #[must_use]
    pub fn encode(&self) -> StructBuf {
        let mut b = StructBuf::new(1 + SERIAL_LEN);
        b.append().u8(self.version).put(self.serial);
        b
    }
}

/// Reset complete payload of protocol version 1: the sender's maximum
/// receive and transmit windows.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResetComplete {
    pub rx_window: u8,
    pub tx_window: u8,
}

impl ResetComplete {
    /// Parses a version 1 payload.
    pub fn parse(b: &[u8]) -> Result<Self> {
        let mut p = b.unpack();
        let (rx_window, tx_window) = (p.u8(), p.u8());
        if !p.is_ok() || rx_window == 0 || tx_window == 0 {
            return Err(Error::MalformedPacket);
        }
        Ok(Self {
            rx_window,
            tx_window,
        })
    }

    /// Returns the encoded payload.
    #[must_use]
    pub fn encode(&self) -> StructBuf {
        let mut b = StructBuf::new(2);
        b.append().u8(self.rx_window).u8(self.tx_window);
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header() {
        let p = Packet::new(PacketType::ResetComplete, Seq::new(5), &[1, 2]);
        let b = p.encode();
        assert_eq!(b.as_ref(), &[5 << 3 | 3, 1, 2]);
        assert_eq!(Packet::parse(b.as_ref()).unwrap(), p);

        let a = Packet::parse(&[31 << 3 | 1]).unwrap();
        assert_eq!((a.typ, a.seq, a.payload), (PacketType::Ack, Seq::new(31), &[][..]));
        assert_eq!(Packet::parse(&[]), Err(Error::MalformedPacket));
        assert_eq!(Packet::parse(&[0x07]), Err(Error::UnknownType(7)));
    }

    #[test]
    fn reset_payloads() {
        let r = ResetRequest::new(1, "Q402445E00AA");
        let b = r.encode();
        assert_eq!(b.len(), 13);
        assert_eq!(&b[1..], b"Q402445E00AA");
        assert_eq!(ResetRequest::parse(b.as_ref()), Ok(r));
        assert_eq!(ResetRequest::new(0, "12").serial, *b"120000000000");
        assert_eq!(ResetRequest::parse(&[1, 2]), Err(Error::MalformedPacket));

        let c = ResetComplete {
            rx_window: 25,
            tx_window: 12,
        };
        assert_eq!(ResetComplete::parse(c.encode().as_ref()), Ok(c));
        assert_eq!(ResetComplete::parse(&[4]), Err(Error::MalformedPacket));
        assert_eq!(ResetComplete::parse(&[0, 4]), Err(Error::MalformedPacket));
    }
}
