//! Interfaces to the collaborators that sit below and beside the GATT core:
//! the radio driver and the persisted bond database.

use std::fmt::{Debug, Display, Formatter};
use std::num::NonZeroU32;

use crate::att::{Handle, HandleRange};
use crate::le::{Addr, ConnHandle, Irk};
use crate::util::name_of;

/// Error type returned synchronously by the radio driver.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("driver is out of transmit resources")]
    OutOfResources,
    #[error("link is not connected")]
    NotConnected,
    #[error("driver rejected the request ({0:#06X})")]
    Rejected(u16),
}

/// Common driver result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Correlation cookie attached to a GATT request and echoed back by the driver
/// in the matching completion callback.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct OpId(NonZeroU32);

impl OpId {
    /// Wraps a raw cookie.
    #[inline]
    #[must_use]
    pub const fn new(v: u32) -> Option<Self> {
        match NonZeroU32::new(v) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Returns the cookie following this one, skipping zero.
    #[inline]
    #[must_use]
    pub(crate) fn next(self) -> Self {
        Self::new(self.0.get().wrapping_add(1).max(1)).unwrap_or(self)
    }
}

impl From<OpId> for u32 {
    #[inline(always)]
    fn from(id: OpId) -> Self {
        id.0.get()
    }
}

impl Debug for OpId {
    #[allow(clippy::use_self)]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", name_of!(OpId), self.0)
    }
}

impl Display for OpId {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Radio driver operations used by the core. Every method is a request; the
/// outcome of asynchronous requests is reported back through the matching
/// `Client::on_*` callback.
///
/// Implementations must not call back into the `Client` from within these
/// methods.
pub trait Driver: Debug + Send + Sync {
    /// Starts attribute discovery of `range` on the link. Discovered services
    /// are reported with `Client::on_service_discovered`, followed by
    /// `Client::on_discovery_complete`.
    fn discover(&self, link: ConnHandle, range: HandleRange) -> Result<()>;

    /// Aborts the discovery in progress on the link, if any. No completion is
    /// reported for an aborted discovery.
    fn stop_discovery(&self, link: ConnHandle);

    /// Reads an attribute value.
    fn read(&self, link: ConnHandle, hdl: Handle, op: OpId) -> Result<()>;

    /// Writes an attribute value with response.
    fn write(&self, link: ConnHandle, hdl: Handle, val: &[u8], op: OpId) -> Result<()>;

    /// Writes an attribute value without response. Returns
    /// [`Error::OutOfResources`] when the transmit queue is full; the driver
    /// calls `Client::on_tx_available` once space frees up.
    fn write_without_response(&self, link: ConnHandle, hdl: Handle, val: &[u8]) -> Result<()>;

    /// Forcibly disconnects the link.
    fn disconnect(&self, link: ConnHandle);

    /// Starts connection parameter negotiation.
    fn update_conn_params(&self, link: ConnHandle, p: ConnParams) -> Result<()>;
}

/// Bonding database identifier.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct BondId(pub u16);

/// Persisted bonding metadata owned outside the core.
pub trait BondStore: Debug + Send + Sync {
    /// Returns whether the bonded device is the gateway (paired phone).
    fn is_gateway(&self, bond: BondId) -> bool;

    /// Records whether the bonded device is the gateway.
    fn set_gateway(&self, bond: BondId, gateway: bool);
}

/// Connection-established event parameters.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectEvent {
    pub peer: Addr,
    pub link: ConnHandle,
    pub is_master: bool,
    pub encrypted: bool,
    pub irk: Option<Irk>,
    pub bond: Option<BondId>,
}

impl ConnectEvent {
    /// Creates an event for an unencrypted, unbonded link.
    #[inline]
    #[must_use]
    pub const fn new(peer: Addr, link: ConnHandle, is_master: bool) -> Self {
        Self {
            peer,
            link,
            is_master,
            encrypted: false,
            irk: None,
            bond: None,
        }
    }

    /// Sets the resolved identity key.
    #[inline]
    #[must_use]
    pub const fn with_irk(mut self, irk: Irk) -> Self {
        self.irk = Some(irk);
        self
    }

    /// Sets the bonding identifier.
    #[inline]
    #[must_use]
    pub const fn with_bond(mut self, bond: BondId) -> Self {
        self.bond = Some(bond);
        self
    }

    /// Marks the link as encrypted.
    #[inline]
    #[must_use]
    pub const fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }
}

/// Remote controller version information
/// ([Vol 4] Part E, Section 7.7.12).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VersionInfo {
    pub version: u8,
    pub company: u16,
    pub subversion: u16,
}

/// LE connection parameters ([Vol 4] Part E, Section 7.8.18).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConnParams {
    /// Minimum connection interval in 1.25 ms units.
    pub interval_min: u16,
    /// Maximum connection interval in 1.25 ms units.
    pub interval_max: u16,
    /// Peripheral latency in connection events.
    pub latency: u16,
    /// Supervision timeout in 10 ms units.
    pub timeout: u16,
}
