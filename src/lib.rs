//! BLE GATT client connection core.
//!
//! Tracks live LE connections, discovers remote attribute databases, issues
//! GATT operations for the kernel and application contexts, and multiplexes
//! notifications into per-context buffers. On top of that, [`ppogatt`]
//! provides a reliable, sequenced byte stream over a vendor GATT service.
//!
//! The radio below the core is abstracted by [`host::Driver`].

pub mod att;
pub mod config;
pub mod gatt;
pub mod host;
pub mod le;
pub mod ppogatt;
pub mod uuid;

mod util;
