//! Runtime tunables.
//!
//! Defaults match the values the transport was tuned with. All fields can be
//! overridden by deserializing a partial document; missing fields keep their
//! defaults.

use std::time::Duration;

use serde::Deserialize;

/// Core configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
#[non_exhaustive]
pub struct Config {
    /// Time allowed for one discovery job before it is retried.
    pub discovery_timeout_ms: u64,
    /// Consecutive retries of a single discovery job before giving up.
    pub discovery_max_retries: u8,
    /// Disconnect the link after a terminal discovery failure.
    pub disconnect_on_discovery_failure: bool,
    /// Kernel context notification buffer size in bytes.
    pub kernel_ntf_buffer: usize,
    /// Application context notification buffer size in bytes.
    pub app_ntf_buffer: usize,
    /// Maximum time a notification writer waits for buffer space.
    pub ntf_block_ms: u64,
    /// Period of the background tick that drives timeouts.
    pub tick_ms: u64,
    /// PPoGATT transport parameters.
    pub ppogatt: PPoGattConfig,
}

impl Config {
    /// Returns the discovery job timeout.
    #[inline]
    #[must_use]
    pub const fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    /// Returns the notification back-pressure timeout.
    #[inline]
    #[must_use]
    pub const fn ntf_block(&self) -> Duration {
        Duration::from_millis(self.ntf_block_ms)
    }

    /// Returns the background tick period.
    #[inline]
    #[must_use]
    pub const fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Parses a JSON configuration document.
    #[cfg(feature = "json")]
    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Loads a JSON configuration file.
    #[cfg(feature = "json")]
    pub fn load(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        let f = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(f))?)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_timeout_ms: 5_000,
            discovery_max_retries: 3,
            disconnect_on_discovery_failure: true,
            kernel_ntf_buffer: 1024,
            app_ntf_buffer: 1024,
            ntf_block_ms: 300,
            tick_ms: 50,
            ppogatt: PPoGattConfig::default(),
        }
    }
}

/// PPoGATT transport parameters.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
#[non_exhaustive]
pub struct PPoGattConfig {
    /// Time without an ack before outstanding data is rolled back.
    pub ack_timeout_ms: u64,
    /// Consecutive ack timeouts tolerated before resetting instead.
    pub max_ack_timeouts: u8,
    /// Consecutive resets tolerated before the link is disconnected.
    pub max_resets: u8,
    /// Forced disconnects allowed before auto-recovery stops entirely.
    pub max_disconnects: u32,
    /// Forced disconnects that are logged before going quiet.
    pub disconnect_log_limit: u32,
    /// Maximum delay of a coalesced ack (enhanced throughput peers).
    pub ack_latency_ms: u64,
    /// An ack is sent once `rx_window / ack_divisor` packets are unacked.
    pub ack_divisor: u8,
    /// Desired window when the link payload is small.
    pub small_mtu_window: u8,
    /// Desired window otherwise.
    pub window: u8,
    /// Largest ATT MTU considered small.
    pub small_mtu: u16,
    /// Packets built per dispatch pass.
    pub max_packets_per_pass: u8,
    /// Bytes the session layer may queue for transmission.
    pub tx_queue_capacity: usize,
    /// Device serial number sent during the reset handshake.
    pub serial_number: String,
}

impl PPoGattConfig {
    /// Returns the ack timeout.
    #[inline]
    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Returns the ack coalescing latency.
    #[inline]
    #[must_use]
    pub const fn ack_latency(&self) -> Duration {
        Duration::from_millis(self.ack_latency_ms)
    }
}

impl Default for PPoGattConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 5_000,
            max_ack_timeouts: 2,
            max_resets: 3,
            max_disconnects: 5,
            disconnect_log_limit: 3,
            ack_latency_ms: 200,
            ack_divisor: 2,
            small_mtu_window: 25,
            window: 12,
            small_mtu: 23,
            max_packets_per_pass: 10,
            tx_queue_capacity: 8 * 1024,
            serial_number: "000000000000".to_owned(),
        }
    }
}
