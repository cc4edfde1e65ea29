//! Unified error type for rcu-link.
//!
//! Only the genuinely fallible surface returns `Error`; the non-fatal
//! classes (transport errors during discovery, malformed frames) are
//! logged and recovered from in place, and the audio decoder never
//! fails - it saturates instead.

use thiserror::Error;

/// Top-level error type used across the crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A device address string did not parse as `AA:BB:CC:DD:EE:FF`.
    #[error("invalid device address: {0}")]
    InvalidAddress(String),

    /// No BLE adapter is available on this host.
    #[error("no Bluetooth adapter available")]
    AdapterUnavailable,

    /// The audio decode worker could not be started.
    #[error("audio worker failed to start")]
    Worker(#[source] std::io::Error),

    /// The BLE stack returned an error.
    #[cfg(feature = "btleplug")]
    #[error("BLE stack error: {0}")]
    Ble(#[from] btleplug::Error),
}
