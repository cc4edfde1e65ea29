//! Abstract attribute-server transport.
//!
//! The engine never talks to a BLE stack directly. A platform binding
//! implements [`Transport`] (outbound operations) and [`Timers`]
//! (cancellable delayed re-entry), and feeds [`TransportEvent`]s back
//! into the engine from the owner execution context.
//!
//! Attribute handles are opaque indices assigned by the transport at
//! discovery time; their lifetime is owned by the transport layer, not
//! the engine.

use core::fmt;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::error::Error;

/// Six-byte peripheral address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DeviceAddress(pub [u8; 6]);

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for DeviceAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for slot in &mut bytes {
            let part = parts
                .next()
                .ok_or_else(|| Error::InvalidAddress(s.to_string()))?;
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| Error::InvalidAddress(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(Error::InvalidAddress(s.to_string()));
        }
        Ok(DeviceAddress(bytes))
    }
}

/// Opaque characteristic instance handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharHandle(pub u16);

/// Opaque descriptor handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescHandle(pub u16);

/// Attribute-operation status as reported by the radio stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    Failure(u8),
}

impl GattStatus {
    pub fn is_success(self) -> bool {
        matches!(self, GattStatus::Success)
    }
}

/// Bond state of a peripheral.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

/// Descriptor entry in the discovered attribute inventory.
#[derive(Clone, Debug)]
pub struct DescriptorInfo {
    pub uuid: Uuid,
    pub handle: DescHandle,
}

/// Characteristic entry in the discovered attribute inventory.
#[derive(Clone, Debug)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub handle: CharHandle,
    pub descriptors: Vec<DescriptorInfo>,
}

impl CharacteristicInfo {
    /// Handle of the descriptor with the given UUID, if present.
    pub fn descriptor(&self, uuid: Uuid) -> Option<DescHandle> {
        self.descriptors
            .iter()
            .find(|d| d.uuid == uuid)
            .map(|d| d.handle)
    }
}

/// Service entry in the discovered attribute inventory.
#[derive(Clone, Debug)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

impl ServiceInfo {
    /// First characteristic with the given UUID, if present.
    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicInfo> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Events delivered by the transport into the engine.
///
/// All of these must be handed to the engine on its owner execution
/// context, in the order the stack produced them.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// The attribute-server link went up or down.
    ConnectionState {
        connected: bool,
        status: GattStatus,
    },
    /// Service discovery finished; `services` is the full inventory.
    ServicesDiscovered {
        status: GattStatus,
        services: Vec<ServiceInfo>,
    },
    /// A characteristic notification arrived.
    Notification {
        characteristic: CharHandle,
        value: Vec<u8>,
    },
    /// Result of a queued characteristic read.
    CharacteristicRead {
        characteristic: CharHandle,
        uuid: Uuid,
        value: Vec<u8>,
        status: GattStatus,
    },
    /// Result of a queued descriptor read.
    DescriptorRead {
        characteristic: CharHandle,
        descriptor: DescHandle,
        value: Vec<u8>,
        status: GattStatus,
    },
    /// Result of a queued descriptor write.
    DescriptorWrite {
        descriptor: DescHandle,
        status: GattStatus,
    },
    /// Result of a characteristic write (control commands).
    WriteCompleted { status: GattStatus },
    /// Pairing state of a peripheral changed.
    BondState {
        address: DeviceAddress,
        state: BondState,
    },
    /// Bare-link (ACL) connection to the peripheral came up.
    AclConnected { address: DeviceAddress },
    /// Bare-link (ACL) connection to the peripheral dropped.
    AclDisconnected { address: DeviceAddress },
    /// The radio adapter was powered on or off.
    AdapterState { powered: bool },
    /// The platform's system input profile claimed or released a device.
    SystemProfileState {
        address: DeviceAddress,
        connected: bool,
    },
    /// An advertisement was seen while scanning.
    ScanResult {
        address: DeviceAddress,
        rssi: i16,
        name: Option<String>,
    },
}

/// Outbound operations on the attribute server.
///
/// All calls are asynchronous: they request the operation and return
/// immediately; completion arrives later as a [`TransportEvent`]. The
/// engine guarantees at most one discovery-phase operation is in flight
/// at a time, and at most one control write.
pub trait Transport {
    /// Request a new connection to `address`.
    fn connect(&mut self, address: DeviceAddress);

    /// Try to resume the existing transport handle. Returns false if no
    /// resumable handle exists (the engine then requests a fresh
    /// connection).
    fn resume(&mut self) -> bool {
        false
    }

    /// Gracefully disconnect the current link.
    fn disconnect(&mut self);

    /// Release the transport handle entirely.
    fn close(&mut self);

    fn discover_services(&mut self);

    fn read_characteristic(&mut self, characteristic: CharHandle);

    fn write_characteristic(&mut self, characteristic: CharHandle, value: &[u8]);

    fn read_descriptor(&mut self, characteristic: CharHandle, descriptor: DescHandle);

    fn write_descriptor(&mut self, descriptor: DescHandle, value: &[u8]);

    /// Enable or disable local delivery of notifications for a
    /// characteristic.
    fn set_notifications(&mut self, characteristic: CharHandle, enable: bool);

    fn is_bonded(&self, address: &DeviceAddress) -> bool;

    /// Start pairing. Returns false if the stack rejected the request.
    fn create_bond(&mut self, address: &DeviceAddress) -> bool;

    /// Whether the current link is encrypted. `None` when the stack
    /// cannot report link security.
    fn is_encrypted(&self) -> Option<bool>;

    fn start_scan(&mut self);

    fn stop_scan(&mut self);

    /// Whether the platform exposes a legacy system input profile.
    fn has_system_input_profile(&self) -> bool {
        false
    }

    /// Ask the system input profile to claim `address`. Returns false
    /// when the profile is unavailable, already connected, or the
    /// request failed; the engine then initializes directly.
    fn connect_system_input_profile(&mut self, address: &DeviceAddress) -> bool {
        let _ = address;
        false
    }
}

/// Delayed re-entry points of the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Retry the initialization pump (encryption wait).
    InitRetry,
    /// Attempt to reconnect after an unexpected link loss.
    Reconnect,
    /// Resume discovery after the system input profile settled.
    ProfileSettle,
}

/// Cancellable delayed tasks. Scheduling a kind replaces any pending
/// task of the same kind; firing re-enters the engine through
/// `handle_timer`.
pub trait Timers {
    fn schedule(&mut self, kind: TimerKind, delay: Duration);
    fn cancel(&mut self, kind: TimerKind);
}

/// Everything the link layer needs from a platform binding.
pub trait LinkHost: Transport + Timers {}

impl<T: Transport + Timers> LinkHost for T {}
