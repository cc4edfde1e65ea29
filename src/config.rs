//! Protocol constants and runtime options.
//!
//! All attribute UUIDs, report ids, wire-format offsets, and timing
//! parameters live here so they can be tuned in one place.

use std::time::Duration;
use uuid::Uuid;

// HID (Human Interface Device) profile

/// HID Service.
pub const HID_SERVICE: Uuid = Uuid::from_u128(0x00001812_0000_1000_8000_00805f9b34fb);
/// HID Report characteristic.
pub const HID_REPORT_CHAR: Uuid = Uuid::from_u128(0x00002a4d_0000_1000_8000_00805f9b34fb);
/// HID Report Reference descriptor (report id + report type).
pub const HID_REPORT_REFERENCE: Uuid = Uuid::from_u128(0x00002908_0000_1000_8000_00805f9b34fb);

pub const HID_REPORT_TYPE_INPUT: u8 = 1;
pub const HID_REPORT_TYPE_OUTPUT: u8 = 2;

// Device information service

pub const DEVICE_INFO_SERVICE: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);
pub const DEVICE_INFO_FIRMWARE_REVISION: Uuid =
    Uuid::from_u128(0x00002a28_0000_1000_8000_00805f9b34fb);
pub const DEVICE_INFO_PNP_ID: Uuid = Uuid::from_u128(0x00002a50_0000_1000_8000_00805f9b34fb);

// Client Characteristic Configuration descriptor

pub const CLIENT_CONFIG_DESCRIPTOR: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCC value enabling remote notifications.
pub const CCC_NOTIFICATIONS_ENABLE: [u8; 2] = [0x01, 0x00];

// Vendor stream profile (alternative to HID reports on newer peripherals)

pub const VENDOR_SERVICE: Uuid = Uuid::from_u128(0xbc1d108b_5094_4c03_b6b0_3d912d9903d8);
pub const VENDOR_STREAM_CONFIG: Uuid = Uuid::from_u128(0xfdf9289f_9c21_4dd7_bfc6_0e3d87ac9546);
pub const VENDOR_STREAM_CONTROL: Uuid = Uuid::from_u128(0x0c0541ae_efe8_4771_b2c2_dc0b0f6fbc6a);
pub const VENDOR_STREAM_DATA: Uuid = Uuid::from_u128(0x8d2c0991_0d20_4ce4_8e87_613224073dd1);

// Predefined HID report ids used by the remote

/// Stream control output report (host -> remote commands).
pub const REPORT_ID_CONTROL_OUT: u8 = 4;
/// Stream control input report (remote -> host control frames).
pub const REPORT_ID_CONTROL_IN: u8 = 5;
/// Fixed trio of audio data reports, cycled in sequence while streaming.
pub const REPORT_ID_AUDIO_FIRST: u8 = 6;
pub const REPORT_ID_AUDIO_LAST: u8 = 8;

// Audio in-band control

/// Reserved escape byte introducing an in-band command (self-escaping).
pub const AUDIO_CONTROL_ESCAPE: u8 = 0x7f;
pub const AUDIO_CONTROL_OP_MASK: u8 = 0xf0;
pub const AUDIO_CONTROL_OP_SHIFT: u8 = 4;
pub const AUDIO_CONTROL_OP_DATA_MASK: u8 = 0x0f;
/// In-band command: reset decoder state.
pub const AUDIO_CONTROL_OP_RESET: u8 = 0;
/// In-band command: set decode mode (mode in the data nibble).
pub const AUDIO_CONTROL_OP_SETMODE: u8 = 1;

// Decoder modes

/// IMA 4 bits/sample, 16 kHz.
pub const AUDIO_MODE_64KBPS: u8 = 0;
/// IMA 3 bits/sample, 16 kHz.
pub const AUDIO_MODE_48KBPS: u8 = 1;
/// IMA 4 bits/sample, 8 kHz (upsampled 2x on output).
pub const AUDIO_MODE_32KBPS: u8 = 2;
/// IMA 3 bits/sample, 8 kHz (upsampled 2x on output).
pub const AUDIO_MODE_24KBPS: u8 = 3;
/// Mode selection left to the peripheral's in-band commands.
pub const AUDIO_MODE_AUTOMATIC: u8 = 4;

// Config frame feature bits

/// Audio bytes carry in-band escape commands.
pub const FEATURE_INBAND_CONTROL: u8 = 0x01;
/// Peripheral accepts the legacy encode-mode write.
pub const FEATURE_SET_MODE: u8 = 0x02;
/// Packets are not sample-aligned (decoder keeps partial bit carry).
pub const FEATURE_NOT_PACKET_BASED: u8 = 0x04;
/// Peripheral understands the flagged outbound command set.
pub const FEATURE_COMMAND_SUPPORT: u8 = 0x08;

// Timing

/// Delay before a reconnect attempt after an unexpected link loss.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(3000);

/// Settle time after the system input profile claims the device, before
/// service discovery is retried. Discovering earlier interferes with the
/// platform connector.
pub const PROFILE_SETTLE_DELAY: Duration = Duration::from_millis(1000);

/// Grace period assumed sufficient for encryption when the transport
/// cannot report link security.
pub const ENCRYPTION_GRACE: Duration = Duration::from_millis(1000);

/// Poll interval while waiting for the link to encrypt.
pub const ENCRYPTION_POLL: Duration = Duration::from_millis(200);

/// Maximum number of encryption polls before initialization proceeds on
/// the assumption of an encrypted link.
pub const ENCRYPTION_POLL_LIMIT: u32 = 25;

/// Minimum window between bitrate samples.
pub const BITRATE_WINDOW: Duration = Duration::from_millis(500);

/// Runtime behaviour toggles.
#[derive(Clone, Copy, Debug)]
pub struct LinkOptions {
    /// Bond with an unpaired device before connecting.
    pub auto_pair: bool,
    /// Hand the device to the platform's system input profile before
    /// initializing, when that profile is available.
    pub auto_system_profile: bool,
    /// Write the client configuration descriptor of input reports.
    /// Most transports enable remote notifications themselves, so this
    /// is off by default.
    pub write_report_ccc: bool,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            auto_pair: true,
            auto_system_profile: true,
            write_report_ccc: false,
        }
    }
}
