//! Control report wire format.
//!
//! Inbound control frames (remote -> host) share a fixed layout:
//! byte 0 is the stream-flag/report marker, byte 1 the frame type, and
//! the remaining bytes depend on the type. Multi-byte fields are
//! little-endian. Outbound commands (host -> remote) are written to the
//! control output report as `[0, opcode | 0x80, payload_len, payload...]`.
//!
//! Parsing is deliberately lenient: fields beyond the received length
//! default to zero, matching what peripherals with older firmware send.
//! Only a frame too short to carry its type byte is rejected.

// Inbound frame types
pub const TYPE_STREAM: u8 = 0;
pub const TYPE_CONFIG: u8 = 1;
pub const TYPE_KEY: u8 = 2;
pub const TYPE_STREAM_ERROR: u8 = 3;
pub const TYPE_AUDIO_MODE: u8 = 4;
pub const TYPE_CONN_PARAMS: u8 = 5;
pub const TYPE_MTU: u8 = 6;

// Inbound field offsets
const TYPE_OFFSET: usize = 1;
const STREAM_ENABLE_OFFSET: usize = 0;
const AUDIO_REPORT_OFFSET: usize = 3;
const FEATURES_OFFSET: usize = 4;
const AUDIO_MODE_OFFSET: usize = 5;
const KEY_LAYOUT_OFFSET: usize = 6;
const CONFIG_MTU_OFFSET: usize = 7;
const CONFIG_CONN_PARAMS_OFFSET: usize = 11;
const AUDIO_MODE_REPORT_OFFSET: usize = 2;
const CONN_PARAMS_REPORT_OFFSET: usize = 3;
const MTU_REPORT_OFFSET: usize = 3;

// Outbound command layout
const COMMAND_FLAG: u8 = 0x80;
const COMMAND_SET_MTU: u8 = 1;
const COMMAND_UPDATE_CONN_PARAMS: u8 = 2;
const COMMAND_READ_CONFIG: u8 = 3;

/// Negotiated packet-size/MTU pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketConfig {
    pub packet_size: u16,
    pub mtu: u16,
}

/// Connection parameter triple (interval in 1.25 ms units, latency in
/// skipped events, supervision timeout in 10 ms units).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnParams {
    pub interval: u16,
    pub latency: u16,
    pub timeout: u16,
}

/// A parsed inbound control frame. Transient: produced from a received
/// control characteristic value, never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlFrame {
    /// Streaming state announcement; carries the audio report id.
    Stream { enable: bool, audio_report_id: u8 },
    /// Configuration snapshot.
    Config {
        audio_report_id: u8,
        features: u8,
        audio_mode: u8,
        key_layout: u8,
        packet: Option<PacketConfig>,
        conn_params: Option<ConnParams>,
    },
    /// Key press report, relayed raw (full frame bytes).
    Key(Vec<u8>),
    /// Stream error report, relayed raw (full frame bytes).
    StreamError(Vec<u8>),
    /// Legacy set-audio-mode report.
    AudioMode(u8),
    /// Connection parameter update announcement.
    ConnParams(ConnParams),
    /// Packet-size/MTU update announcement.
    Mtu(PacketConfig),
    /// Unrecognized frame type.
    Unknown(u8),
}

fn read_u16(raw: &[u8], offset: usize) -> Option<u16> {
    raw.get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_conn_params(raw: &[u8], offset: usize) -> Option<ConnParams> {
    Some(ConnParams {
        interval: read_u16(raw, offset)?,
        latency: read_u16(raw, offset + 2)?,
        timeout: read_u16(raw, offset + 4)?,
    })
}

fn read_packet_config(raw: &[u8], offset: usize) -> Option<PacketConfig> {
    Some(PacketConfig {
        packet_size: read_u16(raw, offset)?,
        mtu: read_u16(raw, offset + 2)?,
    })
}

impl ControlFrame {
    /// Parse a received control report value. Returns `None` only for
    /// frames too short to carry a type byte.
    pub fn parse(raw: &[u8]) -> Option<ControlFrame> {
        let frame_type = *raw.get(TYPE_OFFSET)?;
        let byte_at = |offset: usize| raw.get(offset).copied().unwrap_or(0);

        Some(match frame_type {
            TYPE_STREAM => ControlFrame::Stream {
                enable: byte_at(STREAM_ENABLE_OFFSET) != 0,
                audio_report_id: byte_at(AUDIO_REPORT_OFFSET),
            },
            TYPE_CONFIG => ControlFrame::Config {
                audio_report_id: byte_at(AUDIO_REPORT_OFFSET),
                features: byte_at(FEATURES_OFFSET),
                audio_mode: byte_at(AUDIO_MODE_OFFSET),
                key_layout: byte_at(KEY_LAYOUT_OFFSET),
                packet: read_packet_config(raw, CONFIG_MTU_OFFSET),
                conn_params: read_conn_params(raw, CONFIG_CONN_PARAMS_OFFSET),
            },
            TYPE_KEY => ControlFrame::Key(raw.to_vec()),
            TYPE_STREAM_ERROR => ControlFrame::StreamError(raw.to_vec()),
            TYPE_AUDIO_MODE => ControlFrame::AudioMode(byte_at(AUDIO_MODE_REPORT_OFFSET)),
            TYPE_CONN_PARAMS => ControlFrame::ConnParams(
                read_conn_params(raw, CONN_PARAMS_REPORT_OFFSET)?,
            ),
            TYPE_MTU => ControlFrame::Mtu(read_packet_config(raw, MTU_REPORT_OFFSET)?),
            other => ControlFrame::Unknown(other),
        })
    }
}

/// Parsed PnP id characteristic (vendor/product/version at byte
/// offsets 1, 3 and 5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PnpId {
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
}

impl PnpId {
    pub fn parse(value: &[u8]) -> Option<PnpId> {
        Some(PnpId {
            vendor: read_u16(value, 1)?,
            product: read_u16(value, 3)?,
            version: read_u16(value, 5)?,
        })
    }
}

// Outbound control writes

/// Stream enable/disable: `[1, mode]` to enable, `[0]` to disable.
pub fn stream_enable(enable: bool, mode: u8) -> Vec<u8> {
    if enable {
        vec![1, mode]
    } else {
        vec![0]
    }
}

/// Legacy encode-mode write.
pub fn encode_mode(mode: u8) -> Vec<u8> {
    vec![0, mode]
}

fn command(opcode: u8, payload: &[u16]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(3 + payload.len() * 2);
    frame.push(0);
    frame.push(COMMAND_FLAG | opcode);
    frame.push((payload.len() * 2) as u8);
    for value in payload {
        frame.extend_from_slice(&value.to_le_bytes());
    }
    frame
}

/// Ask the remote to re-send its configuration snapshot.
pub fn read_config() -> Vec<u8> {
    command(COMMAND_READ_CONFIG, &[])
}

/// Request a packet-size/MTU change.
pub fn set_packet_size(max: u16, fixed: u16) -> Vec<u8> {
    command(COMMAND_SET_MTU, &[max, fixed])
}

/// Request a connection-parameter update.
pub fn update_conn_params(min_interval: u16, max_interval: u16, latency: u16, timeout: u16) -> Vec<u8> {
    command(
        COMMAND_UPDATE_CONN_PARAMS,
        &[min_interval, max_interval, latency, timeout],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config_frame() {
        let mut raw = vec![0u8; 17];
        raw[1] = TYPE_CONFIG;
        raw[3] = 9; // audio report id
        raw[4] = 0x0D; // features
        raw[5] = 0x20; // audio mode: auto
        raw[6] = 2; // key layout
        raw[7..9].copy_from_slice(&131u16.to_le_bytes()); // packet size
        raw[9..11].copy_from_slice(&135u16.to_le_bytes()); // mtu
        raw[11..13].copy_from_slice(&12u16.to_le_bytes()); // interval
        raw[13..15].copy_from_slice(&0u16.to_le_bytes()); // latency
        raw[15..17].copy_from_slice(&400u16.to_le_bytes()); // timeout

        let frame = ControlFrame::parse(&raw).unwrap();
        assert_eq!(
            frame,
            ControlFrame::Config {
                audio_report_id: 9,
                features: 0x0D,
                audio_mode: 0x20,
                key_layout: 2,
                packet: Some(PacketConfig {
                    packet_size: 131,
                    mtu: 135
                }),
                conn_params: Some(ConnParams {
                    interval: 12,
                    latency: 0,
                    timeout: 400
                }),
            }
        );
    }

    #[test]
    fn parse_short_config_frame_defaults_missing_fields() {
        // Older firmware sends only the fixed head.
        let raw = [0, TYPE_CONFIG, 0, 0, 0x01];
        let frame = ControlFrame::parse(&raw).unwrap();
        match frame {
            ControlFrame::Config {
                features,
                key_layout,
                packet,
                conn_params,
                ..
            } => {
                assert_eq!(features, 0x01);
                assert_eq!(key_layout, 0);
                assert!(packet.is_none());
                assert!(conn_params.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn parse_stream_frame() {
        let raw = [1, TYPE_STREAM, 0, 7];
        assert_eq!(
            ControlFrame::parse(&raw).unwrap(),
            ControlFrame::Stream {
                enable: true,
                audio_report_id: 7
            }
        );
    }

    #[test]
    fn parse_conn_params_frame() {
        let mut raw = vec![0u8, TYPE_CONN_PARAMS, 0];
        raw.extend_from_slice(&36u16.to_le_bytes());
        raw.extend_from_slice(&4u16.to_le_bytes());
        raw.extend_from_slice(&600u16.to_le_bytes());
        assert_eq!(
            ControlFrame::parse(&raw).unwrap(),
            ControlFrame::ConnParams(ConnParams {
                interval: 36,
                latency: 4,
                timeout: 600
            })
        );
    }

    #[test]
    fn parse_mtu_frame() {
        let mut raw = vec![0u8, TYPE_MTU, 0];
        raw.extend_from_slice(&160u16.to_le_bytes());
        raw.extend_from_slice(&163u16.to_le_bytes());
        assert_eq!(
            ControlFrame::parse(&raw).unwrap(),
            ControlFrame::Mtu(PacketConfig {
                packet_size: 160,
                mtu: 163
            })
        );
    }

    #[test]
    fn parse_rejects_truncated_frames() {
        assert!(ControlFrame::parse(&[]).is_none());
        assert!(ControlFrame::parse(&[0]).is_none());
        // Conn-params frame without its payload is dropped too.
        assert!(ControlFrame::parse(&[0, TYPE_CONN_PARAMS, 0, 1]).is_none());
    }

    #[test]
    fn parse_key_frame_keeps_raw_bytes() {
        let raw = [0, TYPE_KEY, 1, 0x04, 0x00];
        assert_eq!(
            ControlFrame::parse(&raw).unwrap(),
            ControlFrame::Key(raw.to_vec())
        );
    }

    #[test]
    fn pnp_id_parse() {
        let value = [0x01, 0xD2, 0x00, 0x2A, 0x01, 0x00, 0x01];
        assert_eq!(
            PnpId::parse(&value).unwrap(),
            PnpId {
                vendor: 0x00D2,
                product: 0x012A,
                version: 0x0100
            }
        );
        assert!(PnpId::parse(&[0x01, 0xD2]).is_none());
    }

    #[test]
    fn stream_enable_layout() {
        assert_eq!(stream_enable(true, 3), vec![1, 3]);
        assert_eq!(stream_enable(false, 3), vec![0]);
    }

    #[test]
    fn command_layouts() {
        assert_eq!(read_config(), vec![0, 0x83, 0]);
        assert_eq!(
            set_packet_size(131, 0),
            vec![0, 0x81, 4, 131, 0, 0, 0]
        );
        assert_eq!(
            update_conn_params(6, 12, 0, 400),
            vec![0, 0x82, 8, 6, 0, 12, 0, 0, 0, 0x90, 0x01]
        );
    }
}
