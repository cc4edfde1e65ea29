//! The remote link engine.
//!
//! Single entry point tying the pieces together: transport events go
//! in, a single event stream comes out. Control-type frames update the
//! link state machine; stream-type frames are sequence-checked and
//! handed to the audio worker; everything the engine learns is
//! published as [`Event`]s on a channel handed out at construction.
//!
//! All `handle_*` and directive methods must be called from one owner
//! execution context; transport callbacks arriving elsewhere must be
//! enqueued onto it, never applied directly.

use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, warn};

use crate::audio::{AudioMessage, AudioPipeline};
use crate::config::{
    LinkOptions, BITRATE_WINDOW, REPORT_ID_AUDIO_FIRST, REPORT_ID_AUDIO_LAST,
};
use crate::control;
use crate::error::Error;
use crate::link::{LinkSignal, LinkStateMachine, ReportClass};
use crate::transport::{CharHandle, DeviceAddress, LinkHost, TimerKind, TransportEvent};

/// Events published to external consumers.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Connected(DeviceAddress),
    Disconnected(DeviceAddress),
    ServicesDiscovered(DeviceAddress),
    /// Initialization finished; control writes are accepted from here.
    DeviceReady(DeviceAddress),
    ScanResult {
        address: DeviceAddress,
        rssi: i16,
        name: Option<String>,
    },
    /// Raw inbound control frame, as received.
    ControlFrame(Vec<u8>),
    /// Raw key report (modifier + scan codes).
    KeyReport(Vec<u8>),
    /// Negotiated link parameters changed. Fields are -1 until learned.
    ConfigUpdate {
        mtu: i32,
        packet_size: i32,
        connection_interval: i32,
        slave_latency: i32,
        supervision_timeout: i32,
    },
    /// Measured audio bitrate in bits per second.
    BitrateSample(f64),
    /// One decoded PCM block (16-bit mono, 16 kHz).
    DecodedAudio(Vec<i16>),
}

/// Arrival-driven bitrate measurement: a sample is emitted whenever at
/// least the reporting window has elapsed since the previous one.
struct BitrateMeter {
    window_start: Option<Instant>,
    window_bytes: usize,
    total_bytes: u64,
}

impl BitrateMeter {
    fn new() -> Self {
        Self {
            window_start: None,
            window_bytes: 0,
            total_bytes: 0,
        }
    }

    fn reset(&mut self) {
        self.window_start = None;
        self.window_bytes = 0;
    }

    fn record(&mut self, len: usize, now: Instant) -> Option<f64> {
        self.total_bytes += len as u64;
        let start = *self.window_start.get_or_insert(now);
        self.window_bytes += len;
        let elapsed = now.duration_since(start);
        if elapsed < BITRATE_WINDOW || self.window_bytes == 0 {
            return None;
        }
        let bits_per_second = self.window_bytes as f64 * 8000.0 / elapsed.as_millis() as f64;
        self.window_start = Some(now);
        self.window_bytes = 0;
        Some(bits_per_second)
    }
}

/// One engine per active peripheral connection.
pub struct RemoteLinkEngine<H: LinkHost> {
    link: LinkStateMachine<H>,
    audio: AudioPipeline,
    events: Sender<Event>,
    expected_report: u8,
    bitrate: BitrateMeter,
}

impl<H: LinkHost> RemoteLinkEngine<H> {
    /// Build an engine over `host`. The returned receiver is the
    /// engine's published event stream.
    pub fn new(host: H, options: LinkOptions) -> Result<(Self, Receiver<Event>), Error> {
        let (events, receiver) = unbounded();
        let audio = AudioPipeline::spawn(events.clone())?;
        Ok((
            Self {
                link: LinkStateMachine::new(host, options),
                audio,
                events,
                expected_report: 0,
                bitrate: BitrateMeter::new(),
            },
            receiver,
        ))
    }

    /// Feed one transport event into the engine.
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionState { connected, status } => {
                self.link.on_connection_state(connected, status);
            }
            TransportEvent::ServicesDiscovered { status, services } => {
                self.link.on_services_discovered(status, services);
            }
            TransportEvent::Notification {
                characteristic,
                value,
            } => self.on_notification(characteristic, value),
            TransportEvent::CharacteristicRead {
                characteristic,
                uuid,
                value,
                status,
            } => self
                .link
                .on_characteristic_read(characteristic, uuid, &value, status),
            TransportEvent::DescriptorRead {
                characteristic,
                descriptor,
                value,
                status,
            } => self
                .link
                .on_descriptor_read(characteristic, descriptor, &value, status),
            TransportEvent::DescriptorWrite { descriptor, status } => {
                self.link.on_descriptor_write(descriptor, status);
            }
            TransportEvent::WriteCompleted { status } => self.link.on_write_completed(status),
            TransportEvent::BondState { address, state } => {
                self.link.on_bond_state(address, state);
            }
            TransportEvent::AclConnected { address } => self.link.on_acl_connected(address),
            TransportEvent::AclDisconnected { address } => self.link.on_acl_disconnected(address),
            TransportEvent::AdapterState { powered } => self.link.on_adapter_state(powered),
            TransportEvent::SystemProfileState { address, connected } => {
                self.link.on_system_profile_state(address, connected);
            }
            TransportEvent::ScanResult {
                address,
                rssi,
                name,
            } => self.publish(Event::ScanResult {
                address,
                rssi,
                name,
            }),
        }
        self.flush_link_signals();
    }

    /// A scheduled timer fired.
    pub fn handle_timer(&mut self, kind: TimerKind) {
        self.link.on_timer(kind);
        self.flush_link_signals();
    }

    // Directives

    pub fn connect(&mut self, address: DeviceAddress) {
        self.link.connect(address);
        self.flush_link_signals();
    }

    pub fn disconnect(&mut self) {
        self.link.disconnect();
        self.flush_link_signals();
    }

    pub fn close(&mut self) {
        self.link.close();
        self.flush_link_signals();
    }

    pub fn start_scan(&mut self) {
        self.link.start_scan();
    }

    pub fn stop_scan(&mut self) {
        self.link.stop_scan();
    }

    /// Enable or disable voice streaming on the remote.
    pub fn set_streaming(&mut self, enable: bool, mode: u8) {
        self.audio.send(if enable {
            AudioMessage::StreamOn
        } else {
            AudioMessage::StreamOff
        });
        self.expected_report = 0;
        self.bitrate.reset();
        self.link.write_control(control::stream_enable(enable, mode));
        self.flush_link_signals();
    }

    /// Select the local decode mode (AUDIO_MODE_AUTOMATIC defers to the
    /// remote's in-band commands).
    pub fn set_decode_mode(&mut self, mode: u8) {
        self.audio.send(AudioMessage::SetMode(mode));
    }

    /// Legacy encode-mode control write.
    pub fn send_encode_mode(&mut self, mode: u8) {
        self.link.write_control(control::encode_mode(mode));
        self.flush_link_signals();
    }

    /// Ask the remote to re-send its configuration snapshot.
    pub fn read_remote_config(&mut self) {
        self.link.write_control(control::read_config());
        self.flush_link_signals();
    }

    pub fn set_packet_size(&mut self, max: u16, fixed: u16) {
        self.link
            .write_control(control::set_packet_size(max, fixed));
        self.flush_link_signals();
    }

    pub fn set_connection_parameters(
        &mut self,
        min_interval: u16,
        max_interval: u16,
        latency: u16,
        timeout: u16,
    ) {
        self.link.write_control(control::update_conn_params(
            min_interval,
            max_interval,
            latency,
            timeout,
        ));
        self.flush_link_signals();
    }

    /// The link state machine, for negotiated-parameter getters.
    pub fn link(&self) -> &LinkStateMachine<H> {
        &self.link
    }

    // Internals

    fn on_notification(&mut self, characteristic: CharHandle, value: Vec<u8>) {
        match self.link.classify(characteristic) {
            ReportClass::ControlIn => {
                debug!("control input: {value:02x?}");
                self.link.on_control_notification(&value);
            }
            ReportClass::AudioLegacy(id) => {
                self.check_sequence(id);
                self.feed_audio(value);
            }
            ReportClass::AudioStream => self.feed_audio(value),
            ReportClass::Unknown(id) => {
                warn!("unknown report notification dropped (id {id:?})");
            }
        }
    }

    /// Legacy audio reports cycle through the fixed trio; a gap means
    /// the radio dropped a packet.
    fn check_sequence(&mut self, id: u8) {
        if self.expected_report == 0 {
            self.expected_report = id;
        } else {
            self.expected_report += 1;
        }
        if self.expected_report > REPORT_ID_AUDIO_LAST {
            self.expected_report = REPORT_ID_AUDIO_FIRST;
        }
        if self.expected_report != id {
            warn!(
                "packet sequence interruption: expected {}, received {id}",
                self.expected_report
            );
            self.expected_report = id;
        }
    }

    fn feed_audio(&mut self, value: Vec<u8>) {
        if let Some(bits_per_second) = self.bitrate.record(value.len(), Instant::now()) {
            self.publish(Event::BitrateSample(bits_per_second));
        }
        self.audio.send(AudioMessage::Frame(value));
    }

    fn flush_link_signals(&mut self) {
        while let Some(signal) = self.link.take_signal() {
            match signal {
                LinkSignal::Event(event) => self.publish(event),
                LinkSignal::AudioFeatures(features) => {
                    self.audio.send(AudioMessage::SetFeatures(features));
                }
            }
        }
    }

    fn publish(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn bitrate_meter_emits_after_window() {
        let mut meter = BitrateMeter::new();
        let start = Instant::now();
        assert!(meter.record(100, start).is_none());
        // 1000 bytes over one second -> 8000 bits/s.
        let sample = meter
            .record(900, start + Duration::from_millis(1000))
            .expect("sample due");
        assert!((sample - 8000.0).abs() < 1.0);
    }

    #[test]
    fn bitrate_meter_stays_quiet_within_window() {
        let mut meter = BitrateMeter::new();
        let start = Instant::now();
        assert!(meter.record(100, start).is_none());
        assert!(meter
            .record(100, start + Duration::from_millis(100))
            .is_none());
    }

    #[test]
    fn bitrate_meter_reset_restarts_window() {
        let mut meter = BitrateMeter::new();
        let start = Instant::now();
        meter.record(100, start);
        meter.reset();
        // Window restarts at the next packet.
        assert!(meter
            .record(100, start + Duration::from_secs(10))
            .is_none());
        assert!(meter
            .record(100, start + Duration::from_secs(11))
            .is_some());
        assert_eq!(meter.total_bytes, 300);
    }
}
