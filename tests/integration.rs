//! End-to-end tests: transport events in, engine events out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rcu_link::config::{
    AUDIO_CONTROL_ESCAPE, AUDIO_MODE_AUTOMATIC, CLIENT_CONFIG_DESCRIPTOR, FEATURE_INBAND_CONTROL,
    FEATURE_NOT_PACKET_BASED, HID_REPORT_CHAR, HID_REPORT_REFERENCE, HID_SERVICE,
};
use rcu_link::{
    BondState, CharHandle, CharacteristicInfo, DescHandle, DescriptorInfo, DeviceAddress, Event,
    GattStatus, LinkOptions, RemoteLinkEngine, ServiceInfo, TimerKind, Timers, Transport,
    TransportEvent,
};

const ADDR: DeviceAddress = DeviceAddress([0x80, 0xEA, 0xCA, 0x00, 0x00, 0x01]);

#[derive(Clone, Debug, PartialEq)]
enum Op {
    Connect,
    Disconnect,
    DiscoverServices,
    ReadChar(u16),
    WriteChar(u16, Vec<u8>),
    ReadDesc(u16),
    WriteDesc(u16),
    SetNotify(u16, bool),
    Schedule(TimerKind),
}

/// Shared operation log: the engine owns the host, the test keeps a
/// clone of the log handle.
#[derive(Clone, Default)]
struct OpLog(Arc<Mutex<Vec<Op>>>);

impl OpLog {
    fn push(&self, op: Op) {
        self.0.lock().unwrap().push(op);
    }

    fn take(&self) -> Vec<Op> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

struct MockHost {
    log: OpLog,
}

impl Transport for MockHost {
    fn connect(&mut self, _address: DeviceAddress) {
        self.log.push(Op::Connect);
    }

    fn disconnect(&mut self) {
        self.log.push(Op::Disconnect);
    }

    fn close(&mut self) {}

    fn discover_services(&mut self) {
        self.log.push(Op::DiscoverServices);
    }

    fn read_characteristic(&mut self, characteristic: CharHandle) {
        self.log.push(Op::ReadChar(characteristic.0));
    }

    fn write_characteristic(&mut self, characteristic: CharHandle, value: &[u8]) {
        self.log.push(Op::WriteChar(characteristic.0, value.to_vec()));
    }

    fn read_descriptor(&mut self, _characteristic: CharHandle, descriptor: DescHandle) {
        self.log.push(Op::ReadDesc(descriptor.0));
    }

    fn write_descriptor(&mut self, descriptor: DescHandle, _value: &[u8]) {
        self.log.push(Op::WriteDesc(descriptor.0));
    }

    fn set_notifications(&mut self, characteristic: CharHandle, enable: bool) {
        self.log.push(Op::SetNotify(characteristic.0, enable));
    }

    fn is_bonded(&self, _address: &DeviceAddress) -> bool {
        true
    }

    fn create_bond(&mut self, _address: &DeviceAddress) -> bool {
        false
    }

    fn is_encrypted(&self) -> Option<bool> {
        Some(true)
    }

    fn start_scan(&mut self) {}

    fn stop_scan(&mut self) {}
}

impl Timers for MockHost {
    fn schedule(&mut self, kind: TimerKind, _delay: Duration) {
        self.log.push(Op::Schedule(kind));
    }

    fn cancel(&mut self, _kind: TimerKind) {}
}

fn hid_services() -> Vec<ServiceInfo> {
    vec![ServiceInfo {
        uuid: HID_SERVICE,
        characteristics: (1..=5)
            .map(|instance| CharacteristicInfo {
                uuid: HID_REPORT_CHAR,
                handle: CharHandle(instance),
                descriptors: vec![
                    DescriptorInfo {
                        uuid: HID_REPORT_REFERENCE,
                        handle: DescHandle(100 + instance),
                    },
                    DescriptorInfo {
                        uuid: CLIENT_CONFIG_DESCRIPTOR,
                        handle: DescHandle(200 + instance),
                    },
                ],
            })
            .collect(),
    }]
}

/// Drive a fresh engine through connection, discovery and
/// initialization. Characteristic instances 1..=5 carry report ids
/// 4 (control out), 5 (control in), 6, 7, 8 (audio).
fn bring_up(
    engine: &mut RemoteLinkEngine<MockHost>,
    features: u8,
) {
    engine.connect(ADDR);
    engine.handle_transport_event(TransportEvent::ConnectionState {
        connected: true,
        status: GattStatus::Success,
    });
    engine.handle_transport_event(TransportEvent::ServicesDiscovered {
        status: GattStatus::Success,
        services: hid_services(),
    });
    for (instance, id) in (1u16..=5).zip(4u8..=8) {
        let report_type = if id == 4 { 2 } else { 1 };
        engine.handle_transport_event(TransportEvent::DescriptorRead {
            characteristic: CharHandle(instance),
            descriptor: DescHandle(100 + instance),
            value: vec![id, report_type],
            status: GattStatus::Success,
        });
    }
    let mut config = vec![0u8; 7];
    config[1] = 1; // config frame
    config[4] = features;
    engine.handle_transport_event(TransportEvent::CharacteristicRead {
        characteristic: CharHandle(2),
        uuid: HID_REPORT_CHAR,
        value: config,
        status: GattStatus::Success,
    });
}

fn new_engine() -> (RemoteLinkEngine<MockHost>, crossbeam_channel::Receiver<Event>, OpLog) {
    let log = OpLog::default();
    let host = MockHost { log: log.clone() };
    let (engine, events) =
        RemoteLinkEngine::new(host, LinkOptions::default()).expect("engine start");
    (engine, events, log)
}

fn drain_now(events: &crossbeam_channel::Receiver<Event>) -> Vec<Event> {
    let mut collected = Vec::new();
    while let Ok(event) = events.try_recv() {
        collected.push(event);
    }
    collected
}

#[test]
fn bring_up_publishes_lifecycle_events() {
    let (mut engine, events, _log) = new_engine();
    bring_up(&mut engine, FEATURE_INBAND_CONTROL);

    let seen = drain_now(&events);
    assert!(seen.contains(&Event::Connected(ADDR)));
    assert!(seen.contains(&Event::ServicesDiscovered(ADDR)));
    assert_eq!(
        seen.iter()
            .filter(|e| matches!(e, Event::DeviceReady(_)))
            .count(),
        1
    );
    assert!(engine.link().is_ready());
}

#[test]
fn voice_stream_decodes_through_the_engine() {
    let (mut engine, events, log) = new_engine();
    bring_up(&mut engine, FEATURE_INBAND_CONTROL | FEATURE_NOT_PACKET_BASED);
    log.take();

    // Enable streaming: the stream-enable write goes to the control
    // output report (instance 1).
    engine.set_streaming(true, AUDIO_MODE_AUTOMATIC);
    assert!(log
        .take()
        .contains(&Op::WriteChar(1, vec![1, AUDIO_MODE_AUTOMATIC])));

    // Audio notification on legacy report 6 (instance 3), carrying an
    // in-band reset command followed by four ADPCM codes.
    engine.handle_transport_event(TransportEvent::Notification {
        characteristic: CharHandle(3),
        value: vec![AUDIO_CONTROL_ESCAPE, 0x00, 0x17, 0x89],
    });

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let left = deadline.saturating_duration_since(std::time::Instant::now());
        match events.recv_timeout(left) {
            Ok(Event::DecodedAudio(pcm)) => {
                assert_eq!(pcm, vec![2, 15, 13, 8]);
                break;
            }
            Ok(_) => continue,
            Err(err) => panic!("no decoded audio: {err}"),
        }
    }
}

#[test]
fn escaped_audio_survives_packet_split() {
    let (mut engine, events, _log) = new_engine();
    bring_up(&mut engine, FEATURE_INBAND_CONTROL | FEATURE_NOT_PACKET_BASED);
    engine.set_streaming(true, AUDIO_MODE_AUTOMATIC);
    drain_now(&events);

    // A literal 0x7F audio byte, escaped, with the pair split across
    // two packets.
    engine.handle_transport_event(TransportEvent::Notification {
        characteristic: CharHandle(3),
        value: vec![0x17, AUDIO_CONTROL_ESCAPE],
    });
    engine.handle_transport_event(TransportEvent::Notification {
        characteristic: CharHandle(3),
        value: vec![AUDIO_CONTROL_ESCAPE, 0x89],
    });

    // The decoded stream equals decoding 0x17 0x7F 0x89 in one piece.
    let mut expected_decoder = rcu_link::audio::adpcm::AdpcmDecoder::new();
    expected_decoder.set_partial_samples(true);
    let expected = expected_decoder.process(&[0x17, AUDIO_CONTROL_ESCAPE, 0x89]);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let mut decoded = Vec::new();
    while decoded.len() < expected.len() {
        let left = deadline.saturating_duration_since(std::time::Instant::now());
        match events.recv_timeout(left) {
            Ok(Event::DecodedAudio(pcm)) => decoded.extend(pcm),
            Ok(_) => continue,
            Err(err) => panic!("incomplete decode: {err}"),
        }
    }
    assert_eq!(decoded, expected);
}

#[test]
fn key_reports_are_relayed_raw() {
    let (mut engine, events, _log) = new_engine();
    bring_up(&mut engine, FEATURE_INBAND_CONTROL);
    drain_now(&events);

    let report = vec![0x00, 0x02, 0x01, 0x1E, 0x00];
    engine.handle_transport_event(TransportEvent::Notification {
        characteristic: CharHandle(2),
        value: report.clone(),
    });
    let seen = drain_now(&events);
    assert!(seen.contains(&Event::KeyReport(report.clone())));
    assert!(seen.contains(&Event::ControlFrame(report)));
}

#[test]
fn unknown_notifications_are_dropped() {
    let (mut engine, events, _log) = new_engine();
    bring_up(&mut engine, FEATURE_INBAND_CONTROL);
    drain_now(&events);

    engine.handle_transport_event(TransportEvent::Notification {
        characteristic: CharHandle(42),
        value: vec![1, 2, 3],
    });
    // Nothing surfaces, and no audio is decoded from it.
    assert!(drain_now(&events).is_empty());
}

#[test]
fn disconnect_then_reconnect_reinitializes_cleanly() {
    let (mut engine, events, log) = new_engine();
    bring_up(&mut engine, FEATURE_INBAND_CONTROL);
    drain_now(&events);
    log.take();

    engine.handle_transport_event(TransportEvent::ConnectionState {
        connected: false,
        status: GattStatus::Success,
    });
    let seen = drain_now(&events);
    assert!(seen.contains(&Event::Disconnected(ADDR)));
    assert!(!engine.link().is_ready());
    // Unexpected loss of a bonded device: reconnect is scheduled.
    assert!(log.take().contains(&Op::Schedule(TimerKind::Reconnect)));

    engine.handle_timer(TimerKind::Reconnect);
    assert!(log.take().contains(&Op::Connect));

    bring_up(&mut engine, FEATURE_INBAND_CONTROL);
    assert!(engine.link().is_ready());
}

#[test]
fn scan_results_pass_through() {
    let (mut engine, events, _log) = new_engine();
    engine.handle_transport_event(TransportEvent::ScanResult {
        address: ADDR,
        rssi: -61,
        name: Some("RCU".into()),
    });
    assert_eq!(
        drain_now(&events),
        vec![Event::ScanResult {
            address: ADDR,
            rssi: -61,
            name: Some("RCU".into())
        }]
    );
}

#[test]
fn pairing_failure_surfaces_disconnect() {
    let log = OpLog::default();
    struct UnbondedHost {
        inner: MockHost,
    }
    impl Transport for UnbondedHost {
        fn connect(&mut self, address: DeviceAddress) {
            self.inner.connect(address);
        }
        fn disconnect(&mut self) {
            self.inner.disconnect();
        }
        fn close(&mut self) {}
        fn discover_services(&mut self) {
            self.inner.discover_services();
        }
        fn read_characteristic(&mut self, c: CharHandle) {
            self.inner.read_characteristic(c);
        }
        fn write_characteristic(&mut self, c: CharHandle, v: &[u8]) {
            self.inner.write_characteristic(c, v);
        }
        fn read_descriptor(&mut self, c: CharHandle, d: DescHandle) {
            self.inner.read_descriptor(c, d);
        }
        fn write_descriptor(&mut self, d: DescHandle, v: &[u8]) {
            self.inner.write_descriptor(d, v);
        }
        fn set_notifications(&mut self, c: CharHandle, e: bool) {
            self.inner.set_notifications(c, e);
        }
        fn is_bonded(&self, _address: &DeviceAddress) -> bool {
            false
        }
        fn create_bond(&mut self, address: &DeviceAddress) -> bool {
            self.inner.create_bond(address)
        }
        fn is_encrypted(&self) -> Option<bool> {
            Some(true)
        }
        fn start_scan(&mut self) {}
        fn stop_scan(&mut self) {}
    }
    impl Timers for UnbondedHost {
        fn schedule(&mut self, kind: TimerKind, delay: Duration) {
            self.inner.schedule(kind, delay);
        }
        fn cancel(&mut self, kind: TimerKind) {
            self.inner.cancel(kind);
        }
    }

    let host = UnbondedHost {
        inner: MockHost { log: log.clone() },
    };
    let (mut engine, events) =
        RemoteLinkEngine::new(host, LinkOptions::default()).expect("engine start");

    engine.connect(ADDR);
    // No direct connect: pairing is initiated instead.
    assert!(!log.take().contains(&Op::Connect));

    engine.handle_transport_event(TransportEvent::BondState {
        address: ADDR,
        state: BondState::None,
    });
    assert!(drain_now(&events).contains(&Event::Disconnected(ADDR)));
}
