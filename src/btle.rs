//! btleplug transport binding.
//!
//! Binds the abstract [`Transport`]/[`Timers`] pair to a real BLE
//! stack through `btleplug`, and runs the engine's owner loop as a
//! tokio task. Three tasks cooperate:
//!
//! 1. the I/O task owns the adapter and peripheral and executes
//!    transport commands, reporting completions as [`TransportEvent`]s;
//! 2. the owner task drives the [`RemoteLinkEngine`] with transport
//!    events, timer firings, and user commands, strictly serialized;
//! 3. a notification pump forwards characteristic notifications.
//!
//! btleplug identifies notifications by characteristic UUID, so
//! peripherals exposing several report characteristics with the same
//! UUID resolve to the first discovered instance; the vendor stream
//! profile is unaffected.
//!
//! Pairing and link encryption are owned by the platform stack here:
//! `is_bonded` always reports true and `is_encrypted` reports unknown,
//! which routes the engine through its encryption grace delay.

use std::collections::HashMap;
use std::time::Duration;

use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Descriptor, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use log::{debug, error, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{self, LinkOptions};
use crate::engine::{Event, RemoteLinkEngine};
use crate::error::Error;
use crate::transport::{
    CharHandle, CharacteristicInfo, DescHandle, DescriptorInfo, DeviceAddress, GattStatus,
    ServiceInfo, TimerKind, Timers, Transport, TransportEvent,
};

/// Directives forwarded to the engine on its owner task.
#[derive(Clone, Debug)]
pub enum EngineCommand {
    Connect(DeviceAddress),
    Disconnect,
    Close,
    StartScan,
    StopScan,
    SetStreaming { enable: bool, mode: u8 },
    SetDecodeMode(u8),
    ReadRemoteConfig,
    SetPacketSize { max: u16, fixed: u16 },
    SetConnectionParameters {
        min_interval: u16,
        max_interval: u16,
        latency: u16,
        timeout: u16,
    },
}

/// Handle to a running engine: send [`EngineCommand`]s, drain
/// [`Event`]s.
pub struct BtleEngine {
    pub commands: mpsc::UnboundedSender<EngineCommand>,
    pub events: crossbeam_channel::Receiver<Event>,
}

/// Spawn the I/O and owner tasks over `adapter`.
pub async fn start(adapter: Adapter, options: LinkOptions) -> Result<BtleEngine, Error> {
    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let (io_tx, io_rx) = mpsc::unbounded_channel();
    let (timer_tx, timer_rx) = mpsc::unbounded_channel();

    tokio::spawn(io_task(adapter, io_rx, transport_tx));

    let host = BtleHost {
        io: io_tx,
        timer_tx,
        timers: HashMap::new(),
    };
    let (engine, events) = RemoteLinkEngine::new(host, options)?;

    let (commands, command_rx) = mpsc::unbounded_channel();
    tokio::spawn(owner_task(engine, transport_rx, timer_rx, command_rx));

    Ok(BtleEngine { commands, events })
}

// Owner task

async fn owner_task(
    mut engine: RemoteLinkEngine<BtleHost>,
    mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    mut timer_rx: mpsc::UnboundedReceiver<TimerKind>,
    mut command_rx: mpsc::UnboundedReceiver<EngineCommand>,
) {
    loop {
        tokio::select! {
            event = transport_rx.recv() => match event {
                Some(event) => engine.handle_transport_event(event),
                None => break,
            },
            kind = timer_rx.recv() => match kind {
                Some(kind) => engine.handle_timer(kind),
                None => break,
            },
            command = command_rx.recv() => match command {
                Some(command) => apply_command(&mut engine, command),
                None => break,
            },
        }
    }
}

fn apply_command(engine: &mut RemoteLinkEngine<BtleHost>, command: EngineCommand) {
    match command {
        EngineCommand::Connect(address) => engine.connect(address),
        EngineCommand::Disconnect => engine.disconnect(),
        EngineCommand::Close => engine.close(),
        EngineCommand::StartScan => engine.start_scan(),
        EngineCommand::StopScan => engine.stop_scan(),
        EngineCommand::SetStreaming { enable, mode } => engine.set_streaming(enable, mode),
        EngineCommand::SetDecodeMode(mode) => engine.set_decode_mode(mode),
        EngineCommand::ReadRemoteConfig => engine.read_remote_config(),
        EngineCommand::SetPacketSize { max, fixed } => engine.set_packet_size(max, fixed),
        EngineCommand::SetConnectionParameters {
            min_interval,
            max_interval,
            latency,
            timeout,
        } => engine.set_connection_parameters(min_interval, max_interval, latency, timeout),
    }
}

// Host handle given to the engine

struct BtleHost {
    io: mpsc::UnboundedSender<IoCommand>,
    timer_tx: mpsc::UnboundedSender<TimerKind>,
    timers: HashMap<TimerKind, JoinHandle<()>>,
}

#[derive(Debug)]
enum IoCommand {
    Connect(DeviceAddress),
    Disconnect,
    Close,
    DiscoverServices,
    ReadChar(CharHandle),
    WriteChar(CharHandle, Vec<u8>),
    ReadDesc(CharHandle, DescHandle),
    WriteDesc(DescHandle, Vec<u8>),
    SetNotifications(CharHandle, bool),
    StartScan,
    StopScan,
}

impl BtleHost {
    fn send(&self, command: IoCommand) {
        if self.io.send(command).is_err() {
            warn!("transport I/O task is gone");
        }
    }
}

impl Transport for BtleHost {
    fn connect(&mut self, address: DeviceAddress) {
        self.send(IoCommand::Connect(address));
    }

    fn disconnect(&mut self) {
        self.send(IoCommand::Disconnect);
    }

    fn close(&mut self) {
        self.send(IoCommand::Close);
    }

    fn discover_services(&mut self) {
        self.send(IoCommand::DiscoverServices);
    }

    fn read_characteristic(&mut self, characteristic: CharHandle) {
        self.send(IoCommand::ReadChar(characteristic));
    }

    fn write_characteristic(&mut self, characteristic: CharHandle, value: &[u8]) {
        self.send(IoCommand::WriteChar(characteristic, value.to_vec()));
    }

    fn read_descriptor(&mut self, characteristic: CharHandle, descriptor: DescHandle) {
        self.send(IoCommand::ReadDesc(characteristic, descriptor));
    }

    fn write_descriptor(&mut self, descriptor: DescHandle, value: &[u8]) {
        self.send(IoCommand::WriteDesc(descriptor, value.to_vec()));
    }

    fn set_notifications(&mut self, characteristic: CharHandle, enable: bool) {
        self.send(IoCommand::SetNotifications(characteristic, enable));
    }

    fn is_bonded(&self, _address: &DeviceAddress) -> bool {
        // The platform stack owns pairing.
        true
    }

    fn create_bond(&mut self, _address: &DeviceAddress) -> bool {
        false
    }

    fn is_encrypted(&self) -> Option<bool> {
        None
    }

    fn start_scan(&mut self) {
        self.send(IoCommand::StartScan);
    }

    fn stop_scan(&mut self) {
        self.send(IoCommand::StopScan);
    }
}

impl Timers for BtleHost {
    fn schedule(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel(kind);
        let tx = self.timer_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(kind);
        });
        self.timers.insert(kind, handle);
    }

    fn cancel(&mut self, kind: TimerKind) {
        if let Some(handle) = self.timers.remove(&kind) {
            handle.abort();
        }
    }
}

// I/O task

struct IoState {
    adapter: Adapter,
    peripheral: Option<Peripheral>,
    characteristics: Vec<Characteristic>,
    descriptors: Vec<(Descriptor, CharHandle)>,
    notification_pump: Option<JoinHandle<()>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

async fn io_task(
    adapter: Adapter,
    mut commands: mpsc::UnboundedReceiver<IoCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut central_events = match adapter.events().await {
        Ok(stream) => stream,
        Err(err) => {
            error!("cannot listen for adapter events: {err}");
            return;
        }
    };

    let mut state = IoState {
        adapter,
        peripheral: None,
        characteristics: Vec::new(),
        descriptors: Vec::new(),
        notification_pump: None,
        events,
    };

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => state.handle_command(command).await,
                None => break,
            },
            event = central_events.next() => match event {
                Some(event) => state.handle_central_event(event).await,
                None => break,
            },
        }
    }

    if let Some(pump) = state.notification_pump.take() {
        pump.abort();
    }
}

fn to_status<T>(result: &Result<T, btleplug::Error>) -> GattStatus {
    match result {
        Ok(_) => GattStatus::Success,
        Err(_) => GattStatus::Failure(0),
    }
}

impl IoState {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    async fn handle_central_event(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                if let Ok(peripheral) = self.adapter.peripheral(&id).await {
                    if let Ok(Some(properties)) = peripheral.properties().await {
                        self.emit(TransportEvent::ScanResult {
                            address: DeviceAddress(properties.address.into_inner()),
                            rssi: properties.rssi.unwrap_or(0),
                            name: properties.local_name,
                        });
                    }
                }
            }
            CentralEvent::DeviceConnected(id) => {
                if let Some(address) = self.our_address(&id).await {
                    self.emit(TransportEvent::AclConnected { address });
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                if let Some(address) = self.our_address(&id).await {
                    self.emit(TransportEvent::AclDisconnected { address });
                    self.emit(TransportEvent::ConnectionState {
                        connected: false,
                        status: GattStatus::Success,
                    });
                }
            }
            _ => {}
        }
    }

    async fn our_address(&self, id: &btleplug::platform::PeripheralId) -> Option<DeviceAddress> {
        let ours = self.peripheral.as_ref()?;
        let peripheral = self.adapter.peripheral(id).await.ok()?;
        (peripheral.address() == ours.address())
            .then(|| DeviceAddress(peripheral.address().into_inner()))
    }

    async fn handle_command(&mut self, command: IoCommand) {
        match command {
            IoCommand::Connect(address) => self.connect(address).await,
            IoCommand::Disconnect => {
                if let Some(peripheral) = &self.peripheral {
                    if let Err(err) = peripheral.disconnect().await {
                        warn!("disconnect failed: {err}");
                    }
                }
            }
            IoCommand::Close => {
                if let Some(pump) = self.notification_pump.take() {
                    pump.abort();
                }
                self.peripheral = None;
                self.characteristics.clear();
                self.descriptors.clear();
            }
            IoCommand::DiscoverServices => self.discover_services().await,
            IoCommand::ReadChar(handle) => self.read_characteristic(handle).await,
            IoCommand::WriteChar(handle, value) => self.write_characteristic(handle, value).await,
            IoCommand::ReadDesc(char_handle, desc_handle) => {
                self.read_descriptor(char_handle, desc_handle).await;
            }
            IoCommand::WriteDesc(handle, value) => self.write_descriptor(handle, value).await,
            IoCommand::SetNotifications(handle, enable) => {
                self.set_notifications(handle, enable).await;
            }
            IoCommand::StartScan => {
                let filter = ScanFilter {
                    services: vec![config::HID_SERVICE],
                };
                if let Err(err) = self.adapter.start_scan(filter).await {
                    error!("scan failed to start: {err}");
                }
            }
            IoCommand::StopScan => {
                if let Err(err) = self.adapter.stop_scan().await {
                    warn!("scan failed to stop: {err}");
                }
            }
        }
    }

    async fn connect(&mut self, address: DeviceAddress) {
        let target = BDAddr::from(address.0);
        let peripheral = match self.find_peripheral(target).await {
            Some(peripheral) => peripheral,
            None => {
                error!("peripheral {address} not known to the adapter (scan first)");
                self.emit(TransportEvent::ConnectionState {
                    connected: false,
                    status: GattStatus::Failure(0),
                });
                return;
            }
        };

        debug!("connecting to {address}");
        let result = peripheral.connect().await;
        let status = to_status(&result);
        if let Err(err) = &result {
            error!("connect failed: {err}");
        } else {
            self.peripheral = Some(peripheral);
        }
        self.emit(TransportEvent::ConnectionState {
            connected: result.is_ok(),
            status,
        });
    }

    async fn find_peripheral(&self, target: BDAddr) -> Option<Peripheral> {
        let peripherals = self.adapter.peripherals().await.ok()?;
        peripherals.into_iter().find(|p| p.address() == target)
    }

    async fn discover_services(&mut self) {
        let Some(peripheral) = self.peripheral.clone() else {
            return;
        };
        let result = peripheral.discover_services().await;
        let status = to_status(&result);

        self.characteristics.clear();
        self.descriptors.clear();
        let mut services = Vec::new();
        if result.is_ok() {
            for service in peripheral.services() {
                let mut characteristics = Vec::new();
                for characteristic in &service.characteristics {
                    let char_handle = CharHandle(self.characteristics.len() as u16);
                    self.characteristics.push(characteristic.clone());
                    let mut descriptors = Vec::new();
                    for descriptor in &characteristic.descriptors {
                        let desc_handle = DescHandle(self.descriptors.len() as u16);
                        self.descriptors.push((descriptor.clone(), char_handle));
                        descriptors.push(DescriptorInfo {
                            uuid: descriptor.uuid,
                            handle: desc_handle,
                        });
                    }
                    characteristics.push(CharacteristicInfo {
                        uuid: characteristic.uuid,
                        handle: char_handle,
                        descriptors,
                    });
                }
                services.push(ServiceInfo {
                    uuid: service.uuid,
                    characteristics,
                });
            }
        }
        self.emit(TransportEvent::ServicesDiscovered { status, services });
    }

    async fn read_characteristic(&mut self, handle: CharHandle) {
        let Some((peripheral, characteristic)) = self.resolve(handle) else {
            return;
        };
        let result = peripheral.read(&characteristic).await;
        let status = to_status(&result);
        self.emit(TransportEvent::CharacteristicRead {
            characteristic: handle,
            uuid: characteristic.uuid,
            value: result.unwrap_or_default(),
            status,
        });
    }

    async fn write_characteristic(&mut self, handle: CharHandle, value: Vec<u8>) {
        let Some((peripheral, characteristic)) = self.resolve(handle) else {
            return;
        };
        let result = peripheral
            .write(&characteristic, &value, WriteType::WithResponse)
            .await;
        self.emit(TransportEvent::WriteCompleted {
            status: to_status(&result),
        });
    }

    async fn read_descriptor(&mut self, char_handle: CharHandle, desc_handle: DescHandle) {
        let Some(peripheral) = self.peripheral.clone() else {
            return;
        };
        let Some((descriptor, _)) = self.descriptors.get(desc_handle.0 as usize).cloned() else {
            return;
        };
        let result = peripheral.read_descriptor(&descriptor).await;
        let status = to_status(&result);
        self.emit(TransportEvent::DescriptorRead {
            characteristic: char_handle,
            descriptor: desc_handle,
            value: result.unwrap_or_default(),
            status,
        });
    }

    async fn write_descriptor(&mut self, handle: DescHandle, value: Vec<u8>) {
        let Some(peripheral) = self.peripheral.clone() else {
            return;
        };
        let Some((descriptor, _)) = self.descriptors.get(handle.0 as usize).cloned() else {
            return;
        };
        let result = peripheral.write_descriptor(&descriptor, &value).await;
        self.emit(TransportEvent::DescriptorWrite {
            descriptor: handle,
            status: to_status(&result),
        });
    }

    async fn set_notifications(&mut self, handle: CharHandle, enable: bool) {
        let Some((peripheral, characteristic)) = self.resolve(handle) else {
            return;
        };
        let result = if enable {
            peripheral.subscribe(&characteristic).await
        } else {
            peripheral.unsubscribe(&characteristic).await
        };
        if let Err(err) = result {
            warn!("set notifications failed: {err}");
            return;
        }
        if enable && self.notification_pump.is_none() {
            self.spawn_notification_pump(peripheral).await;
        }
    }

    async fn spawn_notification_pump(&mut self, peripheral: Peripheral) {
        let stream = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(err) => {
                error!("cannot open notification stream: {err}");
                return;
            }
        };
        let characteristics = self.characteristics.clone();
        let events = self.events.clone();
        self.notification_pump = Some(tokio::spawn(async move {
            let mut stream = stream;
            while let Some(notification) = stream.next().await {
                // Notifications carry only the UUID; the first matching
                // characteristic wins.
                let Some(index) = characteristics
                    .iter()
                    .position(|c| c.uuid == notification.uuid)
                else {
                    continue;
                };
                let delivered = events.send(TransportEvent::Notification {
                    characteristic: CharHandle(index as u16),
                    value: notification.value,
                });
                if delivered.is_err() {
                    break;
                }
            }
        }));
    }

    fn resolve(&self, handle: CharHandle) -> Option<(Peripheral, Characteristic)> {
        let peripheral = self.peripheral.clone()?;
        let characteristic = self.characteristics.get(handle.0 as usize)?.clone();
        Some((peripheral, characteristic))
    }
}
