//! Connection and initialization state machine.
//!
//! Drives one peripheral link through
//! `Disconnected -> Connecting -> Connected{initializing} ->
//! Connected{ready}` over an abstract attribute-server transport.
//!
//! The radio stack allows at most one outstanding read/write, so all
//! initialization work is held in explicit FIFO queues (descriptor
//! reads, characteristic reads, descriptor writes) and a single pump
//! function issues the next operation after every completion event.
//! Queue entries are removed only once the transport confirms the
//! operation. Outbound control writes have their own queue, drained
//! one-at-a-time after the link is ready.
//!
//! Two discovery paths exist: the HID profile (report characteristics
//! classified through their report-reference descriptors) and a vendor
//! stream profile with dedicated config/control/data characteristics.

use std::collections::{HashMap, VecDeque};

use log::{debug, error, info, warn};

use crate::config::{
    LinkOptions, CCC_NOTIFICATIONS_ENABLE, CLIENT_CONFIG_DESCRIPTOR, DEVICE_INFO_FIRMWARE_REVISION,
    DEVICE_INFO_PNP_ID, DEVICE_INFO_SERVICE, ENCRYPTION_GRACE, ENCRYPTION_POLL,
    ENCRYPTION_POLL_LIMIT, FEATURE_COMMAND_SUPPORT, HID_REPORT_CHAR, HID_REPORT_REFERENCE,
    HID_REPORT_TYPE_INPUT, HID_SERVICE, PROFILE_SETTLE_DELAY, RECONNECT_DELAY,
    REPORT_ID_AUDIO_FIRST, REPORT_ID_AUDIO_LAST, REPORT_ID_CONTROL_IN, REPORT_ID_CONTROL_OUT,
    VENDOR_SERVICE, VENDOR_STREAM_CONFIG, VENDOR_STREAM_CONTROL, VENDOR_STREAM_DATA,
};
use crate::control::{ConnParams, ControlFrame, PacketConfig, PnpId};
use crate::engine::Event;
use crate::transport::{
    BondState, CharHandle, DescHandle, DeviceAddress, GattStatus, LinkHost, ServiceInfo,
    TimerKind,
};
use uuid::Uuid;

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Classification of a notifying characteristic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportClass {
    /// Control input report carrying a control frame.
    ControlIn,
    /// One of the fixed legacy audio reports (sequence-checked).
    AudioLegacy(u8),
    /// The dynamically selected audio report or the vendor data
    /// characteristic.
    AudioStream,
    /// Not a report we know; the frame is dropped.
    Unknown(Option<u8>),
}

/// Output of the state machine, drained by the engine after every
/// entry call.
#[derive(Clone, Debug)]
pub(crate) enum LinkSignal {
    Event(Event),
    AudioFeatures(u8),
}

/// The link state machine. Owns the transport; single-writer - all
/// methods must be called from the engine's owner context.
pub struct LinkStateMachine<H: LinkHost> {
    host: H,
    options: LinkOptions,

    state: LinkState,
    address: Option<DeviceAddress>,
    have_handle: bool,
    ready: bool,
    encrypted: bool,
    encryption_polls: u32,
    user_disconnect: bool,

    vendor_profile: bool,
    hid_device: bool,
    pending_profile: bool,
    config_read: bool,

    services: Vec<ServiceInfo>,
    registry: HashMap<CharHandle, u8>,
    config_char: Option<CharHandle>,
    control_write_char: Option<CharHandle>,
    audio_char: Option<CharHandle>,
    audio_report_id: u8,

    features: u8,
    key_layout: u8,
    mtu: i32,
    packet_size: i32,
    connection_interval: i32,
    slave_latency: i32,
    supervision_timeout: i32,
    pnp_id: Option<PnpId>,
    firmware_revision: Option<String>,

    desc_read_queue: VecDeque<(CharHandle, DescHandle)>,
    char_read_queue: VecDeque<CharHandle>,
    desc_write_queue: VecDeque<(DescHandle, [u8; 2])>,
    control_write_queue: VecDeque<Vec<u8>>,

    signals: VecDeque<LinkSignal>,
}

impl<H: LinkHost> LinkStateMachine<H> {
    pub fn new(host: H, options: LinkOptions) -> Self {
        Self {
            host,
            options,
            state: LinkState::Disconnected,
            address: None,
            have_handle: false,
            ready: false,
            encrypted: false,
            encryption_polls: 0,
            user_disconnect: false,
            vendor_profile: false,
            hid_device: false,
            pending_profile: false,
            config_read: false,
            services: Vec::new(),
            registry: HashMap::new(),
            config_char: None,
            control_write_char: None,
            audio_char: None,
            audio_report_id: 0,
            features: 0,
            key_layout: 0,
            mtu: -1,
            packet_size: -1,
            connection_interval: -1,
            slave_latency: -1,
            supervision_timeout: -1,
            pnp_id: None,
            firmware_revision: None,
            desc_read_queue: VecDeque::new(),
            char_read_queue: VecDeque::new(),
            desc_write_queue: VecDeque::new(),
            control_write_queue: VecDeque::new(),
            signals: VecDeque::new(),
        }
    }

    // Public API

    /// Connect to `address`. Reuses a live handle for the same address,
    /// re-announces the ready state when already connected, and defers
    /// behind a pairing request for unbonded devices when auto-pairing
    /// is on.
    pub fn connect(&mut self, address: DeviceAddress) {
        self.user_disconnect = false;

        if self.address == Some(address) && self.have_handle {
            if self.state == LinkState::Connected {
                debug!("already connected to {address}");
                self.on_connection_state(true, GattStatus::Success);
                return;
            }
            debug!("resuming existing transport handle for {address}");
            if self.host.resume() {
                self.state = LinkState::Connecting;
                self.log_state();
                return;
            }
            self.have_handle = false;
        }

        debug!("creating a new connection to {address}");
        self.address = Some(address);
        self.state = LinkState::Connecting;
        self.log_state();

        if (self.options.auto_pair || self.options.auto_system_profile)
            && !self.host.is_bonded(&address)
        {
            debug!("device not paired, bonding first");
            self.host.create_bond(&address);
            return;
        }

        self.host.connect(address);
        self.have_handle = true;
    }

    /// Gracefully disconnect; no reconnect will be scheduled.
    pub fn disconnect(&mut self) {
        self.user_disconnect = true;
        self.host.disconnect();
    }

    /// Release the transport handle and forget the peripheral.
    pub fn close(&mut self) {
        debug!("close");
        self.host.close();
        let was_connected = self.state == LinkState::Connected;
        self.state = LinkState::Disconnected;
        if was_connected {
            self.log_state();
        }
        self.reset_session();
        self.host.cancel(TimerKind::Reconnect);
        self.address = None;
        self.have_handle = false;
    }

    pub fn start_scan(&mut self) {
        self.host.start_scan();
    }

    pub fn stop_scan(&mut self) {
        self.host.stop_scan();
    }

    /// Queue an outbound control write. Dropped unless the link is
    /// connected and ready. Writes go out one at a time, in submission
    /// order.
    pub fn write_control(&mut self, frame: Vec<u8>) {
        if self.state != LinkState::Connected || !self.ready {
            return;
        }
        let Some(characteristic) = self.control_write_char else {
            return;
        };
        self.control_write_queue.push_back(frame);
        if self.control_write_queue.len() == 1 {
            let frame = self.control_write_queue[0].clone();
            debug!("write control: {frame:02x?}");
            self.host.write_characteristic(characteristic, &frame);
        }
    }

    // Getters

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn address(&self) -> Option<DeviceAddress> {
        self.address
    }

    pub fn is_vendor_profile(&self) -> bool {
        self.vendor_profile
    }

    /// Whether the configuration snapshot has been read this session.
    pub fn has_configuration(&self) -> bool {
        self.config_read
    }

    pub fn features(&self) -> u8 {
        self.features
    }

    pub fn key_layout(&self) -> u8 {
        self.key_layout
    }

    pub fn mtu(&self) -> i32 {
        self.mtu
    }

    pub fn packet_size(&self) -> i32 {
        self.packet_size
    }

    pub fn connection_interval(&self) -> i32 {
        self.connection_interval
    }

    pub fn slave_latency(&self) -> i32 {
        self.slave_latency
    }

    pub fn supervision_timeout(&self) -> i32 {
        self.supervision_timeout
    }

    pub fn pnp_id(&self) -> Option<PnpId> {
        self.pnp_id
    }

    pub fn firmware_revision(&self) -> Option<&str> {
        self.firmware_revision.as_deref()
    }

    // Transport event handlers

    pub fn on_connection_state(&mut self, connected: bool, status: GattStatus) {
        info!(
            "connection state change: {}, status {status:?}",
            if connected { "connected" } else { "disconnected" }
        );
        if connected {
            self.host.cancel(TimerKind::Reconnect);
            let was_ready = self.ready;
            self.ready = false; // re-read config before announcing ready again
            self.encrypted = false;
            self.encryption_polls = 0;
            self.state = LinkState::Connected;
            self.have_handle = true;
            self.log_state();
            self.emit(Event::Connected(self.current_address()));
            if !was_ready {
                debug!("starting service discovery");
                self.host.discover_services();
            } else if let Some(config_char) = self.config_char {
                self.char_read_queue.push_back(config_char);
                self.pump_init();
            }
        } else {
            self.clear_queues();
            self.state = LinkState::Disconnected;
            self.ready = false;
            self.log_state();
            let address = self.current_address();
            self.emit(Event::Disconnected(address));
            // Unexpected loss of a bonded device: retry after a delay.
            // An explicit ACL disconnect cancels the attempt.
            if !self.user_disconnect {
                if let Some(address) = self.address {
                    if self.host.is_bonded(&address) {
                        debug!("scheduling reconnect to {address}");
                        self.host.schedule(TimerKind::Reconnect, RECONNECT_DELAY);
                    }
                }
            }
        }
    }

    pub fn on_services_discovered(&mut self, status: GattStatus, services: Vec<ServiceInfo>) {
        if !status.is_success() {
            warn!("service discovery failed: {status:?}");
            return;
        }
        debug!("services discovered");
        self.services = services;
        self.begin_initialization();
        self.emit(Event::ServicesDiscovered(self.current_address()));
    }

    pub fn on_descriptor_read(
        &mut self,
        characteristic: CharHandle,
        _descriptor: DescHandle,
        value: &[u8],
        status: GattStatus,
    ) {
        if status.is_success() {
            self.register_report_reference(characteristic, value);
        } else {
            // A single failed descriptor does not abort initialization.
            warn!("descriptor read failed on {characteristic:?}: {status:?}");
        }
        self.desc_read_queue.pop_front();
        self.pump_init();
    }

    pub fn on_characteristic_read(
        &mut self,
        characteristic: CharHandle,
        uuid: Uuid,
        value: &[u8],
        status: GattStatus,
    ) {
        info!("read {uuid}, id={}, status {status:?}", characteristic.0);
        if status.is_success() {
            let is_config_report = uuid == HID_REPORT_CHAR
                && self.registry.get(&characteristic) == Some(&REPORT_ID_CONTROL_IN);
            if is_config_report || uuid == VENDOR_STREAM_CONFIG {
                debug!("configuration snapshot: {value:02x?}");
                self.process_control_frame(value);
                self.config_read = true;
            } else if uuid == DEVICE_INFO_PNP_ID {
                match PnpId::parse(value) {
                    Some(pnp) => {
                        debug!(
                            "peripheral PnP id: {:04x} {:04x} {:04x}",
                            pnp.vendor, pnp.product, pnp.version
                        );
                        self.pnp_id = Some(pnp);
                    }
                    None => warn!("malformed PnP id characteristic"),
                }
            } else if uuid == DEVICE_INFO_FIRMWARE_REVISION {
                let revision = String::from_utf8_lossy(value).replace("v_", "");
                debug!("peripheral firmware revision: {revision}");
                self.firmware_revision = Some(revision);
            }
        } else {
            warn!("characteristic read failed on {characteristic:?}: {status:?}");
        }
        self.char_read_queue.pop_front();
        self.pump_init();
    }

    pub fn on_descriptor_write(&mut self, descriptor: DescHandle, status: GattStatus) {
        if !status.is_success() {
            warn!("descriptor write failed on {descriptor:?}: {status:?}");
        }
        self.desc_write_queue.pop_front();
        self.pump_init();
    }

    /// Completion of an outbound control write: drop the head entry and
    /// issue the next, preserving submission order.
    pub fn on_write_completed(&mut self, status: GattStatus) {
        debug!("control write completed: {status:?}");
        self.control_write_queue.pop_front();
        if let (Some(characteristic), Some(next)) =
            (self.control_write_char, self.control_write_queue.front())
        {
            let frame = next.clone();
            debug!("write control: {frame:02x?}");
            self.host.write_characteristic(characteristic, &frame);
        }
    }

    /// Control frame received as a notification: process it and relay
    /// the raw bytes to consumers.
    pub fn on_control_notification(&mut self, value: &[u8]) {
        self.process_control_frame(value);
        self.emit(Event::ControlFrame(value.to_vec()));
    }

    pub fn on_bond_state(&mut self, address: DeviceAddress, state: BondState) {
        match state {
            BondState::Bonded => info!("paired with {address}"),
            BondState::None => info!("unpaired from {address}"),
            BondState::Bonding => {}
        }

        // A pairing we initiated ourselves gates the pending connection.
        if (self.options.auto_pair || self.options.auto_system_profile)
            && self.state == LinkState::Connecting
            && self.address == Some(address)
        {
            match state {
                BondState::Bonded => {
                    debug!("device bonded, connecting");
                    self.host.connect(address);
                    self.have_handle = true;
                }
                BondState::None => {
                    error!("pairing failed");
                    self.state = LinkState::Disconnected;
                    self.emit(Event::Disconnected(address));
                }
                BondState::Bonding => {}
            }
        }
    }

    pub fn on_acl_connected(&mut self, address: DeviceAddress) {
        if self.address == Some(address) {
            self.host.schedule(TimerKind::Reconnect, RECONNECT_DELAY);
        }
    }

    pub fn on_acl_disconnected(&mut self, address: DeviceAddress) {
        if self.address == Some(address) {
            self.host.cancel(TimerKind::Reconnect);
        }
    }

    pub fn on_adapter_state(&mut self, powered: bool) {
        if powered {
            info!("radio adapter on");
            return;
        }
        info!("radio adapter off");
        if self.state != LinkState::Disconnected {
            self.emit(Event::Disconnected(self.current_address()));
        }
        let keep_address = self.address; // keep for reconnection
        self.close();
        self.address = keep_address;
    }

    pub fn on_system_profile_state(&mut self, address: DeviceAddress, connected: bool) {
        if !self.options.auto_system_profile {
            return;
        }
        debug!(
            "system input profile {}: {address}",
            if connected { "connected" } else { "disconnected" }
        );
        if connected && self.pending_profile && self.address == Some(address) {
            debug!("pending system profile connection complete");
            self.host
                .schedule(TimerKind::ProfileSettle, PROFILE_SETTLE_DELAY);
        }
    }

    pub fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::InitRetry => self.pump_init(),
            TimerKind::Reconnect => {
                if self.state != LinkState::Disconnected {
                    return;
                }
                if let Some(address) = self.address {
                    debug!("reconnecting to {address}");
                    self.reset_session();
                    self.host.close();
                    self.state = LinkState::Connecting;
                    self.host.connect(address);
                    self.have_handle = true;
                }
            }
            TimerKind::ProfileSettle => {
                if self.pending_profile {
                    self.pending_profile = false;
                    self.host.discover_services();
                }
            }
        }
    }

    // Classification

    /// Map a notifying characteristic to its role.
    pub fn classify(&self, characteristic: CharHandle) -> ReportClass {
        if self.vendor_profile {
            if self.control_write_char == Some(characteristic) {
                return ReportClass::ControlIn;
            }
            if self.audio_char == Some(characteristic) {
                return ReportClass::AudioStream;
            }
            return ReportClass::Unknown(None);
        }
        match self.registry.get(&characteristic) {
            Some(&id) if id == self.audio_report_id && id != 0 => ReportClass::AudioStream,
            Some(&REPORT_ID_CONTROL_IN) => ReportClass::ControlIn,
            Some(&id) if (REPORT_ID_AUDIO_FIRST..=REPORT_ID_AUDIO_LAST).contains(&id) => {
                ReportClass::AudioLegacy(id)
            }
            Some(&id) => ReportClass::Unknown(Some(id)),
            None => ReportClass::Unknown(None),
        }
    }

    pub(crate) fn take_signal(&mut self) -> Option<LinkSignal> {
        self.signals.pop_front()
    }

    #[cfg(test)]
    pub(crate) fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    // Initialization

    fn begin_initialization(&mut self) {
        self.reset_session();
        for service in &self.services {
            debug!("service {}", service.uuid);
        }
        self.hid_device = self.find_service(HID_SERVICE).is_some();

        // Hand the device to the platform input profile first, when
        // configured; discovery restarts once the profile settles.
        if self.options.auto_system_profile
            && self.hid_device
            && self.host.has_system_input_profile()
        {
            if let Some(address) = self.address {
                if self.host.connect_system_input_profile(&address) {
                    debug!("system input profile takeover requested");
                    self.pending_profile = true;
                    return;
                }
            }
        }

        if !self.init_vendor_profile() {
            if !self.hid_device {
                // Mandatory service missing: terminal for this attempt.
                error!("HID service not found");
                self.host.disconnect();
                return;
            }
            debug!("found HID service, initializing");
            let mut references = Vec::new();
            if let Some(service) = self.find_service(HID_SERVICE) {
                for characteristic in &service.characteristics {
                    debug!(
                        "characteristic {} id={}",
                        characteristic.uuid, characteristic.handle.0
                    );
                    if characteristic.uuid != HID_REPORT_CHAR {
                        continue;
                    }
                    if let Some(reference) = characteristic.descriptor(HID_REPORT_REFERENCE) {
                        references.push((characteristic.handle, reference));
                    }
                }
            }
            self.desc_read_queue.extend(references);
        }

        // Device identity
        let mut identity_reads = Vec::new();
        if let Some(service) = self.find_service(DEVICE_INFO_SERVICE) {
            for uuid in [DEVICE_INFO_PNP_ID, DEVICE_INFO_FIRMWARE_REVISION] {
                if let Some(characteristic) = service.characteristic(uuid) {
                    identity_reads.push(characteristic.handle);
                }
            }
        }
        self.char_read_queue.extend(identity_reads);

        self.pump_init();
    }

    fn init_vendor_profile(&mut self) -> bool {
        let Some(service) = self.find_service(VENDOR_SERVICE) else {
            return false;
        };
        debug!("found vendor stream profile, initializing");
        let config = service.characteristic(VENDOR_STREAM_CONFIG).map(|c| c.handle);
        let control = service
            .characteristic(VENDOR_STREAM_CONTROL)
            .map(|c| (c.handle, c.descriptor(CLIENT_CONFIG_DESCRIPTOR)));
        let data = service
            .characteristic(VENDOR_STREAM_DATA)
            .map(|c| (c.handle, c.descriptor(CLIENT_CONFIG_DESCRIPTOR)));
        self.vendor_profile = true;

        match config {
            Some(handle) => {
                self.config_char = Some(handle);
                self.char_read_queue.push_back(handle);
            }
            None => error!("missing vendor profile config characteristic"),
        }

        match control {
            Some((handle, ccc)) => {
                self.host.set_notifications(handle, true);
                if let Some(ccc) = ccc {
                    self.desc_write_queue.push_back((ccc, CCC_NOTIFICATIONS_ENABLE));
                }
                self.control_write_char = Some(handle);
            }
            None => error!("missing vendor profile control characteristic"),
        }

        match data {
            Some((handle, ccc)) => {
                self.host.set_notifications(handle, true);
                if let Some(ccc) = ccc {
                    self.desc_write_queue.push_back((ccc, CCC_NOTIFICATIONS_ENABLE));
                }
                self.audio_char = Some(handle);
            }
            None => error!("missing vendor profile stream data characteristic"),
        }

        true
    }

    /// Issue the next initialization operation, or declare the device
    /// ready once all three queues are empty. Called after every
    /// completion event.
    fn pump_init(&mut self) {
        // Stale completions may arrive after a drop; ready must never
        // be announced off a dead link.
        if self.state != LinkState::Connected {
            return;
        }
        if !self.check_encryption() {
            return;
        }
        if let Some(&(characteristic, descriptor)) = self.desc_read_queue.front() {
            self.host.read_descriptor(characteristic, descriptor);
        } else if let Some(&characteristic) = self.char_read_queue.front() {
            self.host.read_characteristic(characteristic);
        } else if let Some(&(descriptor, value)) = self.desc_write_queue.front() {
            self.host.write_descriptor(descriptor, &value);
        } else if !self.ready {
            self.ready = true;
            info!("device ready");
            self.emit(Event::DeviceReady(self.current_address()));
        }
    }

    /// Initialization runs over an encrypted link. Returns false while
    /// the wait is still pending; after a bounded number of polls the
    /// link is assumed encrypted.
    fn check_encryption(&mut self) -> bool {
        if self.encrypted {
            return true;
        }
        match self.host.is_encrypted() {
            Some(true) => {
                self.encrypted = true;
                true
            }
            Some(false) => {
                self.encryption_polls += 1;
                if self.encryption_polls < ENCRYPTION_POLL_LIMIT {
                    debug!("no encryption yet, delaying init operations");
                    self.host.schedule(TimerKind::InitRetry, ENCRYPTION_POLL);
                    return false;
                }
                warn!("encryption wait timed out, assuming encrypted link");
                self.encrypted = true;
                true
            }
            None => {
                // Security state not reportable: proceed after a grace
                // period.
                self.encrypted = true;
                self.host.schedule(TimerKind::InitRetry, ENCRYPTION_GRACE);
                false
            }
        }
    }

    fn register_report_reference(&mut self, characteristic: CharHandle, value: &[u8]) {
        let (Some(&id), Some(&report_type)) = (value.first(), value.get(1)) else {
            warn!("malformed report reference descriptor: {value:02x?}");
            return;
        };
        debug!(
            "HID report [{}]: id={id}, type={report_type}",
            characteristic.0
        );
        self.registry.insert(characteristic, id);

        let mut set_notify = false;
        match id {
            REPORT_ID_CONTROL_OUT => {
                debug!("found stream control output report");
                self.control_write_char = Some(characteristic);
            }
            REPORT_ID_CONTROL_IN => {
                debug!("found stream control input report");
                self.config_char = Some(characteristic);
                self.char_read_queue.push_back(characteristic); // read configuration
                set_notify = true;
            }
            REPORT_ID_AUDIO_FIRST..=REPORT_ID_AUDIO_LAST => {
                debug!("found stream data audio report {id}");
                set_notify = true;
            }
            _ => {}
        }

        if report_type == HID_REPORT_TYPE_INPUT {
            if set_notify {
                self.host.set_notifications(characteristic, true);
            }
            if self.options.write_report_ccc {
                let ccc = self
                    .find_characteristic(characteristic)
                    .and_then(|c| c.descriptor(CLIENT_CONFIG_DESCRIPTOR));
                if let Some(ccc) = ccc {
                    debug!("queueing client configuration write for report {id}");
                    self.desc_write_queue.push_back((ccc, CCC_NOTIFICATIONS_ENABLE));
                }
            }
        }
    }

    // Control frames

    fn process_control_frame(&mut self, raw: &[u8]) {
        let Some(frame) = ControlFrame::parse(raw) else {
            warn!("truncated control frame dropped ({} bytes)", raw.len());
            return;
        };
        match frame {
            ControlFrame::Config {
                audio_report_id,
                features,
                audio_mode: _,
                key_layout,
                packet,
                conn_params,
            } => {
                self.features = features;
                self.key_layout = key_layout;
                self.signals.push_back(LinkSignal::AudioFeatures(features));
                if features & FEATURE_COMMAND_SUPPORT != 0 {
                    if let Some(packet) = packet {
                        self.apply_packet_config(packet);
                    }
                    if let Some(params) = conn_params {
                        self.apply_conn_params(params);
                    }
                    self.emit_config_update();
                }
                self.set_audio_report(audio_report_id);
            }
            ControlFrame::Stream {
                enable: _,
                audio_report_id,
            } => {
                self.set_audio_report(audio_report_id);
            }
            ControlFrame::Key(raw) => {
                self.emit(Event::KeyReport(raw));
            }
            ControlFrame::StreamError(raw) => {
                debug!("stream error report: {raw:02x?}");
            }
            ControlFrame::AudioMode(mode) => {
                // Legacy report, never used by shipped remotes.
                debug!("legacy set-audio-mode report ignored (mode {mode})");
            }
            ControlFrame::ConnParams(params) => {
                self.apply_conn_params(params);
                self.emit_config_update();
            }
            ControlFrame::Mtu(packet) => {
                self.apply_packet_config(packet);
                self.emit_config_update();
            }
            ControlFrame::Unknown(frame_type) => {
                warn!("unknown control frame type {frame_type}");
            }
        }
    }

    /// Move audio streaming to the report announced by the remote.
    /// Id 0 selects the fixed legacy report trio.
    fn set_audio_report(&mut self, id: u8) {
        if self.vendor_profile || self.audio_report_id == id {
            return;
        }
        self.audio_report_id = id;
        if let Some(previous) = self.audio_char.take() {
            self.host.set_notifications(previous, false);
        }
        if id == 0 {
            debug!("using legacy audio reports");
            return;
        }
        debug!("audio report id {id}");
        let target = self
            .find_service(HID_SERVICE)
            .into_iter()
            .flat_map(|s| &s.characteristics)
            .find(|c| c.uuid == HID_REPORT_CHAR && self.registry.get(&c.handle) == Some(&id))
            .map(|c| c.handle);
        match target {
            Some(handle) => {
                debug!("found audio report characteristic {}", handle.0);
                self.audio_char = Some(handle);
                self.host.set_notifications(handle, true);
            }
            None => {
                error!("audio report characteristic not found");
                self.audio_report_id = 0;
            }
        }
    }

    fn apply_conn_params(&mut self, params: ConnParams) {
        self.connection_interval = i32::from(params.interval);
        self.slave_latency = i32::from(params.latency);
        self.supervision_timeout = i32::from(params.timeout);
    }

    fn apply_packet_config(&mut self, packet: PacketConfig) {
        self.packet_size = i32::from(packet.packet_size);
        self.mtu = i32::from(packet.mtu);
    }

    fn emit_config_update(&mut self) {
        self.emit(Event::ConfigUpdate {
            mtu: self.mtu,
            packet_size: self.packet_size,
            connection_interval: self.connection_interval,
            slave_latency: self.slave_latency,
            supervision_timeout: self.supervision_timeout,
        });
    }

    // Session state

    fn reset_session(&mut self) {
        self.clear_queues();
        self.ready = false;
        self.config_read = false;
        self.vendor_profile = false;
        self.hid_device = false;
        self.pending_profile = false;
        self.key_layout = 0;
        self.features = 0;
        self.packet_size = -1;
        self.mtu = -1;
        self.connection_interval = -1;
        self.slave_latency = -1;
        self.supervision_timeout = -1;
        self.registry.clear();
        self.config_char = None;
        self.control_write_char = None;
        self.audio_report_id = 0;
        self.audio_char = None;
        self.pnp_id = None;
        self.encryption_polls = 0;
    }

    fn clear_queues(&mut self) {
        self.host.cancel(TimerKind::InitRetry);
        self.desc_read_queue.clear();
        self.char_read_queue.clear();
        self.desc_write_queue.clear();
        self.control_write_queue.clear();
    }

    fn find_service(&self, uuid: Uuid) -> Option<&ServiceInfo> {
        self.services.iter().find(|s| s.uuid == uuid)
    }

    fn find_characteristic(&self, handle: CharHandle) -> Option<&crate::transport::CharacteristicInfo> {
        self.services
            .iter()
            .flat_map(|s| &s.characteristics)
            .find(|c| c.handle == handle)
    }

    fn current_address(&self) -> DeviceAddress {
        self.address.unwrap_or_default()
    }

    fn emit(&mut self, event: Event) {
        self.signals.push_back(LinkSignal::Event(event));
    }

    fn log_state(&self) {
        match self.state {
            LinkState::Connecting => info!("connecting..."),
            LinkState::Connected => info!("connected to {}", self.current_address()),
            LinkState::Disconnected => info!("disconnected"),
        }
    }
}
