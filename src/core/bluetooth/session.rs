//! The device session for the iPowerUp case
//! This module owns the whole link lifecycle: discovery, connection,
//! handshake, steady-state polling and teardown.
//!
//! All state lives behind one mutex. Events coming from the transport are
//! queued on a single channel and applied one at a time by a driver task, so
//! transitions never interleave. Each connection attempt gets a new
//! generation number; anything tagged with an older generation is dropped.

use std::sync::{Arc, Weak};

use anyhow::anyhow;
use chrono::Utc;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::session_config::SessionConfig;
use crate::core::bluetooth::commands::{ChargeSource, CommandExecutor, CommandSender, PowerBankCommand};
use crate::core::bluetooth::constants::{
    EVENT_CHANNEL_CAPACITY, UUID_POWER_BANK_NOTIFY_CHAR, UUID_POWER_BANK_SERVICE, UUID_POWER_BANK_WRITE_CHAR,
};
use crate::core::bluetooth::events::{EventEmitter, SessionEvent};
use crate::core::bluetooth::notification::{NotificationHandler, NotificationReport};
use crate::core::bluetooth::poller::{read_phone_battery, PhoneBatterySource, StatusPoller};
use crate::core::bluetooth::scanner::{BluetoothScanner, DeviceRegistry, Discovery, ScanReport};
use crate::core::bluetooth::transport::{Advertisement, BleTransport, TransportError};
use crate::core::bluetooth::types::{
    ConnectedDeviceState, DisconnectReason, DiscoveredDevice, RadioState, SessionState,
};
use crate::core::power_bank::TemperatureUnit;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not connected (session is {state:?})")]
    NotConnected { state: SessionState },
    #[error("bluetooth is powered off")]
    RadioPoweredOff,
    #[error("device not found with ID: {0}")]
    DeviceNotFound(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Inbound events, applied in arrival order by the driver task
enum Signal<P> {
    Scan(ScanReport<P>),
    Notification { generation: u64, report: NotificationReport },
    Radio(RadioState),
    VerificationDeadline { generation: u64 },
}

struct SessionInner<T: BleTransport> {
    state: SessionState,
    radio: RadioState,
    temperature_unit: TemperatureUnit,
    registry: DeviceRegistry<T::Peripheral>,
    scanner: BluetoothScanner,
    /// Device being connected, until its characteristics are ready
    pending: Option<(DiscoveredDevice, T::Peripheral)>,
    connected: Option<ConnectedDeviceState<T::Peripheral, T::Characteristic>>,
    /// Parent of the notification listener and verification deadline of the current link
    link_token: CancellationToken,
    poller: StatusPoller,
    generation: u64,
    /// Set by the first decoded status of the current link
    verified: bool,
}

impl<T: BleTransport> Drop for SessionInner<T> {
    fn drop(&mut self) {
        self.link_token.cancel();
    }
}

struct Shared<T: BleTransport> {
    transport: Arc<T>,
    config: SessionConfig,
    battery: Arc<dyn PhoneBatterySource>,
    emitter: EventEmitter,
    notifications: NotificationHandler,
    signals: mpsc::UnboundedSender<Signal<T::Peripheral>>,
    inner: Mutex<SessionInner<T>>,
}

impl<T: BleTransport> Shared<T> {
    /// Writes one frame on the link identified by `generation`. Fails instead
    /// of writing when that link is gone or the radio is off.
    async fn write_on_link(&self, generation: u64, command: PowerBankCommand) -> Result<(), SessionError> {
        let characteristic = {
            let inner = self.inner.lock().await;
            if inner.radio == RadioState::PoweredOff {
                return Err(SessionError::RadioPoweredOff);
            }
            match &inner.connected {
                Some(connected) if inner.generation == generation && inner.state.is_connected() => {
                    connected.write_characteristic.clone()
                }
                _ => return Err(SessionError::NotConnected { state: inner.state }),
            }
        };

        let frame = command.to_frame();
        debug!("Sending {:?} as {}", command, frame.to_hex());
        if let Err(e) = self.transport.write(&characteristic, frame.as_bytes()).await {
            error!("Failed to write {:?}: {}", command, e);
            self.emitter.emit(SessionEvent::WriteFailed {
                opcode: command.opcode().as_byte(),
                message: e.to_string(),
            });
            return Err(e.into());
        }
        Ok(())
    }
}

/// Command sender bound to one link generation
struct LinkWriter<T: BleTransport> {
    shared: Weak<Shared<T>>,
    generation: u64,
}

impl<T: BleTransport> Clone for LinkWriter<T> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone(), generation: self.generation }
    }
}

#[async_trait::async_trait]
impl<T: BleTransport> CommandSender for LinkWriter<T> {
    async fn send_command(&self, command: PowerBankCommand) -> anyhow::Result<()> {
        let shared = self.shared.upgrade().ok_or_else(|| anyhow!("session has been dropped"))?;
        shared.write_on_link(self.generation, command).await?;
        Ok(())
    }
}

/// The single session with an iPowerUp case.
///
/// Cloning yields another handle to the same session.
pub struct DeviceSession<T: BleTransport> {
    shared: Arc<Shared<T>>,
}

impl<T: BleTransport> Clone for DeviceSession<T> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<T: BleTransport> DeviceSession<T> {
    /// Creates an idle session. Must be called from within a tokio runtime.
    pub fn new(transport: Arc<T>, config: SessionConfig, battery: Arc<dyn PhoneBatterySource>) -> Self {
        let emitter = EventEmitter::new(EVENT_CHANNEL_CAPACITY);
        let (signals, signal_rx) = mpsc::unbounded_channel();

        let inner = SessionInner {
            state: SessionState::Idle,
            radio: RadioState::Unknown,
            temperature_unit: config.temperature_unit,
            registry: DeviceRegistry::new(),
            scanner: BluetoothScanner::new(),
            pending: None,
            connected: None,
            link_token: CancellationToken::new(),
            poller: StatusPoller::new(config.poll_interval(), config.fallback_phone_battery_percent),
            generation: 0,
            verified: false,
        };

        let shared = Arc::new(Shared {
            transport,
            config,
            battery,
            notifications: NotificationHandler::new(emitter.clone()),
            emitter,
            signals,
            inner: Mutex::new(inner),
        });

        tokio::spawn(Self::drive(Arc::downgrade(&shared), signal_rx));
        Self { shared }
    }

    async fn drive(shared: Weak<Shared<T>>, mut signals: mpsc::UnboundedReceiver<Signal<T::Peripheral>>) {
        while let Some(signal) = signals.recv().await {
            let Some(shared) = shared.upgrade() else { break };
            DeviceSession { shared }.handle_signal(signal).await;
        }
        debug!("Session driver stopped");
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.emitter.subscribe()
    }

    pub async fn state(&self) -> SessionState {
        self.shared.inner.lock().await.state
    }

    pub async fn radio_state(&self) -> RadioState {
        self.shared.inner.lock().await.radio
    }

    /// True once a status has been decoded on the current link
    pub async fn is_verified(&self) -> bool {
        self.shared.inner.lock().await.verified
    }

    pub async fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.shared.inner.lock().await.registry.devices()
    }

    /// The device the session is connected to, as last seen while scanning
    pub async fn connected_device(&self) -> Option<DiscoveredDevice> {
        let inner = self.shared.inner.lock().await;
        let connected = inner.connected.as_ref()?;
        inner.registry.get(&connected.device_id).map(|(device, _)| device)
    }

    /// Returns the ID of the currently connected device
    pub async fn connected_device_id(&self) -> Option<String> {
        let inner = self.shared.inner.lock().await;
        inner.connected.as_ref().map(|state| state.device_id.clone())
    }

    /// Returns the name of the currently connected device.
    pub async fn connected_device_name(&self) -> Option<String> {
        let inner = self.shared.inner.lock().await;
        inner.connected.as_ref().map(|state| state.name.clone())
    }

    /// Applies to every status decoded from now on
    pub async fn set_temperature_unit(&self, unit: TemperatureUnit) {
        self.shared.inner.lock().await.temperature_unit = unit;
        info!("Temperature unit set to {:?}", unit);
    }

    /// Starts following the radio power state reported by the transport
    pub async fn watch_radio(&self) -> Result<(), SessionError> {
        let mut radio_events = self.shared.transport.radio_events().await?;
        let signals = self.shared.signals.clone();
        tokio::spawn(async move {
            while let Some(state) = radio_events.recv().await {
                if signals.send(Signal::Radio(state)).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    /// Clears the device list and starts scanning. Ignored unless idle.
    pub async fn start_scanning(&self) -> Result<(), SessionError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state != SessionState::Idle {
            debug!("Ignoring scan request in state {:?}", inner.state);
            return Ok(());
        }
        if inner.radio == RadioState::PoweredOff {
            return Err(SessionError::RadioPoweredOff);
        }

        inner.registry.clear();
        let advertisements = match self.shared.transport.scan().await {
            Ok(advertisements) => advertisements,
            Err(e) => {
                error!("Failed to start scan: {}", e);
                self.emit(match &e {
                    TransportError::PermissionDenied(message) => SessionEvent::PermissionError { message: message.clone() },
                    other => SessionEvent::ScanError { message: other.to_string() },
                });
                return Err(e.into());
            }
        };

        let signals = self.shared.signals.clone();
        inner.scanner.start(advertisements, move |report| {
            let _ = signals.send(Signal::Scan(report));
        });
        self.transition(&mut inner, SessionState::Scanning);
        self.emit(SessionEvent::ScanStarted);
        Ok(())
    }

    pub async fn stop_scanning(&self) -> Result<(), SessionError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state != SessionState::Scanning {
            debug!("Ignoring stop-scan request in state {:?}", inner.state);
            return Ok(());
        }
        self.halt_scan(&mut inner).await;
        self.transition(&mut inner, SessionState::Idle);
        Ok(())
    }

    /// Connects to a discovered device. Ignored while a link is being set up or is up.
    pub async fn connect_to_device(&self, device_id: &str) -> Result<(), SessionError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state.is_busy_with_link() {
            info!("Ignoring connect to {} in state {:?}", device_id, inner.state);
            return Ok(());
        }
        self.begin_connect(&mut inner, device_id).await
    }

    /// Disconnects from any state. Safe to call repeatedly.
    pub async fn disconnect_device(&self) -> Result<(), SessionError> {
        self.teardown(None, DisconnectReason::Requested).await;
        Ok(())
    }

    pub async fn enable_phone_charging(&self) -> Result<(), SessionError> {
        self.send_user_command(PowerBankCommand::EnablePhoneCharging).await
    }

    pub async fn stop_charging(&self) -> Result<(), SessionError> {
        self.send_user_command(PowerBankCommand::StopCharging).await
    }

    pub async fn query_power_bank_status(&self) -> Result<(), SessionError> {
        let phone_battery_percent = self.phone_battery_percent().await;
        self.send_user_command(PowerBankCommand::QueryStatus { phone_battery_percent })
            .await
    }

    pub async fn query_charger_config_status(&self) -> Result<(), SessionError> {
        self.send_user_command(PowerBankCommand::QueryChargerConfig).await
    }

    pub async fn query_charging_history(&self, source: ChargeSource) -> Result<(), SessionError> {
        self.send_user_command(PowerBankCommand::ChargingHistory(source)).await
    }

    pub async fn query_today_status(&self) -> Result<(), SessionError> {
        self.send_user_command(PowerBankCommand::TodayStatus).await
    }

    async fn send_user_command(&self, command: PowerBankCommand) -> Result<(), SessionError> {
        let generation = {
            let inner = self.shared.inner.lock().await;
            if inner.state != SessionState::ConnectedSteady {
                warn!("Rejecting {:?}: session is {:?}", command, inner.state);
                return Err(SessionError::NotConnected { state: inner.state });
            }
            inner.generation
        };
        self.shared.write_on_link(generation, command).await
    }

    async fn phone_battery_percent(&self) -> f64 {
        read_phone_battery(self.shared.battery.as_ref(), self.shared.config.fallback_phone_battery_percent).await
    }

    fn emit(&self, event: SessionEvent) {
        self.shared.emitter.emit(event);
    }

    fn transition(&self, inner: &mut SessionInner<T>, to: SessionState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        info!("Session state {:?} -> {:?}", from, to);
        self.emit(SessionEvent::StateChanged { from, to });
    }

    async fn halt_scan(&self, inner: &mut SessionInner<T>) {
        inner.scanner.stop();
        if let Err(e) = self.shared.transport.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        self.emit(SessionEvent::ScanStopped);
    }

    async fn begin_connect(&self, inner: &mut SessionInner<T>, device_id: &str) -> Result<(), SessionError> {
        if inner.radio == RadioState::PoweredOff {
            return Err(SessionError::RadioPoweredOff);
        }
        let (device, peripheral) = inner
            .registry
            .get(device_id)
            .ok_or_else(|| SessionError::DeviceNotFound(device_id.to_string()))?;

        // Scanning and connecting never overlap on the radio.
        if inner.state == SessionState::Scanning {
            self.halt_scan(inner).await;
        }

        inner.generation += 1;
        let generation = inner.generation;
        inner.pending = Some((device.clone(), peripheral.clone()));
        self.transition(inner, SessionState::Connecting);
        info!("Connecting to {} ({})", device.name, device.id);

        tokio::spawn(self.clone().run_connect(generation, device, peripheral));
        Ok(())
    }

    async fn run_connect(self, generation: u64, device: DiscoveredDevice, peripheral: T::Peripheral) {
        let transport = self.shared.transport.clone();

        if let Err(e) = transport.connect(&peripheral).await {
            error!("Connection to {} failed: {}", device.id, e);
            let mut inner = self.shared.inner.lock().await;
            if inner.generation == generation {
                inner.pending = None;
                self.transition(&mut inner, SessionState::Idle);
                self.emit(SessionEvent::ConnectionFailed {
                    device_id: device.id.clone(),
                    message: e.to_string(),
                });
            }
            return;
        }

        {
            let mut inner = self.shared.inner.lock().await;
            if inner.generation != generation {
                drop(inner);
                self.abandon(&peripheral).await;
                return;
            }
            self.transition(&mut inner, SessionState::ConnectedAwaitingHandshake);
            self.emit(SessionEvent::Connected {
                device_id: device.id.clone(),
                name: device.name.clone(),
            });
        }

        let endpoints = match transport
            .discover_characteristics(
                &peripheral,
                UUID_POWER_BANK_SERVICE,
                UUID_POWER_BANK_WRITE_CHAR,
                UUID_POWER_BANK_NOTIFY_CHAR,
            )
            .await
        {
            Ok(endpoints) => endpoints,
            Err(e) => return self.abort_setup(generation, &device, e).await,
        };
        let notifications = match transport.subscribe(&peripheral, &endpoints.notify).await {
            Ok(notifications) => notifications,
            Err(e) => return self.abort_setup(generation, &device, e).await,
        };

        let writer = {
            let mut inner = self.shared.inner.lock().await;
            if inner.generation != generation {
                drop(inner);
                self.abandon(&peripheral).await;
                return;
            }
            let signals = self.shared.signals.clone();
            NotificationHandler::spawn_listener(notifications, inner.link_token.child_token(), move |report| {
                let _ = signals.send(Signal::Notification { generation, report });
            });
            inner.pending = None;
            inner.connected = Some(ConnectedDeviceState {
                device_id: device.id.clone(),
                name: device.name.clone(),
                peripheral,
                write_characteristic: endpoints.write,
                notify_characteristic: endpoints.notify,
            });
            LinkWriter { shared: Arc::downgrade(&self.shared), generation }
        };

        let phone_battery_percent = self.phone_battery_percent().await;
        let command_executor = CommandExecutor::new(writer.clone());
        if let Err(e) = command_executor
            .perform_handshake(self.shared.config.handshake_settle(), phone_battery_percent)
            .await
        {
            // No retry here; the poller keeps asking for status.
            warn!("Handshake with {} incomplete: {}", device.id, e);
        }

        let mut inner = self.shared.inner.lock().await;
        if inner.generation != generation || inner.state != SessionState::ConnectedAwaitingHandshake {
            return;
        }
        self.transition(&mut inner, SessionState::ConnectedSteady);
        inner.poller.start(writer, self.shared.battery.clone());

        if let Some(timeout) = self.shared.config.verification_timeout() {
            let signals = self.shared.signals.clone();
            let cancel_token = inner.link_token.child_token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        let _ = signals.send(Signal::VerificationDeadline { generation });
                    }
                    _ = cancel_token.cancelled() => {}
                }
            });
        }
        info!("Session with {} is steady", device.id);
    }

    /// Characteristic discovery or subscription failed on a fresh link
    async fn abort_setup(&self, generation: u64, device: &DiscoveredDevice, error: TransportError) {
        error!("Setting up {} failed: {}", device.id, error);
        {
            let inner = self.shared.inner.lock().await;
            if inner.generation != generation {
                return;
            }
            self.emit(SessionEvent::ConnectionFailed {
                device_id: device.id.clone(),
                message: error.to_string(),
            });
        }
        self.teardown(Some(generation), DisconnectReason::SetupFailed { detail: error.to_string() })
            .await;
    }

    /// Drops a link whose attempt was superseded while it was being set up
    async fn abandon(&self, peripheral: &T::Peripheral) {
        debug!("Connection attempt superseded, releasing peripheral");
        if let Err(e) = self.shared.transport.disconnect(peripheral).await {
            warn!("Failed to release superseded connection: {}", e);
        }
    }

    /// Returns the session to idle. With `expected_generation`, only acts if
    /// that link is still the current one.
    async fn teardown(&self, expected_generation: Option<u64>, reason: DisconnectReason) {
        let peripheral = {
            let mut inner = self.shared.inner.lock().await;
            if expected_generation.is_some_and(|generation| generation != inner.generation) {
                debug!("Ignoring teardown of a stale link ({:?})", reason);
                return;
            }
            match inner.state {
                SessionState::Idle | SessionState::Disconnecting => return,
                SessionState::Scanning => {
                    self.halt_scan(&mut inner).await;
                    self.transition(&mut inner, SessionState::Idle);
                    return;
                }
                SessionState::Connecting
                | SessionState::ConnectedAwaitingHandshake
                | SessionState::ConnectedSteady => {}
            }

            info!("Tearing down session: {:?}", reason);
            inner.generation += 1;
            self.transition(&mut inner, SessionState::Disconnecting);
            inner.poller.stop();
            inner.link_token.cancel();
            inner.link_token = CancellationToken::new();
            inner.verified = false;

            let connected = inner.connected.take().map(|state| state.peripheral);
            let pending = inner.pending.take().map(|(_, peripheral)| peripheral);
            info!("Connected state cleared, releasing device and characteristic objects.");
            connected.or(pending)
        };

        if let Some(peripheral) = peripheral {
            if let Err(e) = self.shared.transport.disconnect(&peripheral).await {
                warn!("Disconnect reported an error: {}", e);
            }
        }

        let mut inner = self.shared.inner.lock().await;
        self.transition(&mut inner, SessionState::Idle);
        self.emit(SessionEvent::Disconnected { reason });
    }

    async fn handle_signal(&self, signal: Signal<T::Peripheral>) {
        match signal {
            Signal::Scan(ScanReport::Advertisement { epoch, advertisement }) => {
                self.on_advertisement(epoch, advertisement).await
            }
            Signal::Scan(ScanReport::Finished { epoch }) => self.on_scan_finished(epoch).await,
            Signal::Notification { generation, report: NotificationReport::Payload(payload) } => {
                self.on_notification(generation, payload).await
            }
            Signal::Notification { generation, report: NotificationReport::Closed } => {
                let reason = DisconnectReason::LinkLost { detail: "notification channel closed".to_string() };
                self.teardown(Some(generation), reason).await
            }
            Signal::Radio(state) => self.on_radio_state(state).await,
            Signal::VerificationDeadline { generation } => self.on_verification_deadline(generation).await,
        }
    }

    async fn on_advertisement(&self, epoch: u64, advertisement: Advertisement<T::Peripheral>) {
        let mut inner = self.shared.inner.lock().await;
        if inner.state != SessionState::Scanning || epoch != inner.scanner.epoch() {
            return;
        }

        match inner.registry.observe(advertisement, Utc::now()) {
            None => {}
            Some(Discovery::Updated(device)) => self.emit(SessionEvent::DeviceUpdated(device)),
            Some(Discovery::Found(device)) => {
                let device_id = device.id.clone();
                self.emit(SessionEvent::DeviceFound(device));
                if self.shared.config.auto_connect {
                    if let Err(e) = self.begin_connect(&mut inner, &device_id).await {
                        warn!("Auto-connect to {} failed: {}", device_id, e);
                    }
                }
            }
        }
    }

    async fn on_scan_finished(&self, epoch: u64) {
        let mut inner = self.shared.inner.lock().await;
        if inner.state != SessionState::Scanning || epoch != inner.scanner.epoch() {
            return;
        }
        info!("Scan ended by the platform");
        inner.scanner.stop();
        self.transition(&mut inner, SessionState::Idle);
        self.emit(SessionEvent::ScanStopped);
    }

    async fn on_notification(&self, generation: u64, payload: Vec<u8>) {
        let mut inner = self.shared.inner.lock().await;
        if generation != inner.generation || inner.connected.is_none() {
            debug!("Discarding notification from a stale link: {}", hex::encode(&payload));
            return;
        }

        let unit = inner.temperature_unit;
        if self.shared.notifications.handle_payload(&payload, unit).is_some() && !inner.verified {
            inner.verified = true;
            info!("Connection verified by first status response");
            self.emit(SessionEvent::ConnectionVerified);
        }
    }

    async fn on_radio_state(&self, state: RadioState) {
        let mut inner = self.shared.inner.lock().await;
        if inner.radio == state {
            return;
        }
        inner.radio = state;
        info!("Bluetooth radio is now {:?}", state);
        self.emit(SessionEvent::BluetoothStateChanged { state });
    }

    async fn on_verification_deadline(&self, generation: u64) {
        {
            let inner = self.shared.inner.lock().await;
            if generation != inner.generation || inner.verified || !inner.state.is_connected() {
                return;
            }
        }
        warn!("No status received from the case in time, dropping the link");
        self.emit(SessionEvent::VerificationTimedOut);
        self.teardown(Some(generation), DisconnectReason::VerificationTimeout).await;
    }
}
