//! In-memory BLE transport used by the session tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ipowerup_link_lib::config::session_config::SessionConfig;
use ipowerup_link_lib::core::bluetooth::transport::{
    AdvertisementReceiver, GattEndpoints, NotificationReceiver, RadioReceiver, TransportResult,
};
use ipowerup_link_lib::core::bluetooth::{
    Advertisement, BleTransport, DeviceSession, FixedBatteryLevel, RadioState, SessionEvent, TransportError,
};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

#[derive(Default)]
struct FakeState {
    advertisements: Option<mpsc::UnboundedSender<Advertisement<String>>>,
    notifications: Option<mpsc::UnboundedSender<Vec<u8>>>,
    radio: Option<mpsc::UnboundedSender<RadioState>>,
    writes: Vec<Vec<u8>>,
    scans: usize,
    connects: usize,
    disconnects: usize,
    fail_scan: Option<TransportError>,
    fail_connect: bool,
    fail_discovery: bool,
    fail_writes: bool,
}

#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<FakeState>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Delivers an advertisement if a scan is running
    pub fn advertise(&self, id: &str, name: Option<&str>, rssi: Option<i16>) {
        let state = self.state.lock().unwrap();
        if let Some(tx) = &state.advertisements {
            let _ = tx.send(Advertisement {
                id: id.to_string(),
                name: name.map(str::to_string),
                local_name: None,
                rssi,
                peripheral: id.to_string(),
            });
        }
    }

    pub fn notify(&self, payload: &[u8]) {
        let state = self.state.lock().unwrap();
        if let Some(tx) = &state.notifications {
            let _ = tx.send(payload.to_vec());
        }
    }

    /// Simulates the case walking out of range
    pub fn drop_link(&self) {
        self.state.lock().unwrap().notifications = None;
    }

    pub fn set_radio(&self, radio: RadioState) {
        let state = self.state.lock().unwrap();
        if let Some(tx) = &state.radio {
            let _ = tx.send(radio);
        }
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.lock().unwrap().writes.clear();
    }

    pub fn scans(&self) -> usize {
        self.state.lock().unwrap().scans
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().unwrap().disconnects
    }

    pub fn fail_scan_with(&self, error: TransportError) {
        self.state.lock().unwrap().fail_scan = Some(error);
    }

    pub fn fail_connect(&self) {
        self.state.lock().unwrap().fail_connect = true;
    }

    pub fn fail_discovery(&self) {
        self.state.lock().unwrap().fail_discovery = true;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().unwrap().fail_writes = fail;
    }
}

#[async_trait::async_trait]
impl BleTransport for FakeTransport {
    type Peripheral = String;
    type Characteristic = Uuid;

    async fn scan(&self) -> TransportResult<AdvertisementReceiver<String>> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.fail_scan.clone() {
            return Err(error);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.advertisements = Some(tx);
        state.scans += 1;
        Ok(rx)
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        self.state.lock().unwrap().advertisements = None;
        Ok(())
    }

    async fn connect(&self, _peripheral: &String) -> TransportResult<()> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.fail_connect {
            return Err(TransportError::Platform("connection refused".to_string()));
        }
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        _peripheral: &String,
        service: Uuid,
        write: Uuid,
        notify: Uuid,
    ) -> TransportResult<GattEndpoints<Uuid>> {
        if self.state.lock().unwrap().fail_discovery {
            return Err(TransportError::ServiceNotFound(service));
        }
        Ok(GattEndpoints { write, notify })
    }

    async fn write(&self, _characteristic: &Uuid, data: &[u8]) -> TransportResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            return Err(TransportError::Platform("write rejected".to_string()));
        }
        state.writes.push(data.to_vec());
        Ok(())
    }

    async fn subscribe(&self, _peripheral: &String, _characteristic: &Uuid) -> TransportResult<NotificationReceiver> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().notifications = Some(tx);
        Ok(rx)
    }

    async fn disconnect(&self, _peripheral: &String) -> TransportResult<()> {
        let mut state = self.state.lock().unwrap();
        state.disconnects += 1;
        state.notifications = None;
        Ok(())
    }

    async fn radio_events(&self) -> TransportResult<RadioReceiver> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().radio = Some(tx);
        Ok(rx)
    }
}

pub const DEVICE_ID: &str = "AA:BB:CC:DD:EE:01";
pub const DEVICE_NAME: &str = "iPowerUp Uno";
pub const PHONE_BATTERY: f64 = 73.0;

/// Status response: 80 %, all three charge flags set, 25 C, 10 mA solar
pub const STATUS_FIXTURE: [u8; 10] = [0x04, 0x64, 0x00, 0x50, 0x07, 0x19, 0x00, 0x32, 0x0A, 0x00];

pub async fn session_with(transport: &Arc<FakeTransport>, config: SessionConfig) -> DeviceSession<FakeTransport> {
    let session = DeviceSession::new(transport.clone(), config, Arc::new(FixedBatteryLevel(PHONE_BATTERY)));
    session.watch_radio().await.unwrap();
    session
}

/// Waits for the first event matching `predicate`, returning everything seen up to it.
pub async fn wait_for<F>(events: &mut broadcast::Receiver<SessionEvent>, predicate: F) -> Vec<SessionEvent>
where
    F: Fn(&SessionEvent) -> bool,
{
    let mut seen = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            let event = events.recv().await.unwrap();
            let done = predicate(&event);
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await;
    assert!(result.is_ok(), "event never arrived, saw {:?}", seen);
    seen
}

/// Lets spawned tasks run without advancing the paused clock much
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Scans, advertises the case and waits until the session is steady
pub async fn connect_steady(
    transport: &Arc<FakeTransport>,
    session: &DeviceSession<FakeTransport>,
    events: &mut broadcast::Receiver<SessionEvent>,
) {
    session.start_scanning().await.unwrap();
    transport.advertise(DEVICE_ID, Some(DEVICE_NAME), Some(-60));
    wait_for(events, |event| {
        matches!(
            event,
            SessionEvent::StateChanged { to: ipowerup_link_lib::core::bluetooth::SessionState::ConnectedSteady, .. }
        )
    })
    .await;
}
