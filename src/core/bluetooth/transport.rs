//! The narrow capability the session needs from a platform BLE stack.
//!
//! The session never talks to a radio directly. Platform adapters (the
//! bluest one in [`connection`](super::connection), or an in-memory fake in
//! tests) implement [`BleTransport`] and hand events back over channels.

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::types::RadioState;

/// One advertisement seen during a scan
#[derive(Debug, Clone)]
pub struct Advertisement<P> {
    pub id: String,
    /// Name reported by the platform for the device
    pub name: Option<String>,
    /// Local name carried in the advertising payload
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
    pub peripheral: P,
}

/// The write/notify characteristic pair of the power bank service
#[derive(Debug, Clone)]
pub struct GattEndpoints<C> {
    pub write: C,
    pub notify: C,
}

pub type AdvertisementReceiver<P> = mpsc::UnboundedReceiver<Advertisement<P>>;
/// Closed by the transport when the link drops
pub type NotificationReceiver = mpsc::UnboundedReceiver<Vec<u8>>;
pub type RadioReceiver = mpsc::UnboundedReceiver<RadioState>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("bluetooth permission denied: {0}")]
    PermissionDenied(String),
    #[error("bluetooth adapter unavailable")]
    AdapterUnavailable,
    #[error("service not found: {0}")]
    ServiceNotFound(Uuid),
    #[error("characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),
    #[error("{0}")]
    Platform(String),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

#[async_trait::async_trait]
pub trait BleTransport: Send + Sync + 'static {
    /// Handle identifying a peripheral for connect/disconnect
    type Peripheral: Clone + Send + Sync + 'static;
    /// Handle to a GATT characteristic
    type Characteristic: Clone + Send + Sync + 'static;

    /// Starts scanning. Advertisements arrive unfiltered on the receiver.
    async fn scan(&self) -> TransportResult<AdvertisementReceiver<Self::Peripheral>>;

    async fn stop_scan(&self) -> TransportResult<()>;

    async fn connect(&self, peripheral: &Self::Peripheral) -> TransportResult<()>;

    async fn discover_characteristics(
        &self,
        peripheral: &Self::Peripheral,
        service: Uuid,
        write: Uuid,
        notify: Uuid,
    ) -> TransportResult<GattEndpoints<Self::Characteristic>>;

    async fn write(&self, characteristic: &Self::Characteristic, data: &[u8]) -> TransportResult<()>;

    /// Notifications from `characteristic`. The receiver closes when the
    /// transport sees `peripheral` disconnect.
    async fn subscribe(
        &self,
        peripheral: &Self::Peripheral,
        characteristic: &Self::Characteristic,
    ) -> TransportResult<NotificationReceiver>;

    async fn disconnect(&self, peripheral: &Self::Peripheral) -> TransportResult<()>;

    /// Radio power changes, starting with the current state when known
    async fn radio_events(&self) -> TransportResult<RadioReceiver>;
}
