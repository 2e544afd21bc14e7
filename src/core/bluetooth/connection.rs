//! Bluetooth connection handling for the iPowerUp case
//! This module implements [`BleTransport`] on top of bluest: scanning,
//! connecting, characteristic discovery, writes and notifications.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bluest::error::ErrorKind;
use bluest::{Adapter, AdapterEvent, Characteristic, ConnectionEvent, Device, Uuid};
use futures_util::{stream, Stream, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::constants::ADAPTER_READY_TIMEOUT_MS;

use crate::core::bluetooth::transport::{
    Advertisement, AdvertisementReceiver, BleTransport, GattEndpoints, NotificationReceiver, RadioReceiver,
    TransportError, TransportResult,
};
use crate::core::bluetooth::types::RadioState;

impl From<bluest::Error> for TransportError {
    fn from(err: bluest::Error) -> Self {
        match err.kind() {
            ErrorKind::NotAuthorized => Self::PermissionDenied(err.to_string()),
            ErrorKind::AdapterUnavailable => Self::AdapterUnavailable,
            _ => Self::Platform(err.to_string()),
        }
    }
}

/// Platform transport backed by the default bluest adapter
pub struct BluestTransport {
    adapter: Adapter,
    scan_token: Mutex<Option<CancellationToken>>,
    /// Parent of every notification forwarding task of the current link
    link_token: Mutex<CancellationToken>,
}

impl BluestTransport {
    /// Opens the default adapter. The radio may still be off; that shows up
    /// through [`BleTransport::radio_events`].
    pub async fn new() -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        info!("Bluetooth adapter opened.");

        Ok(Self {
            adapter,
            scan_token: Mutex::new(None),
            link_token: Mutex::new(CancellationToken::new()),
        })
    }

    fn task_gone() -> TransportError {
        TransportError::Platform("bluetooth task ended unexpectedly".to_string())
    }
}

/// Waits for the adapter to report itself ready, giving up after `timeout`.
async fn await_adapter_ready<F>(ready: F, timeout: Duration) -> TransportResult<()>
where
    F: Future<Output = std::result::Result<(), bluest::Error>>,
{
    match tokio::time::timeout(timeout, ready).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            warn!("Bluetooth adapter not ready after {:?}", timeout);
            Err(TransportError::AdapterUnavailable)
        }
    }
}

/// Forwards notification payloads to `tx` until the stream ends or errors, the
/// device reports a disconnect, or `cancel_token` fires. Returning drops `tx`,
/// which is how the session learns the link is gone.
async fn pump_notifications<N, C, E>(
    mut notifications: N,
    mut connection_events: C,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    cancel_token: CancellationToken,
) where
    N: Stream<Item = std::result::Result<Vec<u8>, E>> + Unpin,
    C: Stream<Item = ConnectionEvent> + Unpin,
    E: Display,
{
    let mut watching_link = true;
    loop {
        tokio::select! {
            result = notifications.next() => {
                match result {
                    Some(Ok(value)) => {
                        debug!("RX: {}", hex::encode(&value));
                        if tx.send(value).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error!("Error in notification stream: {}", e);
                        break;
                    }
                    None => break,
                }
            }
            event = connection_events.next(), if watching_link => {
                match event {
                    Some(ConnectionEvent::Disconnected) => {
                        warn!("Device reported a disconnect");
                        break;
                    }
                    Some(_) => {}
                    // Platform stopped reporting; rely on the notification stream alone.
                    None => watching_link = false,
                }
            }
            _ = cancel_token.cancelled() => break,
        }
    }
    info!("Notification stream ended");
}

#[async_trait::async_trait]
impl BleTransport for BluestTransport {
    type Peripheral = Device;
    type Characteristic = Characteristic;

    async fn scan(&self) -> TransportResult<AdvertisementReceiver<Device>> {
        await_adapter_ready(self.adapter.wait_available(), Duration::from_millis(ADAPTER_READY_TIMEOUT_MS)).await?;

        let cancel_token = CancellationToken::new();
        if let Some(previous) = self.scan_token.lock().await.replace(cancel_token.clone()) {
            previous.cancel();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (started_tx, started_rx) = oneshot::channel();
        let adapter = self.adapter.clone();

        tokio::spawn(async move {
            let mut scan_stream = match adapter.scan(&[]).await {
                Ok(stream) => {
                    let _ = started_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = started_tx.send(Err(TransportError::from(e)));
                    return;
                }
            };
            info!("Starting bluetooth scan");

            loop {
                tokio::select! {
                    result = scan_stream.next() => {
                        match result {
                            Some(discovered_device) => {
                                let device = discovered_device.device;
                                debug!("Found device - Device: {:?}, RSSI: {:?}", device, discovered_device.rssi);
                                let advertisement = Advertisement {
                                    id: device.id().to_string(),
                                    name: device.name().ok(),
                                    local_name: discovered_device.adv_data.local_name,
                                    rssi: discovered_device.rssi,
                                    peripheral: device,
                                };
                                if tx.send(advertisement).is_err() {
                                    break;
                                }
                            }
                            None => {
                                info!("Bluetooth scan stream has ended.");
                                break;
                            }
                        }
                    }
                    _ = cancel_token.cancelled() => {
                        info!("Bluetooth scan cancelled.");
                        break;
                    }
                }
            }
        });

        started_rx.await.map_err(|_| Self::task_gone())??;
        Ok(rx)
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        if let Some(cancel_token) = self.scan_token.lock().await.take() {
            info!("Stopping Bluetooth scan.");
            cancel_token.cancel();
        }
        Ok(())
    }

    async fn connect(&self, device: &Device) -> TransportResult<()> {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        info!("Device details - ID: {}, Name: {:?}", device.id(), name);

        if !device.is_connected().await {
            info!("Initiating connection to {}...", device.id());
            self.adapter.connect_device(device).await?;
        }
        info!("Connection successful");
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        device: &Device,
        service_uuid: Uuid,
        write_char_uuid: Uuid,
        notify_char_uuid: Uuid,
    ) -> TransportResult<GattEndpoints<Characteristic>> {
        info!("Discovering services...");
        let service = device
            .discover_services_with_uuid(service_uuid)
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::ServiceNotFound(service_uuid))?;
        info!("Found power bank service: {}", service.uuid());

        let write = service
            .discover_characteristics_with_uuid(write_char_uuid)
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::CharacteristicNotFound(write_char_uuid))?;
        info!("Found write characteristic: {}", write.uuid());

        let notify = service
            .discover_characteristics_with_uuid(notify_char_uuid)
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::CharacteristicNotFound(notify_char_uuid))?;
        info!("Found notification characteristic: {}", notify.uuid());

        Ok(GattEndpoints { write, notify })
    }

    async fn write(&self, characteristic: &Characteristic, data: &[u8]) -> TransportResult<()> {
        debug!("TX {}: {}", characteristic.uuid(), hex::encode(data));
        characteristic.write(data).await?;
        Ok(())
    }

    async fn subscribe(&self, device: &Device, characteristic: &Characteristic) -> TransportResult<NotificationReceiver> {
        info!("Subscribing to notifications...");
        let cancel_token = self.link_token.lock().await.child_token();
        let adapter = self.adapter.clone();
        let device = device.clone();
        let notify_char = characteristic.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(async move {
            let notification_stream = match notify_char.notify().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    error!("Failed to subscribe to notifications: {}", e);
                    let _ = ready_tx.send(Err(TransportError::from(e)));
                    return;
                }
            };

            let connection_events = match adapter.device_connection_events(&device).await {
                Ok(events) => events.boxed(),
                Err(e) => {
                    warn!("Connection events unavailable for {}: {}", device.id(), e);
                    stream::empty().boxed()
                }
            };

            info!("Listening for power bank notifications...");
            pump_notifications(notification_stream, connection_events, tx, cancel_token).await;
        });

        ready_rx.await.map_err(|_| Self::task_gone())??;
        Ok(rx)
    }

    async fn disconnect(&self, device: &Device) -> TransportResult<()> {
        {
            let mut link_token = self.link_token.lock().await;
            link_token.cancel();
            *link_token = CancellationToken::new();
        }

        if device.is_connected().await {
            info!("Disconnecting from device {}", device.id());
            self.adapter.disconnect_device(device).await?;
            info!("Successfully disconnected");
        } else {
            info!("Device {} not connected", device.id());
        }
        Ok(())
    }

    async fn radio_events(&self) -> TransportResult<RadioReceiver> {
        let adapter = self.adapter.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => {
                    let _ = ready_tx.send(Ok(()));
                    events
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(TransportError::from(e)));
                    return;
                }
            };

            while let Some(event) = events.next().await {
                let state = match event {
                    Ok(AdapterEvent::Available) => RadioState::PoweredOn,
                    Ok(AdapterEvent::Unavailable) => RadioState::PoweredOff,
                    Err(e) => {
                        warn!("Adapter event error: {}", e);
                        continue;
                    }
                };
                if tx.send(state).is_err() {
                    break;
                }
            }
            info!("Adapter event stream ended");
        });

        ready_rx.await.map_err(|_| Self::task_gone())??;
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disconnect_event_closes_the_notification_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifications = stream::pending::<std::result::Result<Vec<u8>, String>>();
        let connection_events = stream::iter(vec![ConnectionEvent::Disconnected]);

        pump_notifications(notifications, connection_events, tx, CancellationToken::new()).await;
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connection_events_leave_notifications_flowing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifications = stream::iter(vec![Ok::<_, String>(vec![0x04, 0x64])]).chain(stream::pending());
        let cancel_token = CancellationToken::new();
        let pump = tokio::spawn(pump_notifications(notifications, stream::empty(), tx, cancel_token.clone()));

        assert_eq!(rx.recv().await, Some(vec![0x04, 0x64]));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!pump.is_finished());

        cancel_token.cancel();
        pump.await.unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn adapter_that_never_becomes_ready_times_out() {
        let result = await_adapter_ready(std::future::pending(), Duration::from_secs(5)).await;
        assert_eq!(result, Err(TransportError::AdapterUnavailable));

        let result = await_adapter_ready(async { Ok(()) }, Duration::from_secs(5)).await;
        assert_eq!(result, Ok(()));
    }
}
