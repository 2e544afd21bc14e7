//! Discovery of iPowerUp cases.
//! Filters advertisements by exact name and keeps one entry per device id.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::{debug, info};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::constants::DEVICE_NAME;
use crate::core::bluetooth::transport::{Advertisement, AdvertisementReceiver};
use crate::core::bluetooth::types::DiscoveredDevice;

/// Name used for matching: the platform name if present, else the advertised local name
pub fn resolve_name<P>(advertisement: &Advertisement<P>) -> Option<&str> {
    advertisement
        .name
        .as_deref()
        .filter(|name| !name.is_empty())
        .or_else(|| advertisement.local_name.as_deref().filter(|name| !name.is_empty()))
}

/// Returns true if this advertisement belongs to an iPowerUp case
pub fn is_power_bank<P>(advertisement: &Advertisement<P>) -> bool {
    resolve_name(advertisement) == Some(DEVICE_NAME)
}

/// Outcome of feeding an advertisement into the registry
#[derive(Debug, Clone, PartialEq)]
pub enum Discovery {
    Found(DiscoveredDevice),
    Updated(DiscoveredDevice),
}

/// Devices seen during the current scan session, keyed by platform id
pub struct DeviceRegistry<P> {
    devices: HashMap<String, (DiscoveredDevice, P)>,
}

impl<P: Clone> DeviceRegistry<P> {
    pub fn new() -> Self {
        Self { devices: HashMap::new() }
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    /// Records an advertisement. Non-matching advertisements yield `None`.
    pub fn observe(&mut self, advertisement: Advertisement<P>, now: DateTime<Utc>) -> Option<Discovery> {
        if !is_power_bank(&advertisement) {
            return None;
        }

        if let Some((device, peripheral)) = self.devices.get_mut(&advertisement.id) {
            if let Some(rssi) = advertisement.rssi {
                device.signal_strength = Some(rssi);
            }
            device.last_seen = now;
            *peripheral = advertisement.peripheral;
            return Some(Discovery::Updated(device.clone()));
        }

        let device = DiscoveredDevice {
            id: advertisement.id.clone(),
            name: DEVICE_NAME.to_string(),
            signal_strength: advertisement.rssi,
            last_seen: now,
        };
        info!(
            "Found iPowerUp device: ID: {}, RSSI: {:?}",
            device.id, advertisement.rssi
        );
        self.devices
            .insert(advertisement.id, (device.clone(), advertisement.peripheral));
        Some(Discovery::Found(device))
    }

    pub fn get(&self, id: &str) -> Option<(DiscoveredDevice, P)> {
        self.devices.get(id).cloned()
    }

    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        let mut devices: Vec<_> = self.devices.values().map(|(device, _)| device.clone()).collect();
        // Devices with no RSSI yet sort last.
        devices.sort_by(|a, b| b.signal_strength.cmp(&a.signal_strength));
        devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl<P: Clone> Default for DeviceRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// What the scan task reports back
#[derive(Debug)]
pub enum ScanReport<P> {
    Advertisement { epoch: u64, advertisement: Advertisement<P> },
    Finished { epoch: u64 },
}

/// Owns the task that drains the transport's advertisement channel
pub struct BluetoothScanner {
    cancel_token: CancellationToken,
    scan_task_handle: Option<JoinHandle<()>>,
    epoch: u64,
}

impl BluetoothScanner {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            scan_task_handle: None,
            epoch: 0,
        }
    }

    /// Identifies the current scan; reports from older scans carry a smaller epoch
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_running(&self) -> bool {
        self.scan_task_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Starts forwarding advertisements to `report`. Any previous scan task is cancelled.
    pub fn start<P, F>(&mut self, mut advertisements: AdvertisementReceiver<P>, report: F) -> u64
    where
        P: Send + 'static,
        F: Fn(ScanReport<P>) + Send + 'static,
    {
        self.stop();
        self.epoch += 1;
        self.cancel_token = CancellationToken::new();

        let epoch = self.epoch;
        let cancel_token = self.cancel_token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = advertisements.recv() => {
                        match result {
                            Some(advertisement) => report(ScanReport::Advertisement { epoch, advertisement }),
                            None => {
                                debug!("Advertisement channel closed");
                                report(ScanReport::Finished { epoch });
                                break;
                            }
                        }
                    }
                    _ = cancel_token.cancelled() => break,
                }
            }
        });

        self.scan_task_handle = Some(handle);
        info!("Device scan task started.");
        epoch
    }

    pub fn stop(&mut self) {
        self.cancel_token.cancel();
        if self.scan_task_handle.take().is_some() {
            info!("Device scan task stopped.");
        }
    }
}

impl Default for BluetoothScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BluetoothScanner {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    fn advert(id: &str, name: Option<&str>, local_name: Option<&str>, rssi: Option<i16>) -> Advertisement<()> {
        Advertisement {
            id: id.to_string(),
            name: name.map(str::to_string),
            local_name: local_name.map(str::to_string),
            rssi,
            peripheral: (),
        }
    }

    #[test]
    fn accepts_only_exact_name() {
        assert!(is_power_bank(&advert("a", Some("iPowerUp Uno"), None, None)));
        assert!(!is_power_bank(&advert("a", Some("iPowerUp Un"), None, None)));
        assert!(!is_power_bank(&advert("a", Some("iPowerUp Uno 2"), None, None)));
        assert!(!is_power_bank(&advert("a", Some("ipowerup uno"), None, None)));
        assert!(!is_power_bank(&advert("a", None, None, None)));
    }

    #[test]
    fn falls_back_to_local_name() {
        assert!(is_power_bank(&advert("a", None, Some("iPowerUp Uno"), None)));
        assert!(is_power_bank(&advert("a", Some(""), Some("iPowerUp Uno"), None)));
        // The primary name takes priority when it is present.
        assert!(!is_power_bank(&advert("a", Some("Speaker"), Some("iPowerUp Uno"), None)));
    }

    #[test]
    fn repeat_advertisement_updates_instead_of_duplicating() {
        let mut registry = DeviceRegistry::new();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(2);

        let first = registry.observe(advert("dev-1", Some("iPowerUp Uno"), None, Some(-70)), t0);
        assert!(matches!(first, Some(Discovery::Found(ref d)) if d.signal_strength == Some(-70)));

        let second = registry.observe(advert("dev-1", Some("iPowerUp Uno"), None, Some(-55)), t1);
        match second {
            Some(Discovery::Updated(device)) => {
                assert_eq!(device.signal_strength, Some(-55));
                assert_eq!(device.last_seen, t1);
            }
            other => panic!("expected update, got {other:?}"),
        }
        assert_eq!(registry.len(), 1);

        // A repeat without RSSI keeps the last known strength.
        registry.observe(advert("dev-1", None, Some("iPowerUp Uno"), None), t1);
        assert_eq!(registry.get("dev-1").unwrap().0.signal_strength, Some(-55));
    }

    #[test]
    fn missing_rssi_is_not_invented() {
        let mut registry = DeviceRegistry::new();
        let now = Utc::now();

        let first = registry.observe(advert("quiet", Some("iPowerUp Uno"), None, None), now);
        assert!(matches!(first, Some(Discovery::Found(ref d)) if d.signal_strength.is_none()));
        registry.observe(advert("loud", Some("iPowerUp Uno"), None, Some(-80)), now);

        let ids: Vec<_> = registry.devices().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["loud", "quiet"]);

        registry.observe(advert("quiet", Some("iPowerUp Uno"), None, Some(-45)), now);
        assert_eq!(registry.get("quiet").unwrap().0.signal_strength, Some(-45));
    }

    #[test]
    fn non_matching_advertisements_are_dropped() {
        let mut registry = DeviceRegistry::new();
        assert_eq!(registry.observe(advert("x", Some("iPowerUp Un"), None, Some(-40)), Utc::now()), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn devices_are_listed_strongest_first() {
        let mut registry = DeviceRegistry::new();
        let now = Utc::now();
        registry.observe(advert("far", Some("iPowerUp Uno"), None, Some(-90)), now);
        registry.observe(advert("near", Some("iPowerUp Uno"), None, Some(-40)), now);
        let ids: Vec<_> = registry.devices().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["near", "far"]);

        registry.clear();
        assert!(registry.devices().is_empty());
    }

    #[tokio::test]
    async fn scanner_forwards_and_reports_end() {
        let (tx, rx) = mpsc::unbounded_channel();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();

        let mut scanner = BluetoothScanner::new();
        let epoch = scanner.start(rx, move |report| sink.lock().unwrap().push(report));

        tx.send(advert("dev-1", Some("iPowerUp Uno"), None, None)).unwrap();
        drop(tx);
        while scanner.is_running() {
            tokio::task::yield_now().await;
        }

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 2);
        assert!(matches!(reports[0], ScanReport::Advertisement { epoch: e, .. } if e == epoch));
        assert!(matches!(reports[1], ScanReport::Finished { epoch: e } if e == epoch));
    }
}
