//! Notification handling for the iPowerUp case
//! This module forwards notification payloads and turns them into session events

use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::events::{EventEmitter, SessionEvent};
use crate::core::bluetooth::transport::NotificationReceiver;
use crate::core::power_bank::{decode_response, DeviceResponse, PowerBankStatus, TemperatureUnit};

/// What the listener task reports back
#[derive(Debug)]
pub enum NotificationReport {
    Payload(Vec<u8>),
    /// The transport closed the channel, which means the link is gone
    Closed,
}

/// Notification handler for power bank data
#[derive(Clone)]
pub struct NotificationHandler {
    emitter: EventEmitter,
}

impl NotificationHandler {
    /// Create a new NotificationHandler
    pub fn new(emitter: EventEmitter) -> Self {
        Self { emitter }
    }

    /// Spawns the task draining `notifications` until it closes or `cancel_token` fires.
    /// Closure of the channel is reported, cancellation is not.
    pub fn spawn_listener<F>(
        mut notifications: NotificationReceiver,
        cancel_token: CancellationToken,
        report: F,
    ) -> JoinHandle<()>
    where
        F: Fn(NotificationReport) + Send + 'static,
    {
        tokio::spawn(async move {
            info!("Listening for power bank notifications...");
            loop {
                tokio::select! {
                    result = notifications.recv() => {
                        match result {
                            Some(value) => report(NotificationReport::Payload(value)),
                            None => {
                                report(NotificationReport::Closed);
                                break;
                            }
                        }
                    }
                    _ = cancel_token.cancelled() => break,
                }
            }
            info!("Notification listener ended");
        })
    }

    /// Decodes one payload and publishes the matching events.
    /// Returns the status when the payload was a valid status response.
    pub fn handle_payload(&self, value: &[u8], unit: TemperatureUnit) -> Option<PowerBankStatus> {
        let raw = hex::encode(value);
        debug!("Received power bank data: {}", raw);
        self.emitter.emit(SessionEvent::RawDataReceived { hex: raw.clone() });

        match decode_response(value, unit) {
            Ok(DeviceResponse::Status(status)) => {
                debug!("Parsed power bank status: {:?}", status);
                self.emitter.emit(SessionEvent::StatusReceived(status.clone()));
                Some(status)
            }
            Ok(DeviceResponse::ChargerConfig(config)) => {
                info!("Charger config: enabled={}", config.enabled);
                self.emitter.emit(SessionEvent::ChargerConfigReceived(config));
                None
            }
            Ok(response) => {
                let opcode = response.opcode_byte();
                if let DeviceResponse::Unrecognized(_) = response {
                    debug!("Unrecognized opcode 0x{:02x}, ignoring", opcode);
                }
                self.emitter.emit(SessionEvent::DeviceResponse {
                    opcode,
                    raw,
                    length: value.len(),
                });
                None
            }
            Err(e) => {
                warn!("Failed to parse power bank data {}: {}", raw, e);
                self.emitter.emit(SessionEvent::ParseError { message: e.to_string() });
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::sync::{broadcast, mpsc};

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn status_payload_emits_raw_and_status() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();
        let handler = NotificationHandler::new(emitter);

        let payload = [0x04, 0x64, 0x00, 0x50, 0x07, 0x19, 0x00, 0x32, 0x0A, 0x00];
        let status = handler.handle_payload(&payload, TemperatureUnit::Fahrenheit).unwrap();
        assert_eq!(status.case_temperature, 77.0);

        let events = drain(&mut rx);
        assert!(matches!(&events[0], SessionEvent::RawDataReceived { hex } if hex == "04640050071900320a00"));
        assert!(matches!(&events[1], SessionEvent::StatusReceived(s) if s.case_battery_percent == 80));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn acknowledgement_is_not_a_status() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();
        let handler = NotificationHandler::new(emitter);

        assert!(handler.handle_payload(&[0x19, 0x00], TemperatureUnit::Celsius).is_none());
        let events = drain(&mut rx);
        assert!(matches!(
            &events[1],
            SessionEvent::DeviceResponse { opcode: 0x19, length: 2, raw } if raw == "1900"
        ));
    }

    #[test]
    fn charger_config_and_parse_errors() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();
        let handler = NotificationHandler::new(emitter);

        handler.handle_payload(&[0x03, 0, 0, 0, 0, 1], TemperatureUnit::Celsius);
        handler.handle_payload(&[0x04, 0x01], TemperatureUnit::Celsius);

        let events = drain(&mut rx);
        assert!(matches!(&events[1], SessionEvent::ChargerConfigReceived(c) if c.enabled));
        assert!(matches!(&events[3], SessionEvent::ParseError { .. }));
        assert!(!events.iter().any(|e| matches!(e, SessionEvent::StatusReceived(_))));
    }

    #[tokio::test]
    async fn listener_reports_payloads_then_closure() {
        let (tx, rx) = mpsc::unbounded_channel();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();

        let handle = NotificationHandler::spawn_listener(rx, CancellationToken::new(), move |report| {
            sink.lock().unwrap().push(report)
        });
        tx.send(vec![0x19]).unwrap();
        drop(tx);
        handle.await.unwrap();

        let reports = reports.lock().unwrap();
        assert!(matches!(&reports[0], NotificationReport::Payload(p) if p == &vec![0x19]));
        assert!(matches!(reports[1], NotificationReport::Closed));
    }

    #[tokio::test]
    async fn cancelled_listener_does_not_report_closure() {
        let (_tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        let cancel_token = CancellationToken::new();

        let handle = NotificationHandler::spawn_listener(rx, cancel_token.clone(), move |report| {
            sink.lock().unwrap().push(report)
        });
        cancel_token.cancel();
        handle.await.unwrap();

        assert!(reports.lock().unwrap().is_empty());
    }
}
