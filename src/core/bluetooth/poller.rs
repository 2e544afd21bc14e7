//! Periodic status polling while the session is steady.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::commands::{CommandSender, PowerBankCommand};

/// Supplies the phone's own battery level for status queries
#[async_trait::async_trait]
pub trait PhoneBatterySource: Send + Sync {
    async fn phone_battery_percent(&self) -> Result<f64>;
}

/// A battery source that always reports the same level
#[derive(Debug, Clone, Copy)]
pub struct FixedBatteryLevel(pub f64);

#[async_trait::async_trait]
impl PhoneBatterySource for FixedBatteryLevel {
    async fn phone_battery_percent(&self) -> Result<f64> {
        Ok(self.0)
    }
}

/// Reads the battery level, substituting `fallback` when the source fails
pub async fn read_phone_battery(source: &dyn PhoneBatterySource, fallback: f64) -> f64 {
    match source.phone_battery_percent().await {
        Ok(percent) => percent,
        Err(e) => {
            warn!("Phone battery level unavailable ({}), using {}", e, fallback);
            fallback
        }
    }
}

pub struct StatusPoller {
    interval: Duration,
    fallback_percent: f64,
    cancel_token: CancellationToken,
    poll_task_handle: Option<JoinHandle<()>>,
}

impl StatusPoller {
    pub fn new(interval: Duration, fallback_percent: f64) -> Self {
        Self {
            interval,
            fallback_percent,
            cancel_token: CancellationToken::new(),
            poll_task_handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.poll_task_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Start the poll timer. The first query goes out one interval from now;
    /// an already running timer is cancelled first.
    pub fn start<S>(&mut self, sender: S, battery: Arc<dyn PhoneBatterySource>)
    where
        S: CommandSender + Send + Sync + 'static,
    {
        self.stop();
        self.cancel_token = CancellationToken::new();

        let cancel_token = self.cancel_token.clone();
        let interval = self.interval;
        let fallback_percent = self.fallback_percent;

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel_token.cancelled() => break,
                }

                let phone_battery_percent = read_phone_battery(battery.as_ref(), fallback_percent).await;
                debug!("Polling status (phone battery {}%)", phone_battery_percent);
                if let Err(e) = sender
                    .send_command(PowerBankCommand::QueryStatus { phone_battery_percent })
                    .await
                {
                    error!("Status poll failed: {}", e);
                }
            }
        });

        self.poll_task_handle = Some(handle);
        info!("Status poller started with interval of {:?}", interval);
    }

    pub fn stop(&mut self) {
        self.cancel_token.cancel();
        if self.poll_task_handle.take().is_some() {
            info!("Status poller stopped");
        }
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
