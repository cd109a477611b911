use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::models::SnapshotReason;

use super::rotator::BackupRotator;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupIntervals {
    pub normal: Duration,
    /// Used while every tier write is failing.
    pub degraded: Duration,
}

impl BackupIntervals {
    fn period(&self, degraded: bool) -> Duration {
        if degraded {
            self.degraded
        } else {
            self.normal
        }
    }
}

/// Asks the running loop for an out-of-band rotation.
#[derive(Clone)]
pub struct BackupTrigger {
    tx: mpsc::UnboundedSender<SnapshotReason>,
}

impl BackupTrigger {
    /// False once the loop has stopped.
    pub fn request(&self, reason: SnapshotReason) -> bool {
        self.tx.send(reason).is_ok()
    }
}

pub struct BackupController {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl BackupController {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn start(
        &mut self,
        rotator: Arc<BackupRotator>,
        degraded: watch::Receiver<bool>,
        intervals: BackupIntervals,
    ) -> Result<BackupTrigger> {
        if self.handle.is_some() {
            bail!("backup loop already running");
        }

        let cancel_token = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let trigger = BackupTrigger { tx };

        let handle = tokio::spawn(backup_loop(
            rotator,
            degraded,
            rx,
            intervals,
            cancel_token.clone(),
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(trigger)
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("backup loop task failed to join")
                .map(|_| ())
        } else {
            Ok(())
        }
    }
}

impl Default for BackupController {
    fn default() -> Self {
        Self::new()
    }
}

fn backup_ticker(period: Duration) -> Interval {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

pub async fn backup_loop(
    rotator: Arc<BackupRotator>,
    mut degraded_rx: watch::Receiver<bool>,
    mut triggers: mpsc::UnboundedReceiver<SnapshotReason>,
    intervals: BackupIntervals,
    cancel_token: CancellationToken,
) {
    let mut degraded = *degraded_rx.borrow_and_update();
    let mut ticker = backup_ticker(intervals.period(degraded));
    let mut watching = true;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                rotator.rotate(SnapshotReason::Interval).await;
            }
            Some(reason) = triggers.recv() => {
                rotator.rotate(reason).await;
            }
            changed = degraded_rx.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                    continue;
                }
                let now = *degraded_rx.borrow_and_update();
                if now != degraded {
                    degraded = now;
                    let period = intervals.period(degraded);
                    if degraded {
                        log_warn!("storage degraded; backing up every {}s", period.as_secs_f32());
                    } else {
                        log_info!("storage recovered; backing up every {}s", period.as_secs_f32());
                    }
                    ticker = backup_ticker(period);
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("backup loop shutting down");
                break;
            }
        }
    }
}
