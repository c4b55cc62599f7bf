//! Timer, jitter, backoff, and signal-driven lifecycle around the
//! reconciler (§4.7). Not part of the hard core: this is the contract that
//! keeps the reconciler running as a long-lived process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::change_detector::ChangeDetector;
use crate::config::FleetSyncConfig;
use crate::dataplane::DataplaneClient;
use crate::discovery::DiscoveryClient;
use crate::error::FleetSyncError;
use crate::grouper;
use crate::reconciler::Reconciler;
use crate::tag_filter;

/// Owns every piece of state that persists across polling cycles: the
/// change-detector snapshot, the consecutive-failure counter, and the
/// SIGHUP flag. All three are mutated only from this loop.
pub struct DaemonLoop {
    config: Arc<FleetSyncConfig>,
    discovery: Arc<dyn DiscoveryClient>,
    reconciler: Reconciler<dyn DataplaneClient>,
    detector: ChangeDetector,
    consecutive_failures: u32,
    sighup_pending: Arc<AtomicBool>,
}

impl DaemonLoop {
    pub fn new(config: Arc<FleetSyncConfig>, discovery: Arc<dyn DiscoveryClient>, dataplane: Arc<dyn DataplaneClient>) -> Self {
        let reconciler = Reconciler::new(dataplane, config.clone());
        Self {
            config,
            discovery,
            reconciler,
            detector: ChangeDetector::new(),
            consecutive_failures: 0,
            sighup_pending: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Runs one polling cycle: discover, filter, group, reconcile. Does not
    /// sleep and does not touch the failure counter — callers own that.
    pub async fn run_cycle(&mut self) -> Result<(), FleetSyncError> {
        if self.sighup_pending.swap(false, Ordering::SeqCst) {
            info!("SIGHUP received, clearing snapshot before discovery");
            self.detector.clear();
        }

        let instances = self.discovery.discover_all().await?;
        let filtered = tag_filter::filter(instances, &self.config.tags);
        let services = grouper::group(filtered, &self.config.tags);
        self.reconciler.reconcile(&services, &mut self.detector).await
    }

    /// `--once`: run a single cycle and return its result directly.
    pub async fn run_once(&mut self) -> Result<(), FleetSyncError> {
        self.run_cycle().await
    }

    /// Runs until SIGTERM/SIGINT. A cycle once started always runs to
    /// completion (finishing its commit or abort) before a shutdown signal
    /// is honored; signals are only observed at tick boundaries and during
    /// the jittered sleep.
    pub async fn run_forever(&mut self) -> Result<(), FleetSyncError> {
        let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
            FleetSyncError::Config(crate::error::ConfigError::invalid("signal", e.to_string()))
        })?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(|e| {
            FleetSyncError::Config(crate::error::ConfigError::invalid("signal", e.to_string()))
        })?;
        let mut sighup = signal(SignalKind::hangup()).map_err(|e| {
            FleetSyncError::Config(crate::error::ConfigError::invalid("signal", e.to_string()))
        })?;

        loop {
            let wait = self.next_wait();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    match self.run_cycle().await {
                        Ok(()) => {
                            self.consecutive_failures = 0;
                        }
                        Err(err) => {
                            self.consecutive_failures += 1;
                            warn!(error = %err, consecutive_failures = self.consecutive_failures, "cycle failed, backing off");
                            tokio::time::sleep(self.backoff()).await;
                        }
                    }
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received, exiting");
                    return Ok(());
                }
                _ = sigint.recv() => {
                    info!("SIGINT received, exiting");
                    return Ok(());
                }
                _ = sighup.recv() => {
                    info!("SIGHUP received, will clear snapshot on next tick");
                    self.sighup_pending.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    fn next_wait(&self) -> Duration {
        let jitter = self.config.polling.jitter_seconds;
        let jitter_secs = if jitter == 0 { 0 } else { rand::thread_rng().gen_range(0..=jitter) };
        Duration::from_secs(self.config.polling.interval_seconds + jitter_secs)
    }

    fn backoff(&self) -> Duration {
        let base = self.config.polling.backoff_base_seconds;
        let max = self.config.polling.max_backoff_seconds;
        let exponent = self.consecutive_failures.saturating_sub(1).min(20);
        let backoff = base.saturating_mul(1u64.checked_shl(exponent).unwrap_or(u64::MAX));
        Duration::from_secs(backoff.min(max))
    }
}
