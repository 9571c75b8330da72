//! Background sync coordinator.
//!
//! A periodic run evicts rows past retention, refreshes the top-level keys and
//! then enforces the capacity bounds. Runs are gated on device conditions and
//! retried with linear backoff.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use metrics::counter;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::clock::Clock;
use super::error::CacheError;
use super::events::{CacheEvents, EventKind};
use super::eviction::EvictionManager;
use super::keys::CacheKey;
use super::refresh::RefreshCoordinator;
use crate::store::EvictionReport;

pub const METRIC_SYNC_RUNS_TOTAL: &str = "postcache_sync_runs_total";

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    pub interval: Duration,
    /// Delay before retry `n` is `backoff_base * n`.
    pub backoff_base: Duration,
    /// Attempts per scheduled run, including the first.
    pub max_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SYNC_INTERVAL,
            backoff_base: DEFAULT_BACKOFF_BASE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl SyncConfig {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(attempt)
    }
}

/// Device state a sync run depends on.
pub trait DeviceConditions: Send + Sync {
    fn network_connected(&self) -> bool;
    fn battery_low(&self) -> bool;
}

/// Conditions for hosts without a battery or connectivity monitor.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAvailable;

impl DeviceConditions for AlwaysAvailable {
    fn network_connected(&self) -> bool {
        true
    }

    fn battery_low(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncState {
    Scheduled,
    Running { attempt: u32 },
    Retry { attempt: u32, delay_ms: u64 },
    Success { attempts: u32 },
    PermanentFailure { attempts: u32, error: String },
    Skipped { reason: SkipReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoNetwork,
    BatteryLow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Succeeded,
    Failed,
    Skipped,
}

impl SyncOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncOutcome::Succeeded => "succeeded",
            SyncOutcome::Failed => "failed",
            SyncOutcome::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    pub attempts: u32,
    pub evicted: EvictionReport,
    pub refreshed: Vec<CacheKey>,
    /// Error from the last attempt of a failed run.
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<CacheError>,
}

fn serialize_error<S: serde::Serializer>(
    error: &Option<CacheError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(err) => serializer.collect_str(err),
        None => serializer.serialize_none(),
    }
}

#[derive(Clone)]
pub struct SyncCoordinator {
    refresh: RefreshCoordinator,
    eviction: EvictionManager,
    conditions: Arc<dyn DeviceConditions>,
    clock: Arc<dyn Clock>,
    events: Arc<CacheEvents>,
    config: SyncConfig,
    state: Arc<watch::Sender<SyncState>>,
}

impl SyncCoordinator {
    pub fn new(
        refresh: RefreshCoordinator,
        eviction: EvictionManager,
        conditions: Arc<dyn DeviceConditions>,
        clock: Arc<dyn Clock>,
        events: Arc<CacheEvents>,
        config: SyncConfig,
    ) -> Self {
        let (state, _rx) = watch::channel(SyncState::Scheduled);
        Self {
            refresh,
            eviction,
            conditions,
            clock,
            events,
            config,
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// One sync pass without retry.
    ///
    /// Every top-level key is attempted even when another fails; the first
    /// failure is returned after the capacity pass.
    pub async fn run_once(&self) -> Result<(EvictionReport, Vec<CacheKey>), CacheError> {
        let mut evicted = self.eviction.evict_expired(self.clock.now()).await?;

        let results = join_all(
            CacheKey::TOP_LEVEL
                .iter()
                .map(|key| self.refresh.refresh(key)),
        )
        .await;

        evicted.merge(self.eviction.evict_over_capacity().await?);

        let mut refreshed = Vec::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(outcome) => refreshed.push(outcome.key),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok((evicted, refreshed)),
        }
    }

    /// A scheduled run: check conditions, then [`Self::run_once`] with linear
    /// backoff between attempts. The state ends as `Scheduled`.
    pub async fn run_with_retry(&self) -> SyncReport {
        if let Some(reason) = self.skip_reason() {
            info!(
                target = "postcache::cache::sync",
                reason = ?reason,
                "sync skipped"
            );
            self.set_state(SyncState::Skipped { reason });
            self.set_state(SyncState::Scheduled);
            counter!(METRIC_SYNC_RUNS_TOTAL, "outcome" => SyncOutcome::Skipped.as_str())
                .increment(1);
            return SyncReport {
                outcome: SyncOutcome::Skipped,
                attempts: 0,
                evicted: EvictionReport::default(),
                refreshed: Vec::new(),
                error: None,
            };
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut evicted = EvictionReport::default();
        let mut attempt = 0;
        let report = loop {
            attempt += 1;
            self.set_state(SyncState::Running { attempt });

            match self.run_once().await {
                Ok((report, refreshed)) => {
                    evicted.merge(report);
                    info!(
                        target = "postcache::cache::sync",
                        attempt,
                        refreshed = refreshed.len(),
                        evicted = evicted.total(),
                        "sync succeeded"
                    );
                    self.set_state(SyncState::Success { attempts: attempt });
                    break SyncReport {
                        outcome: SyncOutcome::Succeeded,
                        attempts: attempt,
                        evicted,
                        refreshed,
                        error: None,
                    };
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.config.backoff(attempt);
                    warn!(
                        target = "postcache::cache::sync",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "sync attempt failed; retrying"
                    );
                    self.set_state(SyncState::Retry {
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                    });
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(
                        target = "postcache::cache::sync",
                        attempt,
                        retryable = err.is_retryable(),
                        error = %err,
                        "sync failed"
                    );
                    self.set_state(SyncState::PermanentFailure {
                        attempts: attempt,
                        error: err.to_string(),
                    });
                    break SyncReport {
                        outcome: SyncOutcome::Failed,
                        attempts: attempt,
                        evicted,
                        refreshed: Vec::new(),
                        error: Some(err),
                    };
                }
            }
        };

        counter!(METRIC_SYNC_RUNS_TOTAL, "outcome" => report.outcome.as_str()).increment(1);
        self.events.publish(
            EventKind::SyncFinished {
                succeeded: report.outcome == SyncOutcome::Succeeded,
                attempts: report.attempts,
            },
            self.clock.now(),
        );
        self.set_state(SyncState::Scheduled);
        report
    }

    /// Run [`Self::run_with_retry`] every `interval` until the handle is aborted.
    /// The first run happens one interval after spawning.
    pub fn spawn(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(coordinator.config.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                coordinator.run_with_retry().await;
            }
        })
    }

    fn skip_reason(&self) -> Option<SkipReason> {
        if !self.conditions.network_connected() {
            Some(SkipReason::NoNetwork)
        } else if self.conditions.battery_low() {
            Some(SkipReason::BatteryLow)
        } else {
            None
        }
    }

    fn set_state(&self, state: SyncState) {
        self.state.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_linearly() {
        let config = SyncConfig {
            backoff_base: Duration::from_secs(30),
            ..SyncConfig::default()
        };
        assert_eq!(config.backoff(1), Duration::from_secs(30));
        assert_eq!(config.backoff(2), Duration::from_secs(60));
        assert_eq!(config.backoff(3), Duration::from_secs(90));
    }

    #[test]
    fn defaults_match_schedule() {
        let config = SyncConfig::default();
        assert_eq!(config.interval, Duration::from_secs(21_600));
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn state_serializes_with_tag() {
        let json = serde_json::to_value(SyncState::Retry {
            attempt: 2,
            delay_ms: 60_000,
        })
        .expect("serialize");
        assert_eq!(json["state"], "retry");
        assert_eq!(json["delay_ms"], 60_000);
    }
}
