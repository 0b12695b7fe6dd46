//! Broker health tracking for the liveness/readiness endpoint.
//!
//! Two signals per broker kind:
//! - a rolling window of recent per-target delivery results
//! - connectivity, from periodic pings and connection-level publish errors
//!
//! Health checks never publish events.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::broker::{BrokerKind, BrokerPublisher};
use crate::error::DeliveryError;
use crate::pipeline::TargetReport;

/// Health thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSettings {
    /// Results remembered per broker
    pub window_size: usize,
    /// Failure ratio above which a broker is degraded
    pub degraded_ratio: f64,
    /// Samples required before the ratio is judged
    pub min_samples: usize,
    /// Continuous unreachability before a broker is unhealthy
    pub unreachable_threshold: Duration,
    /// Period of the connectivity ping loop
    pub probe_interval: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            window_size: 50,
            degraded_ratio: 0.5,
            min_samples: 5,
            unreachable_threshold: Duration::from_secs(60),
            probe_interval: Duration::from_secs(15),
        }
    }
}

/// Overall or per-broker status. Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Per-broker detail in a [`HealthReport`].
#[derive(Debug, Clone, Serialize)]
pub struct BrokerHealth {
    pub broker: BrokerKind,
    pub status: HealthStatus,
    pub samples: usize,
    pub failure_ratio: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unreachable_for_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Result of [`HealthCheck::probe`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub brokers: Vec<BrokerHealth>,
}

#[derive(Debug, Default)]
struct BrokerState {
    window: VecDeque<bool>,
    unreachable_since: Option<Instant>,
    last_error: Option<String>,
}

impl BrokerState {
    fn push(&mut self, success: bool, capacity: usize) {
        if self.window.len() == capacity {
            self.window.pop_front();
        }
        self.window.push_back(success);
    }

    fn mark_reachable(&mut self) {
        self.unreachable_since = None;
    }

    fn mark_unreachable(&mut self, error: &DeliveryError) {
        self.unreachable_since.get_or_insert_with(Instant::now);
        self.last_error = Some(error.to_string());
    }

    fn failure_ratio(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.window.len() as f64
    }

    fn evaluate(&self, kind: BrokerKind, settings: &HealthSettings, now: Instant) -> BrokerHealth {
        let unreachable_for = self.unreachable_since.map(|since| now.duration_since(since));
        let ratio = self.failure_ratio();

        let status = match unreachable_for {
            Some(elapsed) if elapsed >= settings.unreachable_threshold => HealthStatus::Unhealthy,
            _ if self.window.len() >= settings.min_samples && ratio > settings.degraded_ratio => {
                HealthStatus::Degraded
            }
            _ => HealthStatus::Healthy,
        };

        BrokerHealth {
            broker: kind,
            status,
            samples: self.window.len(),
            failure_ratio: ratio,
            unreachable_for_secs: unreachable_for.map(|d| d.as_secs()),
            last_error: self.last_error.clone(),
        }
    }
}

/// Tracks broker health from delivery results and connectivity pings.
pub struct HealthCheck {
    settings: HealthSettings,
    publishers: Vec<Arc<dyn BrokerPublisher>>,
    brokers: Mutex<HashMap<BrokerKind, BrokerState>>,
}

impl HealthCheck {
    /// Track the brokers behind `publishers`.
    pub fn new(settings: HealthSettings, publishers: Vec<Arc<dyn BrokerPublisher>>) -> Self {
        let brokers = publishers
            .iter()
            .map(|p| (p.kind(), BrokerState::default()))
            .collect();

        Self {
            settings,
            publishers,
            brokers: Mutex::new(brokers),
        }
    }

    /// Record the terminal result of one target delivery.
    pub fn record(&self, report: &TargetReport) {
        let mut brokers = self.lock();
        let state = brokers.entry(report.target.kind).or_default();

        state.push(report.is_delivered(), self.settings.window_size);

        match &report.error {
            None => state.mark_reachable(),
            Some(e) if e.is_connectivity() => state.mark_unreachable(e),
            Some(e) => state.last_error = Some(e.to_string()),
        }
    }

    /// Record the result of a connectivity ping.
    pub fn record_ping(&self, kind: BrokerKind, result: &Result<(), DeliveryError>) {
        let mut brokers = self.lock();
        let state = brokers.entry(kind).or_default();

        match result {
            Ok(()) => state.mark_reachable(),
            Err(e) => state.mark_unreachable(e),
        }
    }

    /// Ping every broker once.
    pub async fn ping_all(&self) {
        for publisher in &self.publishers {
            let kind = publisher.kind();
            let result = publisher.ping().await;

            match &result {
                Ok(()) => debug!(broker = %kind, "broker_ping_ok"),
                Err(e) => warn!(broker = %kind, error = %e, "broker_ping_failed"),
            }

            self.record_ping(kind, &result);
        }
    }

    /// Ping all brokers every probe interval until the task is aborted.
    pub fn spawn_probe_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.probe_interval);
            loop {
                ticker.tick().await;
                self.ping_all().await;
            }
        })
    }

    /// Current status; the overall status is the worst broker status.
    pub fn probe(&self) -> HealthReport {
        let now = Instant::now();
        let brokers = self.lock();

        let mut kinds: Vec<_> = brokers.keys().copied().collect();
        kinds.sort();

        let details: Vec<BrokerHealth> = kinds
            .into_iter()
            .filter_map(|kind| brokers.get(&kind).map(|s| s.evaluate(kind, &self.settings, now)))
            .collect();

        let status = details
            .iter()
            .map(|b| b.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        HealthReport {
            status,
            brokers: details,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<BrokerKind, BrokerState>> {
        self.brokers.lock().unwrap_or_else(|p| p.into_inner())
    }
}
