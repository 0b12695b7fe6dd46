//! Event routing: which broker targets receive an event.
//!
//! Static routes map event types to ordered target lists. Feature flags are
//! read once per resolution as a [`FlagSet`] snapshot and can disable a
//! broker or force all traffic onto one broker without a redeploy.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{BrokerKind, BrokerPublisher, PublishTarget};
use crate::error::ConfigurationError;
use crate::event::WebhookEvent;

/// Route key matching event types without an explicit entry.
pub const WILDCARD_ROUTE: &str = "*";

// =============================================================================
// Routing Table
// =============================================================================

/// Event type → ordered target list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    routes: HashMap<String, Vec<PublishTarget>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route. Duplicate targets are dropped, first occurrence wins.
    pub fn with_route(mut self, event_type: impl Into<String>, targets: Vec<PublishTarget>) -> Self {
        self.routes.insert(event_type.into(), dedupe(targets));
        self
    }

    /// Parse `type=kind:name,kind:name;type2=kind:name`.
    ///
    /// Malformed entries are logged and skipped.
    pub fn parse(raw: &str) -> Self {
        let mut table = RoutingTable::new();

        for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((event_type, targets)) = entry.split_once('=') else {
                warn!(entry = %entry, "route_entry_invalid");
                continue;
            };

            let event_type = event_type.trim();
            if event_type.is_empty() {
                warn!(entry = %entry, "route_entry_missing_event_type");
                continue;
            }

            let mut parsed = Vec::new();
            for target in targets.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                match target.parse::<PublishTarget>() {
                    Ok(target) => parsed.push(target),
                    Err(reason) => warn!(entry = %entry, reason = %reason, "route_target_invalid"),
                }
            }

            if parsed.is_empty() {
                warn!(entry = %entry, "route_entry_has_no_targets");
                continue;
            }

            table = table.with_route(event_type, parsed);
        }

        table
    }

    /// Configured targets for an event type, falling back to the wildcard route.
    pub fn targets_for(&self, event_type: &str) -> Option<&[PublishTarget]> {
        self.routes
            .get(event_type)
            .or_else(|| self.routes.get(WILDCARD_ROUTE))
            .map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

// =============================================================================
// Feature Flags
// =============================================================================

/// Recognized feature flags.
///
/// Effects, applied in this order during resolution:
/// - `force_queue`: stream targets are redirected to the queue broker
/// - `force_stream`: queue targets are redirected to the stream broker
///   (ignored when `force_queue` is also set)
/// - `queue_disabled` / `stream_disabled`: targets on that broker are dropped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct FlagSet {
    pub queue_disabled: bool,
    pub stream_disabled: bool,
    pub force_queue: bool,
    pub force_stream: bool,
}

impl FlagSet {
    fn redirect(&self, kind: BrokerKind) -> BrokerKind {
        if self.force_queue {
            BrokerKind::Queue
        } else if self.force_stream {
            BrokerKind::Stream
        } else {
            kind
        }
    }

    fn is_disabled(&self, kind: BrokerKind) -> bool {
        match kind {
            BrokerKind::Queue => self.queue_disabled,
            BrokerKind::Stream => self.stream_disabled,
        }
    }

    /// Apply the flags to a configured target list.
    pub fn apply(&self, targets: &[PublishTarget]) -> Vec<PublishTarget> {
        let redirected = targets
            .iter()
            .map(|t| PublishTarget::new(self.redirect(t.kind), t.destination.clone()))
            .filter(|t| !self.is_disabled(t.kind))
            .collect();
        dedupe(redirected)
    }
}

/// Shared, runtime-updatable flag state.
#[derive(Debug, Default)]
pub struct FeatureFlags {
    current: RwLock<FlagSet>,
}

impl FeatureFlags {
    pub fn new(initial: FlagSet) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    /// Copy of the current flags.
    pub fn snapshot(&self) -> FlagSet {
        *self.current.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Replace all flags at once.
    pub fn replace(&self, flags: FlagSet) {
        let mut current = self.current.write().unwrap_or_else(|p| p.into_inner());
        if *current != flags {
            info!(?flags, "feature_flags_changed");
            *current = flags;
        }
    }

    /// Reload flags from a JSON file such as `{"stream_disabled": true}`.
    pub async fn reload_from_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        use anyhow::Context;

        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read flags file {}", path.display()))?;
        let flags: FlagSet =
            serde_json::from_slice(&raw).context("Failed to parse flags file")?;

        self.replace(flags);
        Ok(())
    }

    /// Reload from `path` every `interval` until the task is aborted.
    pub fn spawn_reload_loop(self: Arc<Self>, path: PathBuf, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.reload_from_file(&path).await {
                    warn!(error = %e, path = %path.display(), "feature_flags_reload_failed");
                }
            }
        })
    }
}

// =============================================================================
// Publisher Factory
// =============================================================================

/// Resolves targets for events and hands out the publisher for each broker.
///
/// Built once at startup and shared; resolution does no I/O.
pub struct PublisherFactory {
    routes: RoutingTable,
    flags: Arc<FeatureFlags>,
    publishers: HashMap<BrokerKind, Arc<dyn BrokerPublisher>>,
}

impl PublisherFactory {
    pub fn new(routes: RoutingTable, flags: Arc<FeatureFlags>) -> Self {
        Self {
            routes,
            flags,
            publishers: HashMap::new(),
        }
    }

    /// Register the publisher for its broker kind, replacing any previous one.
    pub fn with_publisher(mut self, publisher: Arc<dyn BrokerPublisher>) -> Self {
        self.publishers.insert(publisher.kind(), publisher);
        self
    }

    /// Ordered, duplicate-free targets for `event` under the current flags.
    pub fn resolve(&self, event: &WebhookEvent) -> Result<Vec<PublishTarget>, ConfigurationError> {
        let event_type = event.event_type();

        let configured = self
            .routes
            .targets_for(event_type)
            .ok_or_else(|| ConfigurationError::NoRoute {
                event_type: event_type.to_string(),
            })?;

        let flags = self.flags.snapshot();
        let targets = flags.apply(configured);

        if targets.is_empty() {
            return Err(ConfigurationError::AllTargetsDisabled {
                event_type: event_type.to_string(),
            });
        }

        if let Some(missing) = targets.iter().find(|t| !self.publishers.contains_key(&t.kind)) {
            return Err(ConfigurationError::BrokerNotConfigured { kind: missing.kind });
        }

        debug!(
            event_type = %event_type,
            target_count = targets.len(),
            ?flags,
            "event_routes_resolved"
        );

        Ok(targets)
    }

    /// Publisher for a broker kind.
    pub fn publisher_for(&self, kind: BrokerKind) -> Result<Arc<dyn BrokerPublisher>, ConfigurationError> {
        self.publishers
            .get(&kind)
            .cloned()
            .ok_or(ConfigurationError::BrokerNotConfigured { kind })
    }

    /// All configured publishers, in broker-kind order.
    pub fn publishers(&self) -> Vec<Arc<dyn BrokerPublisher>> {
        BrokerKind::ALL
            .iter()
            .filter_map(|kind| self.publishers.get(kind).cloned())
            .collect()
    }

    pub fn flags(&self) -> &Arc<FeatureFlags> {
        &self.flags
    }

    /// Close every publisher's broker connections.
    pub async fn close(&self) {
        for publisher in self.publishers() {
            publisher.close().await;
        }
    }
}

fn dedupe(targets: Vec<PublishTarget>) -> Vec<PublishTarget> {
    let mut unique: Vec<PublishTarget> = Vec::with_capacity(targets.len());
    for target in targets {
        if !unique.contains(&target) {
            unique.push(target);
        }
    }
    unique
}
