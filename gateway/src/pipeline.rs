//! Delivery pipeline: one inbound event → every resolved broker target.
//!
//! ## Processing Flow
//!
//! ```text
//! Received → Resolved → Publishing → { Delivered | PartiallyDelivered | Failed }
//! ```
//!
//! Targets are published concurrently and retried independently. The event
//! deadline bounds the whole delivery; a target still pending when it
//! elapses fails with [`DeliveryError::DeadlineExceeded`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, info_span, warn, Instrument};

use crate::broker::{OutboundMessage, PublishTarget};
use crate::error::{ConfigurationError, DeliveryError};
use crate::event::WebhookEvent;
use crate::health::HealthCheck;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::routing::PublisherFactory;

/// State of one publish attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptStatus {
    Pending,
    Succeeded,
    Failed(DeliveryError),
}

impl AttemptStatus {
    pub fn error(&self) -> Option<&DeliveryError> {
        match self {
            AttemptStatus::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// One try of publishing an event to one target.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub number: u32,
    pub target: PublishTarget,
    pub event_id: String,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    fn start(number: u32, target: &PublishTarget, event_id: &str) -> Self {
        Self {
            number,
            target: target.clone(),
            event_id: event_id.to_string(),
            status: AttemptStatus::Pending,
            started_at: Utc::now(),
        }
    }

    fn finish(mut self, result: &Result<(), DeliveryError>) -> Self {
        self.status = match result {
            Ok(()) => AttemptStatus::Succeeded,
            Err(e) => AttemptStatus::Failed(e.clone()),
        };
        self
    }
}

/// Terminal summary for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetReport {
    pub target: PublishTarget,
    /// Attempts made, including the first.
    pub attempts: u32,
    /// Final error; `None` when the target was delivered.
    pub error: Option<DeliveryError>,
}

impl TargetReport {
    /// Summarize a target's attempt history; the last attempt decides the result.
    fn from_attempts(target: &PublishTarget, attempts: &[DeliveryAttempt]) -> Self {
        Self {
            target: target.clone(),
            attempts: attempts.len() as u32,
            error: attempts
                .last()
                .and_then(|attempt| attempt.status.error())
                .cloned(),
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.error.is_none()
    }
}

/// Why an event was not delivered anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// No usable route; nothing was published.
    Unroutable(ConfigurationError),
    /// Every target failed.
    Exhausted(Vec<TargetReport>),
}

/// Terminal result for one event across all of its targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered {
        targets: Vec<TargetReport>,
    },
    PartiallyDelivered {
        delivered: Vec<TargetReport>,
        failed: Vec<TargetReport>,
    },
    Failed(FailureCause),
}

impl DeliveryOutcome {
    fn from_reports(reports: Vec<TargetReport>) -> Self {
        let (delivered, failed): (Vec<_>, Vec<_>) =
            reports.into_iter().partition(TargetReport::is_delivered);

        if failed.is_empty() {
            DeliveryOutcome::Delivered { targets: delivered }
        } else if delivered.is_empty() {
            DeliveryOutcome::Failed(FailureCause::Exhausted(failed))
        } else {
            DeliveryOutcome::PartiallyDelivered { delivered, failed }
        }
    }

    /// Short status label for logs and responses.
    pub fn status(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered { .. } => "delivered",
            DeliveryOutcome::PartiallyDelivered { .. } => "partially_delivered",
            DeliveryOutcome::Failed(_) => "failed",
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    /// Reports for every target, delivered first.
    pub fn reports(&self) -> Vec<&TargetReport> {
        match self {
            DeliveryOutcome::Delivered { targets } => targets.iter().collect(),
            DeliveryOutcome::PartiallyDelivered { delivered, failed } => {
                delivered.iter().chain(failed.iter()).collect()
            }
            DeliveryOutcome::Failed(FailureCause::Exhausted(failed)) => failed.iter().collect(),
            DeliveryOutcome::Failed(FailureCause::Unroutable(_)) => Vec::new(),
        }
    }

    /// Reports of the targets that were not delivered.
    pub fn failed(&self) -> Vec<&TargetReport> {
        self.reports().into_iter().filter(|r| !r.is_delivered()).collect()
    }

    pub fn report_for(&self, target: &PublishTarget) -> Option<&TargetReport> {
        self.reports().into_iter().find(|r| &r.target == target)
    }
}

/// Orchestrates resolution, publish-with-retry and outcome reporting.
///
/// Cheap to share: one instance serves every concurrent request.
pub struct DeliveryPipeline {
    factory: Arc<PublisherFactory>,
    policy: RetryPolicy,
    health: Option<Arc<HealthCheck>>,
}

impl DeliveryPipeline {
    pub fn new(factory: Arc<PublisherFactory>, policy: RetryPolicy) -> Self {
        Self {
            factory,
            policy,
            health: None,
        }
    }

    /// Record every target result in `health`.
    pub fn with_health(mut self, health: Arc<HealthCheck>) -> Self {
        self.health = Some(health);
        self
    }

    /// Deliver one event. Never returns an error: failures are part of the outcome.
    pub async fn deliver(&self, event: &WebhookEvent) -> DeliveryOutcome {
        let span = info_span!(
            "deliver_event",
            event_id = %event.id(),
            event_type = %event.event_type(),
            trace_id = %event.trace_id(),
        );

        self.deliver_inner(event).instrument(span).await
    }

    async fn deliver_inner(&self, event: &WebhookEvent) -> DeliveryOutcome {
        let targets = match self.factory.resolve(event) {
            Ok(targets) => targets,
            Err(e) => {
                error!(error = %e, "delivery_unroutable");
                return DeliveryOutcome::Failed(FailureCause::Unroutable(e));
            }
        };

        let deadline = Instant::now() + self.policy.event_deadline;
        let message = OutboundMessage::from_event(event);

        let reports = join_all(
            targets
                .iter()
                .map(|target| self.deliver_to_target(target, &message, deadline)),
        )
        .await;

        if let Some(health) = &self.health {
            for report in &reports {
                health.record(report);
            }
        }

        let outcome = DeliveryOutcome::from_reports(reports);
        let failed: Vec<String> = outcome.failed().iter().map(|r| r.target.to_string()).collect();

        match &outcome {
            DeliveryOutcome::Delivered { targets } => {
                info!(target_count = targets.len(), outcome = outcome.status(), "delivery_outcome");
            }
            _ => {
                warn!(failed_targets = ?failed, outcome = outcome.status(), "delivery_outcome");
            }
        }

        outcome
    }

    /// Drive one target through the retry policy until a terminal state.
    async fn deliver_to_target(
        &self,
        target: &PublishTarget,
        message: &OutboundMessage,
        deadline: Instant,
    ) -> TargetReport {
        let publisher = match self.factory.publisher_for(target.kind) {
            Ok(publisher) => publisher,
            Err(e) => {
                return TargetReport {
                    target: target.clone(),
                    attempts: 0,
                    error: Some(DeliveryError::rejected(e.to_string())),
                }
            }
        };

        let deadline_ms = self.policy.event_deadline.as_millis() as u64;
        let mut attempts: Vec<DeliveryAttempt> = Vec::new();

        loop {
            let attempt = DeliveryAttempt::start(attempts.len() as u32 + 1, target, message.event_id());
            let number = attempt.number;

            let span = info_span!(
                "delivery_attempt",
                broker = %target.kind,
                destination = %target.destination,
                attempt = number,
            );

            let result = match timeout_at(deadline, publisher.publish(target, message))
                .instrument(span.clone())
                .await
            {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::DeadlineExceeded { deadline_ms }),
            };

            attempts.push(attempt.finish(&result));

            let error = match result {
                Ok(()) => {
                    info!(parent: &span, "delivery_attempt_succeeded");
                    return TargetReport::from_attempts(target, &attempts);
                }
                Err(error) => error,
            };

            warn!(
                parent: &span,
                error = %error,
                category = %error.category(),
                "delivery_attempt_failed"
            );

            let delay = match self.policy.decide(number, &error) {
                RetryDecision::Retry(delay) => delay,
                RetryDecision::GiveUp => return TargetReport::from_attempts(target, &attempts),
            };

            // Give up early; the report keeps the last publish error.
            if Instant::now() + delay >= deadline {
                warn!(
                    parent: &span,
                    backoff_ms = delay.as_millis() as u64,
                    "delivery_backoff_exceeds_deadline"
                );
                return TargetReport::from_attempts(target, &attempts);
            }

            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::broker::{BrokerKind, BrokerPublisher};
    use crate::health::{BrokerHealth, HealthReport, HealthSettings};
    use crate::routing::{FeatureFlags, RoutingTable};

    /// Scripted in-memory broker. Each destination pops its next result;
    /// an exhausted script succeeds.
    struct ScriptedPublisher {
        kind: BrokerKind,
        script: Mutex<HashMap<String, VecDeque<Step>>>,
        calls: Mutex<Vec<(PublishTarget, String)>>,
    }

    #[derive(Clone)]
    enum Step {
        Fail(DeliveryError),
        Hang,
    }

    impl ScriptedPublisher {
        fn new(kind: BrokerKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                script: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn script(self: &Arc<Self>, destination: &str, steps: Vec<Step>) -> Arc<Self> {
            self.script
                .lock()
                .unwrap()
                .insert(destination.to_string(), steps.into());
            Arc::clone(self)
        }

        fn calls(&self) -> Vec<(PublishTarget, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BrokerPublisher for ScriptedPublisher {
        fn kind(&self) -> BrokerKind {
            self.kind
        }

        async fn publish(
            &self,
            target: &PublishTarget,
            message: &OutboundMessage,
        ) -> Result<(), DeliveryError> {
            self.calls
                .lock()
                .unwrap()
                .push((target.clone(), message.event_id().to_string()));

            let step = self
                .script
                .lock()
                .unwrap()
                .get_mut(&target.destination)
                .and_then(|steps| steps.pop_front());

            match step {
                None => Ok(()),
                Some(Step::Fail(e)) => Err(e),
                Some(Step::Hang) => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }
        }

        async fn ping(&self) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter_factor: 0.0,
            event_deadline: Duration::from_secs(30),
        }
    }

    fn pipeline(
        queue: &Arc<ScriptedPublisher>,
        stream: &Arc<ScriptedPublisher>,
        policy: RetryPolicy,
    ) -> DeliveryPipeline {
        let routes = RoutingTable::parse("payment.completed=queue:payments,stream:payments");
        let factory = PublisherFactory::new(routes, Arc::new(FeatureFlags::default()))
            .with_publisher(Arc::clone(queue) as Arc<dyn BrokerPublisher>)
            .with_publisher(Arc::clone(stream) as Arc<dyn BrokerPublisher>);
        DeliveryPipeline::new(Arc::new(factory), policy)
    }

    fn pipeline_with_health(
        queue: &Arc<ScriptedPublisher>,
        stream: &Arc<ScriptedPublisher>,
        policy: RetryPolicy,
    ) -> (DeliveryPipeline, Arc<HealthCheck>) {
        let publishers: Vec<Arc<dyn BrokerPublisher>> = vec![
            Arc::clone(queue) as Arc<dyn BrokerPublisher>,
            Arc::clone(stream) as Arc<dyn BrokerPublisher>,
        ];
        let health = Arc::new(HealthCheck::new(HealthSettings::default(), publishers));
        let pipeline = pipeline(queue, stream, policy).with_health(Arc::clone(&health));
        (pipeline, health)
    }

    fn broker_health(report: &HealthReport, kind: BrokerKind) -> BrokerHealth {
        report
            .brokers
            .iter()
            .find(|b| b.broker == kind)
            .cloned()
            .unwrap()
    }

    fn payment_event() -> WebhookEvent {
        WebhookEvent::builder("payment.completed", r#"{"amount":10}"#)
            .id("evt-payment-1")
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_retries_then_delivers() {
        let queue = ScriptedPublisher::new(BrokerKind::Queue);
        let stream = ScriptedPublisher::new(BrokerKind::Stream).script(
            "payments",
            vec![
                Step::Fail(DeliveryError::timeout(5000)),
                Step::Fail(DeliveryError::timeout(5000)),
            ],
        );

        let outcome = pipeline(&queue, &stream, policy()).deliver(&payment_event()).await;

        assert!(outcome.is_delivered(), "unexpected outcome: {outcome:?}");
        assert_eq!(
            outcome.report_for(&PublishTarget::stream("payments")).unwrap().attempts,
            3
        );
        assert_eq!(
            outcome.report_for(&PublishTarget::queue("payments")).unwrap().attempts,
            1
        );
        assert_eq!(stream.calls().len(), 3);
        assert_eq!(queue.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrouted_event_publishes_nothing() {
        let queue = ScriptedPublisher::new(BrokerKind::Queue);
        let stream = ScriptedPublisher::new(BrokerKind::Stream);
        let event = WebhookEvent::builder("unregistered.type", "{}").build();

        let outcome = pipeline(&queue, &stream, policy()).deliver(&event).await;

        assert_eq!(
            outcome,
            DeliveryOutcome::Failed(FailureCause::Unroutable(ConfigurationError::NoRoute {
                event_type: "unregistered.type".to_string()
            }))
        );
        assert!(queue.calls().is_empty());
        assert!(stream.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_rejection_gives_partial_delivery() {
        let queue = ScriptedPublisher::new(BrokerKind::Queue).script(
            "payments",
            vec![Step::Fail(DeliveryError::unknown_destination("payments"))],
        );
        let stream = ScriptedPublisher::new(BrokerKind::Stream);

        let outcome = pipeline(&queue, &stream, policy()).deliver(&payment_event()).await;

        match &outcome {
            DeliveryOutcome::PartiallyDelivered { delivered, failed } => {
                assert_eq!(delivered.len(), 1);
                assert_eq!(delivered[0].target, PublishTarget::stream("payments"));
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].target, PublishTarget::queue("payments"));
                assert_eq!(failed[0].attempts, 1);
                assert_eq!(
                    failed[0].error,
                    Some(DeliveryError::unknown_destination("payments"))
                );
            }
            other => panic!("expected partial delivery, got {other:?}"),
        }
        assert_eq!(queue.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_targets_exhaust_retries() {
        let transient = || Step::Fail(DeliveryError::connection("refused"));
        let queue = ScriptedPublisher::new(BrokerKind::Queue)
            .script("payments", vec![transient(); 10]);
        let stream = ScriptedPublisher::new(BrokerKind::Stream)
            .script("payments", vec![transient(); 10]);

        let outcome = pipeline(&queue, &stream, policy()).deliver(&payment_event()).await;

        match &outcome {
            DeliveryOutcome::Failed(FailureCause::Exhausted(failed)) => {
                assert_eq!(failed.len(), 2);
                assert!(failed.iter().all(|r| r.attempts == 4));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(queue.calls().len(), 4);
        assert_eq!(stream.calls().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identifier_is_stable_across_retries() {
        let queue = ScriptedPublisher::new(BrokerKind::Queue)
            .script("payments", vec![Step::Fail(DeliveryError::backpressure("nack")); 3]);
        let stream = ScriptedPublisher::new(BrokerKind::Stream)
            .script("payments", vec![Step::Fail(DeliveryError::timeout(1)); 2]);
        let event = payment_event();

        pipeline(&queue, &stream, policy()).deliver(&event).await;

        let calls: Vec<_> = queue.calls().into_iter().chain(stream.calls()).collect();
        assert_eq!(calls.len(), 7);
        assert!(calls.iter().all(|(_, id)| id == event.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_target_fails_at_deadline() {
        let queue = ScriptedPublisher::new(BrokerKind::Queue);
        let stream = ScriptedPublisher::new(BrokerKind::Stream).script("payments", vec![Step::Hang]);
        let policy = RetryPolicy {
            event_deadline: Duration::from_secs(2),
            ..policy()
        };

        let started = Instant::now();
        let outcome = pipeline(&queue, &stream, policy).deliver(&payment_event()).await;

        assert!(started.elapsed() <= Duration::from_secs(2));
        let failed = outcome.failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].target, PublishTarget::stream("payments"));
        assert_eq!(
            failed[0].error,
            Some(DeliveryError::DeadlineExceeded { deadline_ms: 2000 })
        );
        assert_eq!(outcome.status(), "partially_delivered");
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_past_deadline_is_not_started() {
        let queue = ScriptedPublisher::new(BrokerKind::Queue)
            .script("payments", vec![Step::Fail(DeliveryError::timeout(1)); 5]);
        let stream = ScriptedPublisher::new(BrokerKind::Stream);
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            event_deadline: Duration::from_secs(5),
            ..policy()
        };

        let started = Instant::now();
        let outcome = pipeline(&queue, &stream, policy).deliver(&payment_event()).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        let report = outcome.report_for(&PublishTarget::queue("payments")).unwrap();
        assert_eq!(report.attempts, 1);
        assert_eq!(report.error, Some(DeliveryError::timeout(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcomes_are_recorded_in_health() {
        let queue = ScriptedPublisher::new(BrokerKind::Queue).script(
            "payments",
            vec![Step::Fail(DeliveryError::unknown_destination("payments"))],
        );
        let stream = ScriptedPublisher::new(BrokerKind::Stream);
        let (pipeline, health) = pipeline_with_health(&queue, &stream, policy());

        pipeline.deliver(&payment_event()).await;

        let report = health.probe();
        let queue_health = broker_health(&report, BrokerKind::Queue);
        assert_eq!(queue_health.samples, 1);
        assert_eq!(queue_health.failure_ratio, 1.0);
        assert_eq!(queue_health.unreachable_for_secs, None);
        assert!(queue_health.last_error.is_some());
        let stream_health = broker_health(&report, BrokerKind::Stream);
        assert_eq!(stream_health.samples, 1);
        assert_eq!(stream_health.failure_ratio, 0.0);

        let unrouted = WebhookEvent::builder("unregistered.type", "{}").build();
        pipeline.deliver(&unrouted).await;

        let report = health.probe();
        assert_eq!(broker_health(&report, BrokerKind::Queue).samples, 1);
        assert_eq!(broker_health(&report, BrokerKind::Stream).samples, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_error_before_deadline_marks_broker_unreachable() {
        let queue = ScriptedPublisher::new(BrokerKind::Queue)
            .script("payments", vec![Step::Fail(DeliveryError::connection("refused")); 5]);
        let stream = ScriptedPublisher::new(BrokerKind::Stream);
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            event_deadline: Duration::from_secs(5),
            ..policy()
        };
        let (pipeline, health) = pipeline_with_health(&queue, &stream, policy);

        let outcome = pipeline.deliver(&payment_event()).await;

        let report = outcome.report_for(&PublishTarget::queue("payments")).unwrap();
        assert_eq!(report.error, Some(DeliveryError::connection("refused")));
        let queue_health = broker_health(&health.probe(), BrokerKind::Queue);
        assert!(queue_health.unreachable_for_secs.is_some());
    }

    #[test]
    fn test_attempt_lifecycle() {
        let target = PublishTarget::queue("q");
        let attempt = DeliveryAttempt::start(1, &target, "evt-1");
        assert_eq!(attempt.status, AttemptStatus::Pending);

        let done = attempt.finish(&Err(DeliveryError::timeout(1)));
        assert_eq!(done.status, AttemptStatus::Failed(DeliveryError::timeout(1)));
        assert_eq!(done.event_id, "evt-1");
    }

    #[test]
    fn test_report_follows_last_attempt() {
        let target = PublishTarget::stream("payments");
        let attempts = vec![
            DeliveryAttempt::start(1, &target, "evt-1").finish(&Err(DeliveryError::timeout(1))),
            DeliveryAttempt::start(2, &target, "evt-1").finish(&Ok(())),
        ];

        let report = TargetReport::from_attempts(&target, &attempts);
        assert_eq!(report.attempts, 2);
        assert!(report.is_delivered());

        let report = TargetReport::from_attempts(&target, &attempts[..1]);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.error, Some(DeliveryError::timeout(1)));
    }
}
