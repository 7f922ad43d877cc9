//! Watch-and-detect loop
//!
//! A [`PodMonitor`] runs one [`EventStream`] for a scope, passes every event
//! through a [`FailureDetector`], and forwards the resulting alerts to an
//! [`AlertSink`]. Monitors for different scopes share nothing but a clone of
//! the sink.

use std::sync::Arc;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::detector::FailureDetector;
use crate::health::{components, HealthRegistry};
use crate::models::Scope;
use crate::observability::{PodmonMetrics, StructuredLogger};
use crate::sink::{AlertSink, SendOutcome};
use crate::watch::{EventStream, PodFeed, ReconnectPolicy, WatchError};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("alert consumer shut down while monitoring {scope}")]
    SinkClosed { scope: Scope },
}

/// Counters for a finished monitor run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MonitorStats {
    pub events_seen: u64,
    pub alerts_emitted: u64,
    pub alerts_dropped: u64,
    pub reconnects: u64,
}

/// Watches one scope and alerts on failed containers
pub struct PodMonitor {
    feed: Arc<dyn PodFeed>,
    scope: Scope,
    detector: FailureDetector,
    sink: AlertSink,
    policy: ReconnectPolicy,
    metrics: PodmonMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl PodMonitor {
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Run until `cancel` fires
    ///
    /// # Errors
    ///
    /// - [`MonitorError::Watch`] if the first subscription cannot be opened
    /// - [`MonitorError::SinkClosed`] if the alert consumer goes away
    #[tracing::instrument(
        skip(self, cancel),
        fields(scope = %self.scope, annotation = %self.detector.annotation_prefix())
    )]
    pub async fn run(self, cancel: CancellationToken) -> Result<MonitorStats, MonitorError> {
        let prefix = self.detector.annotation_prefix();
        match &self.scope {
            Scope::AllNamespaces => info!("Setting up watch on all namespaces for {prefix}"),
            Scope::Namespace(ns) => info!("Setting up watch on {ns} for {prefix}"),
        }

        let mut stats = MonitorStats::default();
        if cancel.is_cancelled() {
            return Ok(stats);
        }

        let component = components::watcher(&self.scope);
        let mut stream = match EventStream::open(
            Arc::clone(&self.feed),
            self.scope.clone(),
            self.policy.clone(),
            cancel.clone(),
        )
        .await
        {
            Ok(stream) => stream,
            Err(e) => {
                if let Some(health) = &self.health {
                    health.set_unhealthy(&component, e.to_string()).await;
                }
                return Err(e.into());
            }
        };

        if let Some(health) = &self.health {
            health.set_healthy(&component).await;
            stream = stream.with_health(health.clone());
        }

        self.metrics.watch_started();
        let result = self.process(&mut stream, &cancel, &mut stats).await;
        self.metrics.watch_stopped();
        stats.reconnects = stream.reconnects();
        drop(stream);

        info!(
            events = stats.events_seen,
            alerts = stats.alerts_emitted,
            dropped = stats.alerts_dropped,
            reconnects = stats.reconnects,
            "Pod monitor stopped"
        );
        result.map(|()| stats)
    }

    async fn process(
        &self,
        stream: &mut EventStream,
        cancel: &CancellationToken,
        stats: &mut MonitorStats,
    ) -> Result<(), MonitorError> {
        while let Some(event) = stream.next().await {
            stats.events_seen += 1;
            self.metrics.inc_events(event.kind);

            for alert in self.detector.detect(&event) {
                let started = Instant::now();
                let sent = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    sent = self.sink.send(alert.clone()) => sent,
                };
                self.metrics
                    .observe_send_latency(started.elapsed().as_secs_f64());

                match sent {
                    Ok(SendOutcome::Delivered) => {
                        stats.alerts_emitted += 1;
                        self.metrics.inc_alerts_emitted();
                        debug!(pod_name = %alert.pod_name(), container = %alert.container_name(), "Event sent to notifier.");
                    }
                    Ok(SendOutcome::Dropped) => {
                        stats.alerts_dropped += 1;
                        self.metrics.inc_alerts_dropped();
                        self.logger.log_alert_dropped(&alert);
                    }
                    Err(e) => {
                        error!(error = %e, "Stopping pod monitor");
                        return Err(MonitorError::SinkClosed {
                            scope: self.scope.clone(),
                        });
                    }
                }
            }
        }

        Ok(())
    }
}

/// Builder for creating a pod monitor
pub struct PodMonitorBuilder {
    feed: Option<Arc<dyn PodFeed>>,
    scope: Scope,
    detector: Option<FailureDetector>,
    sink: Option<AlertSink>,
    policy: ReconnectPolicy,
    logger: Option<StructuredLogger>,
    health: Option<HealthRegistry>,
}

impl PodMonitorBuilder {
    /// Create a new builder watching all namespaces
    pub fn new() -> Self {
        Self {
            feed: None,
            scope: Scope::AllNamespaces,
            detector: None,
            sink: None,
            policy: ReconnectPolicy::default(),
            logger: None,
            health: None,
        }
    }

    pub fn feed(mut self, feed: Arc<dyn PodFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn detector(mut self, detector: FailureDetector) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn sink(mut self, sink: AlertSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Build the monitor
    pub fn build(self) -> anyhow::Result<PodMonitor> {
        let feed = self
            .feed
            .ok_or_else(|| anyhow::anyhow!("Pod feed is required"))?;
        let detector = self
            .detector
            .ok_or_else(|| anyhow::anyhow!("Failure detector is required"))?;
        let sink = self
            .sink
            .ok_or_else(|| anyhow::anyhow!("Alert sink is required"))?;

        Ok(PodMonitor {
            feed,
            scope: self.scope,
            detector,
            sink,
            policy: self.policy,
            metrics: PodmonMetrics::new(),
            logger: self
                .logger
                .unwrap_or_else(|| StructuredLogger::new("podmon")),
            health: self.health,
        })
    }
}

impl Default for PodMonitorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
