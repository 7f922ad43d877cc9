//! Restartable pod event stream
//!
//! [`EventStream`] owns at most one open subscription. Reads move it through
//! three states:
//!
//! ```text
//! Disconnected --subscribe ok--> Connected --next()--> ReadingEvent
//!      ^                             ^                     |
//!      |                             +------ event --------+
//!      +------------------- read error / stream end -------+
//! ```
//!
//! Only the very first subscription can fail the stream. After that every
//! failure, including a failed reopen, is retried with the configured
//! backoff until it succeeds or the stream is cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{PodFeed, PodSubscription, WatchError};
use crate::health::{components, HealthRegistry};
use crate::models::{PodEvent, Scope};
use crate::observability::PodmonMetrics;

/// Backoff applied between reconnect attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt (doubles per consecutive failure)
    pub initial_backoff: Duration,
    /// Upper bound for the doubled delay
    pub max_backoff: Duration,
    /// Maximum random jitter added to each delay
    pub jitter: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }
}

impl ReconnectPolicy {
    /// Reconnect immediately, without any delay
    pub fn immediate() -> Self {
        Self {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Delay before reconnecting after `failures` consecutive failures
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 || self.initial_backoff.is_zero() {
            return Duration::ZERO;
        }

        let factor = 2u32.saturating_pow(failures - 1);
        let base = self
            .initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff);
        base + Duration::from_millis(rand_jitter(self.jitter.as_millis() as u64))
    }
}

/// Connection state of an [`EventStream`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No subscription is open
    Disconnected,
    /// A subscription is open and idle
    Connected,
    /// Waiting on the open subscription for the next event
    ReadingEvent,
}

/// Unbounded stream of pod events for one scope
pub struct EventStream {
    feed: Arc<dyn PodFeed>,
    scope: Scope,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
    subscription: Option<Box<dyn PodSubscription>>,
    state: ConnectionState,
    consecutive_failures: u32,
    reconnects: u64,
    metrics: PodmonMetrics,
    health: Option<HealthRegistry>,
    degraded: bool,
}

impl EventStream {
    /// Open the first subscription for `scope`
    ///
    /// # Errors
    ///
    /// - [`WatchError::Subscribe`] if the feed refuses the initial subscription
    pub async fn open(
        feed: Arc<dyn PodFeed>,
        scope: Scope,
        policy: ReconnectPolicy,
        cancel: CancellationToken,
    ) -> Result<Self, WatchError> {
        let subscription = feed.subscribe(&scope).await?;
        info!(scope = %scope, "Pod watch established");

        Ok(Self {
            feed,
            scope,
            policy,
            cancel,
            subscription: Some(subscription),
            state: ConnectionState::Connected,
            consecutive_failures: 0,
            reconnects: 0,
            metrics: PodmonMetrics::new(),
            health: None,
            degraded: false,
        })
    }

    /// Report watch health to `health` under this scope's watcher component
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Number of subscriptions reopened after a failure
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// Wait for the next event, reconnecting as often as needed
    ///
    /// Returns `None` only once the stream has been cancelled. The open
    /// subscription is closed before returning `None`.
    pub async fn next(&mut self) -> Option<PodEvent> {
        loop {
            if self.cancel.is_cancelled() {
                self.disconnect();
                return None;
            }

            if self.subscription.is_none() && !self.reconnect().await {
                self.disconnect();
                return None;
            }

            let Some(subscription) = self.subscription.as_mut() else {
                continue;
            };

            self.state = ConnectionState::ReadingEvent;
            let cancel = self.cancel.clone();
            let result = tokio::select! {
                _ = cancel.cancelled() => None,
                result = subscription.next_event() => Some(result),
            };

            match result {
                None => {
                    self.disconnect();
                    return None;
                }
                Some(Ok(event)) => {
                    self.state = ConnectionState::Connected;
                    self.consecutive_failures = 0;
                    self.mark_healthy().await;
                    return Some(event);
                }
                Some(Err(e)) => {
                    warn!(scope = %self.scope, error = %e, "Got an error from watch, restarting watch");
                    self.metrics.inc_watch_errors();
                    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                    self.disconnect();
                    self.mark_degraded(&e).await;
                }
            }
        }
    }

    /// Reopen the subscription; returns false if cancelled first
    async fn reconnect(&mut self) -> bool {
        let mut attempts = 0u32;

        loop {
            let delay = self.policy.delay_for(self.consecutive_failures);
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                debug!(scope = %self.scope, delay_ms = delay.as_millis() as u64, "Waiting before reopening pod watch");
                tokio::select! {
                    _ = self.cancel.cancelled() => return false,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            if self.cancel.is_cancelled() {
                return false;
            }

            attempts += 1;
            let cancel = self.cancel.clone();
            let result = tokio::select! {
                _ = cancel.cancelled() => return false,
                result = self.feed.subscribe(&self.scope) => result,
            };

            match result {
                Ok(subscription) => {
                    self.subscription = Some(subscription);
                    self.state = ConnectionState::Connected;
                    self.reconnects += 1;
                    self.metrics.inc_watch_reconnects();
                    self.mark_healthy().await;
                    info!(scope = %self.scope, attempts = attempts, "Pod watch re-established");
                    return true;
                }
                Err(e) => {
                    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                    warn!(
                        scope = %self.scope,
                        error = %e,
                        attempt = attempts,
                        "Failed to reopen pod watch, retrying"
                    );
                }
            }
        }
    }

    fn disconnect(&mut self) {
        if self.subscription.take().is_some() {
            debug!(scope = %self.scope, "Closed pod watch");
        }
        self.state = ConnectionState::Disconnected;
    }

    async fn mark_healthy(&mut self) {
        if !self.degraded {
            return;
        }
        self.degraded = false;
        if let Some(health) = &self.health {
            health.set_healthy(&components::watcher(&self.scope)).await;
        }
    }

    async fn mark_degraded(&mut self, error: &WatchError) {
        self.degraded = true;
        if let Some(health) = &self.health {
            health
                .set_degraded(
                    &components::watcher(&self.scope),
                    format!("Reconnecting after watch error: {error}"),
                )
                .await;
        }
    }
}

/// Generate a random jitter value between 0 and max_ms
fn rand_jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }

    // Time-based pseudo-randomness is enough to spread reconnects
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;

    now % max_ms
}
