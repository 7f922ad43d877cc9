//! Bounded alert queue between the monitors and the alert consumer
//!
//! The queue holds at most `capacity` alerts. What happens when it is full
//! is decided by the [`OverflowPolicy`]:
//! - `Block` waits until the consumer makes room, with no upper bound
//! - `BlockWithTimeout` waits up to the timeout, then drops the alert
//! - `DropNewest` never waits and drops the alert being sent
//!
//! Dropped alerts are reported to the caller as [`SendOutcome::Dropped`].

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};

use crate::models::Alert;

/// Default time a sender waits for queue space
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of alerts buffered between monitors and consumer
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Behaviour of [`AlertSink::send`] when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait for the consumer indefinitely
    Block,
    /// Wait for the consumer up to the given duration, then drop the alert
    BlockWithTimeout(Duration),
    /// Drop the alert immediately if the queue is full
    DropNewest,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        OverflowPolicy::BlockWithTimeout(DEFAULT_SEND_TIMEOUT)
    }
}

/// Result of a send that reached a live consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Alert queued for the consumer
    Delivered,
    /// Queue stayed full and the policy gave up on this alert
    Dropped,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("alert consumer has shut down")]
    Closed,
}

/// Create a bounded alert queue
///
/// A capacity of zero is raised to one.
pub fn alert_queue(capacity: usize, policy: OverflowPolicy) -> (AlertSink, AlertReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    (
        AlertSink {
            tx,
            policy,
            capacity,
        },
        AlertReceiver { rx },
    )
}

/// Sending half of the alert queue, cloned into every monitor
#[derive(Debug, Clone)]
pub struct AlertSink {
    tx: mpsc::Sender<Alert>,
    policy: OverflowPolicy,
    capacity: usize,
}

impl AlertSink {
    /// Send an alert according to the overflow policy
    pub async fn send(&self, alert: Alert) -> Result<SendOutcome, SinkError> {
        match self.policy {
            OverflowPolicy::Block => self
                .tx
                .send(alert)
                .await
                .map(|()| SendOutcome::Delivered)
                .map_err(|_| SinkError::Closed),
            OverflowPolicy::BlockWithTimeout(timeout) => {
                match self.tx.send_timeout(alert, timeout).await {
                    Ok(()) => Ok(SendOutcome::Delivered),
                    Err(SendTimeoutError::Timeout(_)) => Ok(SendOutcome::Dropped),
                    Err(SendTimeoutError::Closed(_)) => Err(SinkError::Closed),
                }
            }
            OverflowPolicy::DropNewest => match self.tx.try_send(alert) {
                Ok(()) => Ok(SendOutcome::Delivered),
                Err(TrySendError::Full(_)) => Ok(SendOutcome::Dropped),
                Err(TrySendError::Closed(_)) => Err(SinkError::Closed),
            },
        }
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of alerts currently waiting in the queue
    pub fn queued(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    /// Returns true once the consumer has been dropped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of the alert queue, owned by the alert consumer
#[derive(Debug)]
pub struct AlertReceiver {
    rx: mpsc::Receiver<Alert>,
}

impl AlertReceiver {
    /// Wait for the next alert; `None` once every sink has been dropped
    pub async fn recv(&mut self) -> Option<Alert> {
        self.rx.recv().await
    }

    /// Take an alert if one is queued
    pub fn try_recv(&mut self) -> Option<Alert> {
        self.rx.try_recv().ok()
    }
}
