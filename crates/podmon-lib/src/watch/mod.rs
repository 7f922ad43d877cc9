//! Pod change-feed subscriptions
//!
//! This module provides:
//! - The [`PodFeed`] / [`PodSubscription`] seam over the cluster watch API
//! - [`EventStream`], which keeps one subscription open per scope and
//!   reopens it whenever a read fails
//! - [`KubePodFeed`], the Kubernetes implementation of the feed

mod kube_feed;
mod stream;

#[cfg(test)]
mod tests;

pub use kube_feed::{connect, KubePodFeed};
pub use stream::{ConnectionState, EventStream, ReconnectPolicy};

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{PodEvent, Scope};

/// Errors raised by pod watch subscriptions
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WatchError {
    #[error("failed to open pod watch on {scope}: {message}")]
    Subscribe { scope: Scope, message: String },

    #[error("pod watch stream failed: {0}")]
    Stream(String),

    #[error("pod watch returned status {code} ({reason}): {message}")]
    Status {
        code: u16,
        reason: String,
        message: String,
    },

    #[error("pod watch stream ended")]
    Ended,
}

/// Source of pod watch subscriptions
#[async_trait]
pub trait PodFeed: Send + Sync {
    /// Open a new subscription for `scope`
    ///
    /// The subscription is closed when the returned box is dropped.
    async fn subscribe(&self, scope: &Scope) -> Result<Box<dyn PodSubscription>, WatchError>;
}

/// An open pod watch
#[async_trait]
pub trait PodSubscription: Send {
    /// Wait for the next change event
    async fn next_event(&mut self) -> Result<PodEvent, WatchError>;
}
