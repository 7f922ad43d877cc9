//! Pod failure monitoring library
//!
//! This crate provides the core functionality for:
//! - Watching pod change feeds with transparent reconnection
//! - Detecting containers that terminated with a non-zero exit code
//! - Forwarding alerts through a bounded queue with an explicit overflow policy
//! - Health checks and observability

pub mod detector;
pub mod health;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod sink;
pub mod watch;

pub use detector::{has_key_prefix, DetectorError, FailureDetector};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use monitor::{MonitorError, MonitorStats, PodMonitor, PodMonitorBuilder};
pub use observability::{PodmonMetrics, StructuredLogger};
pub use sink::{alert_queue, AlertReceiver, AlertSink, OverflowPolicy, SendOutcome, SinkError};
pub use watch::{EventStream, PodFeed, PodSubscription, ReconnectPolicy, WatchError};
