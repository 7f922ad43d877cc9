//! Container failure detection
//!
//! Turns a single pod change event into zero or more alerts:
//! - only `MODIFIED` events are inspected
//! - the pod must carry an annotation key starting with the configured prefix
//! - every terminated container with a positive exit code yields one alert,
//!   in container status order
//!
//! Repeated deliveries of the same terminated container produce repeated
//! alerts. Deduplication belongs to the alert consumer.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;
use tracing::debug;

use crate::models::{Alert, PodEvent, PodEventKind};

/// Errors raised while configuring the detector
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DetectorError {
    #[error("annotation prefix must not be empty")]
    EmptyPrefix,
}

/// Returns true if any key in `map` starts with `prefix`
pub fn has_key_prefix(map: &BTreeMap<String, String>, prefix: &str) -> bool {
    map.keys().any(|key| key.starts_with(prefix))
}

/// Detects abnormally terminated containers in annotated pods
#[derive(Debug, Clone)]
pub struct FailureDetector {
    annotation_prefix: String,
}

impl FailureDetector {
    /// Create a detector for pods annotated with `annotation_prefix`
    pub fn new(annotation_prefix: impl Into<String>) -> Result<Self, DetectorError> {
        let annotation_prefix = annotation_prefix.into();
        if annotation_prefix.is_empty() {
            return Err(DetectorError::EmptyPrefix);
        }

        Ok(Self { annotation_prefix })
    }

    pub fn annotation_prefix(&self) -> &str {
        &self.annotation_prefix
    }

    /// Check whether the pod opted in to failure alerts
    pub fn is_watched(&self, pod: &Pod) -> bool {
        pod.metadata
            .annotations
            .as_ref()
            .is_some_and(|annotations| has_key_prefix(annotations, &self.annotation_prefix))
    }

    /// Inspect one event and build an alert per failed container
    pub fn detect(&self, event: &PodEvent) -> Vec<Alert> {
        if event.kind != PodEventKind::Modified || !self.is_watched(&event.pod) {
            return Vec::new();
        }

        let Some(statuses) = event
            .pod
            .status
            .as_ref()
            .and_then(|status| status.container_statuses.as_ref())
        else {
            return Vec::new();
        };

        let mut alerts = Vec::new();
        for status in statuses {
            let Some(terminated) = status
                .state
                .as_ref()
                .and_then(|state| state.terminated.as_ref())
            else {
                continue;
            };

            if terminated.exit_code <= 0 {
                continue;
            }

            match Alert::for_container(&event.pod, &status.name, terminated.exit_code) {
                Some(alert) => alerts.push(alert),
                None => debug!(
                    pod_name = %event.pod_name(),
                    container = %status.name,
                    "Skipping failed container of pod without name or namespace"
                ),
            }
        }

        alerts
    }
}
