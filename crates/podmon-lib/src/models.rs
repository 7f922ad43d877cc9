//! Core data models for the pod monitor

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::Pod;
use serde::Serialize;

/// Alert describing a container that exited with a non-zero status
///
/// Alerts own copies of the pod's annotations and labels, taken when the
/// failure was detected. The exit code is always greater than zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pod_name: String,
    namespace: String,
    annotations: BTreeMap<String, String>,
    labels: BTreeMap<String, String>,
    container_name: String,
    container_exit_code: i32,
}

impl Alert {
    /// Build an alert for a terminated container of `pod`
    ///
    /// Returns `None` when the exit code is not positive or the pod has no
    /// name or namespace.
    pub fn for_container(pod: &Pod, container_name: &str, exit_code: i32) -> Option<Self> {
        if exit_code <= 0 {
            return None;
        }

        let metadata = &pod.metadata;
        Some(Self {
            pod_name: metadata.name.clone()?,
            namespace: metadata.namespace.clone()?,
            annotations: metadata.annotations.clone().unwrap_or_default(),
            labels: metadata.labels.clone().unwrap_or_default(),
            container_name: container_name.to_string(),
            container_exit_code: exit_code,
        })
    }

    pub fn pod_name(&self) -> &str {
        &self.pod_name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn container_exit_code(&self) -> i32 {
        self.container_exit_code
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "container {} in pod {}/{} exited with code {}",
            self.container_name, self.namespace, self.pod_name, self.container_exit_code
        )
    }
}

/// Namespace scope of a pod watch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Watch pods in every namespace
    AllNamespaces,
    /// Watch pods in a single namespace
    Namespace(String),
}

impl Scope {
    /// Build a scope from an optional namespace name
    ///
    /// An empty name means all namespaces, the same as the Kubernetes API.
    pub fn from_namespace(namespace: Option<&str>) -> Self {
        match namespace.map(str::trim) {
            Some(ns) if !ns.is_empty() => Scope::Namespace(ns.to_string()),
            _ => Scope::AllNamespaces,
        }
    }

    /// Namespace name, or `None` for all namespaces
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Scope::AllNamespaces => None,
            Scope::Namespace(ns) => Some(ns),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::AllNamespaces => write!(f, "all namespaces"),
            Scope::Namespace(ns) => write!(f, "{}", ns),
        }
    }
}

/// Kind of change reported by the pod feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PodEventKind {
    Added,
    Modified,
    Deleted,
}

impl PodEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodEventKind::Added => "ADDED",
            PodEventKind::Modified => "MODIFIED",
            PodEventKind::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for PodEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single change event paired with the pod snapshot it describes
#[derive(Debug, Clone)]
pub struct PodEvent {
    pub kind: PodEventKind,
    pub pod: Pod,
}

impl PodEvent {
    pub fn new(kind: PodEventKind, pod: Pod) -> Self {
        Self { kind, pod }
    }

    pub fn added(pod: Pod) -> Self {
        Self::new(PodEventKind::Added, pod)
    }

    pub fn modified(pod: Pod) -> Self {
        Self::new(PodEventKind::Modified, pod)
    }

    pub fn deleted(pod: Pod) -> Self {
        Self::new(PodEventKind::Deleted, pod)
    }

    /// Pod name, or `"unknown"` when the snapshot has none
    pub fn pod_name(&self) -> &str {
        self.pod.metadata.name.as_deref().unwrap_or("unknown")
    }
}
