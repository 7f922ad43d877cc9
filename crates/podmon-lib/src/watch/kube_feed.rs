//! Kubernetes pod watch feed

use std::path::Path;
use std::pin::Pin;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, WatchEvent, WatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info};

use super::{PodFeed, PodSubscription, WatchError};
use crate::models::{PodEvent, PodEventKind, Scope};

type PodWatchStream = Pin<Box<dyn Stream<Item = kube::Result<WatchEvent<Pod>>> + Send>>;

/// Resource version that starts a watch from the API server's current state
const WATCH_FROM_ANY_VERSION: &str = "0";

/// Build a Kubernetes client
///
/// Uses the kubeconfig at `kubeconfig` when given, otherwise the in-cluster
/// configuration or the default kubeconfig.
pub async fn connect(kubeconfig: Option<&Path>) -> Result<Client> {
    let client = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig file: {}", path.display()))?;
            let config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .with_context(|| {
                        format!(
                            "Failed to create config from kubeconfig: {}",
                            path.display()
                        )
                    })?;
            Client::try_from(config)
                .context("Failed to create Kubernetes client from custom kubeconfig")?
        }
        None => Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?,
    };

    info!(kubeconfig = ?kubeconfig, "Kubernetes client ready");
    Ok(client)
}

/// Pod feed backed by the Kubernetes watch API
#[derive(Clone)]
pub struct KubePodFeed {
    client: Client,
    params: WatchParams,
}

impl KubePodFeed {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            params: WatchParams::default(),
        }
    }

    /// Override the watch parameters (label/field selectors, timeout)
    pub fn with_params(mut self, params: WatchParams) -> Self {
        self.params = params;
        self
    }

    fn api(&self, scope: &Scope) -> Api<Pod> {
        match scope.namespace() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl PodFeed for KubePodFeed {
    async fn subscribe(&self, scope: &Scope) -> Result<Box<dyn PodSubscription>, WatchError> {
        let stream = self
            .api(scope)
            .watch(&self.params, WATCH_FROM_ANY_VERSION)
            .await
            .map_err(|e| WatchError::Subscribe {
                scope: scope.clone(),
                message: e.to_string(),
            })?;

        debug!(scope = %scope, "Opened pod watch");
        Ok(Box::new(KubeSubscription {
            stream: Box::pin(stream),
        }))
    }
}

/// An open Kubernetes pod watch; the HTTP stream closes on drop
struct KubeSubscription {
    stream: PodWatchStream,
}

#[async_trait]
impl PodSubscription for KubeSubscription {
    async fn next_event(&mut self) -> Result<PodEvent, WatchError> {
        loop {
            let event = match self.stream.next().await {
                Some(Ok(event)) => event,
                Some(Err(e)) => return Err(WatchError::Stream(e.to_string())),
                None => return Err(WatchError::Ended),
            };

            match event {
                WatchEvent::Added(pod) => return Ok(PodEvent::new(PodEventKind::Added, pod)),
                WatchEvent::Modified(pod) => {
                    return Ok(PodEvent::new(PodEventKind::Modified, pod))
                }
                WatchEvent::Deleted(pod) => return Ok(PodEvent::new(PodEventKind::Deleted, pod)),
                WatchEvent::Bookmark(bookmark) => {
                    debug!(
                        resource_version = %bookmark.metadata.resource_version,
                        "Pod watch bookmark"
                    );
                }
                WatchEvent::Error(status) => {
                    return Err(WatchError::Status {
                        code: status.code,
                        reason: status.reason,
                        message: status.message,
                    })
                }
            }
        }
    }
}
