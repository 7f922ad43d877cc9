//! podmon - Kubernetes pod failure monitor
//!
//! Watches pods in the configured namespaces and raises an alert for every
//! container that terminates with a non-zero exit code in a pod carrying the
//! configured annotation prefix.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use podmon_lib::{
    alert_queue,
    health::components,
    watch::{connect, KubePodFeed},
    FailureDetector, HealthRegistry, MonitorError, MonitorStats, PodFeed, PodMonitorBuilder,
    PodmonMetrics, Scope, StructuredLogger,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod cli;
mod config;
mod notifier;

use cli::Cli;
use config::PodmonConfig;
use notifier::LogNotifier;

const PODMON_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Interval between readiness checks during startup
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(250);

type MonitorOutcome = (Scope, Result<MonitorStats, MonitorError>);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();
    info!("Starting podmon");

    // Load configuration
    let config = PodmonConfig::load(&cli)?;
    let scopes = config.scopes();
    let detector = FailureDetector::new(config.annotation_prefix.clone())?;
    info!(
        instance = %config.instance,
        scopes = scopes.len(),
        overflow = ?config.overflow,
        "Podmon configured"
    );

    // Initialize health registry; watchers register themselves once their first watch opens
    let health_registry = HealthRegistry::new();
    health_registry.register(components::NOTIFIER).await;

    // Register the metric families before the first scrape
    PodmonMetrics::new();
    let logger = StructuredLogger::new(&config.instance);

    let client = connect(config.kubeconfig.as_deref()).await?;
    let feed: Arc<dyn PodFeed> = Arc::new(KubePodFeed::new(client));

    let cancel = CancellationToken::new();
    let notifier_cancel = CancellationToken::new();

    let (sink, receiver) = alert_queue(config.queue_capacity, config.overflow_policy());
    let notifier = tokio::spawn(
        LogNotifier::new(receiver, logger.clone(), health_registry.clone())
            .run(notifier_cancel.clone()),
    );

    let mut monitors: JoinSet<MonitorOutcome> = JoinSet::new();
    for scope in &scopes {
        let monitor = PodMonitorBuilder::new()
            .feed(Arc::clone(&feed))
            .scope(scope.clone())
            .detector(detector.clone())
            .sink(sink.clone())
            .reconnect_policy(config.reconnect_policy())
            .logger(logger.clone())
            .health(health_registry.clone())
            .build()?;

        let token = cancel.clone();
        monitors.spawn(async move {
            let scope = monitor.scope().clone();
            (scope, monitor.run(token).await)
        });
    }
    // Monitors hold the only senders, so the notifier stops once they are gone
    drop(sink);

    logger.log_startup(PODMON_VERSION, &scopes, detector.annotation_prefix());

    tokio::spawn(mark_ready_when_watching(
        health_registry.clone(),
        scopes.clone(),
        cancel.clone(),
    ));

    // Start health and metrics server
    let app_state = Arc::new(api::AppState::new(health_registry.clone()));
    let mut api_handle = tokio::spawn(api::serve(config.api_port, app_state, cancel.clone()));

    // Run until a shutdown signal, or until a monitor or the API server gives up
    let mut failure = None;
    let mut api_stopped = false;
    tokio::select! {
        result = shutdown_signal() => {
            result?;
            logger.log_shutdown("Shutdown signal received");
        }
        Some(joined) = monitors.join_next() => {
            failure = monitor_finished(joined);
            logger.log_shutdown("Pod monitor stopped");
        }
        joined = &mut api_handle => {
            api_stopped = true;
            failure = Some(api_finished(joined));
            logger.log_shutdown("API server stopped");
        }
    }

    info!("Shutting down");
    cancel.cancel();

    while let Some(joined) = monitors.join_next().await {
        let result = monitor_finished(joined);
        if failure.is_none() {
            failure = result;
        }
    }

    notifier_cancel.cancel();
    match notifier.await {
        Ok(written) => info!(alerts = written, "Notifier drained"),
        Err(e) => error!(error = %e, "Notifier task failed"),
    }

    if !api_stopped {
        match api_handle.await {
            Ok(Err(e)) => error!(error = %e, "API server failed"),
            Err(e) => error!(error = %e, "API server task failed"),
            Ok(Ok(())) => {}
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Log a finished monitor; returns its error, if any
fn monitor_finished(joined: Result<MonitorOutcome, JoinError>) -> Option<anyhow::Error> {
    match joined {
        Ok((scope, Ok(stats))) => {
            info!(
                scope = %scope,
                events = stats.events_seen,
                alerts = stats.alerts_emitted,
                dropped = stats.alerts_dropped,
                reconnects = stats.reconnects,
                "Pod monitor finished"
            );
            None
        }
        Ok((scope, Err(e))) => {
            error!(scope = %scope, error = %e, "Pod monitor failed");
            Some(anyhow!(e).context(format!("Pod monitor for {scope} failed")))
        }
        Err(e) => {
            error!(error = %e, "Pod monitor task panicked");
            Some(anyhow!(e).context("Pod monitor task failed"))
        }
    }
}

/// Log an API server that stopped before shutdown was requested
fn api_finished(joined: Result<Result<()>, JoinError>) -> anyhow::Error {
    let e = match joined {
        Ok(Ok(())) => anyhow!("API server stopped unexpectedly"),
        Ok(Err(e)) => e.context("API server failed"),
        Err(e) => anyhow!(e).context("API server task failed"),
    };
    error!(error = ?e, "Health and metrics endpoints are down");
    e
}

/// Flip readiness once every scope has an open watch
async fn mark_ready_when_watching(
    health: HealthRegistry,
    scopes: Vec<Scope>,
    cancel: CancellationToken,
) {
    let watchers: Vec<String> = scopes.iter().map(components::watcher).collect();
    let mut interval = tokio::time::interval(READINESS_POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        let report = health.health().await;
        let watching = watchers.iter().all(|name| {
            report
                .components
                .get(name)
                .is_some_and(|c| c.status.is_operational())
        });

        if watching {
            health.set_ready(true).await;
            info!(watches = watchers.len(), "All pod watches established");
            return;
        }
    }
}

/// Wait for Ctrl-C or, on unix, SIGTERM
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl-C")?,
            _ = terminate.recv() => warn!("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    Ok(())
}
