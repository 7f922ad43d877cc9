//! Alert consumer that writes every alert to the structured log

use podmon_lib::{health::components, AlertReceiver, HealthRegistry, StructuredLogger};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct LogNotifier {
    receiver: AlertReceiver,
    logger: StructuredLogger,
    health: HealthRegistry,
}

impl LogNotifier {
    pub fn new(receiver: AlertReceiver, logger: StructuredLogger, health: HealthRegistry) -> Self {
        Self {
            receiver,
            logger,
            health,
        }
    }

    /// Consume alerts until every sender is gone or `cancel` fires
    ///
    /// Returns the number of alerts written. Alerts still queued at
    /// cancellation are written before returning.
    pub async fn run(mut self, cancel: CancellationToken) -> u64 {
        self.health.set_healthy(components::NOTIFIER).await;
        let mut written = 0u64;

        loop {
            let alert = tokio::select! {
                biased;
                alert = self.receiver.recv() => alert,
                _ = cancel.cancelled() => break,
            };

            match alert {
                Some(alert) => {
                    self.logger.log_alert(&alert);
                    written += 1;
                }
                None => break,
            }
        }

        while let Some(alert) = self.receiver.try_recv() {
            self.logger.log_alert(&alert);
            written += 1;
        }

        self.health
            .set_unhealthy(components::NOTIFIER, "Notifier stopped")
            .await;
        info!(alerts = written, "Notifier stopped");
        written
    }
}
