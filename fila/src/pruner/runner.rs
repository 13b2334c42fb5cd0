use std::{ops::Sub, sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::manager::QueueManager;

use super::PrunerConfig;

/// Calls [`QueueManager::prune`] on the configured schedule.
#[derive(Debug)]
pub struct PrunerRunner {
    config: PrunerConfig,
    manager: Arc<QueueManager>,
}

impl PrunerRunner {
    pub fn new(manager: Arc<QueueManager>, config: PrunerConfig) -> Self {
        Self { manager, config }
    }

    pub fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn({
            async move {
                loop {
                    let Some(next) = self.config.schedule.upcoming(Utc).next() else {
                        tracing::warn!("No future scheduled time for pruner, stopping");
                        break;
                    };
                    let delay = next
                        .sub(Utc::now())
                        .sub(TimeDelta::milliseconds(10))
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            self.prune().await;
                            let delay = next - Utc::now();
                            if delay > TimeDelta::zero() {
                                tokio::time::sleep(delay.to_std().unwrap_or(Duration::ZERO)).await;
                            }
                        }
                        _ = cancellation_token.cancelled() => {
                            tracing::debug!("Shutting down the job pruner");
                            break;
                        },
                    }
                }
            }
        })
    }

    async fn prune(&self) {
        let _ = self
            .manager
            .prune(self.config.older_than)
            .await
            .inspect(|pruned| tracing::info!(pruned, "Pruned {pruned} terminal jobs"))
            .inspect_err(|err| tracing::error!(?err, "Failed to clean up jobs with error {err}"));
    }
}

#[cfg(test)]
mod test {
    use crate::{
        backend::{memory::InMemoryBackend, Backend},
        job::JobOptions,
    };

    use super::*;

    #[tokio::test]
    async fn prunes_on_schedule_and_stops_on_cancel() {
        let backend = InMemoryBackend::new();
        let manager = Arc::new(QueueManager::new(Arc::new(backend.clone())));
        let id = manager
            .add_job("orcamento", "generate-pdf", (), JobOptions::default())
            .await
            .unwrap()
            .job_id;
        manager.next_job("orcamento").await.unwrap().unwrap();
        manager
            .complete_job(&id, serde_json::Value::Null)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let config = PrunerConfig::from_cron("* * * * * *")
            .unwrap()
            .with_retention(TimeDelta::milliseconds(1));
        let token = CancellationToken::new();
        let handle = PrunerRunner::new(manager.clone(), config).spawn(token.clone());

        tokio::time::timeout(Duration::from_secs(3), async {
            while backend.get_job("orcamento", &id).await.unwrap().is_some() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            manager.queue_metrics("orcamento").await.unwrap().completed,
            0
        );
    }
}
