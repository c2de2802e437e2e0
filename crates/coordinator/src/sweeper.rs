use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::Coordinator;

/// Spawns the periodic expiry sweep.
///
/// The first pass runs immediately so tasks that expired while the process
/// was down are reclaimed on startup. The loop exits when `cancel` fires.
pub fn spawn_sweeper(coordinator: Arc<Coordinator>, cancel: CancellationToken) -> JoinHandle<()> {
    let interval = coordinator.config().sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("expiry sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let removed = coordinator.sweep_expired(chrono::Utc::now()).await;
                    if removed > 0 {
                        info!(removed, remaining = coordinator.active_tasks(), "expiry sweep finished");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chunkup_protocol::messages::InitializeTaskRequest;

    use crate::CoordinatorConfig;

    #[tokio::test]
    async fn sweeper_reclaims_expired_tasks_and_stops() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = CoordinatorConfig::new(tmp.path());
        config.retention = Duration::ZERO;
        config.sweep_interval = Duration::from_millis(20);
        let coord = Arc::new(Coordinator::open(config).await.unwrap());

        coord
            .initialize(&InitializeTaskRequest {
                digest: None,
                token: None,
                name: "a.bin".into(),
                size: 4,
                chunk_size: 2,
                chunk_count: 2,
            })
            .await
            .unwrap();
        assert_eq!(coord.active_tasks(), 1);

        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(Arc::clone(&coord), cancel.clone());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while coord.active_tasks() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(coord.active_tasks(), 0);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
