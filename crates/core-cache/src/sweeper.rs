//! Background sweep loop

use crate::store::ShardStore;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Sweep `store` every `interval` until `cancel` fires.
///
/// Skipping sweeps never affects correctness since reads check expiry
/// themselves; sweeping only reclaims memory.
pub fn spawn_sweeper<K, V>(
    store: Arc<ShardStore<K, V>>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = store.sweep();
                    if removed > 0 {
                        debug!(removed, "cache sweep removed expired entries");
                    }
                }
            }
        }

        info!("cache sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_reclaims_and_stops() {
        let store = Arc::new(ShardStore::<String, u32>::new(4).unwrap());
        store.set("a".to_string(), 1, Duration::from_millis(50));
        store.set("b".to_string(), 2, Duration::from_secs(60));

        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(store.clone(), Duration::from_millis(100), cancel.clone());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.len(), 1);
        assert_eq!(store.stats().swept, 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
