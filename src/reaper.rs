use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that expires overdue requests and prunes the
/// submission throttle.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let expired = engine.sweep_expired().await;
        if expired > 0 {
            tracing::debug!("sweeper tick expired {expired}");
        }
        engine.prune_throttle();
    }
}

/// Rewrites the WAL once `threshold` appends have piled up since the last
/// compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    compact_every(engine, threshold, COMPACT_CHECK_INTERVAL).await
}

async fn compact_every(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::engine::SubmitRequest;
    use crate::limits::RESPONSE_WINDOW_MS;
    use crate::model::*;
    use crate::notify::Outbox;
    use crate::throttle::SubmitThrottle;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("offhire_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn engine_with_request(name: &str) -> (Arc<Engine>, Arc<ManualClock>, Ulid) {
        let clock = Arc::new(ManualClock::new(1_780_315_200_000));
        let (outbox, _rx) = Outbox::channel();
        let engine = Arc::new(
            Engine::new(test_wal_path(name), outbox, clock.clone(), SubmitThrottle::disabled())
                .unwrap(),
        );
        let listing = Ulid::new();
        engine
            .sync_listing(listing, Ulid::new(), ListingType::Rent, ListingStatus::Active)
            .await
            .unwrap();
        let id = Ulid::new();
        engine
            .submit(SubmitRequest {
                id,
                listing_id: listing,
                start: "2026-07-01".parse().unwrap(),
                end: "2026-07-03".parse().unwrap(),
                renter: Renter::Registered { user_id: Ulid::new() },
            })
            .await
            .unwrap();
        (engine, clock, id)
    }

    #[tokio::test]
    async fn sweeper_expires_overdue_requests() {
        let (engine, clock, id) = engine_with_request("sweeper.wal").await;
        clock.advance(RESPONSE_WINDOW_MS + 1);

        let task = tokio::spawn(run_sweeper(engine.clone(), Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();

        let view = engine.get_request(id).await.unwrap();
        assert_eq!(view.status, RequestStatus::Expired);
        assert!(engine.collect_overdue(clock.now_ms()).await.is_empty());
    }

    #[tokio::test]
    async fn compactor_waits_for_threshold() {
        let (engine, _clock, _id) = engine_with_request("compactor.wal").await;
        assert_eq!(engine.wal_appends_since_compact().await, 2);

        let idle = tokio::spawn(compact_every(engine.clone(), 100, Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        idle.abort();
        assert_eq!(engine.wal_appends_since_compact().await, 2);

        let busy = tokio::spawn(compact_every(engine.clone(), 2, Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        busy.abort();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
