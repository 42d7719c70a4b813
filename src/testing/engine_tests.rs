//! Scenario tests for the public engine operations.
//!
//! These drive the engine from many tasks at once and check the stock
//! invariants against the ledger, not the cache.

#[cfg(test)]
mod tests {
    use crate::config::{EngineConfig, HotspotConfig, LockConfig};
    use crate::engine::InventoryEngine;
    use crate::error::{Error, ValidationError};
    use crate::lock::{DistributedLock, InMemoryLock};
    use crate::testing::{ledger_aggregate, FaultController, FaultyLock};
    use crate::types::{ShardKey, StockKey};
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use test_log::test;
    use tokio::time::sleep;

    fn engine(config: EngineConfig) -> Arc<InventoryEngine> {
        Arc::new(InventoryEngine::in_memory(config).unwrap())
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_conservation_under_concurrent_traffic() {
        let engine = engine(EngineConfig::new(8));
        engine.initialize_shards(1, 1, 500).await.unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let observer = {
            let engine = engine.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut observations = 0;
                while !stop.load(Ordering::Relaxed) {
                    ledger_aggregate(&engine, 1, 1).await.unwrap();
                    observations += 1;
                    tokio::task::yield_now().await;
                }
                observations
            })
        };

        let mut handles = Vec::new();
        for user_id in 0..64u64 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                let mut rng = rand::rngs::StdRng::seed_from_u64(user_id);
                let quantity = rng.gen_range(1..=5);
                if engine.lock(1, 1, user_id, quantity).await.is_err() {
                    return 0;
                }
                if rng.gen_bool(0.5) {
                    engine.deduct(1, 1, user_id, quantity).await.unwrap();
                    quantity as u64
                } else {
                    engine.release(1, 1, user_id, quantity).await.unwrap();
                    0
                }
            }));
        }

        let mut sold = 0;
        for handle in handles {
            sold += handle.await.unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        assert!(observer.await.unwrap() > 0);

        let aggregate = ledger_aggregate(&engine, 1, 1).await.unwrap();
        assert_eq!(aggregate.locked, 0);
        assert_eq!(aggregate.sold, sold);
        assert_eq!(aggregate.available + aggregate.sold, 500);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_k_units_n_single_unit_buyers() {
        let engine = engine(EngineConfig::new(10));
        engine.initialize_shards(1, 1, 50).await.unwrap();

        let mut handles = Vec::new();
        for user_id in 0..200u64 {
            let engine = engine.clone();
            handles.push(tokio::spawn(
                async move { engine.lock(1, 1, user_id, 1).await },
            ));
        }

        let mut succeeded = 0;
        let mut insufficient = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => succeeded += 1,
                Err(Error::InsufficientStock { .. }) => insufficient += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(succeeded, 50);
        assert_eq!(insufficient, 150);

        let aggregate = ledger_aggregate(&engine, 1, 1).await.unwrap();
        assert_eq!(aggregate.available, 0);
        assert_eq!(aggregate.locked, 50);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_eight_buyers_of_fifteen_over_five_shards() {
        let engine = engine(EngineConfig::new(5));
        engine.initialize_shards(1, 1, 100).await.unwrap();

        let mut handles = Vec::new();
        for user_id in 1..=8u64 {
            let engine = engine.clone();
            handles.push(tokio::spawn(
                async move { engine.lock(1, 1, user_id, 15).await },
            ));
        }

        let mut succeeded = 0;
        let mut insufficient = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => succeeded += 1,
                Err(Error::InsufficientStock { .. }) => insufficient += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(succeeded, 6);
        assert_eq!(insufficient, 2);

        let aggregate = engine.query_aggregate(1, 1).await.unwrap();
        assert_eq!(aggregate.available, 10);
        assert_eq!(aggregate.locked, 90);
        assert_eq!(ledger_aggregate(&engine, 1, 1).await.unwrap(), aggregate);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_thousand_units_over_twenty_shards() {
        let engine = engine(EngineConfig::new(20));
        engine.initialize_shards(1, 1, 1000).await.unwrap();

        let mut sum = 0;
        for shard_id in 0..20 {
            let shard = engine.query_shard(1, 1, shard_id).await.unwrap();
            assert_eq!(shard.total, 50);
            sum += shard.available as u64;
        }

        assert_eq!(sum, 1000);
        assert_eq!(engine.query_aggregate(1, 1).await.unwrap().available, 1000);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_lock_deduct_release_never_raises_available() {
        let engine = engine(EngineConfig::new(4));
        engine.initialize_shards(1, 1, 20).await.unwrap();
        let before = engine.query_aggregate(1, 1).await.unwrap().available;

        engine.lock(1, 1, 9, 5).await.unwrap();
        engine.deduct(1, 1, 9, 5).await.unwrap();
        let err = engine.release(1, 1, 9, 5).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::ReservationNotFound { user_id: 9 })
        ));

        let after = engine.query_aggregate(1, 1).await.unwrap();
        assert_eq!(after.available, before - 5);
        assert_eq!(after.sold, 5);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_lock_then_release_restores_three_units() {
        let engine = engine(EngineConfig::new(3));
        engine.initialize_shards(1, 1, 30).await.unwrap();
        let before = engine.query_aggregate(1, 1).await.unwrap().available;

        engine.lock(1, 1, 7, 3).await.unwrap();
        assert_eq!(
            engine.query_aggregate(1, 1).await.unwrap().available,
            before - 3
        );

        engine.release(1, 1, 7, 3).await.unwrap();
        assert_eq!(engine.query_aggregate(1, 1).await.unwrap().available, before);
        assert!(engine.reservation(1, 1, 7).await.unwrap().is_none());
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_lock_timeout_leaves_ledger_unchanged() {
        let lock = Arc::new(InMemoryLock::new());
        let config = EngineConfig::new(2).with_lock(
            LockConfig::default()
                .with_wait_timeout(Duration::from_millis(50))
                .with_scan_timeout(Duration::from_millis(300)),
        );
        let engine = InventoryEngine::builder(config)
            .with_lock(lock.clone())
            .build()
            .unwrap();
        engine.initialize_shards(1, 1, 10).await.unwrap();

        // Someone else holds every segment lock.
        let stock = StockKey::new(1, 1);
        let mut held = Vec::new();
        for shard_id in 0..2 {
            let key = stock.shard(shard_id).lock_key();
            let token = lock
                .acquire(&key, Duration::ZERO, Duration::from_secs(10))
                .await
                .unwrap()
                .unwrap();
            held.push((key, token));
        }

        let before = ledger_aggregate(&engine, 1, 1).await.unwrap();
        let err = engine.lock(1, 1, 7, 2).await.unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
        assert!(err.is_retryable());

        assert_eq!(ledger_aggregate(&engine, 1, 1).await.unwrap(), before);
        assert!(engine.reservation(1, 1, 7).await.unwrap().is_none());

        for (key, token) in held {
            lock.release(&key, &token).await.unwrap();
        }
        engine.lock(1, 1, 7, 2).await.unwrap();
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_lock_service_outage_surfaces() {
        let faults = Arc::new(FaultController::outage());
        let lock = Arc::new(FaultyLock::new(Arc::new(InMemoryLock::new()), faults.clone()));
        let engine = InventoryEngine::builder(EngineConfig::new(4))
            .with_lock(lock)
            .build()
            .unwrap();
        engine.initialize_shards(1, 1, 10).await.unwrap();

        faults.enable();
        let err = engine.lock(1, 1, 7, 2).await.unwrap_err();
        assert!(matches!(err, Error::DependencyUnavailable(_)));
        assert!(engine.reservation(1, 1, 7).await.unwrap().is_none());
        assert_eq!(ledger_aggregate(&engine, 1, 1).await.unwrap().available, 10);

        faults.disable();
        engine.lock(1, 1, 7, 2).await.unwrap();
        assert_eq!(engine.metrics().snapshot().lock_failure, 1);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_expired_reservation_is_released() {
        let config = EngineConfig::new(2).with_reservation_ttl(Duration::from_millis(50));
        let engine = engine(config);
        engine.initialize_shards(1, 1, 10).await.unwrap();

        engine.lock(1, 1, 7, 4).await.unwrap();
        assert_eq!(engine.expire_reservations().await.unwrap(), 0);

        sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.expire_reservations().await.unwrap(), 1);

        assert!(engine.reservation(1, 1, 7).await.unwrap().is_none());
        let aggregate = ledger_aggregate(&engine, 1, 1).await.unwrap();
        assert_eq!(aggregate.available, 10);
        assert_eq!(engine.metrics().snapshot().reservations_expired, 1);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_expired_reservation_does_not_block_relock() {
        let config = EngineConfig::new(2).with_reservation_ttl(Duration::from_millis(50));
        let engine = engine(config);
        engine.initialize_shards(1, 1, 10).await.unwrap();

        engine.lock(1, 1, 7, 4).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        engine.lock(1, 1, 7, 2).await.unwrap();
        let reservation = engine.reservation(1, 1, 7).await.unwrap().unwrap();
        assert_eq!(reservation.quantity, 2);
        assert_eq!(ledger_aggregate(&engine, 1, 1).await.unwrap().locked, 2);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_reaper_releases_in_background() {
        let config = EngineConfig::new(2)
            .with_reservation_ttl(Duration::from_millis(30))
            .with_reaper_interval(Duration::from_millis(20));
        let engine = engine(config);
        engine.start().await.unwrap();
        engine.initialize_shards(1, 1, 10).await.unwrap();

        engine.lock(1, 1, 7, 3).await.unwrap();

        let mut released = false;
        for _ in 0..50 {
            sleep(Duration::from_millis(20)).await;
            if engine.reservation(1, 1, 7).await.unwrap().is_none() {
                released = true;
                break;
            }
        }
        assert!(released);
        assert_eq!(ledger_aggregate(&engine, 1, 1).await.unwrap().available, 10);

        engine.shutdown().await;
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_hot_shard_served_from_local_tier_without_staleness() {
        let config = EngineConfig::new(1).with_hotspot(HotspotConfig::new(Duration::from_secs(60), 3));
        let engine = engine(config);
        engine.initialize_shards(1, 1, 10).await.unwrap();

        for _ in 0..4 {
            assert_eq!(engine.query_shard(1, 1, 0).await.unwrap().available, 10);
        }
        assert!(engine.cache().hotspot().is_hot(&ShardKey::new(1, 1, 0)));
        assert!(engine.cache().stats().local_hits >= 1);

        engine.lock(1, 1, 7, 4).await.unwrap();
        assert_eq!(engine.query_shard(1, 1, 0).await.unwrap().available, 6);
        assert!(engine.metrics_text().contains("hotspot_keys 1"));
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_preload_warms_every_shard() {
        let engine = engine(EngineConfig::new(6));
        engine.initialize_shards(1, 1, 60).await.unwrap();

        assert_eq!(engine.preload(1, 1).await.unwrap(), 6);
        assert_eq!(engine.cache().stats().loads, 6);

        engine.query_aggregate(1, 1).await.unwrap();
        let stats = engine.cache().stats();
        assert_eq!(stats.loads, 6);
        assert_eq!(stats.shared_hits, 6);
    }
}
