use std::sync::Arc;
use std::time::Duration;

use skimmer_core::clock::system_clock;
use skimmer_core::ratelimit::{
    FixedLoad, LimiterConfig, LimiterStore, RateLimiterService, WindowAdmission,
};
use skimmer_core::ratelimit::{DomainPolicyTable, SlidingWindowLimiter};
use skimmer_db::PgLimiterStore;

use crate::integration::common::setup_test_db;

#[tokio::test]
async fn values_round_trip_and_expire() {
    let (pool, _container) = setup_test_db().await;
    let store = PgLimiterStore::new(pool);

    store.set("penalty:k", "123", Duration::from_secs(60)).await.unwrap();
    assert_eq!(store.get("penalty:k").await.unwrap().as_deref(), Some("123"));

    store.set("penalty:k", "456", Duration::from_millis(50)).await.unwrap();
    assert_eq!(store.get("penalty:k").await.unwrap().as_deref(), Some("456"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.get("penalty:k").await.unwrap().is_none());

    store.set("other", "v", Duration::from_secs(60)).await.unwrap();
    store.delete("other").await.unwrap();
    assert!(store.get("other").await.unwrap().is_none());
}

#[tokio::test]
async fn scored_set_operations() {
    let (pool, _container) = setup_test_db().await;
    let store = PgLimiterStore::new(pool);

    store.zadd("sw", 100, "100-a").await.unwrap();
    store.zadd("sw", 200, "200-b").await.unwrap();
    store.zadd("sw", 300, "300-c").await.unwrap();
    store.expire("sw", Duration::from_secs(60)).await.unwrap();

    assert_eq!(store.zcard("sw").await.unwrap(), 3);
    assert_eq!(store.zoldest("sw").await.unwrap(), Some(100));

    assert_eq!(store.zremrangebyscore("sw", 0, 200).await.unwrap(), 2);
    assert_eq!(store.zcard("sw").await.unwrap(), 1);
    assert_eq!(store.zoldest("sw").await.unwrap(), Some(300));

    assert_eq!(store.zcard("missing").await.unwrap(), 0);
    assert_eq!(store.zoldest("missing").await.unwrap(), None);
}

#[tokio::test]
async fn expired_sets_read_empty_and_are_purged() {
    let (pool, _container) = setup_test_db().await;
    let store = PgLimiterStore::new(pool);

    store.zadd("sw", 1, "1-a").await.unwrap();
    store.expire("sw", Duration::from_millis(50)).await.unwrap();
    store.set("v", "x", Duration::from_millis(50)).await.unwrap();
    store.set("kept", "x", Duration::from_secs(60)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(store.zcard("sw").await.unwrap(), 0);
    assert_eq!(store.purge_expired().await.unwrap(), 2);
    assert_eq!(store.get("kept").await.unwrap().as_deref(), Some("x"));

    // A fresh member after expiry starts a new set.
    store.zadd("sw", 2, "2-b").await.unwrap();
    assert_eq!(store.zcard("sw").await.unwrap(), 1);
}

#[tokio::test]
async fn expiry_follows_database_time_not_scores() {
    let (pool, _container) = setup_test_db().await;
    let store = PgLimiterStore::new(pool);

    // Scores from a caller clock far behind the database.
    let admitted = store
        .zadd_within_limit("behind", 0, 10, 5, "5-a", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(admitted, WindowAdmission::Recorded { count: 1 });
    assert_eq!(store.zcard("behind").await.unwrap(), 1);

    // Scores from a caller clock far ahead still expire on the database TTL.
    let far_future = i64::MAX / 2;
    store
        .zadd_within_limit("ahead", 0, 10, far_future, "f-a", Duration::from_millis(50))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.zcard("ahead").await.unwrap(), 0);
}

#[tokio::test]
async fn sliding_window_shared_between_instances() {
    let (pool, _container) = setup_test_db().await;
    let a = SlidingWindowLimiter::new(
        PgLimiterStore::new(pool.clone()),
        system_clock(),
        Duration::from_secs(2),
    );
    let b = SlidingWindowLimiter::new(PgLimiterStore::new(pool), system_clock(), Duration::from_secs(2));

    let window = Duration::from_secs(30);
    assert!(a.check("submit:alice", 3, window).await.allowed);
    assert!(b.check("submit:alice", 3, window).await.allowed);
    assert!(a.check("submit:alice", 3, window).await.allowed);

    let denied = b.check("submit:alice", 3, window).await;
    assert!(!denied.allowed);
    assert!(denied.retry_after.is_some());
}

#[tokio::test]
async fn bounded_insert_prunes_and_stops_at_limit() {
    let (pool, _container) = setup_test_db().await;
    let store = PgLimiterStore::new(pool);
    let ttl = Duration::from_secs(60);

    assert_eq!(
        store.zadd_within_limit("w", 0, 2, 100, "100-a", ttl).await.unwrap(),
        WindowAdmission::Recorded { count: 0 }
    );
    assert_eq!(
        store.zadd_within_limit("w", 0, 2, 200, "200-b", ttl).await.unwrap(),
        WindowAdmission::Recorded { count: 1 }
    );
    assert_eq!(
        store.zadd_within_limit("w", 0, 2, 300, "300-c", ttl).await.unwrap(),
        WindowAdmission::Full {
            count: 2,
            oldest: Some(100)
        }
    );
    assert_eq!(
        store.zadd_within_limit("w", 150, 2, 400, "400-d", ttl).await.unwrap(),
        WindowAdmission::Recorded { count: 1 }
    );
    assert_eq!(store.zoldest("w").await.unwrap(), Some(200));
}

#[tokio::test]
async fn concurrent_window_checks_admit_exactly_the_limit() {
    let (pool, _container) = setup_test_db().await;
    let limiter = Arc::new(SlidingWindowLimiter::new(
        PgLimiterStore::new(pool),
        system_clock(),
        Duration::from_secs(5),
    ));

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .check("submit:bob", 3, Duration::from_secs(60))
                    .await
            })
        })
        .collect();

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap().allowed {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 3);
}

#[tokio::test]
async fn service_purges_through_store() {
    let (pool, _container) = setup_test_db().await;
    let store = PgLimiterStore::new(pool);
    store.set("stale", "x", Duration::from_millis(10)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let service = RateLimiterService::new(
        store,
        DomainPolicyTable::builtin(),
        Arc::new(FixedLoad(0.0)),
        system_clock(),
        LimiterConfig::default(),
    );
    assert_eq!(service.purge_store().await.unwrap(), 1);
}
