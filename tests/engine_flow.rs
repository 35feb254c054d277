//! End-to-end flows over the in-memory backends.
//!
//! No Docker needed; these run with the default `cargo test`.
//!
//! # Test Organization
//! - `flush_*` - Dirty set and durable write behaviour
//! - `read_*` - Stats responses, cache and eviction recovery
//! - `rank_*` - Index ordering and membership

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tokio::sync::watch;

use product_stats_engine::storage::memory::{InMemoryDurableStore, InMemoryFastTier};
use product_stats_engine::{
    Backends, Boost, BoostStatus, CounterDeltas, CounterStore, DurableStatRecord, DurableStore, ProductCounterSet,
    ProductEvent, ProductRankingInfo, RankIndex, RankIndexStore, StatsEngine, StatsEngineConfig, StatsSource,
};

struct Harness {
    engine: Arc<StatsEngine>,
    fast: Arc<InMemoryFastTier>,
    durable: Arc<InMemoryDurableStore>,
    _config_tx: watch::Sender<StatsEngineConfig>,
}

fn harness() -> Harness {
    let config = StatsEngineConfig::default();
    let fast = Arc::new(InMemoryFastTier::new(config.counter_ttl()));
    let durable = Arc::new(InMemoryDurableStore::new());
    let (tx, rx) = watch::channel(config.clone());
    let backends = Backends::with_fast_tier(fast.clone(), durable.clone());
    Harness {
        engine: Arc::new(StatsEngine::new(config, rx, backends)),
        fast,
        durable,
        _config_tx: tx,
    }
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

// =============================================================================
// Flush
// =============================================================================

#[tokio::test]
async fn flush_twice_writes_identical_totals() {
    let h = harness();
    h.engine.on_product_created("p1").await.unwrap();
    for _ in 0..3 {
        h.engine.record_event("p1", &ProductEvent::Viewed { viewer_id: None }).await.unwrap();
    }
    h.engine.record_event("p1", &ProductEvent::OrderPlaced).await.unwrap();

    h.engine.flush_now().await.unwrap();
    let first = h.durable.find_stats_by_product_id("p1").await.unwrap().unwrap();

    // Re-dirty without new increments and flush again
    let outcome = h.engine.sync_products(&ids(&["p1"])).await.unwrap();
    assert_eq!(outcome.written, 1);
    let second = h.durable.find_stats_by_product_id("p1").await.unwrap().unwrap();

    assert!(first.same_totals(&second));
    assert_eq!(second.total_views, 3);
    assert_eq!(second.total_orders, 1);
}

#[tokio::test]
async fn flush_dirty_membership_tracks_uncommitted_increments() {
    let h = harness();
    h.engine.on_product_created("p1").await.unwrap();
    assert!(!h.fast.is_dirty("p1").await.unwrap());

    h.engine.record_event("p1", &ProductEvent::AddedToCart).await.unwrap();
    assert!(h.fast.is_dirty("p1").await.unwrap());

    h.engine.flush_now().await.unwrap();
    assert!(!h.fast.is_dirty("p1").await.unwrap());

    h.engine.record_event("p1", &ProductEvent::AddedToCart).await.unwrap();
    assert!(h.fast.is_dirty("p1").await.unwrap());
}

#[tokio::test]
async fn flush_concurrent_increments_commute() {
    let h = harness();
    h.engine.on_product_created("p1").await.unwrap();

    let mut tasks = Vec::new();
    for n in [3u64, 2, 5, 1, 4] {
        let fast = h.fast.clone();
        tasks.push(tokio::spawn(async move {
            fast.increment("p1", &CounterDeltas::views(n)).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    h.engine.flush_now().await.unwrap();
    let row = h.durable.find_stats_by_product_id("p1").await.unwrap().unwrap();
    assert_eq!(row.total_views, 15);
}

#[tokio::test]
async fn flush_multi_field_increment_is_never_half_applied() {
    let h = harness();
    h.engine.on_product_created("p1").await.unwrap();

    let writer = {
        let fast = h.fast.clone();
        tokio::spawn(async move {
            let deltas = CounterDeltas {
                views: 1,
                carts: 2,
                ..Default::default()
            };
            for _ in 0..200 {
                fast.increment("p1", &deltas).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    while !writer.is_finished() {
        let counters = h.fast.read_counters("p1").await.unwrap().unwrap();
        assert_eq!(counters.carts, counters.views * 2);
        tokio::task::yield_now().await;
    }
    writer.await.unwrap();

    let counters = h.fast.read_counters("p1").await.unwrap().unwrap();
    assert_eq!((counters.views, counters.carts), (200, 400));
}

#[tokio::test]
async fn flush_after_eviction_adds_new_activity_to_durable_totals() {
    let h = harness();
    h.engine.on_product_created("p1").await.unwrap();
    for _ in 0..50 {
        h.engine.record_event("p1", &ProductEvent::Viewed { viewer_id: None }).await.unwrap();
    }
    h.engine.flush_now().await.unwrap();

    h.fast.evict("p1");
    h.engine.record_event("p1", &ProductEvent::Viewed { viewer_id: None }).await.unwrap();
    h.engine.flush_now().await.unwrap();

    let row = h.durable.find_stats_by_product_id("p1").await.unwrap().unwrap();
    assert_eq!(row.total_views, 51);
    assert_eq!(h.engine.get_stats("p1").await.unwrap().total_views, 51);
}

// =============================================================================
// Read path
// =============================================================================

#[tokio::test]
async fn read_evicted_product_falls_back_and_reseeds() {
    let h = harness();
    let stored = ProductCounterSet {
        views: 50,
        orders: 2,
        ..Default::default()
    };
    h.durable
        .upsert_stats_batch(&[DurableStatRecord::from_counters("p1", &stored, Utc::now())])
        .await
        .unwrap();
    assert!(h.fast.read_counters("p1").await.unwrap().is_none());

    let (stats, source) = h.engine.get_stats_with_source("p1").await.unwrap();
    assert_eq!(stats.total_views, 50);
    assert_eq!(source, StatsSource::Durable);

    let reseeded = h.fast.read_counters("p1").await.unwrap().unwrap();
    assert_eq!(reseeded.views, 50);
    // Re-seeding is not an uncommitted increment
    assert!(!h.fast.is_dirty("p1").await.unwrap());

    let (again, source) = h.engine.get_stats_with_source("p1").await.unwrap();
    assert_eq!(again.total_views, 50);
    assert_ne!(source, StatsSource::Durable);
}

#[tokio::test]
async fn read_conversion_rate_from_views_and_orders() {
    let h = harness();
    h.engine.on_product_created("p1").await.unwrap();
    h.fast
        .increment(
            "p1",
            &CounterDeltas {
                views: 200,
                orders: 10,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let stats = h.engine.get_stats("p1").await.unwrap();
    assert!((stats.conversion_rate - 5.0).abs() < 1e-9);

    h.engine.on_product_created("p2").await.unwrap();
    h.engine.record_event("p2", &ProductEvent::OrderPlaced).await.unwrap();
    assert_eq!(h.engine.get_stats("p2").await.unwrap().conversion_rate, 0.0);
}

#[tokio::test]
async fn read_cache_is_invalidated_by_increment() {
    let h = harness();
    h.engine.on_product_created("p1").await.unwrap();
    h.engine.record_event("p1", &ProductEvent::Clicked { organic: true }).await.unwrap();

    assert_eq!(h.engine.get_stats("p1").await.unwrap().clicks, 1);
    let (_, source) = h.engine.get_stats_with_source("p1").await.unwrap();
    assert_eq!(source, StatsSource::Cache);

    h.engine
        .record_raw_event("p1", "wishlist", Some(&json!({"added": true})))
        .await
        .unwrap();
    let (stats, source) = h.engine.get_stats_with_source("p1").await.unwrap();
    assert_eq!(source, StatsSource::Counters);
    assert_eq!((stats.clicks, stats.organic_clicks), (2, 1));
}

#[tokio::test]
async fn read_aggregated_over_products() {
    let h = harness();
    for (id, orders) in [("a", 1u64), ("b", 3)] {
        h.engine.on_product_created(id).await.unwrap();
        h.fast
            .increment(
                id,
                &CounterDeltas {
                    views: 10,
                    orders,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let aggregated = h.engine.get_aggregated_stats(&ids(&["a", "b", "missing"])).await.unwrap();
    assert_eq!(aggregated.product_count, 3);
    assert_eq!(aggregated.total_views, 20);
    assert_eq!(aggregated.total_orders, 4);
    assert!((aggregated.overall_conversion_rate - 20.0).abs() < 1e-9);
}

// =============================================================================
// Rankings
// =============================================================================

#[tokio::test]
async fn rank_trending_orders_by_score_deterministically() {
    let h = harness();
    // A: one order (10). B and C: five carts each (25).
    h.fast.increment("A", &CounterDeltas::orders(1)).await.unwrap();
    h.fast.increment("B", &CounterDeltas::carts(5)).await.unwrap();
    h.fast.increment("C", &CounterDeltas::carts(5)).await.unwrap();

    let result = h.engine.batch_update_rankings(&ids(&["A", "B", "C"])).await;
    assert!(result.is_success());

    let first = h.engine.get_trending_products(3, 0).await.unwrap();
    assert_eq!(first.len(), 3);
    assert_eq!(first[2], "A");
    assert!(first[..2].contains(&"B".to_string()));
    assert!(first[..2].contains(&"C".to_string()));

    for _ in 0..3 {
        assert_eq!(h.engine.get_trending_products(3, 0).await.unwrap(), first);
    }
    assert_eq!(h.engine.get_trending_products(1, 2).await.unwrap(), vec!["A".to_string()]);
    assert_eq!(h.engine.get_product_trending_rank("A").await.unwrap(), Some(3));
}

#[tokio::test]
async fn rank_discount_membership_follows_window() {
    let h = harness();
    let now = Utc::now();
    h.durable.put_product(
        ProductRankingInfo::new("p1", now - ChronoDuration::days(90)).with_discount(
            20.0,
            now - ChronoDuration::hours(1),
            now + ChronoDuration::hours(1),
        ),
    );
    h.engine.on_product_created("p1").await.unwrap();

    assert_eq!(h.fast.score(RankIndex::Discounted, "p1").await.unwrap(), Some(20.0));
    assert_eq!(h.engine.get_discounted_products(10, 0).await.unwrap(), ids(&["p1"]));

    // The discount window closes
    h.durable.put_product(
        ProductRankingInfo::new("p1", now - ChronoDuration::days(90)).with_discount(
            20.0,
            now - ChronoDuration::hours(2),
            now - ChronoDuration::minutes(1),
        ),
    );
    h.engine.update_product_ranking("p1").await.unwrap();
    assert!(h.engine.get_discounted_products(10, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn rank_boost_lifecycle_applies_and_removes_multiplier() {
    let h = harness();
    let now = Utc::now();
    h.engine.on_product_created("p1").await.unwrap();
    h.fast.increment("p1", &CounterDeltas::orders(2)).await.unwrap();

    let unboosted = h.engine.update_product_ranking("p1").await.unwrap();
    assert_eq!(unboosted.multiplier, 1.0);

    let boost = Boost {
        product_id: "p1".into(),
        boost_score: 5.0,
        status: BoostStatus::Active,
        start_date: now - ChronoDuration::hours(1),
        end_date: now + ChronoDuration::days(1),
    };
    h.durable.put_boost(boost.clone());
    let boosted = h.engine.on_boost_changed("p1").await.unwrap();
    assert_eq!(boosted.score, unboosted.score * 2.0);

    h.durable.replace_boosts(
        "p1",
        vec![Boost {
            status: BoostStatus::Canceled,
            ..boost
        }],
    );
    let cancelled = h.engine.on_boost_changed("p1").await.unwrap();
    assert_eq!(cancelled.score, unboosted.score);
}

#[tokio::test]
async fn rank_new_arrivals_and_cleanup() {
    let h = harness();
    let now = Utc::now();
    h.durable.put_product(ProductRankingInfo::new("fresh", now - ChronoDuration::days(1)));
    h.durable.put_product(ProductRankingInfo::new("old", now - ChronoDuration::days(400)));
    h.engine.on_product_created("fresh").await.unwrap();
    h.engine.on_product_created("old").await.unwrap();

    assert_eq!(h.engine.get_new_arrivals(10, 0).await.unwrap(), ids(&["fresh"]));

    let report = h.engine.cleanup_rankings().await.unwrap().expect("lease should be free");
    assert_eq!(report.new_arrivals_pruned, 0);
    // "old" has neither engagement nor a recency bonus
    assert_eq!(report.trending_pruned, 1);
    assert_eq!(h.fast.score(RankIndex::Trending, "old").await.unwrap(), None);
}

#[tokio::test]
async fn rank_full_rebuild_covers_every_stats_row() {
    let h = harness();
    for id in ["a", "b", "c"] {
        h.engine.on_product_created(id).await.unwrap();
        h.fast.increment(id, &CounterDeltas::views(1)).await.unwrap();
    }
    for index in RankIndex::ALL {
        for id in ["a", "b", "c"] {
            RankIndexStore::remove(&*h.fast, index, id).await.unwrap();
        }
    }

    let result = h.engine.rebuild_rankings().await.unwrap().expect("lease should be free");
    assert_eq!(result.total, 3);
    assert_eq!(h.fast.len(RankIndex::Popular).await.unwrap(), 3);
}
