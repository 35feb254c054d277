//! Property-based tests for counters, event parsing and scoring.
//!
//! Run with: `cargo test --test proptest_counters`

use proptest::prelude::*;
use serde_json::Value;

use product_stats_engine::unique::HyperLogLog;
use product_stats_engine::{CounterDeltas, ProductCounterSet, ProductEvent, RankingWeights};

// =============================================================================
// Strategies
// =============================================================================

fn deltas_strategy() -> impl Strategy<Value = CounterDeltas> {
    (0u64..1000, 0u64..1000, 0u64..1000, 0u64..1000, 0u64..1000, -100i32..100).prop_map(
        |(views, clicks, organic_clicks, carts, orders, boost)| CounterDeltas {
            views,
            clicks,
            organic_clicks,
            carts,
            orders,
            boost_score: f64::from(boost),
            unique_viewer: None,
        },
    )
}

fn counters_strategy() -> impl Strategy<Value = ProductCounterSet> {
    (0u64..10_000, 0u64..10_000, 0u64..10_000, 0u64..10_000).prop_map(|(views, clicks, carts, orders)| {
        ProductCounterSet {
            views,
            clicks,
            organic_clicks: clicks / 2,
            carts,
            orders,
            boost_score: 0.0,
        }
    })
}

fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(3, 32, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
            prop::collection::hash_map("[a-z_]{1,12}", inner, 0..8)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

// =============================================================================
// Counters
// =============================================================================

proptest! {
    /// Any permutation of the same increments lands on the same totals.
    #[test]
    fn increments_commute(batch in prop::collection::vec(deltas_strategy(), 1..20)) {
        let mut forward = ProductCounterSet::default();
        for d in &batch {
            forward.apply(d);
        }

        let mut backward = ProductCounterSet::default();
        for d in batch.iter().rev() {
            backward.apply(d);
        }

        prop_assert_eq!(forward.views, backward.views);
        prop_assert_eq!(forward.clicks, backward.clicks);
        prop_assert_eq!(forward.organic_clicks, backward.organic_clicks);
        prop_assert_eq!(forward.carts, backward.carts);
        prop_assert_eq!(forward.orders, backward.orders);
        // Integer-valued boosts sum exactly in f64
        prop_assert_eq!(forward.boost_score, backward.boost_score);
    }

    /// Re-seeding adds durable history without losing a post-eviction count,
    /// in either order.
    #[test]
    fn reseed_sum_keeps_both_sides(a in counters_strategy(), b in counters_strategy()) {
        let merged = a.plus(&b);
        prop_assert_eq!(merged.views, a.views + b.views);
        prop_assert_eq!(merged.carts, a.carts + b.carts);
        prop_assert_eq!(merged.orders, a.orders + b.orders);
        prop_assert_eq!(merged, b.plus(&a));
    }

    /// Field encoding survives a parse.
    #[test]
    fn counter_fields_parse_back(c in counters_strategy()) {
        let fields = c.to_fields();
        let parsed = ProductCounterSet::from_fields(fields.iter().map(|(k, v)| (*k, v.as_str())));
        prop_assert_eq!(parsed, c);
    }
}

// =============================================================================
// Scoring
// =============================================================================

proptest! {
    /// Adding engagement never lowers the score.
    #[test]
    fn score_is_monotonic_in_engagement(
        base in counters_strategy(),
        extra in deltas_strategy(),
        age in prop::option::of(0i64..400),
        boosted in any::<bool>(),
    ) {
        let weights = RankingWeights::default();
        let before = weights.score(&base, age, 30, boosted);

        let mut more = base;
        more.apply(&CounterDeltas { boost_score: 0.0, ..extra });
        let after = weights.score(&more, age, 30, boosted);

        prop_assert!(after.score >= before.score);
        prop_assert!(after.base >= before.base);
    }

    /// Younger products get at least as much recency as older ones.
    #[test]
    fn recency_decreases_with_age(younger in 0i64..100, gap in 0i64..100) {
        let weights = RankingWeights::default();
        let young = weights.recency_bonus(Some(younger), 30);
        let old = weights.recency_bonus(Some(younger + gap), 30);
        prop_assert!(young >= old);
        prop_assert!(old >= 0.0);
    }

    /// A boost multiplies, never adds.
    #[test]
    fn boost_scales_score(c in counters_strategy(), age in prop::option::of(0i64..60)) {
        let weights = RankingWeights::default();
        let plain = weights.score(&c, age, 30, false);
        let boosted = weights.score(&c, age, 30, true);
        prop_assert!((boosted.score - plain.score * weights.boost_multiplier).abs() < 1e-6);
    }
}

// =============================================================================
// Event parsing
// =============================================================================

proptest! {
    /// Arbitrary metadata never panics the parser.
    #[test]
    fn parse_never_panics(
        event_type in "[a-z_]{0,16}",
        metadata in prop::option::of(arbitrary_json_strategy()),
    ) {
        let _ = ProductEvent::parse(&event_type, metadata.as_ref());
    }

    /// Known event types parse with any metadata except boosts, which need a score.
    #[test]
    fn known_events_accept_any_metadata(
        event_type in prop::sample::select(vec!["view", "click", "cart", "order", "wishlist"]),
        metadata in prop::option::of(arbitrary_json_strategy()),
    ) {
        prop_assert!(ProductEvent::parse(event_type, metadata.as_ref()).is_ok());
    }
}

// =============================================================================
// Unique viewers
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// The estimate stays within a loose band of the true distinct count.
    #[test]
    fn hll_estimate_is_close(n in 100usize..5000) {
        let mut hll = HyperLogLog::new(12);
        for i in 0..n {
            hll.add(&format!("viewer-{i}"));
            // Duplicates must not move the estimate
            hll.add(&format!("viewer-{i}"));
        }
        let estimate = hll.approximate_count() as f64;
        let error = (estimate - n as f64).abs() / n as f64;
        prop_assert!(error < 0.1, "n={} estimate={}", n, estimate);
    }
}
