//! Basic stats-engine usage example.
//!
//! Demonstrates:
//! 1. Connecting to Redis and MySQL/SQLite (or in-memory when unset)
//! 2. Creating products and recording storefront events
//! 3. Flushing dirty counters into the durable store
//! 4. Reading stats and rankings back
//! 5. Displaying metrics
//! 6. Clean shutdown
//!
//! # Run
//!
//! In-memory backends:
//! ```bash
//! cargo run --example basic_usage
//! ```
//!
//! Real backends:
//! ```bash
//! STATS_REDIS_URL=redis://localhost:6379 \
//! STATS_SQL_URL="sqlite:demo_stats.db?mode=rwc" \
//!   cargo run --example basic_usage
//! ```

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use product_stats_engine::{EngineState, Metric, ProductEvent, StatsEngine, StatsEngineConfig};
use serde_json::json;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║         product-stats-engine: Basic Usage Example             ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the engine
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring stats engine...");

    let config = StatsEngineConfig {
        redis_url: std::env::var("STATS_REDIS_URL").ok(),
        sql_url: std::env::var("STATS_SQL_URL").ok(),
        redis_prefix: "demo:".into(),
        ..Default::default()
    };
    println!(
        "   └─ fast tier: {}, durable tier: {}",
        config.redis_url.as_deref().unwrap_or("in-memory"),
        config.sql_url.as_deref().unwrap_or("in-memory"),
    );

    let (_config_tx, config_rx) = watch::channel(config.clone());
    let engine = StatsEngine::connect(config, config_rx).await?;
    assert_eq!(engine.state(), EngineState::Ready);
    println!("✅ Engine ready\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Create products and record events
    // ─────────────────────────────────────────────────────────────────────────
    println!("🛒 Recording storefront events...");

    let products = ["sku-keyboard", "sku-mouse", "sku-monitor"];
    for id in products {
        engine.on_product_created(id).await?;
    }

    for viewer in ["alice", "bob", "carol", "alice"] {
        engine
            .record_event("sku-keyboard", &ProductEvent::Viewed { viewer_id: Some(viewer.into()) })
            .await?;
    }
    engine.record_event("sku-keyboard", &ProductEvent::Clicked { organic: true }).await?;
    engine.record_event("sku-keyboard", &ProductEvent::AddedToCart).await?;
    engine.record_event("sku-keyboard", &ProductEvent::OrderPlaced).await?;

    engine
        .record_events(&[
            ("sku-mouse".to_string(), ProductEvent::Viewed { viewer_id: None }),
            ("sku-mouse".to_string(), ProductEvent::AddedToCart),
            ("sku-monitor".to_string(), ProductEvent::Viewed { viewer_id: Some("dave".into()) }),
        ])
        .await?;

    // API-style callers send an event type plus loose metadata
    engine
        .record_raw_event("sku-monitor", "click", Some(&json!({ "organic": false })))
        .await?;
    engine
        .record_raw_event("sku-monitor", "boost_applied", Some(&json!({ "boost_score": 2.5 })))
        .await?;

    println!("   └─ dirty products: {:?}\n", engine.status().await.dirty_products);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Flush into the durable tier
    // ─────────────────────────────────────────────────────────────────────────
    println!("💾 Flushing dirty counters...");
    let outcome = engine.flush_now().await?;
    println!(
        "   └─ claimed={} written={} skipped_evicted={}\n",
        outcome.claimed, outcome.written, outcome.skipped_evicted
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Read stats and rankings
    // ─────────────────────────────────────────────────────────────────────────
    println!("📊 Product stats:");
    for id in products {
        let (stats, source) = engine.get_stats_with_source(id).await?;
        println!(
            "   ├─ {:<13} views={} unique≈{} carts={} orders={} conv={:.1}% ctr={:.1}% ({:?})",
            id,
            stats.total_views,
            stats.unique_viewers,
            stats.total_carts,
            stats.total_orders,
            stats.conversion_rate,
            stats.click_through_rate,
            source,
        );
    }

    let ids: Vec<String> = products.iter().map(|s| s.to_string()).collect();
    let aggregated = engine.get_aggregated_stats(&ids).await?;
    println!("   └─ aggregated: {:?}\n", aggregated);

    println!("🏆 Rankings:");
    println!("   ├─ trending: {:?}", engine.get_trending_products(10, 0).await?);
    println!("   ├─ popular:  {:?}", engine.get_popular_products(10, 0).await?);
    println!("   ├─ new:      {:?}", engine.get_new_arrivals(10, 0).await?);
    let top_views = engine.top_by_metric(Metric::Views, 1).await?;
    if let Some(top) = top_views.first() {
        println!("   └─ most viewed: {} ({} views)\n", top.product_id, top.total_views);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Status and metrics
    // ─────────────────────────────────────────────────────────────────────────
    let status = engine.status().await;
    println!("🩺 Status: {:?} healthy={}", status.state, status.is_healthy());
    println!("   └─ circuits: {:?}\n", status.circuits);

    println!("📈 Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    engine.shutdown().await;
    println!("   └─ final state: {}", engine.state());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                         Done!                                 ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<(String, String, u64)> = vec![];
    let mut gauges: Vec<(String, String, f64)> = vec![];
    let mut histograms: Vec<(String, String, usize, f64, f64)> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_, key) = composite_key.into_parts();
        let name = key.name().to_string();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let max = samples.iter().map(|v| v.into_inner()).fold(0.0, f64::max);
                histograms.push((name, label_str, count, sum, max));
            }
        }
    }

    counters.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    gauges.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    histograms.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    if !counters.is_empty() {
        println!("   ┌─ Counters");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms");
        for (name, labels, count, sum, max) in &histograms {
            let avg = if *count > 0 { sum / *count as f64 } else { 0.0 };
            println!("      └─ {}{} count={} avg={:.4} max={:.4}", name, labels, count, avg, max);
        }
    }
    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
