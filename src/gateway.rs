//! Increment gateway: business events in, counter increments out.
//!
//! Each event becomes exactly one [`CounterStore::increment`] call, so the
//! per-call atomicity of the counter store carries over to events. After an
//! increment the gateway checks the dirty-set size and, past the high-water
//! mark, wakes the sync engine through a shared [`Notify`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::counters::CounterDeltas;
use crate::storage::traits::{CounterStore, StorageError};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("event for product {product_id} could not be recorded: {source}")]
    NotRecorded {
        product_id: String,
        #[source]
        source: StorageError,
    },
    #[error("unknown event type '{0}'")]
    UnknownEvent(String),
    #[error("invalid metadata for '{event}': {reason}")]
    InvalidMetadata { event: String, reason: String },
}

/// A typed product event.
#[derive(Debug, Clone, PartialEq)]
pub enum ProductEvent {
    Viewed { viewer_id: Option<String> },
    Clicked { organic: bool },
    AddedToCart,
    OrderPlaced,
    WishlistToggled { added: bool },
    BoostApplied { score: f64 },
    BoostRemoved { score: f64 },
}

impl ProductEvent {
    /// Parse the `(eventType, metadata)` shape used by event-source callers.
    ///
    /// Accepted types: `view`, `click`, `cart`, `order`, `wishlist`,
    /// `boost_applied`, `boost_removed` (plus a few long-form aliases).
    pub fn parse(event_type: &str, metadata: Option<&Value>) -> Result<Self, GatewayError> {
        let field = |name: &str| metadata.and_then(|m| m.get(name));

        let event = match event_type {
            "view" | "viewed" | "product_viewed" => ProductEvent::Viewed {
                viewer_id: field("viewer_id")
                    .or_else(|| field("user_id"))
                    .and_then(|v| match v {
                        Value::String(s) => Some(s.clone()),
                        Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    }),
            },
            "click" | "clicked" => ProductEvent::Clicked {
                organic: field("organic").and_then(Value::as_bool).unwrap_or(false),
            },
            "cart" | "add_to_cart" | "added_to_cart" => ProductEvent::AddedToCart,
            "order" | "order_placed" => ProductEvent::OrderPlaced,
            "wishlist" | "wishlist_toggled" => ProductEvent::WishlistToggled {
                added: field("added").and_then(Value::as_bool).unwrap_or(true),
            },
            "boost_applied" | "boost_removed" => {
                let score = field("score")
                    .or_else(|| field("boost_score"))
                    .and_then(Value::as_f64)
                    .ok_or_else(|| GatewayError::InvalidMetadata {
                        event: event_type.to_string(),
                        reason: "missing numeric 'score'".to_string(),
                    })?;
                if event_type == "boost_applied" {
                    ProductEvent::BoostApplied { score }
                } else {
                    ProductEvent::BoostRemoved { score }
                }
            }
            other => return Err(GatewayError::UnknownEvent(other.to_string())),
        };
        Ok(event)
    }

    /// Stable label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Viewed { .. } => "viewed",
            Self::Clicked { .. } => "clicked",
            Self::AddedToCart => "added_to_cart",
            Self::OrderPlaced => "order_placed",
            Self::WishlistToggled { .. } => "wishlist_toggled",
            Self::BoostApplied { .. } => "boost_applied",
            Self::BoostRemoved { .. } => "boost_removed",
        }
    }

    /// Counter changes for this event. Wishlist additions count as clicks;
    /// removals change nothing.
    #[must_use]
    pub fn to_deltas(&self) -> CounterDeltas {
        match self {
            Self::Viewed { viewer_id } => CounterDeltas {
                views: 1,
                unique_viewer: viewer_id.clone(),
                ..Default::default()
            },
            Self::Clicked { organic } => CounterDeltas {
                clicks: 1,
                organic_clicks: u64::from(*organic),
                ..Default::default()
            },
            Self::AddedToCart => CounterDeltas::carts(1),
            Self::OrderPlaced => CounterDeltas::orders(1),
            Self::WishlistToggled { added: true } => CounterDeltas::clicks(1),
            Self::WishlistToggled { added: false } => CounterDeltas::default(),
            Self::BoostApplied { score } => CounterDeltas::boost(*score),
            Self::BoostRemoved { score } => CounterDeltas::boost(-*score),
        }
    }
}

pub struct IncrementGateway {
    counters: Arc<dyn CounterStore>,
    high_water: AtomicUsize,
    flush_signal: Arc<Notify>,
}

impl IncrementGateway {
    pub fn new(counters: Arc<dyn CounterStore>, high_water: usize, flush_signal: Arc<Notify>) -> Self {
        Self {
            counters,
            high_water: AtomicUsize::new(high_water),
            flush_signal,
        }
    }

    pub fn set_high_water(&self, high_water: usize) {
        self.high_water.store(high_water, Ordering::Relaxed);
    }

    /// The notifier woken when the dirty set crosses the high-water mark.
    #[must_use]
    pub fn flush_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.flush_signal)
    }

    #[tracing::instrument(skip(self, event), fields(event = event.kind()))]
    pub async fn record_event(&self, product_id: &str, event: &ProductEvent) -> Result<(), GatewayError> {
        let deltas = event.to_deltas();
        if deltas.is_empty() {
            debug!("Event maps to no counter change");
            return Ok(());
        }

        let _timer = crate::time_operation!("fast", "increment");
        if let Err(source) = self.counters.increment(product_id, &deltas).await {
            crate::metrics::record_event(event.kind(), "error");
            return Err(GatewayError::NotRecorded {
                product_id: product_id.to_string(),
                source,
            });
        }
        crate::metrics::record_event(event.kind(), "success");

        self.check_high_water().await;
        Ok(())
    }

    /// Parse and record in one step.
    pub async fn record_raw(
        &self,
        product_id: &str,
        event_type: &str,
        metadata: Option<&Value>,
    ) -> Result<(), GatewayError> {
        let event = ProductEvent::parse(event_type, metadata)?;
        self.record_event(product_id, &event).await
    }

    /// Record many events with one batched increment. Atomic per product.
    #[tracing::instrument(skip(self, events), fields(count = events.len()))]
    pub async fn record_events(&self, events: &[(String, ProductEvent)]) -> Result<(), GatewayError> {
        let items: Vec<(String, CounterDeltas)> = events
            .iter()
            .map(|(id, event)| (id.clone(), event.to_deltas()))
            .filter(|(_, deltas)| !deltas.is_empty())
            .collect();

        if items.is_empty() {
            return Ok(());
        }

        self.counters
            .batch_increment(&items)
            .await
            .map_err(|source| GatewayError::NotRecorded {
                product_id: items.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>().join(","),
                source,
            })?;

        for (_, event) in events {
            crate::metrics::record_event(event.kind(), "success");
        }

        self.check_high_water().await;
        Ok(())
    }

    async fn check_high_water(&self) {
        match self.counters.dirty_len().await {
            Ok(len) => {
                crate::metrics::set_dirty_products(len);
                let high_water = self.high_water.load(Ordering::Relaxed);
                if len >= high_water {
                    debug!(dirty = len, high_water, "Dirty set past high-water mark");
                    crate::metrics::record_high_water_signal();
                    self.flush_signal.notify_one();
                }
            }
            Err(e) => warn!(error = %e, "Could not read dirty-set size"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryFastTier;
    use serde_json::json;
    use std::time::Duration;

    fn gateway(high_water: usize) -> (IncrementGateway, Arc<InMemoryFastTier>) {
        let store = Arc::new(InMemoryFastTier::default());
        let gw = IncrementGateway::new(store.clone(), high_water, Arc::new(Notify::new()));
        (gw, store)
    }

    #[test]
    fn test_parse_known_events() {
        assert_eq!(
            ProductEvent::parse("view", Some(&json!({"user_id": 42}))).unwrap(),
            ProductEvent::Viewed { viewer_id: Some("42".into()) }
        );
        assert_eq!(
            ProductEvent::parse("click", Some(&json!({"organic": true}))).unwrap(),
            ProductEvent::Clicked { organic: true }
        );
        assert_eq!(ProductEvent::parse("cart", None).unwrap(), ProductEvent::AddedToCart);
        assert_eq!(
            ProductEvent::parse("wishlist", Some(&json!({"added": false}))).unwrap(),
            ProductEvent::WishlistToggled { added: false }
        );
        assert_eq!(
            ProductEvent::parse("boost_removed", Some(&json!({"score": 2.5}))).unwrap(),
            ProductEvent::BoostRemoved { score: 2.5 }
        );
    }

    #[test]
    fn test_parse_rejects_unknown_and_bad_metadata() {
        assert!(matches!(ProductEvent::parse("viewz", None), Err(GatewayError::UnknownEvent(_))));
        assert!(matches!(
            ProductEvent::parse("boost_applied", Some(&json!({"score": "high"}))),
            Err(GatewayError::InvalidMetadata { .. })
        ));
    }

    #[test]
    fn test_event_mapping() {
        let organic = ProductEvent::Clicked { organic: true }.to_deltas();
        assert_eq!((organic.clicks, organic.organic_clicks), (1, 1));

        assert_eq!(ProductEvent::WishlistToggled { added: true }.to_deltas().clicks, 1);
        assert!(ProductEvent::WishlistToggled { added: false }.to_deltas().is_empty());
        assert_eq!(ProductEvent::BoostRemoved { score: 3.0 }.to_deltas().boost_score, -3.0);
    }

    #[tokio::test]
    async fn test_record_event_increments_and_dirties() {
        let (gw, store) = gateway(100);
        store.init_counters("p1").await.unwrap();

        gw.record_event("p1", &ProductEvent::OrderPlaced).await.unwrap();
        gw.record_raw("p1", "view", Some(&json!({"viewer_id": "u1"}))).await.unwrap();

        let counters = store.read_counters("p1").await.unwrap().unwrap();
        assert_eq!(counters.orders, 1);
        assert_eq!(counters.views, 1);
        assert!(store.is_dirty("p1").await.unwrap());
        assert_eq!(store.unique_viewers("p1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_noop_event_leaves_dirty_set_alone() {
        let (gw, store) = gateway(100);
        store.init_counters("p1").await.unwrap();

        gw.record_event("p1", &ProductEvent::WishlistToggled { added: false }).await.unwrap();

        assert!(!store.is_dirty("p1").await.unwrap());
    }

    #[tokio::test]
    async fn test_high_water_signals_flush() {
        let (gw, _store) = gateway(3);
        let signal = gw.flush_signal();

        for id in ["a", "b", "c"] {
            gw.record_event(id, &ProductEvent::AddedToCart).await.unwrap();
        }

        // notify_one stores a permit, so this resolves immediately
        tokio::time::timeout(Duration::from_millis(100), signal.notified())
            .await
            .expect("flush should have been signalled");
    }

    #[tokio::test]
    async fn test_record_events_batches() {
        let (gw, store) = gateway(100);
        gw.record_events(&[
            ("a".to_string(), ProductEvent::OrderPlaced),
            ("b".to_string(), ProductEvent::Viewed { viewer_id: None }),
            ("c".to_string(), ProductEvent::WishlistToggled { added: false }),
        ])
        .await
        .unwrap();

        assert_eq!(store.dirty_len().await.unwrap(), 2);
        assert!(!store.is_dirty("c").await.unwrap());
    }
}
