//! Per-product counter types for the fast tier.
//!
//! [`CounterDeltas`] is the typed increment request: one field per known
//! metric, so a misspelled metric is a compile error rather than a silently
//! ignored map key. [`ProductCounterSet`] holds the absolute totals.

use serde::{Deserialize, Serialize};

/// A tracked product metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Views,
    Clicks,
    OrganicClicks,
    Carts,
    Orders,
    BoostScore,
}

impl Metric {
    pub const ALL: [Metric; 6] = [
        Metric::Views,
        Metric::Clicks,
        Metric::OrganicClicks,
        Metric::Carts,
        Metric::Orders,
        Metric::BoostScore,
    ];

    /// Field name inside the fast-tier counter hash.
    #[must_use]
    pub fn field(&self) -> &'static str {
        match self {
            Self::Views => "views",
            Self::Clicks => "clicks",
            Self::OrganicClicks => "organic_clicks",
            Self::Carts => "carts",
            Self::Orders => "orders",
            Self::BoostScore => "boost_score",
        }
    }

    /// Column name in the durable `product_stats` table.
    #[must_use]
    pub fn column(&self) -> &'static str {
        match self {
            Self::Views => "total_views",
            Self::Clicks => "clicks",
            Self::OrganicClicks => "organic_clicks",
            Self::Carts => "total_carts",
            Self::Orders => "total_orders",
            Self::BoostScore => "total_boost_score",
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.field())
    }
}

/// Increment request for a single product.
///
/// Zero fields are skipped. `unique_viewer` is folded into the same atomic
/// batch as the numeric increments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterDeltas {
    #[serde(default)]
    pub views: u64,
    #[serde(default)]
    pub clicks: u64,
    #[serde(default)]
    pub organic_clicks: u64,
    #[serde(default)]
    pub carts: u64,
    #[serde(default)]
    pub orders: u64,
    /// Signed: boost removal subtracts
    #[serde(default)]
    pub boost_score: f64,
    #[serde(default)]
    pub unique_viewer: Option<String>,
}

impl CounterDeltas {
    #[must_use]
    pub fn views(n: u64) -> Self {
        Self { views: n, ..Default::default() }
    }

    #[must_use]
    pub fn carts(n: u64) -> Self {
        Self { carts: n, ..Default::default() }
    }

    #[must_use]
    pub fn orders(n: u64) -> Self {
        Self { orders: n, ..Default::default() }
    }

    #[must_use]
    pub fn clicks(n: u64) -> Self {
        Self { clicks: n, ..Default::default() }
    }

    #[must_use]
    pub fn boost(score: f64) -> Self {
        Self { boost_score: score, ..Default::default() }
    }

    #[must_use]
    pub fn with_viewer(mut self, viewer: impl Into<String>) -> Self {
        self.unique_viewer = Some(viewer.into());
        self
    }

    /// True when applying these deltas would change nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.integer_deltas().iter().all(|(_, n)| *n == 0)
            && self.boost_score == 0.0
            && self.unique_viewer.is_none()
    }

    /// Non-float deltas paired with their metric.
    #[must_use]
    pub fn integer_deltas(&self) -> [(Metric, u64); 5] {
        [
            (Metric::Views, self.views),
            (Metric::Clicks, self.clicks),
            (Metric::OrganicClicks, self.organic_clicks),
            (Metric::Carts, self.carts),
            (Metric::Orders, self.orders),
        ]
    }
}

/// Absolute per-product totals held in the fast tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductCounterSet {
    pub views: u64,
    pub clicks: u64,
    pub organic_clicks: u64,
    pub carts: u64,
    pub orders: u64,
    pub boost_score: f64,
}

impl ProductCounterSet {
    pub fn apply(&mut self, deltas: &CounterDeltas) {
        self.views = self.views.saturating_add(deltas.views);
        self.clicks = self.clicks.saturating_add(deltas.clicks);
        self.organic_clicks = self.organic_clicks.saturating_add(deltas.organic_clicks);
        self.carts = self.carts.saturating_add(deltas.carts);
        self.orders = self.orders.saturating_add(deltas.orders);
        self.boost_score += deltas.boost_score;
    }

    #[must_use]
    pub fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Views => self.views as f64,
            Metric::Clicks => self.clicks as f64,
            Metric::OrganicClicks => self.organic_clicks as f64,
            Metric::Carts => self.carts as f64,
            Metric::Orders => self.orders as f64,
            Metric::BoostScore => self.boost_score,
        }
    }

    /// Element-wise sum. Boost score adds too, so a negative boost delta
    /// recorded after an eviction cancels against the durable total.
    #[must_use]
    pub fn plus(&self, other: &ProductCounterSet) -> ProductCounterSet {
        ProductCounterSet {
            views: self.views.saturating_add(other.views),
            clicks: self.clicks.saturating_add(other.clicks),
            organic_clicks: self.organic_clicks.saturating_add(other.organic_clicks),
            carts: self.carts.saturating_add(other.carts),
            orders: self.orders.saturating_add(other.orders),
            boost_score: self.boost_score + other.boost_score,
        }
    }

    /// Boost score clamped at zero; removing more boost than was applied
    /// leaves none.
    #[must_use]
    pub fn floored(mut self) -> Self {
        self.boost_score = self.boost_score.max(0.0);
        self
    }

    /// Parse a counter hash (field -> value). Missing fields default to 0.
    pub fn from_fields<'a, I>(fields: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut set = Self::default();
        for (field, value) in fields {
            let int = || value.parse::<i64>().map(|v| v.max(0) as u64).unwrap_or(0);
            match field {
                "views" => set.views = int(),
                "clicks" => set.clicks = int(),
                "organic_clicks" => set.organic_clicks = int(),
                "carts" => set.carts = int(),
                "orders" => set.orders = int(),
                "boost_score" => set.boost_score = value.parse().unwrap_or(0.0),
                _ => {}
            }
        }
        set
    }

    /// Field/value pairs for a full hash write.
    #[must_use]
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            (Metric::Views.field(), self.views.to_string()),
            (Metric::Clicks.field(), self.clicks.to_string()),
            (Metric::OrganicClicks.field(), self.organic_clicks.to_string()),
            (Metric::Carts.field(), self.carts.to_string()),
            (Metric::Orders.field(), self.orders.to_string()),
            (Metric::BoostScore.field(), self.boost_score.to_string()),
        ]
    }
}

/// A fast-tier counter set plus the bookkeeping that makes eviction safe.
///
/// `baseline` is set once the totals include the durable history (product
/// creation, a reset, or a re-seed after eviction). A set without it was
/// recreated by increments after an eviction and holds only the deltas
/// since then; it must be added to the durable row before anything reads
/// it as a total.
///
/// `generation` changes on every write to the set. A computed stats payload
/// is cached only if the generation it was built from is still current.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CounterState {
    pub counters: ProductCounterSet,
    pub baseline: bool,
    pub generation: u64,
}

impl CounterState {
    /// Totals of a baselined set never report a negative boost score.
    #[must_use]
    pub fn new(counters: ProductCounterSet, baseline: bool, generation: u64) -> Self {
        Self {
            counters: if baseline { counters.floored() } else { counters },
            baseline,
            generation,
        }
    }
}

/// A dirty-set member: the product and when it was first dirtied since its
/// last successful flush.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirtyEntry {
    pub product_id: String,
    pub first_dirtied_ms: i64,
}

impl DirtyEntry {
    pub fn new(product_id: impl Into<String>, first_dirtied_ms: i64) -> Self {
        Self {
            product_id: product_id.into(),
            first_dirtied_ms,
        }
    }

    /// Dirty entry stamped with the current time.
    pub fn now(product_id: impl Into<String>) -> Self {
        Self::new(product_id, now_millis())
    }
}

/// Wall-clock epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
