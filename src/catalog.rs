//! Durable-tier records and the read-only catalog inputs the ranking engine
//! consumes (boosts, discount windows, product age).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::counters::ProductCounterSet;

/// One row of the durable `product_stats` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableStatRecord {
    pub product_id: String,
    pub total_views: u64,
    pub clicks: u64,
    pub organic_clicks: u64,
    pub total_carts: u64,
    pub total_orders: u64,
    pub total_boost_score: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DurableStatRecord {
    /// Zeroed row written at product creation.
    pub fn zeroed(product_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::from_counters(product_id, &ProductCounterSet::default(), now)
    }

    /// Row carrying the absolute fast-tier totals. `created_at` is only
    /// used when the row does not exist yet.
    pub fn from_counters(product_id: impl Into<String>, counters: &ProductCounterSet, now: DateTime<Utc>) -> Self {
        Self {
            product_id: product_id.into(),
            total_views: counters.views,
            clicks: counters.clicks,
            organic_clicks: counters.organic_clicks,
            total_carts: counters.carts,
            total_orders: counters.orders,
            total_boost_score: counters.boost_score,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn to_counters(&self) -> ProductCounterSet {
        ProductCounterSet {
            views: self.total_views,
            clicks: self.clicks,
            organic_clicks: self.organic_clicks,
            carts: self.total_carts,
            orders: self.total_orders,
            boost_score: self.total_boost_score,
        }
    }

    /// Same flushed values, ignoring timestamps.
    #[must_use]
    pub fn same_totals(&self, other: &DurableStatRecord) -> bool {
        self.product_id == other.product_id && self.to_counters() == other.to_counters()
    }
}

/// Boost lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoostStatus {
    Pending,
    Active,
    Canceled,
    Expired,
}

impl BoostStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Canceled => "canceled",
            Self::Expired => "expired",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "canceled" | "cancelled" => Some(Self::Canceled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for BoostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A paid or promotional boost. Owned by the boost lifecycle collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Boost {
    pub product_id: String,
    pub boost_score: f64,
    pub status: BoostStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

impl Boost {
    /// Active status and `now` inside `[start_date, end_date]`.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == BoostStatus::Active && self.start_date <= now && now <= self.end_date
    }
}

/// A product's discount and its effective window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiscountWindow {
    pub percentage: f64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DiscountWindow {
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.percentage > 0.0 && self.start <= now && now <= self.end
    }
}

/// Product attributes that feed ranking. Owned by the product collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRankingInfo {
    pub product_id: String,
    pub created_at: DateTime<Utc>,
    pub discount: Option<DiscountWindow>,
}

impl ProductRankingInfo {
    pub fn new(product_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            product_id: product_id.into(),
            created_at,
            discount: None,
        }
    }

    #[must_use]
    pub fn with_discount(mut self, percentage: f64, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.discount = Some(DiscountWindow { percentage, start, end });
        self
    }

    /// Whole days since creation, never negative.
    #[must_use]
    pub fn age_in_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days().max(0)
    }

    /// Discount percentage if the window is open at `now`.
    #[must_use]
    pub fn active_discount(&self, now: DateTime<Utc>) -> Option<f64> {
        self.discount
            .filter(|d| d.is_active_at(now))
            .map(|d| d.percentage)
    }

    #[must_use]
    pub fn is_new_arrival(&self, now: DateTime<Utc>, window_days: i64) -> bool {
        now - self.created_at <= Duration::days(window_days)
    }
}

/// Epoch milliseconds to UTC, clamping out-of-range values to the epoch.
#[must_use]
pub fn datetime_from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
