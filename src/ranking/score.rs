//! Trending score.
//!
//! ```text
//! base     = views*W_view + carts*W_cart + clicks*W_click + orders*W_order
//! recency  = max(0, horizon_days - age_days) * W_recency
//! score    = (base + recency) * (boost_multiplier if boosted else 1)
//! ```

use serde::{Deserialize, Serialize};

use crate::counters::ProductCounterSet;

/// Tunable score weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingWeights {
    pub view: f64,
    pub cart: f64,
    pub click: f64,
    pub order: f64,
    /// Applied to the whole score while a boost is active
    pub boost_multiplier: f64,
    /// Per day of remaining recency horizon
    pub recency: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            view: 1.0,
            cart: 5.0,
            click: 3.0,
            order: 10.0,
            boost_multiplier: 2.0,
            recency: 0.1,
        }
    }
}

/// The parts of a computed score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub base: f64,
    pub recency: f64,
    pub multiplier: f64,
    pub score: f64,
}

impl RankingWeights {
    #[must_use]
    pub fn base_score(&self, counters: &ProductCounterSet) -> f64 {
        counters.views as f64 * self.view
            + counters.carts as f64 * self.cart
            + counters.clicks as f64 * self.click
            + counters.orders as f64 * self.order
    }

    /// `None` age (unknown product attributes) earns no recency bonus.
    #[must_use]
    pub fn recency_bonus(&self, age_days: Option<i64>, horizon_days: i64) -> f64 {
        match age_days {
            Some(age) => (horizon_days - age.max(0)).max(0) as f64 * self.recency,
            None => 0.0,
        }
    }

    #[must_use]
    pub fn score(
        &self,
        counters: &ProductCounterSet,
        age_days: Option<i64>,
        horizon_days: i64,
        boosted: bool,
    ) -> ScoreBreakdown {
        let base = self.base_score(counters);
        let recency = self.recency_bonus(age_days, horizon_days);
        let multiplier = if boosted { self.boost_multiplier } else { 1.0 };
        ScoreBreakdown {
            base,
            recency,
            multiplier,
            score: (base + recency) * multiplier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_uses_default_weights() {
        let weights = RankingWeights::default();
        let counters = ProductCounterSet { views: 10, carts: 2, clicks: 1, orders: 1, ..Default::default() };
        // 10*1 + 2*5 + 1*3 + 1*10
        assert_eq!(weights.base_score(&counters), 33.0);
    }

    #[test]
    fn test_organic_clicks_and_boost_score_not_weighted() {
        let weights = RankingWeights::default();
        let counters = ProductCounterSet { organic_clicks: 50, boost_score: 9.0, ..Default::default() };
        assert_eq!(weights.base_score(&counters), 0.0);
    }

    #[test]
    fn test_recency_decays_to_zero() {
        let weights = RankingWeights::default();
        assert!((weights.recency_bonus(Some(0), 30) - 3.0).abs() < 1e-9);
        assert!((weights.recency_bonus(Some(20), 30) - 1.0).abs() < 1e-9);
        assert_eq!(weights.recency_bonus(Some(45), 30), 0.0);
        assert_eq!(weights.recency_bonus(None, 30), 0.0);
    }

    #[test]
    fn test_boost_multiplies_whole_score() {
        let weights = RankingWeights::default();
        let counters = ProductCounterSet { views: 100, ..Default::default() };

        let plain = weights.score(&counters, Some(25), 30, false);
        let boosted = weights.score(&counters, Some(25), 30, true);

        assert!((plain.score - 100.5).abs() < 1e-9);
        assert!((boosted.score - 201.0).abs() < 1e-9);
        assert_eq!(boosted.base, plain.base);
    }

    #[test]
    fn test_no_counters_scores_zero() {
        let weights = RankingWeights::default();
        let breakdown = weights.score(&ProductCounterSet::default(), None, 30, true);
        assert_eq!(breakdown.score, 0.0);
    }
}
