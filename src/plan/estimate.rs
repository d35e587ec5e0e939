//! Optimizer estimates
//!
//! Cost, cardinality, size, and first-row cost attached per plan node.
//! A negative value is the not-available sentinel; any arithmetic over
//! estimates short-circuits when a sentinel is involved.

use serde::{Deserialize, Serialize};

pub const COST_NOT_AVAIL: f64 = -1.0;
pub const CARD_NOT_AVAIL: f64 = -1.0;
pub const SIZE_NOT_AVAIL: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptEstimate {
    pub cost: f64,
    pub cardinality: f64,
    pub size: i64,
    pub fr_cost: f64,
}

impl OptEstimate {
    pub fn new(cost: f64, cardinality: f64, size: i64, fr_cost: f64) -> Self {
        Self {
            cost,
            cardinality,
            size,
            fr_cost,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            cost: COST_NOT_AVAIL,
            cardinality: CARD_NOT_AVAIL,
            size: SIZE_NOT_AVAIL,
            fr_cost: COST_NOT_AVAIL,
        }
    }

    pub fn is_available(&self) -> bool {
        self.cost >= 0.0 && self.cardinality >= 0.0 && self.size >= 0 && self.fr_cost >= 0.0
    }

    pub fn is_unavailable(&self) -> bool {
        !self.is_available()
    }

    /// Sum of two estimates; unavailable if either side is.
    pub fn add(&self, other: &OptEstimate) -> OptEstimate {
        if self.is_unavailable() || other.is_unavailable() {
            return OptEstimate::unavailable();
        }
        OptEstimate {
            cost: self.cost + other.cost,
            cardinality: self.cardinality + other.cardinality,
            size: self.size.max(other.size),
            fr_cost: self.fr_cost + other.fr_cost,
        }
    }

    /// Split the cost across two equal halves, keeping cardinality and
    /// size. Used when an over-wide scan fan-in is rebalanced.
    pub fn halve_cost(&self) -> OptEstimate {
        if self.is_unavailable() {
            return *self;
        }
        OptEstimate {
            cost: self.cost / 2.0,
            ..*self
        }
    }

    /// Replace the cardinality, keeping the rest.
    pub fn with_cardinality(&self, cardinality: f64) -> OptEstimate {
        OptEstimate {
            cardinality,
            ..*self
        }
    }
}

impl Default for OptEstimate {
    fn default() -> Self {
        Self::unavailable()
    }
}
