use serde::{Deserialize, Serialize};

use crate::db::models::deliveries::DeliveryStatusCounts;

/// Per-subscription delivery summary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    /// Pending plus currently in flight
    pub pending: u64,
    /// Percentage of all deliveries that succeeded, rounded to two decimals
    pub success_rate: f64,
}

impl From<DeliveryStatusCounts> for DeliveryStats {
    fn from(counts: DeliveryStatusCounts) -> Self {
        let total = counts.total();
        let success_rate = if total == 0 {
            0.0
        } else {
            let rate = counts.success as f64 / total as f64 * 100.0;
            (rate * 100.0).round() / 100.0
        };
        Self {
            total,
            success: counts.success,
            failed: counts.failed,
            pending: counts.pending + counts.retrying,
            success_rate,
        }
    }
}
