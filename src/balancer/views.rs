use super::instance::{BalanceLabel, InstanceState, InstanceStatus};
use serde::Serialize;
use std::collections::BTreeMap;

/// Per-node monitoring row, one per instance, sorted by instance name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeView {
    pub name: String,
    pub host: String,
    pub status: InstanceStatus,
    pub balance: BalanceLabel,
    pub load_rate: f64,
    pub token_total: u64,
    pub last_response_time_ms: f64,
    pub effective_weight: f64,
}

impl NodeView {
    pub(crate) fn from_state(inst: &InstanceState) -> Self {
        Self {
            name: inst.name.clone(),
            host: inst.host.clone(),
            status: inst.status,
            balance: inst.balance,
            load_rate: clean(inst.load_rate),
            token_total: inst.token_total,
            last_response_time_ms: clean(inst.last_response_time_ms),
            effective_weight: clean(inst.effective_weight),
        }
    }
}

/// Per-model aggregate for the global monitoring view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelGlobalView {
    pub nodes: usize,
    pub healthy: usize,
    pub warning: usize,
    /// `1 − stddev/mean` over healthy effective weights, clamped to [0,1].
    pub balance_degree: f64,
    /// Requests per second attributed from nodes updated in the last 10 s.
    pub throughput: f64,
    pub avg_load_rate: f64,
    pub avg_response_time_ms: f64,
    pub token_total: u64,
    pub updated_at: String,
}

/// `/modelbase/metrics` payload: both views in one response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedView {
    pub global_metrics: BTreeMap<String, ModelGlobalView>,
    pub node_metrics: BTreeMap<String, Vec<NodeView>>,
}

/// Monitoring payloads must never carry NaN/Infinity; degenerate numerics
/// resolve to zero.
pub(crate) fn clean(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    clean(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation.
pub(crate) fn stddev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance =
        values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    clean(variance.sqrt())
}

/// Coefficient-of-variation balance score: `1 − stddev/mean`, clamped to [0,1].
pub(crate) fn balance_degree(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    if m == 0.0 {
        return 0.0;
    }
    clean(1.0 - stddev(values, m) / m).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_guards_empty() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(mean(&[2.0, 4.0]), 3.0);
    }

    #[test]
    fn test_stddev_population() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let m = mean(&values);
        assert!((stddev(&values, m) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_balance_degree_uniform_is_one() {
        assert_eq!(balance_degree(&[20.0, 20.0, 20.0]), 1.0);
    }

    #[test]
    fn test_balance_degree_empty_is_zero() {
        assert_eq!(balance_degree(&[]), 0.0);
    }

    #[test]
    fn test_balance_degree_clamped() {
        // Extreme spread can push 1 − cv below zero; the score floors at 0.
        let d = balance_degree(&[1.0, 100.0, 1.0, 100.0, 1.0]);
        assert!((0.0..=1.0).contains(&d));
    }

    #[test]
    fn test_clean_replaces_non_finite() {
        assert_eq!(clean(f64::NAN), 0.0);
        assert_eq!(clean(f64::INFINITY), 0.0);
        assert_eq!(clean(1.5), 1.5);
    }
}
