use super::instance::{InstanceState, InstanceStatus};
use super::views::{self, CombinedView, ModelGlobalView, NodeView};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

/// Nodes count toward throughput while their last update is this recent.
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(10);

/// The instance picked for a request, released back via `commit`.
#[derive(Debug, Clone)]
pub struct Selection {
    pub instance: String,
    pub base_url: String,
}

/// In-memory state for every model fleet, guarded by a single mutex.
///
/// All critical sections are O(instances per model) and never perform I/O,
/// so the coarse lock is cheap; it also keeps the SWRR weight sum and the
/// per-instance counters consistent with each other. Constructed once at
/// startup and injected into handlers; tests build their own.
#[derive(Clone, Default)]
pub struct ModelStore {
    inner: Arc<Mutex<HashMap<String, Vec<InstanceState>>>>,
}

impl ModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<InstanceState>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build the fleet map from config, replacing any prior contents
    /// atomically. Idempotent.
    pub fn initialize(&self, config: &GatewayConfig) {
        self.initialize_at(config, Instant::now(), SystemTime::now());
    }

    pub(crate) fn initialize_at(&self, config: &GatewayConfig, now: Instant, wall: SystemTime) {
        let mut fresh: HashMap<String, Vec<InstanceState>> = HashMap::new();
        for (model, instances) in &config.models {
            let states = instances
                .iter()
                .map(|cfg| InstanceState::from_config(model, cfg, now, wall))
                .collect();
            fresh.insert(model.clone(), states);
        }
        *self.lock() = fresh;
    }

    /// Smooth weighted round-robin over the model's healthy instances:
    /// every healthy instance gains its effective weight, the largest
    /// running counter wins (configured order breaks ties) and pays back
    /// the sum of effective weights.
    pub fn select(&self, model: &str) -> Result<Selection, GatewayError> {
        let mut map = self.lock();
        let instances = map
            .get_mut(model)
            .ok_or_else(|| GatewayError::ModelNotConfigured(model.to_string()))?;

        let mut total = 0.0;
        for inst in instances
            .iter_mut()
            .filter(|i| i.status == InstanceStatus::Healthy)
        {
            inst.current_weight += inst.effective_weight;
            total += inst.effective_weight;
        }

        let mut best: Option<usize> = None;
        for (i, inst) in instances.iter().enumerate() {
            if inst.status != InstanceStatus::Healthy {
                continue;
            }
            let wins = match best {
                None => true,
                Some(b) => inst.current_weight > instances[b].current_weight,
            };
            if wins {
                best = Some(i);
            }
        }

        let Some(j) = best else {
            return Err(GatewayError::NoHealthyInstance(model.to_string()));
        };

        let picked = &mut instances[j];
        picked.current_weight -= total;
        // With stable weights the counter stays within [-total, +total];
        // weight adjustments between rounds allow a transient overshoot of
        // at most one weight ceiling. Anything past that is a logic bug.
        debug_assert!(
            picked.current_weight.abs() <= total + super::instance::WEIGHT_CEIL + 1e-6,
            "SWRR counter out of range: {} vs total {}",
            picked.current_weight,
            total
        );
        picked.active_requests += 1;

        Ok(Selection {
            instance: picked.name.clone(),
            base_url: picked.base_url.clone(),
        })
    }

    /// Post-request commit: response time, error/token accounting, sliding
    /// load window, adaptive weight, and the balance labels of the whole
    /// fleet. Unknown model/instance commits are ignored.
    pub fn commit(
        &self,
        model: &str,
        instance: &str,
        response_time_ms: f64,
        is_error: bool,
        token_count: u64,
    ) {
        self.commit_at(
            model,
            instance,
            response_time_ms,
            is_error,
            token_count,
            Instant::now(),
            SystemTime::now(),
        );
    }

    pub(crate) fn commit_at(
        &self,
        model: &str,
        instance: &str,
        response_time_ms: f64,
        is_error: bool,
        token_count: u64,
        now: Instant,
        wall: SystemTime,
    ) {
        let mut map = self.lock();
        let Some(instances) = map.get_mut(model) else {
            return;
        };
        let Some(idx) = instances.iter().position(|i| i.name == instance) else {
            return;
        };

        instances[idx].record_outcome(response_time_ms, is_error, token_count, now, wall);

        // Re-derive balance labels against the healthy-peer average.
        let healthy_weights: Vec<f64> = instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Healthy)
            .map(|i| i.effective_weight)
            .collect();

        if healthy_weights.is_empty() {
            for inst in instances.iter_mut() {
                inst.balance = super::BalanceLabel::Unbalanced;
            }
            return;
        }

        let avg = views::mean(&healthy_weights);
        for inst in instances.iter_mut() {
            let deviation = if avg == 0.0 {
                0.0
            } else {
                (inst.effective_weight - avg).abs() / avg
            };
            inst.balance = if deviation > 0.2 {
                super::BalanceLabel::Unbalanced
            } else {
                super::BalanceLabel::Balanced
            };
        }
    }

    /// Administrative re-promotion of a demoted instance. The weight
    /// controller never promotes Warning back to Healthy on its own; this
    /// is the only recovery path. Returns false when the target is unknown.
    pub fn reset_status(&self, model: &str, instance: &str) -> bool {
        let mut map = self.lock();
        let Some(inst) = map
            .get_mut(model)
            .and_then(|v| v.iter_mut().find(|i| i.name == instance))
        else {
            return false;
        };
        inst.status = InstanceStatus::Healthy;
        inst.history_failures = 0;
        true
    }

    pub fn model_count(&self) -> usize {
        self.lock().len()
    }

    /// Per-node monitoring rows, grouped by model, sorted by instance name.
    pub fn snapshot_nodes(&self) -> BTreeMap<String, Vec<NodeView>> {
        let map = self.lock();
        let mut result = BTreeMap::new();
        for (model, instances) in map.iter() {
            let mut rows: Vec<NodeView> = instances.iter().map(NodeView::from_state).collect();
            rows.sort_by(|a, b| a.name.cmp(&b.name));
            result.insert(model.clone(), rows);
        }
        result
    }

    pub fn snapshot_global(&self) -> BTreeMap<String, ModelGlobalView> {
        self.snapshot_global_at(Instant::now(), SystemTime::now())
    }

    pub(crate) fn snapshot_global_at(
        &self,
        now: Instant,
        wall: SystemTime,
    ) -> BTreeMap<String, ModelGlobalView> {
        let map = self.lock();
        let updated_at = humantime::format_rfc3339_millis(wall).to_string();
        let mut result = BTreeMap::new();

        for (model, instances) in map.iter() {
            let healthy_weights: Vec<f64> = instances
                .iter()
                .filter(|i| i.status == InstanceStatus::Healthy)
                .map(|i| i.effective_weight)
                .collect();
            let warning = instances
                .iter()
                .filter(|i| i.status == InstanceStatus::Warning)
                .count();

            let recent_requests: u64 = instances
                .iter()
                .filter(|i| now.saturating_duration_since(i.last_update) <= THROUGHPUT_WINDOW)
                .map(|i| i.request_count)
                .sum();
            let throughput = recent_requests as f64 / THROUGHPUT_WINDOW.as_secs_f64();

            let load_rates: Vec<f64> = instances.iter().map(|i| i.load_rate).collect();
            let response_times: Vec<f64> =
                instances.iter().map(|i| i.last_response_time_ms).collect();

            result.insert(
                model.clone(),
                ModelGlobalView {
                    nodes: instances.len(),
                    healthy: healthy_weights.len(),
                    warning,
                    balance_degree: views::balance_degree(&healthy_weights),
                    throughput: views::clean(throughput),
                    avg_load_rate: views::mean(&load_rates),
                    avg_response_time_ms: views::mean(&response_times),
                    token_total: instances.iter().map(|i| i.token_total).sum(),
                    updated_at: updated_at.clone(),
                },
            );
        }
        result
    }

    pub fn snapshot_combined(&self) -> CombinedView {
        CombinedView {
            global_metrics: self.snapshot_global(),
            node_metrics: self.snapshot_nodes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceConfig;

    fn fleet_config(weights: &[(&str, u32)]) -> GatewayConfig {
        let mut cfg = GatewayConfig::default();
        cfg.models.insert(
            "m".to_string(),
            weights
                .iter()
                .enumerate()
                .map(|(i, (name, w))| InstanceConfig {
                    name: name.to_string(),
                    url: format!("http://10.0.0.{}:11434", i + 1),
                    initial_weight: *w,
                    load_threshold: 100.0,
                })
                .collect(),
        );
        cfg
    }

    fn store_with(weights: &[(&str, u32)]) -> ModelStore {
        let store = ModelStore::new();
        store.initialize(&fleet_config(weights));
        store
    }

    #[test]
    fn test_swrr_sequence() {
        let store = store_with(&[("A", 3), ("B", 1)]);
        let picks: Vec<String> = (0..8)
            .map(|_| store.select("m").unwrap().instance)
            .collect();
        assert_eq!(picks, ["A", "A", "B", "A", "A", "A", "B", "A"]);
    }

    #[test]
    fn test_swrr_fairness_over_window() {
        // Stable weights (no commits): picks split exactly 3:1 over any
        // multiple of a full rotation.
        let store = store_with(&[("A", 3), ("B", 1)]);
        let mut a = 0;
        for _ in 0..400 {
            if store.select("m").unwrap().instance == "A" {
                a += 1;
            }
        }
        assert_eq!(a, 300);
    }

    #[test]
    fn test_select_unknown_model() {
        let store = store_with(&[("A", 3)]);
        let err = store.select("nope").unwrap_err();
        assert!(matches!(err, GatewayError::ModelNotConfigured(_)));
        assert_eq!(err.status_code(), http::StatusCode::NOT_FOUND);
        assert_eq!(err.to_string(), "model not configured");
        // The miss does not touch any fleet.
        let nodes = store.snapshot_nodes();
        assert_eq!(nodes["m"][0].effective_weight, 3.0);
    }

    #[test]
    fn test_select_no_healthy_instance() {
        let store = store_with(&[("A", 20)]);
        // Four consecutive failures demote the only instance.
        for _ in 0..4 {
            let s = store.select("m").unwrap();
            store.commit("m", &s.instance, 100.0, true, 0);
        }
        let err = store.select("m").unwrap_err();
        assert!(matches!(err, GatewayError::NoHealthyInstance(_)));
        assert_eq!(err.status_code(), http::StatusCode::SERVICE_UNAVAILABLE);
        // Failing closed does not bump active counters.
        let map = store.lock();
        assert_eq!(map["m"][0].active_requests, 0);
    }

    #[test]
    fn test_active_requests_balance() {
        let store = store_with(&[("A", 3), ("B", 1)]);
        let mut selections = Vec::new();
        for _ in 0..16 {
            selections.push(store.select("m").unwrap());
        }
        {
            let map = store.lock();
            let total: u32 = map["m"].iter().map(|i| i.active_requests).sum();
            assert_eq!(total, 16);
        }
        for s in selections {
            store.commit("m", &s.instance, 5.0, false, 0);
        }
        let map = store.lock();
        assert!(map["m"].iter().all(|i| i.active_requests == 0));
    }

    #[test]
    fn test_initialize_idempotent() {
        let cfg = fleet_config(&[("A", 3), ("B", 1)]);
        let now = Instant::now();
        let wall = SystemTime::now();

        let once = ModelStore::new();
        once.initialize_at(&cfg, now, wall);

        let twice = ModelStore::new();
        twice.initialize_at(&cfg, now, wall);
        twice.initialize_at(&cfg, now, wall);

        assert_eq!(once.snapshot_nodes(), twice.snapshot_nodes());
        assert_eq!(
            once.snapshot_global_at(now, wall),
            twice.snapshot_global_at(now, wall)
        );
    }

    #[test]
    fn test_initialize_discards_runtime_state() {
        let cfg = fleet_config(&[("A", 20)]);
        let store = ModelStore::new();
        store.initialize(&cfg);
        let s = store.select("m").unwrap();
        store.commit("m", &s.instance, 10.0, true, 42);

        store.initialize(&cfg);
        let nodes = store.snapshot_nodes();
        assert_eq!(nodes["m"][0].token_total, 0);
        assert_eq!(nodes["m"][0].effective_weight, 20.0);
    }

    #[test]
    fn test_snapshot_pure() {
        let store = store_with(&[("A", 3), ("B", 1)]);
        let s = store.select("m").unwrap();
        store.commit("m", &s.instance, 12.5, false, 99);

        let now = Instant::now();
        let wall = SystemTime::now();
        assert_eq!(store.snapshot_nodes(), store.snapshot_nodes());
        assert_eq!(
            store.snapshot_global_at(now, wall),
            store.snapshot_global_at(now, wall)
        );
    }

    #[test]
    fn test_commit_unknown_targets_ignored() {
        let store = store_with(&[("A", 3)]);
        store.commit("ghost", "A", 10.0, false, 5);
        store.commit("m", "ghost", 10.0, false, 5);
        let nodes = store.snapshot_nodes();
        assert_eq!(nodes["m"][0].token_total, 0);
    }

    #[test]
    fn test_token_and_error_accumulation() {
        let store = store_with(&[("A", 20)]);
        let s = store.select("m").unwrap();
        store.commit("m", &s.instance, 80.0, false, 99);
        let s = store.select("m").unwrap();
        store.commit("m", &s.instance, 120.0, true, 7);

        let map = store.lock();
        let inst = &map["m"][0];
        assert_eq!(inst.token_total, 106);
        assert_eq!(inst.request_count, 2);
        assert_eq!(inst.error_count, 1);
        assert_eq!(inst.last_response_time_ms, 120.0);
    }

    #[test]
    fn test_zero_token_success_commit() {
        let store = store_with(&[("A", 20)]);
        let s = store.select("m").unwrap();
        store.commit("m", &s.instance, 30.0, false, 0);
        let map = store.lock();
        let inst = &map["m"][0];
        assert_eq!(inst.token_total, 0);
        assert_eq!(inst.error_count, 0);
        assert_eq!(inst.status, InstanceStatus::Healthy);
    }

    #[test]
    fn test_reset_status_restores_selection() {
        let store = store_with(&[("A", 20)]);
        for _ in 0..4 {
            let s = store.select("m").unwrap();
            store.commit("m", &s.instance, 100.0, true, 0);
        }
        assert!(store.select("m").is_err());

        assert!(store.reset_status("m", "A"));
        let s = store.select("m").unwrap();
        assert_eq!(s.instance, "A");
        store.commit("m", &s.instance, 10.0, false, 0);

        assert!(!store.reset_status("m", "ghost"));
        assert!(!store.reset_status("ghost", "A"));
    }

    #[test]
    fn test_balance_labels() {
        let store = store_with(&[("A", 20), ("B", 20), ("C", 20)]);
        // Push A's weight far below its peers via repeated failures.
        for _ in 0..3 {
            store.commit("m", "A", 50.0, true, 0);
        }
        let nodes = store.snapshot_nodes();
        let by_name: std::collections::HashMap<_, _> =
            nodes["m"].iter().map(|n| (n.name.clone(), n)).collect();
        assert_eq!(by_name["A"].balance, super::super::BalanceLabel::Unbalanced);
        assert_eq!(by_name["B"].balance, super::super::BalanceLabel::Balanced);
    }

    #[test]
    fn test_global_snapshot_counts() {
        let store = store_with(&[("A", 20), ("B", 20)]);
        for _ in 0..4 {
            store.commit("m", "A", 100.0, true, 10);
        }
        store.commit("m", "B", 50.0, false, 5);

        let now = Instant::now();
        let global = store.snapshot_global_at(now, SystemTime::now());
        let view = &global["m"];
        assert_eq!(view.nodes, 2);
        assert_eq!(view.healthy, 1);
        assert_eq!(view.warning, 1);
        assert_eq!(view.token_total, 45);
        // All five commits land within the 10 s throughput window.
        assert!((view.throughput - 0.5).abs() < 1e-9);
        assert!(view.balance_degree >= 0.0 && view.balance_degree <= 1.0);
        assert!(!view.updated_at.is_empty());
    }

    #[test]
    fn test_current_weight_stays_bounded() {
        // Stable weights: the SWRR counters never leave [-total, +total].
        let store = store_with(&[("A", 7), ("B", 3), ("C", 1)]);
        for _ in 0..500 {
            store.select("m").unwrap();
            let map = store.lock();
            let total: f64 = map["m"].iter().map(|i| i.effective_weight).sum();
            for inst in map["m"].iter() {
                assert!(
                    inst.current_weight.abs() <= total + 1e-6,
                    "{} out of [-{total}, {total}]",
                    inst.current_weight
                );
            }
        }
    }
}
