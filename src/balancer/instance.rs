use crate::config::{self, InstanceConfig};
use serde::Serialize;
use std::time::{Duration, Instant, SystemTime};

/// Effective weight bounds after online adjustment.
pub const WEIGHT_FLOOR: f64 = 5.0;
pub const WEIGHT_CEIL: f64 = 100.0;

/// Multiplicative decrease on a failed request, increase on a successful one.
pub const FAILURE_DECAY: f64 = 0.8;
pub const RECOVERY_GROWTH: f64 = 1.05;

/// The status flips to Warning once the consecutive-failure counter exceeds this.
pub const WARNING_AFTER_FAILURES: u32 = 3;

/// Sliding window for the time-weighted load average.
pub const LOAD_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Healthy,
    Warning,
}

/// Whether the instance's effective weight sits within 20% of the mean of
/// its healthy peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceLabel {
    Balanced,
    Unbalanced,
}

/// Runtime state for one `(model, instance)` pair. Owned exclusively by the
/// `ModelStore`; every mutation happens under its mutex.
#[derive(Debug, Clone)]
pub struct InstanceState {
    pub model: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub base_url: String,

    /// SWRR running counter. Stays within `[-Σeffective, +Σeffective]`.
    pub current_weight: f64,
    pub effective_weight: f64,
    pub history_failures: u32,

    pub active_requests: u32,
    pub request_count: u64,
    pub error_count: u64,
    pub token_total: u64,

    pub last_response_time_ms: f64,
    pub last_update: Instant,
    pub last_update_wall: SystemTime,

    pub load_threshold: f64,
    /// `(completion time, active requests at request start)`, pruned to the
    /// last 30 seconds, monotonically non-decreasing in time.
    pub load_history: Vec<(Instant, u32)>,

    pub status: InstanceStatus,
    pub balance: BalanceLabel,
    pub load_rate: f64,
}

impl InstanceState {
    pub fn from_config(model: &str, cfg: &InstanceConfig, now: Instant, wall: SystemTime) -> Self {
        let base_url = config::normalize_base_url(&cfg.url);
        let (host, port) = config::host_port(&base_url);
        Self {
            model: model.to_string(),
            name: cfg.name.clone(),
            host,
            port,
            base_url,
            current_weight: 0.0,
            effective_weight: f64::from(cfg.initial_weight),
            history_failures: 0,
            active_requests: 0,
            request_count: 0,
            error_count: 0,
            token_total: 0,
            last_response_time_ms: 0.0,
            last_update: now,
            last_update_wall: wall,
            load_threshold: cfg.load_threshold,
            load_history: Vec::new(),
            status: InstanceStatus::Healthy,
            balance: BalanceLabel::Balanced,
            load_rate: 0.0,
        }
    }

    /// Post-request update: counters, sliding load window, and the adaptive
    /// weight. Runs under the store mutex: no I/O, no allocation beyond the
    /// history push.
    pub(crate) fn record_outcome(
        &mut self,
        response_time_ms: f64,
        is_error: bool,
        token_count: u64,
        now: Instant,
        wall: SystemTime,
    ) {
        self.last_response_time_ms = response_time_ms;
        self.request_count += 1;
        self.token_total += token_count;

        // Load history carries the concurrency level the request saw, i.e.
        // the active count before this completion decrements it.
        let active_at_start = self.active_requests;
        self.active_requests = self.active_requests.saturating_sub(1);
        self.load_history.push((now, active_at_start));

        let cutoff = now.checked_sub(LOAD_WINDOW);
        self.load_history
            .retain(|(t, _)| cutoff.map_or(true, |c| *t >= c));

        let avg_load = window_average(&self.load_history, now);
        self.load_rate = if self.load_threshold > 0.0 {
            (avg_load / self.load_threshold).min(1.0)
        } else {
            0.0
        };

        self.last_update = now;
        self.last_update_wall = wall;

        if is_error {
            self.error_count += 1;
            self.effective_weight = (self.effective_weight * FAILURE_DECAY).max(WEIGHT_FLOOR);
            self.history_failures += 1;
            if self.history_failures > WARNING_AFTER_FAILURES {
                self.status = InstanceStatus::Warning;
            }
        } else {
            self.history_failures = 0;
            self.effective_weight = (self.effective_weight * RECOVERY_GROWTH).min(WEIGHT_CEIL);
        }
    }
}

/// Time-weighted average of the active-request samples over the 30-second
/// window: each sample's load is held until the next sample (the last one
/// until `now`), integrated, then divided by the full window length.
pub(crate) fn window_average(history: &[(Instant, u32)], now: Instant) -> f64 {
    if history.is_empty() {
        return 0.0;
    }

    let mut total_load = 0.0;
    for pair in history.windows(2) {
        let (t1, load1) = pair[0];
        let (t2, _) = pair[1];
        total_load += f64::from(load1) * t2.saturating_duration_since(t1).as_secs_f64();
    }
    let (last_t, last_load) = history[history.len() - 1];
    total_load += f64::from(last_load) * now.saturating_duration_since(last_t).as_secs_f64();

    total_load / LOAD_WINDOW.as_secs_f64()
}
