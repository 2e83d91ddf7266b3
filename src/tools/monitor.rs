use crate::balancer::views;
use crate::config::{self, GatewayConfig};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// QPS is measured over the last second; response times and request history
/// are kept for thirty.
const QPS_WINDOW: Duration = Duration::from_secs(1);
const SAMPLE_WINDOW: Duration = Duration::from_secs(30);

/// Forwarding target derived from a tool service's health URL.
#[derive(Debug, Clone)]
pub struct ToolTarget {
    pub name: String,
    pub base_url: String,
}

struct ToolState {
    name: String,
    display_name: String,
    health_check_url: String,
    qps_threshold: f64,
    response_time_threshold_ms: f64,

    healthy: bool,
    consecutive_failures: u32,

    active_tasks: u32,
    /// Request start times, pruned to the sample window.
    starts: VecDeque<Instant>,
    /// `(completion time, response time ms)`, pruned to the sample window.
    samples: VecDeque<(Instant, f64)>,
    request_count: u64,
    error_count: u64,
}

impl ToolState {
    fn prune(&mut self, now: Instant) {
        let cutoff = now.checked_sub(SAMPLE_WINDOW);
        let keep = |t: &Instant| cutoff.map_or(true, |c| *t >= c);
        while self.starts.front().is_some_and(|t| !keep(t)) {
            self.starts.pop_front();
        }
        while self.samples.front().is_some_and(|(t, _)| !keep(t)) {
            self.samples.pop_front();
        }
    }

    fn qps(&self, now: Instant) -> u64 {
        let cutoff = now.checked_sub(QPS_WINDOW);
        self.starts
            .iter()
            .filter(|t| cutoff.map_or(true, |c| **t >= c))
            .count() as u64
    }

    fn avg_response_time_ms(&self) -> f64 {
        let times: Vec<f64> = self.samples.iter().map(|(_, rt)| *rt).collect();
        views::mean(&times)
    }
}

/// Health and traffic state for the tool-service fleet. Entries are touched
/// independently, so a sharded map replaces the balancer's coarse mutex here.
#[derive(Clone, Default)]
pub struct ToolMonitor {
    /// Keyed by lowercased service name, since the route segment is
    /// case-insensitive.
    services: Arc<DashMap<String, ToolState>>,
}

impl ToolMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&self, config: &GatewayConfig) {
        self.services.clear();
        for tool in &config.tools {
            self.services.insert(
                tool.name.to_ascii_lowercase(),
                ToolState {
                    name: tool.name.clone(),
                    display_name: tool
                        .display_name
                        .clone()
                        .unwrap_or_else(|| tool.name.clone()),
                    health_check_url: tool.health_check_url.clone(),
                    qps_threshold: f64::from(tool.qps_threshold),
                    response_time_threshold_ms: tool.response_time_threshold_ms,
                    healthy: true,
                    consecutive_failures: 0,
                    active_tasks: 0,
                    starts: VecDeque::new(),
                    samples: VecDeque::new(),
                    request_count: 0,
                    error_count: 0,
                },
            );
        }
    }

    /// Resolve a route segment to a forwarding target. The target address
    /// comes from the service's health URL (scheme, host, port).
    pub fn resolve(&self, service: &str) -> Option<ToolTarget> {
        let entry = self.services.get(&service.to_ascii_lowercase())?;
        let normalized = config::normalize_base_url(&entry.health_check_url);
        let (host, port) = config::host_port(&normalized);
        let scheme = if normalized.starts_with("https://") {
            "https"
        } else {
            "http"
        };
        Some(ToolTarget {
            name: entry.name.clone(),
            base_url: format!("{}://{}:{}", scheme, host, port),
        })
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn is_healthy(&self, service: &str) -> bool {
        self.services
            .get(&service.to_ascii_lowercase())
            .map(|s| s.healthy)
            .unwrap_or(false)
    }

    /// Health URLs for the prober, keyed by canonical service name.
    pub fn probe_targets(&self) -> Vec<(String, String)> {
        self.services
            .iter()
            .map(|e| (e.name.clone(), e.health_check_url.clone()))
            .collect()
    }

    /// Record the prober's verdict. A definitive response sets the state
    /// directly; transport failures only flip the state after
    /// `failure_threshold` consecutive misses.
    pub fn record_probe(&self, service: &str, verdict: ProbeVerdict, failure_threshold: u32) {
        let Some(mut entry) = self.services.get_mut(&service.to_ascii_lowercase()) else {
            return;
        };
        match verdict {
            ProbeVerdict::Healthy => {
                entry.consecutive_failures = 0;
                entry.healthy = true;
            }
            ProbeVerdict::Unhealthy => {
                entry.consecutive_failures = 0;
                entry.healthy = false;
            }
            ProbeVerdict::Unreachable => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= failure_threshold {
                    entry.healthy = false;
                }
            }
        }
    }

    pub fn record_start(&self, service: &str) {
        self.record_start_at(service, Instant::now());
    }

    pub(crate) fn record_start_at(&self, service: &str, now: Instant) {
        let Some(mut entry) = self.services.get_mut(&service.to_ascii_lowercase()) else {
            return;
        };
        entry.active_tasks += 1;
        entry.starts.push_back(now);
        entry.prune(now);
    }

    pub fn record_end(&self, service: &str, response_time_ms: f64, is_error: bool) {
        self.record_end_at(service, response_time_ms, is_error, Instant::now());
    }

    pub(crate) fn record_end_at(
        &self,
        service: &str,
        response_time_ms: f64,
        is_error: bool,
        now: Instant,
    ) {
        let Some(mut entry) = self.services.get_mut(&service.to_ascii_lowercase()) else {
            return;
        };
        entry.active_tasks = entry.active_tasks.saturating_sub(1);
        entry.samples.push_back((now, response_time_ms));
        entry.request_count += 1;
        if is_error {
            entry.error_count += 1;
        }
        entry.prune(now);
    }

    pub fn snapshot(&self) -> ToolMetricsResponse {
        self.snapshot_at(Instant::now(), SystemTime::now())
    }

    pub(crate) fn snapshot_at(&self, now: Instant, wall: SystemTime) -> ToolMetricsResponse {
        let mut service_metrics = BTreeMap::new();
        let mut qps_values = Vec::new();
        let mut healthy_services = 0usize;
        let mut total_qps = 0u64;
        let mut active_tasks = 0u64;
        let mut total_requests = 0u64;
        let mut total_errors = 0u64;
        let mut rt_sum = 0.0;
        let mut rt_count = 0usize;

        for entry in self.services.iter() {
            let qps = entry.qps(now);
            let avg_rt = entry.avg_response_time_ms();
            let load_rate = if entry.qps_threshold > 0.0 {
                (qps as f64 / entry.qps_threshold).min(1.0)
            } else {
                0.0
            };

            if entry.healthy {
                healthy_services += 1;
            }
            if qps > 0 {
                qps_values.push(qps as f64);
            }
            total_qps += qps;
            active_tasks += u64::from(entry.active_tasks);
            total_requests += entry.request_count;
            total_errors += entry.error_count;
            for (_, rt) in entry.samples.iter() {
                rt_sum += rt;
                rt_count += 1;
            }

            service_metrics.insert(
                entry.name.clone(),
                ToolServiceView {
                    service_name: entry.name.clone(),
                    display_name: entry.display_name.clone(),
                    healthy: entry.healthy,
                    active_tasks: entry.active_tasks,
                    qps,
                    response_time_avg: views::clean(avg_rt),
                    load_rate: views::clean(load_rate),
                    response_time_threshold_ms: entry.response_time_threshold_ms,
                },
            );
        }

        let avg_response_time = if rt_count > 0 {
            views::clean(rt_sum / rt_count as f64)
        } else {
            0.0
        };
        let error_rate = if total_requests > 0 {
            views::clean(total_errors as f64 / total_requests as f64).min(1.0)
        } else {
            0.0
        };

        ToolMetricsResponse {
            global_metrics: ToolGlobalView {
                total_services: self.services.len(),
                healthy_services,
                load_balance_degree: views::balance_degree(&qps_values),
                total_qps,
                avg_response_time,
                error_rate,
                active_tasks,
                system_throughput: total_qps as f64,
                updated_at: humantime::format_rfc3339_millis(wall).to_string(),
            },
            service_metrics,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    Healthy,
    Unhealthy,
    /// Transport failure or timeout; the service state is unknown.
    Unreachable,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolServiceView {
    pub service_name: String,
    pub display_name: String,
    pub healthy: bool,
    pub active_tasks: u32,
    pub qps: u64,
    pub response_time_avg: f64,
    pub load_rate: f64,
    pub response_time_threshold_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolGlobalView {
    pub total_services: usize,
    pub healthy_services: usize,
    pub load_balance_degree: f64,
    pub total_qps: u64,
    pub avg_response_time: f64,
    pub error_rate: f64,
    pub active_tasks: u64,
    pub system_throughput: f64,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolMetricsResponse {
    pub global_metrics: ToolGlobalView,
    pub service_metrics: BTreeMap<String, ToolServiceView>,
}

/// Decrements the service's active counter on every exit path, mirroring the
/// model store's commit guard.
pub struct ToolGuard {
    monitor: ToolMonitor,
    service: String,
    start: Instant,
    finished: bool,
}

impl ToolGuard {
    pub fn start(monitor: ToolMonitor, service: String) -> Self {
        monitor.record_start(&service);
        Self {
            monitor,
            service,
            start: Instant::now(),
            finished: false,
        }
    }

    pub fn finish(mut self, is_error: bool) {
        self.close(is_error);
    }

    fn close(&mut self, is_error: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        let rt_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.monitor.record_end(&self.service, rt_ms, is_error);

        metrics::counter!(
            "gateway_tool_requests_total",
            "service" => self.service.clone(),
            "result" => if is_error { "error" } else { "success" },
        )
        .increment(1);
        metrics::histogram!(
            "gateway_tool_request_duration_seconds",
            "service" => self.service.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}

impl Drop for ToolGuard {
    fn drop(&mut self) {
        self.close(true);
    }
}
