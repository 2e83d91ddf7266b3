use crate::config::HealthCheckConfig;
use crate::tools::monitor::{ProbeVerdict, ToolMonitor};
use futures_util::stream::{self, StreamExt};
use std::time::Duration;
use tracing::{debug, warn};

/// Concurrent probes per round.
const PROBE_CONCURRENCY: usize = 8;

/// Build a shared HTTP client for tool health probes.
pub fn build_probe_client(cfg: &HealthCheckConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.timeout_secs))
        .no_proxy()
        .build()
        .expect("failed to build health probe client")
}

/// Run a single round of health probes across the tool fleet.
///
/// The caller (bootstrap) owns the loop and the interval.
pub async fn run_probe_round(monitor: &ToolMonitor, client: &reqwest::Client, cfg: &HealthCheckConfig) {
    let targets = monitor.probe_targets();
    if targets.is_empty() {
        return;
    }

    stream::iter(targets)
        .map(|(service, url)| {
            let client = client.clone();
            let monitor = monitor.clone();
            let failure_threshold = cfg.failure_threshold;
            async move {
                let verdict = probe_one(&client, &service, &url).await;
                record_probe_metrics(&service, verdict);
                monitor.record_probe(&service, verdict, failure_threshold);
            }
        })
        .buffer_unordered(PROBE_CONCURRENCY)
        .collect::<()>()
        .await;
}

async fn probe_one(client: &reqwest::Client, service: &str, url: &str) -> ProbeVerdict {
    match client.get(url).send().await {
        Ok(resp) => {
            if !resp.status().is_success() {
                warn!(
                    "health: probe failed, service={}, status={}",
                    service,
                    resp.status()
                );
                return ProbeVerdict::Unhealthy;
            }
            let verdict = match resp.json::<serde_json::Value>().await {
                Ok(body) => interpret_health_body(&body),
                // Non-JSON 2xx bodies count as healthy.
                Err(_) => ProbeVerdict::Healthy,
            };
            debug!("health: probe completed, service={}, verdict={:?}", service, verdict);
            verdict
        }
        Err(e) => {
            warn!("health: probe unreachable, service={}, error={}", service, e);
            ProbeVerdict::Unreachable
        }
    }
}

/// Tool services answer their health endpoint in a few dialects; accept the
/// common ones and fall back to "2xx means healthy".
fn interpret_health_body(body: &serde_json::Value) -> ProbeVerdict {
    match body.get("status").and_then(|v| v.as_str()) {
        Some("healthy") => return ProbeVerdict::Healthy,
        Some("unhealthy") => return ProbeVerdict::Unhealthy,
        _ => {}
    }
    match body.get("healthy").and_then(|v| v.as_bool()) {
        Some(true) => ProbeVerdict::Healthy,
        Some(false) => ProbeVerdict::Unhealthy,
        None => ProbeVerdict::Healthy,
    }
}

fn record_probe_metrics(service: &str, verdict: ProbeVerdict) {
    let result = match verdict {
        ProbeVerdict::Healthy => "success",
        ProbeVerdict::Unhealthy => "unhealthy",
        ProbeVerdict::Unreachable => "unreachable",
    };
    metrics::counter!(
        "gateway_health_check_total",
        "service" => service.to_string(),
        "result" => result,
    )
    .increment(1);
    if verdict != ProbeVerdict::Unreachable {
        metrics::gauge!(
            "gateway_tool_health_status",
            "service" => service.to_string(),
        )
        .set(if verdict == ProbeVerdict::Healthy { 1.0 } else { 0.0 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpret_status_field() {
        let healthy = serde_json::json!({"status": "healthy"});
        let unhealthy = serde_json::json!({"status": "unhealthy"});
        assert_eq!(interpret_health_body(&healthy), ProbeVerdict::Healthy);
        assert_eq!(interpret_health_body(&unhealthy), ProbeVerdict::Unhealthy);
    }

    #[test]
    fn test_interpret_healthy_flag() {
        let up = serde_json::json!({"healthy": true});
        let down = serde_json::json!({"healthy": false});
        assert_eq!(interpret_health_body(&up), ProbeVerdict::Healthy);
        assert_eq!(interpret_health_body(&down), ProbeVerdict::Unhealthy);
    }

    #[test]
    fn test_interpret_unknown_shape_defaults_healthy() {
        let other = serde_json::json!({"uptime": 42});
        assert_eq!(interpret_health_body(&other), ProbeVerdict::Healthy);
        // An unrecognized status string falls through to the flag check.
        let odd = serde_json::json!({"status": "degraded"});
        assert_eq!(interpret_health_body(&odd), ProbeVerdict::Healthy);
    }
}
