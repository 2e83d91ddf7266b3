pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used, so the fleets can be supplied entirely via env blobs.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            GatewayConfig::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;

        tracing::info!(
            "config: loaded, models={}, tools={}",
            config.models.len(),
            config.tools.len()
        );
        Ok(config)
    }

    /// Apply environment variable overrides. The model and tool fleets are
    /// deployed as JSON blobs (`MODEL_INSTANCES_JSON`, `SERVICE_HEALTH_CHECKS`)
    /// so that orchestration can inject them without templating config files.
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(blob) = std::env::var("MODEL_INSTANCES_JSON") {
            self.models =
                serde_json::from_str(&blob).context("failed to parse MODEL_INSTANCES_JSON")?;
        }
        if let Ok(blob) = std::env::var("SERVICE_HEALTH_CHECKS") {
            self.tools =
                serde_json::from_str(&blob).context("failed to parse SERVICE_HEALTH_CHECKS")?;
        }

        if let Ok(v) = std::env::var("GATEWAY_CONSUL_ADDRESS") {
            self.consul.address = v;
        }
        if let Ok(v) = std::env::var("GATEWAY_CONSUL_DATACENTER") {
            self.consul.datacenter = Some(v);
        }
        if let Ok(v) = std::env::var("GATEWAY_CONSUL_TOKEN") {
            self.consul.token = Some(v);
        }

        if let Ok(v) = std::env::var("GATEWAY_REGISTRATION_ENABLED") {
            self.registration.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("GATEWAY_SERVICE_NAME") {
            self.registration.service_name = v;
        }

        if let Ok(v) = std::env::var("GATEWAY_HEALTH_CHECK_INTERVAL") {
            if let Ok(n) = v.parse::<u64>() {
                self.health_check.interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("GATEWAY_HEALTH_CHECK_TIMEOUT") {
            if let Ok(n) = v.parse::<u64>() {
                self.health_check.timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("GATEWAY_MODEL_TIMEOUT") {
            if let Ok(n) = v.parse::<f64>() {
                self.proxy.model_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("GATEWAY_REQUEST_TIMEOUT") {
            if let Ok(n) = v.parse::<f64>() {
                self.proxy.tool_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("GATEWAY_RATE_LIMIT_PER_MINUTE") {
            if let Ok(n) = v.parse::<u32>() {
                self.rate_limit_per_minute = n;
            }
        }

        if let Ok(v) = std::env::var("GATEWAY_API_KEY") {
            self.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("GATEWAY_API_KEY_HEADER") {
            self.api_key_header = v;
        }
        if let Ok(v) = std::env::var("NEW_API_BASE_URL") {
            self.new_api_base_url = Some(v);
        }
        if let Ok(v) = std::env::var("PROMETHEUS_URL") {
            self.prometheus_url = v;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (model, instances) in &self.models {
            if model.is_empty() {
                anyhow::bail!("model name cannot be empty");
            }
            if instances.is_empty() {
                anyhow::bail!("model '{}' has no instances", model);
            }
            let mut seen = std::collections::HashSet::new();
            for inst in instances {
                if inst.name.is_empty() {
                    anyhow::bail!("model '{}' has an instance with no name", model);
                }
                if !seen.insert(inst.name.as_str()) {
                    anyhow::bail!(
                        "model '{}' has duplicate instance name '{}'",
                        model,
                        inst.name
                    );
                }
                if inst.url.is_empty() {
                    anyhow::bail!("instance '{}/{}' has no url", model, inst.name);
                }
                if !(1..=100).contains(&inst.initial_weight) {
                    anyhow::bail!(
                        "instance '{}/{}' initial_weight {} out of range [1,100]",
                        model,
                        inst.name,
                        inst.initial_weight
                    );
                }
                if inst.load_threshold <= 0.0 {
                    anyhow::bail!(
                        "instance '{}/{}' load_threshold must be positive",
                        model,
                        inst.name
                    );
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        for tool in &self.tools {
            if tool.name.is_empty() {
                anyhow::bail!("tool service name cannot be empty");
            }
            if !seen.insert(tool.name.to_ascii_lowercase()) {
                anyhow::bail!("duplicate tool service name '{}'", tool.name);
            }
            if tool.health_check_url.is_empty() {
                anyhow::bail!("tool service '{}' has no health_check_url", tool.name);
            }
            let (host, _) = host_port(&tool.health_check_url);
            if host.is_empty() {
                anyhow::bail!(
                    "tool service '{}' health_check_url '{}' has no host",
                    tool.name,
                    tool.health_check_url
                );
            }
        }

        Ok(())
    }
}
