use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Deserialize a `T` that implements `Default`, treating JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration. Immutable once loaded: the model and
/// tool fleets are fixed for the lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Model fleets: model name → ordered list of inference instances.
    /// The order is significant; selection tie-breaks follow it.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub models: BTreeMap<String, Vec<InstanceConfig>>,

    /// Tool microservices reachable via `/tools/{name}/...`.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub tools: Vec<ToolServiceConfig>,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub consul: ConsulConfig,

    /// Self-registration to Consul so other gateways can discover us.
    #[serde(default)]
    pub registration: RegistrationConfig,

    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,

    /// Advisory only. Exposed for operators, never enforced.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,

    /// When set, the tools route requires this key in `api_key_header`.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,

    /// Base URL of the external new-api monitoring feed, passed through
    /// on `/modelbase/newapi/data`.
    #[serde(default)]
    pub new_api_base_url: Option<String>,

    /// External Prometheus read on `/kldgebase/metrics`.
    #[serde(default = "default_prometheus_url")]
    pub prometheus_url: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            models: BTreeMap::new(),
            tools: Vec::new(),
            proxy: ProxyConfig::default(),
            health_check: HealthCheckConfig::default(),
            consul: ConsulConfig::default(),
            registration: RegistrationConfig::default(),
            api_prefix: default_api_prefix(),
            rate_limit_per_minute: default_rate_limit(),
            api_key: None,
            api_key_header: default_api_key_header(),
            new_api_base_url: None,
            prometheus_url: default_prometheus_url(),
        }
    }
}

fn default_api_prefix() -> String {
    "/api/v1".to_string()
}

fn default_rate_limit() -> u32 {
    120
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

fn default_prometheus_url() -> String {
    "http://localhost:9090".to_string()
}

/// One LLM inference endpoint within a model fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub name: String,

    /// Endpoint URL. Accepts `host:port` (scheme defaults to http) or a full
    /// `http(s)://host:port/prefix` form. The legacy blob key is `ip`.
    #[serde(alias = "ip")]
    pub url: String,

    #[serde(default = "default_initial_weight")]
    pub initial_weight: u32,

    /// Max concurrent in-flight requests the node is expected to sustain.
    /// Used as the denominator of the load rate.
    #[serde(default = "default_load_threshold")]
    pub load_threshold: f64,
}

fn default_initial_weight() -> u32 {
    20
}

fn default_load_threshold() -> f64 {
    100.0
}

/// A tool microservice: forwarding target plus health-probe endpoint and
/// the thresholds its metrics are judged against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServiceConfig {
    pub name: String,

    /// Human-readable name for dashboards. Legacy blob key is `ch_name`.
    #[serde(default, alias = "ch_name")]
    pub display_name: Option<String>,

    pub health_check_url: String,

    #[serde(default = "default_qps_threshold")]
    pub qps_threshold: u32,

    #[serde(
        default = "default_rt_threshold",
        alias = "response_time_threshold"
    )]
    pub response_time_threshold_ms: f64,
}

fn default_qps_threshold() -> u32 {
    100
}

fn default_rt_threshold() -> f64 {
    500.0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyConfig {
    /// Model request timeout (unary; streaming uses it for the header phase).
    #[serde(default = "default_model_timeout")]
    pub model_timeout_secs: f64,

    /// Tool forwarding timeout.
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: f64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: f64,

    /// Request bodies up to this size are buffered to inspect `"stream":true`.
    /// Larger bodies are forwarded as unary without inspection.
    #[serde(default = "default_max_inspect_body")]
    pub max_inspect_body_bytes: u64,

    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    #[serde(default = "default_pool_size")]
    pub pool_max_idle_per_host: usize,

    /// Verify upstream TLS certificates. Off by default; model fleets are
    /// internal traffic, often behind self-signed certs.
    #[serde(default)]
    pub tls_verify: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            model_timeout_secs: default_model_timeout(),
            tool_timeout_secs: default_tool_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            max_inspect_body_bytes: default_max_inspect_body(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            pool_max_idle_per_host: default_pool_size(),
            tls_verify: false,
        }
    }
}

fn default_model_timeout() -> f64 {
    300.0
}

fn default_tool_timeout() -> f64 {
    120.0
}

fn default_connect_timeout() -> f64 {
    5.0
}

fn default_max_inspect_body() -> u64 {
    4 * 1024 * 1024
}

fn default_pool_idle_timeout() -> u64 {
    60
}

fn default_pool_size() -> usize {
    32
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_hc_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_hc_timeout")]
    pub timeout_secs: u64,

    /// Consecutive probe failures before a service is marked unhealthy.
    #[serde(default = "default_hc_failures")]
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_hc_interval(),
            timeout_secs: default_hc_timeout(),
            failure_threshold: default_hc_failures(),
        }
    }
}

fn default_hc_interval() -> u64 {
    10
}

fn default_hc_timeout() -> u64 {
    5
}

fn default_hc_failures() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsulConfig {
    #[serde(default = "default_consul_addr")]
    pub address: String,

    #[serde(default)]
    pub datacenter: Option<String>,

    #[serde(default)]
    pub token: Option<String>,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: default_consul_addr(),
            datacenter: None,
            token: None,
        }
    }
}

fn default_consul_addr() -> String {
    "http://127.0.0.1:8500".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Override for the advertised address. When unset the address is taken
    /// from the listen socket, pod-IP env vars, or interface scan.
    #[serde(default)]
    pub address: Option<String>,

    #[serde(default = "default_tags")]
    pub tags: Vec<String>,

    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: u64,

    #[serde(default = "default_deregister_after")]
    pub deregister_after_secs: u64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: default_service_name(),
            address: None,
            tags: default_tags(),
            check_interval_secs: default_check_interval(),
            check_timeout_secs: default_check_timeout(),
            deregister_after_secs: default_deregister_after(),
        }
    }
}

fn default_service_name() -> String {
    "api-gateway".to_string()
}

fn default_tags() -> Vec<String> {
    vec!["api-gateway".to_string(), "tools-library".to_string()]
}

fn default_check_interval() -> u64 {
    10
}

fn default_check_timeout() -> u64 {
    5
}

fn default_deregister_after() -> u64 {
    60
}

/// Normalize an instance URL to `scheme://host[:port][/prefix]` with no
/// trailing slash. A bare `host:port` gets an `http://` scheme.
pub fn normalize_base_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}

/// Extract `(host, port)` from an endpoint URL without pulling in a full URL
/// parser. The port defaults by scheme when absent.
pub fn host_port(url: &str) -> (String, u16) {
    let url = url.trim();
    let (scheme, rest) = if let Some(rest) = url.strip_prefix("https://") {
        ("https", rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        ("http", rest)
    } else {
        ("http", url)
    };

    let authority = rest.split(['/', '?']).next().unwrap_or("");
    let default_port = if scheme == "https" { 443 } else { 80 };

    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(p) => (host.to_string(), p),
            Err(_) => (authority.to_string(), default_port),
        },
        None => (authority.to_string(), default_port),
    }
}
