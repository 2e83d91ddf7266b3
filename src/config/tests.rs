use super::types::*;
use super::GatewayConfig;

#[test]
fn test_deserialize_defaults() {
    let toml_str = r#"
[consul]
address = "http://custom:8500"
"#;
    let cfg: GatewayConfig = toml::from_str(toml_str).unwrap();
    assert_eq!(cfg.consul.address, "http://custom:8500");
    assert_eq!(cfg.api_prefix, "/api/v1");
    assert_eq!(cfg.rate_limit_per_minute, 120);
    assert_eq!(cfg.proxy.model_timeout_secs, 300.0);
    assert_eq!(cfg.proxy.tool_timeout_secs, 120.0);
    assert_eq!(cfg.health_check.interval_secs, 10);
    assert_eq!(cfg.health_check.failure_threshold, 3);
    assert!(!cfg.registration.enabled);
    assert!(cfg.models.is_empty());
}

#[test]
fn test_model_blob_legacy_keys() {
    // The deployment blob uses `ip` for the endpoint URL.
    let json = r#"{
        "qwen-72b": [
            {"name": "qwen-a", "ip": "http://10.0.0.1:11434", "initial_weight": 30},
            {"name": "qwen-b", "ip": "10.0.0.2:11434"}
        ]
    }"#;
    let models: std::collections::BTreeMap<String, Vec<InstanceConfig>> =
        serde_json::from_str(json).unwrap();
    let fleet = &models["qwen-72b"];
    assert_eq!(fleet[0].url, "http://10.0.0.1:11434");
    assert_eq!(fleet[0].initial_weight, 30);
    assert_eq!(fleet[1].initial_weight, 20);
    assert_eq!(fleet[1].load_threshold, 100.0);
}

#[test]
fn test_tool_blob_legacy_keys() {
    let json = r#"[
        {
            "name": "service_nlp2sql",
            "ch_name": "NL-to-SQL",
            "health_check_url": "http://service_nlp2sql:8004/health",
            "qps_threshold": 110,
            "response_time_threshold": 480.0
        }
    ]"#;
    let tools: Vec<ToolServiceConfig> = serde_json::from_str(json).unwrap();
    assert_eq!(tools[0].display_name.as_deref(), Some("NL-to-SQL"));
    assert_eq!(tools[0].qps_threshold, 110);
    assert_eq!(tools[0].response_time_threshold_ms, 480.0);
}

#[test]
fn test_validate_weight_out_of_range() {
    let mut cfg = GatewayConfig::default();
    cfg.models.insert(
        "m".into(),
        vec![InstanceConfig {
            name: "a".into(),
            url: "http://10.0.0.1:11434".into(),
            initial_weight: 0,
            load_threshold: 100.0,
        }],
    );
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_duplicate_instance() {
    let mut cfg = GatewayConfig::default();
    cfg.models.insert(
        "m".into(),
        vec![
            InstanceConfig {
                name: "a".into(),
                url: "http://10.0.0.1:11434".into(),
                initial_weight: 20,
                load_threshold: 100.0,
            },
            InstanceConfig {
                name: "a".into(),
                url: "http://10.0.0.2:11434".into(),
                initial_weight: 20,
                load_threshold: 100.0,
            },
        ],
    );
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_nonpositive_load_threshold() {
    let mut cfg = GatewayConfig::default();
    cfg.models.insert(
        "m".into(),
        vec![InstanceConfig {
            name: "a".into(),
            url: "http://10.0.0.1:11434".into(),
            initial_weight: 20,
            load_threshold: 0.0,
        }],
    );
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_duplicate_tool_case_insensitive() {
    let mut cfg = GatewayConfig::default();
    cfg.tools = vec![
        ToolServiceConfig {
            name: "Svc".into(),
            display_name: None,
            health_check_url: "http://svc:8000/health".into(),
            qps_threshold: 100,
            response_time_threshold_ms: 500.0,
        },
        ToolServiceConfig {
            name: "svc".into(),
            display_name: None,
            health_check_url: "http://svc:8000/health".into(),
            qps_threshold: 100,
            response_time_threshold_ms: 500.0,
        },
    ];
    assert!(cfg.validate().is_err());
}

#[test]
fn test_host_port() {
    assert_eq!(host_port("http://10.0.0.1:11434"), ("10.0.0.1".into(), 11434));
    assert_eq!(host_port("https://api.internal"), ("api.internal".into(), 443));
    assert_eq!(host_port("api.internal"), ("api.internal".into(), 80));
    assert_eq!(host_port("10.0.0.2:8000"), ("10.0.0.2".into(), 8000));
    assert_eq!(
        host_port("http://svc:8004/health"),
        ("svc".into(), 8004)
    );
}

#[test]
fn test_normalize_base_url() {
    assert_eq!(normalize_base_url("10.0.0.1:11434"), "http://10.0.0.1:11434");
    assert_eq!(
        normalize_base_url("http://10.0.0.1:11434/"),
        "http://10.0.0.1:11434"
    );
    assert_eq!(
        normalize_base_url("https://models.internal/v1"),
        "https://models.internal/v1"
    );
}

#[test]
fn test_unsupported_format() {
    let tmp = std::env::temp_dir().join("delphi_test_config.yml");
    std::fs::write(&tmp, "key: value").unwrap();
    assert!(GatewayConfig::load(&tmp).is_err());
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_load_json_config() {
    let json = r#"{
        "models": {
            "chat-7b": [
                {"name": "node-1", "url": "http://10.1.0.1:11434", "initial_weight": 40},
                {"name": "node-2", "url": "http://10.1.0.2:11434"}
            ]
        },
        "tools": [
            {"name": "nlp2sql", "health_check_url": "http://nlp2sql:8004/health"}
        ],
        "proxy": {"model_timeout_secs": 120.0}
    }"#;
    let tmp = std::env::temp_dir().join("delphi_test_config.json");
    std::fs::write(&tmp, json).unwrap();
    let cfg = GatewayConfig::load(&tmp).unwrap();
    assert_eq!(cfg.models["chat-7b"].len(), 2);
    assert_eq!(cfg.tools.len(), 1);
    assert_eq!(cfg.proxy.model_timeout_secs, 120.0);
    std::fs::remove_file(&tmp).ok();
}
