use super::client::ConsulClient;
use crate::config::RegistrationConfig;
use crate::error::GatewayError;
use serde::Serialize;
use std::collections::HashMap;

/// Registers this gateway instance in Consul with an HTTP check against its
/// own liveness endpoint; the Consul agent does the probing from there.
///
/// Pure API operations only; the caller (bootstrap) owns the lifecycle.
pub struct ConsulRegistry {
    client: ConsulClient,
    service_id: String,
    service_info: ServiceRegistration,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceRegistration {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags")]
    tags: Vec<String>,
    #[serde(rename = "Meta")]
    meta: HashMap<String, String>,
    #[serde(rename = "Check")]
    check: HttpCheck,
}

#[derive(Debug, Clone, Serialize)]
struct HttpCheck {
    #[serde(rename = "CheckID")]
    check_id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "HTTP")]
    http: String,
    #[serde(rename = "Interval")]
    interval: String,
    #[serde(rename = "Timeout")]
    timeout: String,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    deregister_after: String,
}

impl ConsulRegistry {
    pub fn new(
        client: ConsulClient,
        listen_addr: &str,
        config: &RegistrationConfig,
    ) -> Result<Self, GatewayError> {
        let (address, port) = Self::resolve_advertised_addr(listen_addr, config)?;

        let service_id = format!("{}-{}", config.service_name, port);
        let health_url = format!("http://{}:{}/health", address, port);

        let mut meta = HashMap::new();
        if let Ok(host) = hostname::get() {
            meta.insert("hostname".to_string(), host.to_string_lossy().into_owned());
        }

        let service_info = ServiceRegistration {
            id: service_id.clone(),
            name: config.service_name.clone(),
            address,
            port,
            tags: config.tags.clone(),
            meta,
            check: HttpCheck {
                check_id: service_id.clone(),
                name: format!("Service '{}' HTTP health", config.service_name),
                http: health_url,
                interval: format!("{}s", config.check_interval_secs),
                timeout: format!("{}s", config.check_timeout_secs),
                deregister_after: format!("{}s", config.deregister_after_secs),
            },
        };

        Ok(Self {
            client,
            service_id,
            service_info,
        })
    }

    fn resolve_advertised_addr(
        listen_addr: &str,
        config: &RegistrationConfig,
    ) -> Result<(String, u16), GatewayError> {
        let (host, port_str) = listen_addr.rsplit_once(':').ok_or_else(|| {
            GatewayError::Config(format!("listen address '{listen_addr}' has no port"))
        })?;
        let port: u16 = port_str.parse().map_err(|_| {
            GatewayError::Config(format!("listen address '{listen_addr}' has a bad port"))
        })?;

        // An explicit override wins; a wildcard bind must be resolved to a
        // concrete address before it can be advertised.
        let address = match &config.address {
            Some(addr) => addr.clone(),
            None if host.is_empty() || host == "0.0.0.0" || host == "::" => {
                Self::get_local_ip()?
            }
            None => host.to_string(),
        };

        Ok((address, port))
    }

    fn get_local_ip() -> Result<String, GatewayError> {
        // The deployment env usually knows the answer (k8s downward API).
        let from_env = ["MY_POD_IP", "POD_IP", "HOST_IP"]
            .iter()
            .find_map(|var| std::env::var(var).ok());
        if let Some(ip) = from_env {
            return Ok(ip);
        }

        // Otherwise advertise the first routable IPv4 on any interface.
        let routable = pnet_datalink::interfaces().into_iter().find_map(|iface| {
            iface.ips.into_iter().find_map(|net| match net {
                ipnetwork::IpNetwork::V4(v4)
                    if !v4.ip().is_loopback() && !v4.ip().is_link_local() =>
                {
                    Some(v4.ip().to_string())
                }
                _ => None,
            })
        });

        routable.ok_or_else(|| {
            GatewayError::Config(
                "no advertisable address: set MY_POD_IP/HOST_IP or registration.address"
                    .to_string(),
            )
        })
    }

    pub async fn register(&self) -> Result<(), GatewayError> {
        self.client.register_service(&self.service_info).await?;
        tracing::info!(
            "consul: service {} registered as {}:{}",
            self.service_id,
            self.service_info.address,
            self.service_info.port
        );
        Ok(())
    }

    pub async fn deregister(&self) -> Result<(), GatewayError> {
        self.client.deregister_service(&self.service_id).await?;
        tracing::info!("consul: service {} deregistered", self.service_id);
        Ok(())
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }
}
