use crate::error::GatewayError;
use serde::Serialize;
use std::time::Duration;

/// Thin wrapper over the Consul agent API. The gateway only ever calls two
/// endpoints: service register and service deregister. Everything goes
/// through `put()`, which owns auth and datacenter handling.
#[derive(Clone)]
pub struct ConsulClient {
    agent_url: String,
    http: reqwest::Client,
    token: Option<String>,
    datacenter: Option<String>,
}

impl ConsulClient {
    pub fn new(address: &str, token: Option<String>, datacenter: Option<String>) -> Self {
        let trimmed = address.trim_end_matches('/');
        let agent_url = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("http://{trimmed}")
        };

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .expect("consul client construction cannot fail");

        Self {
            agent_url,
            http,
            token,
            datacenter,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.agent_url
    }

    /// All agent calls are PUTs; decorate each with the ACL token and the
    /// target datacenter when configured.
    fn put(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.put(format!("{}{}", self.agent_url, path));
        if let Some(token) = &self.token {
            req = req.header("X-Consul-Token", token);
        }
        if let Some(dc) = &self.datacenter {
            req = req.query(&[("dc", dc.as_str())]);
        }
        req
    }

    pub async fn register_service<T: Serialize>(
        &self,
        registration: &T,
    ) -> Result<(), GatewayError> {
        let resp = self
            .put("/v1/agent/service/register")
            .json(registration)
            .send()
            .await
            .map_err(GatewayError::Http)?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let detail = resp.text().await.unwrap_or_default();
        Err(GatewayError::Consul(format!(
            "register rejected ({status}): {detail}"
        )))
    }

    /// Deregistration runs during shutdown and is best-effort: an agent-side
    /// refusal is logged, never propagated.
    pub async fn deregister_service(&self, service_id: &str) -> Result<(), GatewayError> {
        let resp = self
            .put(&format!("/v1/agent/service/deregister/{service_id}"))
            .send()
            .await
            .map_err(GatewayError::Http)?;

        if !resp.status().is_success() {
            tracing::warn!(
                "consul: deregister of {} returned {}",
                service_id,
                resp.status()
            );
        }
        Ok(())
    }
}
