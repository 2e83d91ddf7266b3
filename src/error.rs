use http::StatusCode;
use std::fmt;

#[derive(Debug)]
pub enum GatewayError {
    ModelNotConfigured(String),
    NoHealthyInstance(String),
    ServiceNotConfigured(String),
    InvalidApiKey,
    UpstreamTimeout,
    UpstreamTransport(String),
    Http(reqwest::Error),
    Consul(String),
    Config(String),
    Internal(String),
}

impl GatewayError {
    /// HTTP status surfaced to the downstream caller.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::ModelNotConfigured(_) => StatusCode::NOT_FOUND,
            GatewayError::NoHealthyInstance(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ServiceNotConfigured(_) => StatusCode::NOT_FOUND,
            GatewayError::InvalidApiKey => StatusCode::FORBIDDEN,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Http(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Consul(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::ModelNotConfigured(_) => write!(f, "model not configured"),
            GatewayError::NoHealthyInstance(model) => {
                write!(f, "no healthy instance for model '{}'", model)
            }
            GatewayError::ServiceNotConfigured(name) => {
                write!(f, "service '{}' not configured", name)
            }
            GatewayError::InvalidApiKey => write!(f, "invalid API key"),
            GatewayError::UpstreamTimeout => write!(f, "upstream timeout"),
            GatewayError::UpstreamTransport(msg) => write!(f, "upstream transport error: {}", msg),
            GatewayError::Http(e) => write!(f, "http error: {}", e),
            GatewayError::Consul(msg) => write!(f, "consul error: {}", msg),
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}
