use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use std::time::Instant;

/// Unified body error so that both hyper transport errors and the stream
/// tee's own failures (line-buffer overflow) can travel the same channel.
pub type BodyError = Box<dyn std::error::Error + Send + Sync>;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, BodyError>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Which gateway surface handled the request: the label every operational
/// metric and access-log line is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Model,
    Tools,
}

impl Surface {
    pub fn as_str(&self) -> &'static str {
        match self {
            Surface::Model => "model",
            Surface::Tools => "tools",
        }
    }
}

/// Per-request context: identity for logs plus the timing needed to close
/// out metrics in one place.
pub struct RequestContext {
    pub surface: Surface,
    pub method: String,
    pub path: String,
    pub target: String,
    pub upstream_addr: String,
    pub start: Instant,
}

impl RequestContext {
    pub fn new(surface: Surface, method: String, path: String) -> Self {
        metrics::gauge!(
            "gateway_http_requests_in_flight",
            "surface" => surface.as_str(),
        )
        .increment(1.0);

        Self {
            surface,
            method,
            path,
            target: String::new(),
            upstream_addr: String::new(),
            start: Instant::now(),
        }
    }

    /// Build a JSON error response and close out metrics, the single exit
    /// point for every error path on this surface.
    pub fn error_response(&self, status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
        self.finalize(status.as_u16());
        hyper::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(full_body(format!(r#"{{"error":"{}"}}"#, msg)))
            .unwrap_or_else(|_| hyper::Response::new(empty_body()))
    }

    /// Record the request-level counters, latency histogram, and the access
    /// log line once the response status is known.
    pub fn finalize(&self, status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status);

        metrics::counter!(
            "gateway_http_requests_total",
            "surface" => self.surface.as_str(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
            "upstream_addr" => self.upstream_addr.clone(),
        )
        .increment(1);

        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "surface" => self.surface.as_str(),
        )
        .record(self.start.elapsed().as_secs_f64());

        metrics::gauge!(
            "gateway_http_requests_in_flight",
            "surface" => self.surface.as_str(),
        )
        .decrement(1.0);

        tracing::info!(
            surface = self.surface.as_str(),
            method = %self.method,
            path = %self.path,
            target = %self.target,
            upstream = %self.upstream_addr,
            status,
            latency_ms = %self.start.elapsed().as_millis(),
            "access"
        );
    }
}
