use super::GatewayState;
use crate::proxy::context::{full_body, BoxBody};
use http::StatusCode;
use hyper::body::Incoming;
use hyper::{Request, Response};

/// Admin surface: liveness, readiness, and the Prometheus scrape endpoint.
/// Runs on its own listener so operational traffic never competes with the
/// proxy data path.
pub fn handle_admin(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let (status, content_type, body) = match req.uri().path() {
        "/health" | "/healthz" => (
            StatusCode::OK,
            "application/json",
            r#"{"status":"ok"}"#.to_string(),
        ),

        "/ready" | "/readyz" => {
            let cfg = state.config.load();
            (
                StatusCode::OK,
                "application/json",
                format!(
                    r#"{{"status":"ready","models":{},"tools":{},"rate_limit_per_minute":{}}}"#,
                    state.models.model_count(),
                    state.tools.service_count(),
                    cfg.rate_limit_per_minute,
                ),
            )
        }

        "/metrics" => (
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            state.metrics.render(),
        ),

        _ => (
            StatusCode::NOT_FOUND,
            "application/json",
            r#"{"error":"not found"}"#.to_string(),
        ),
    };

    Ok(Response::builder()
        .status(status)
        .header("content-type", content_type)
        .body(full_body(body))
        .unwrap_or_else(|_| Response::new(full_body(""))))
}
