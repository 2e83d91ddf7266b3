use crate::proxy::context::{full_body, BoxBody, RequestContext, Surface};
use crate::proxy::model;
use crate::server::GatewayState;
use crate::tools::forward;
use http::{Method, StatusCode};
use hyper::body::Incoming;
use hyper::{Request, Response};
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// Top-level request dispatch for the proxy listener.
///
/// Fixed segments route to the monitoring endpoints; everything else under
/// `/modelbase/` and `/tools/` is proxied. The dispatch never fails; every
/// branch resolves to a response.
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    debug!("dispatch: method={}, path={}, peer={}", method, path, peer_addr);

    let api_health = {
        let cfg = state.config.load();
        format!("{}/health", cfg.api_prefix.trim_end_matches('/'))
    };

    let resp = if path == "/health" || path == api_health {
        liveness(&state)
    } else if let Some(rest) = path.strip_prefix("/modelbase/") {
        model_surface(req, &state, rest, &method).await
    } else if path == "/toolsbase/metrics" {
        if method == Method::GET {
            json_response(StatusCode::OK, &state.tools.snapshot())
        } else {
            method_not_allowed()
        }
    } else if let Some(rest) = path.strip_prefix("/tools/") {
        let (service, subpath) = split_target(rest);
        let mut ctx = RequestContext::new(Surface::Tools, method.to_string(), path.clone());
        forward::handle_tool_forward(req, &state, service, subpath, &mut ctx).await
    } else if path == "/kldgebase/metrics" {
        prometheus_passthrough(req, &state).await
    } else {
        not_found()
    };

    Ok(resp)
}

/// Routes under `/modelbase/`. The leading segment disambiguates monitoring
/// endpoints from model names; `metrics`, `instances`, `newapi`, and `reset`
/// are reserved.
async fn model_surface(
    req: Request<Incoming>,
    state: &GatewayState,
    rest: &str,
    method: &Method,
) -> Response<BoxBody> {
    match rest {
        "metrics" => {
            return if *method == Method::GET {
                json_response(StatusCode::OK, &state.models.snapshot_combined())
            } else {
                method_not_allowed()
            };
        }
        "metrics/nodes" => {
            return if *method == Method::GET {
                json_response(StatusCode::OK, &state.models.snapshot_nodes())
            } else {
                method_not_allowed()
            };
        }
        "metrics/global" => {
            return if *method == Method::GET {
                json_response(StatusCode::OK, &state.models.snapshot_global())
            } else {
                method_not_allowed()
            };
        }
        "instances" => {
            return if *method == Method::GET {
                json_response(StatusCode::OK, &state.config.load().models)
            } else {
                method_not_allowed()
            };
        }
        "newapi/data" => {
            return if *method == Method::GET {
                newapi_passthrough(req, state).await
            } else {
                method_not_allowed()
            };
        }
        _ => {}
    }

    if let Some(target) = rest.strip_prefix("reset/") {
        return if *method == Method::POST {
            reset_instance(state, target)
        } else {
            method_not_allowed()
        };
    }

    let (model_name, subpath) = split_target(rest);
    if model_name.is_empty() {
        return not_found();
    }
    let path = format!("/modelbase/{}", rest);
    let mut ctx = RequestContext::new(Surface::Model, method.to_string(), path);
    model::handle_model_proxy(req, state, model_name, subpath, &mut ctx).await
}

/// `POST /modelbase/reset/{model}/{instance}`: administrative re-promotion
/// of an instance demoted to warning. The weight controller never promotes
/// on its own.
fn reset_instance(state: &GatewayState, target: &str) -> Response<BoxBody> {
    let Some((model_name, instance)) = target.split_once('/') else {
        return not_found();
    };
    if state.models.reset_status(model_name, instance) {
        tracing::info!("admin: instance status reset, model={}, instance={}", model_name, instance);
        json_response(
            StatusCode::OK,
            &serde_json::json!({"model": model_name, "instance": instance, "status": "healthy"}),
        )
    } else {
        not_found()
    }
}

/// Passthrough of the external new-api monitoring feed.
async fn newapi_passthrough(req: Request<Incoming>, state: &GatewayState) -> Response<BoxBody> {
    let base = match state.config.load().new_api_base_url.clone() {
        Some(base) => base,
        None => {
            return error_json(
                StatusCode::INTERNAL_SERVER_ERROR,
                "NEW_API_BASE_URL not configured",
            );
        }
    };

    let mut url = format!("{}/api/data/", base.trim_end_matches('/'));
    if let Some(q) = req.uri().query() {
        url.push('?');
        url.push_str(q);
    }
    relay_control_get(state, &url, Duration::from_secs(30)).await
}

/// `/kldgebase/metrics`: thin read of the external Prometheus query API.
async fn prometheus_passthrough(req: Request<Incoming>, state: &GatewayState) -> Response<BoxBody> {
    let base = state.config.load().prometheus_url.clone();
    let mut url = format!("{}/api/v1/query", base.trim_end_matches('/'));
    if let Some(q) = req.uri().query() {
        url.push('?');
        url.push_str(q);
    }
    relay_control_get(state, &url, Duration::from_secs(10)).await
}

async fn relay_control_get(state: &GatewayState, url: &str, timeout: Duration) -> Response<BoxBody> {
    match state.control_client.get(url).timeout(timeout).send().await {
        Ok(resp) => {
            let status = StatusCode::from_u16(resp.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let body = resp.bytes().await.unwrap_or_default();
            Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap_or_else(|_| Response::new(full_body("")))
        }
        Err(e) => {
            warn!("passthrough: upstream unreachable, url={}, error={}", url, e);
            error_json(StatusCode::BAD_GATEWAY, "upstream unreachable")
        }
    }
}

fn liveness(state: &GatewayState) -> Response<BoxBody> {
    let service = state.config.load().registration.service_name.clone();
    json_response(
        StatusCode::OK,
        &serde_json::json!({"status": "healthy", "service": service}),
    )
}

/// Split `{target}/{subpath...}` at the first slash. No slash means an
/// empty subpath.
fn split_target(rest: &str) -> (&str, &str) {
    match rest.split_once('/') {
        Some((target, subpath)) => (target, subpath),
        None => (rest, ""),
    }
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<BoxBody> {
    match serde_json::to_vec(value) {
        Ok(buf) => Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(full_body(buf))
            .unwrap_or_else(|_| Response::new(full_body(""))),
        Err(e) => {
            warn!("dispatch: response serialization failed, error={}", e);
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    }
}

fn error_json(status: StatusCode, msg: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(format!(r#"{{"error":"{}"}}"#, msg)))
        .unwrap_or_else(|_| Response::new(full_body("")))
}

fn not_found() -> Response<BoxBody> {
    error_json(StatusCode::NOT_FOUND, "not found")
}

fn method_not_allowed() -> Response<BoxBody> {
    error_json(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}
