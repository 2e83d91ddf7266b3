use crate::error::GatewayError;
use crate::proxy::context::{full_body, BodyError, BoxBody, RequestContext};
use crate::server::GatewayState;
use crate::tools::monitor::ToolGuard;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HOST};
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::time::Duration;
use tracing::warn;

/// Forward a request to a configured tool service. Same shape as the model
/// route minus load balancing and streaming: one fixed target per service,
/// response relayed verbatim.
pub async fn handle_tool_forward(
    req: Request<Incoming>,
    state: &GatewayState,
    service: &str,
    subpath: &str,
    ctx: &mut RequestContext,
) -> Response<BoxBody> {
    let cfg = state.config.load_full();

    // Opaque header check, only when a key is configured.
    if let Some(ref expected) = cfg.api_key {
        let presented = req
            .headers()
            .get(cfg.api_key_header.as_str())
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            let err = GatewayError::InvalidApiKey;
            return ctx.error_response(err.status_code(), &err.to_string());
        }
    }

    let Some(target) = state.tools.resolve(service) else {
        warn!("tools: unknown service, service={}", service);
        let err = GatewayError::ServiceNotConfigured(service.to_string());
        return ctx.error_response(err.status_code(), &err.to_string());
    };
    ctx.target = target.name.clone();
    ctx.upstream_addr = target.base_url.clone();

    let (parts, body) = req.into_parts();

    let mut target_url =
        String::with_capacity(target.base_url.len() + subpath.len() + 16);
    target_url.push_str(&target.base_url);
    target_url.push('/');
    target_url.push_str(subpath);
    if let Some(q) = parts.uri.query() {
        target_url.push('?');
        target_url.push_str(q);
    }

    let mut builder = Request::builder().method(parts.method.clone()).uri(&target_url);
    let mut headers = parts.headers;
    headers.remove(HOST);
    headers.remove(CONTENT_LENGTH);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }

    let out_req = match builder.body(body.map_err(BodyError::from).boxed()) {
        Ok(r) => r,
        Err(e) => {
            warn!(
                "tools: failed to build upstream request, service={}, url={}, error={}",
                target.name, target_url, e
            );
            return ctx.error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error");
        }
    };

    let guard = ToolGuard::start(state.tools.clone(), target.name.clone());
    let timeout = Duration::from_secs_f64(cfg.proxy.tool_timeout_secs);

    let exchange = async {
        let resp = state
            .upstream_client
            .request(out_req)
            .await
            .map_err(BodyError::from)?;
        let (parts, body) = resp.into_parts();
        let bytes = body.collect().await.map_err(BodyError::from)?.to_bytes();
        Ok::<_, BodyError>((parts, bytes))
    };

    match tokio::time::timeout(timeout, exchange).await {
        Err(_) => {
            warn!("tools: upstream timeout, service={}", target.name);
            guard.finish(true);
            ctx.error_response(StatusCode::GATEWAY_TIMEOUT, "gateway timeout")
        }
        Ok(Err(e)) => {
            warn!("tools: upstream error, service={}, error={}", target.name, e);
            guard.finish(true);
            ctx.error_response(StatusCode::BAD_GATEWAY, "bad gateway")
        }
        Ok(Ok((resp_parts, bytes))) => {
            let status = resp_parts.status;
            guard.finish(status.as_u16() >= 400);
            ctx.finalize(status.as_u16());
            relay_response(status, &resp_parts.headers, bytes)
        }
    }
}

fn relay_response(
    status: StatusCode,
    headers: &http::HeaderMap,
    bytes: Bytes,
) -> Response<BoxBody> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder
        .body(full_body(bytes))
        .unwrap_or_else(|_| Response::new(full_body("")))
}
