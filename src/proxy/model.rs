use crate::error::GatewayError;
use crate::proxy::context::{full_body, BodyError, BoxBody, RequestContext};
use crate::proxy::stream::{CommitGuard, MeteredBody};
use crate::proxy::tokens;
use crate::server::GatewayState;
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderName, StatusCode};
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::time::Duration;
use tracing::{debug, warn};

/// Proxy a request to one instance of `model`, chosen by the weighted
/// selector. Streaming is auto-detected from a `"stream": true` field in the
/// request body; streamed responses are teed through the token meter.
pub async fn handle_model_proxy(
    req: Request<Incoming>,
    state: &GatewayState,
    model: &str,
    subpath: &str,
    ctx: &mut RequestContext,
) -> Response<BoxBody> {
    let cfg = state.config.load_full();
    let (parts, body) = req.into_parts();

    // Buffer the body to sniff `"stream": true`, unless the declared length
    // already exceeds the inspection cap; those forward as unary with the
    // body streamed straight through.
    let declared_len = parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let (body_bytes, passthrough_body): (Option<Bytes>, Option<BoxBody>) =
        if declared_len.is_some_and(|len| len > cfg.proxy.max_inspect_body_bytes) {
            debug!(
                "proxy: model request body too large to inspect, len={:?}, model={}",
                declared_len, model
            );
            (None, Some(body.map_err(BodyError::from).boxed()))
        } else {
            let limited = Limited::new(body, cfg.proxy.max_inspect_body_bytes as usize);
            match limited.collect().await {
                Ok(collected) => (Some(collected.to_bytes()), None),
                Err(e) if e.is::<http_body_util::LengthLimitError>() => {
                    return ctx.error_response(StatusCode::PAYLOAD_TOO_LARGE, "payload too large");
                }
                Err(e) => {
                    warn!("proxy: failed to read request body, model={}, error={}", model, e);
                    return ctx.error_response(StatusCode::BAD_REQUEST, "bad request");
                }
            }
        };

    let wants_stream = body_bytes
        .as_deref()
        .map(detect_stream_flag)
        .unwrap_or(false);

    let selection = match state.models.select(model) {
        Ok(s) => s,
        Err(e) => return ctx.error_response(e.status_code(), &e.to_string()),
    };
    ctx.target = model.to_string();
    ctx.upstream_addr = selection.base_url.clone();

    // From here on the instance's active counter is held; the guard commits
    // on every exit path, including cancellation.
    let guard = CommitGuard::new(
        state.models.clone(),
        model.to_string(),
        selection.instance.clone(),
        true,
    );

    let mut target_url = String::with_capacity(selection.base_url.len() + subpath.len() + 16);
    target_url.push_str(&selection.base_url);
    target_url.push('/');
    target_url.push_str(subpath);
    if let Some(q) = parts.uri.query() {
        target_url.push('?');
        target_url.push_str(q);
    }

    let mut builder = Request::builder().method(parts.method.clone()).uri(&target_url);
    let mut headers = parts.headers.clone();
    headers.remove(HOST);
    headers.remove(CONTENT_LENGTH);
    remove_hop_headers(&mut headers);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }

    let out_body: BoxBody = match (&body_bytes, passthrough_body) {
        (Some(bytes), _) => full_body(bytes.clone()),
        (None, Some(streaming)) => streaming,
        (None, None) => full_body(Bytes::new()),
    };

    let out_req = match builder.body(out_body) {
        Ok(r) => r,
        Err(e) => {
            warn!(
                "proxy: failed to build upstream request, model={}, url={}, error={}",
                model, target_url, e
            );
            guard.finish(true, 0);
            return ctx.error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error");
        }
    };

    let timeout = Duration::from_secs_f64(cfg.proxy.model_timeout_secs);
    if wants_stream {
        stream_upstream(state, out_req, guard, timeout, ctx).await
    } else {
        unary_upstream(state, out_req, guard, timeout, ctx).await
    }
}

/// Unary path: wait for the full response, account tokens from the buffered
/// body, and relay status/headers/body verbatim.
async fn unary_upstream(
    state: &GatewayState,
    out_req: Request<BoxBody>,
    guard: CommitGuard,
    timeout: Duration,
    ctx: &mut RequestContext,
) -> Response<BoxBody> {
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
            warn!("proxy: model upstream timeout, upstream={}", ctx.upstream_addr);
            guard.finish(true, 0);
            let err = GatewayError::UpstreamTimeout;
            ctx.error_response(err.status_code(), &err.to_string())
        }
        Ok(Err(e)) => {
            warn!(
                "proxy: model upstream error, upstream={}, error={}",
                ctx.upstream_addr, e
            );
            guard.finish(true, 0);
            let err = GatewayError::UpstreamTransport(e.to_string());
            ctx.error_response(err.status_code(), "bad gateway")
        }
        Ok(Ok((parts, bytes))) => {
            let token_count = tokens::extract_unary_tokens(&bytes);
            let status = parts.status;
            guard.finish(status.as_u16() >= 400, token_count);
            ctx.finalize(status.as_u16());

            let mut builder = Response::builder().status(status);
            for (name, value) in &parts.headers {
                builder = builder.header(name, value);
            }
            builder
                .body(full_body(bytes))
                .unwrap_or_else(|_| Response::new(full_body("")))
        }
    }
}

/// Streaming path: a non-200 upstream commits an error and is surfaced as-is;
/// a 200 hands the caller a tee that forwards bytes while counting tokens
/// and commits once the stream ends.
async fn stream_upstream(
    state: &GatewayState,
    out_req: Request<BoxBody>,
    guard: CommitGuard,
    timeout: Duration,
    ctx: &mut RequestContext,
) -> Response<BoxBody> {
    let resp = match tokio::time::timeout(timeout, state.upstream_client.request(out_req)).await {
        Err(_) => {
            warn!("proxy: model stream open timeout, upstream={}", ctx.upstream_addr);
            guard.finish(true, 0);
            let err = GatewayError::UpstreamTimeout;
            return ctx.error_response(err.status_code(), &err.to_string());
        }
        Ok(Err(e)) => {
            warn!(
                "proxy: model stream open failed, upstream={}, error={}",
                ctx.upstream_addr, e
            );
            guard.finish(true, 0);
            let err = GatewayError::UpstreamTransport(e.to_string());
            return ctx.error_response(err.status_code(), "bad gateway");
        }
        Ok(Ok(resp)) => resp,
    };

    let (parts, body) = resp.into_parts();

    if parts.status != StatusCode::OK {
        warn!(
            "proxy: model stream rejected upstream, status={}, upstream={}",
            parts.status, ctx.upstream_addr
        );
        guard.finish(true, 0);
        ctx.finalize(parts.status.as_u16());
        let mut builder = Response::builder().status(parts.status);
        for (name, value) in &parts.headers {
            builder = builder.header(name, value);
        }
        return builder
            .body(body.map_err(BodyError::from).boxed())
            .unwrap_or_else(|_| Response::new(full_body("")));
    }

    ctx.finalize(parts.status.as_u16());
    let metered = MeteredBody::new(body, guard);
    let mut builder = Response::builder().status(parts.status);
    for (name, value) in &parts.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(BodyExt::boxed(metered))
        .unwrap_or_else(|_| Response::new(full_body("")))
}

/// A body is a streaming request iff it parses as a JSON object carrying
/// `"stream": true`. Unparseable bodies default to unary.
fn detect_stream_flag(body: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("stream").and_then(serde_json::Value::as_bool))
        .unwrap_or(false)
}

fn remove_hop_headers(headers: &mut http::HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_stream_flag() {
        assert!(detect_stream_flag(br#"{"model":"m","stream":true}"#));
        assert!(!detect_stream_flag(br#"{"model":"m","stream":false}"#));
        assert!(!detect_stream_flag(br#"{"model":"m"}"#));
        assert!(!detect_stream_flag(b"not json"));
        assert!(!detect_stream_flag(br#"{"stream":"true"}"#));
        assert!(!detect_stream_flag(b""));
    }

    #[test]
    fn test_remove_hop_headers() {
        let mut headers = http::HeaderMap::new();
        headers.insert(CONNECTION, "keep-alive".parse().unwrap());
        headers.insert("te", "trailers".parse().unwrap());
        headers.insert("x-custom", "kept".parse().unwrap());
        remove_hop_headers(&mut headers);
        assert!(!headers.contains_key(CONNECTION));
        assert!(!headers.contains_key("te"));
        assert!(headers.contains_key("x-custom"));
    }
}
