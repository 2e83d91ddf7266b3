use crate::balancer::ModelStore;
use crate::proxy::context::BodyError;
use crate::proxy::tokens::TokenScanner;
use bytes::Bytes;
use hyper::body::{Body, Frame};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

/// Commits the outcome of a proxied model request exactly once.
///
/// Every path out of the proxy (normal completion, upstream failure,
/// timeout, client cancellation) must decrement the instance's active
/// counter and feed the weight controller. Dropping the guard without an
/// explicit `finish` commits with the configured cancellation verdict, so
/// the epilogue runs even when the handler future is dropped mid-flight.
pub struct CommitGuard {
    store: ModelStore,
    model: String,
    instance: String,
    start: Instant,
    cancel_is_error: bool,
    committed: bool,
}

impl CommitGuard {
    pub fn new(store: ModelStore, model: String, instance: String, cancel_is_error: bool) -> Self {
        Self {
            store,
            model,
            instance,
            start: Instant::now(),
            cancel_is_error,
            committed: false,
        }
    }

    pub fn finish(mut self, is_error: bool, token_count: u64) {
        self.commit(is_error, token_count);
    }

    fn commit(&mut self, is_error: bool, token_count: u64) {
        if self.committed {
            return;
        }
        self.committed = true;

        // Milliseconds, rounded up to two decimals.
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        let response_time_ms = (elapsed_ms * 100.0).ceil() / 100.0;

        self.store
            .commit(&self.model, &self.instance, response_time_ms, is_error, token_count);

        metrics::counter!(
            "gateway_model_requests_total",
            "model" => self.model.clone(),
            "instance" => self.instance.clone(),
            "result" => if is_error { "error" } else { "success" },
        )
        .increment(1);
        if token_count > 0 {
            metrics::counter!(
                "gateway_model_tokens_total",
                "model" => self.model.clone(),
                "instance" => self.instance.clone(),
            )
            .increment(token_count);
        }
        metrics::histogram!(
            "gateway_model_upstream_duration_seconds",
            "model" => self.model.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}

impl Drop for CommitGuard {
    fn drop(&mut self) {
        let is_error = self.cancel_is_error;
        self.commit(is_error, 0);
    }
}

/// Response body that forwards upstream bytes downstream unchanged while a
/// line parser extracts token usage on the side.
///
/// Pull-pull: the downstream consumer drives upstream reads, so at most one
/// chunk is outstanding and byte order is preserved by construction. The
/// stream outcome is committed on EOF, on upstream error, and (via `Drop`)
/// when the downstream disconnects early.
pub struct MeteredBody<B> {
    upstream: B,
    scanner: TokenScanner,
    guard: Option<CommitGuard>,
    failed: bool,
}

impl<B> MeteredBody<B> {
    pub fn new(upstream: B, guard: CommitGuard) -> Self {
        Self {
            upstream,
            scanner: TokenScanner::new(),
            guard: Some(guard),
            failed: false,
        }
    }

    fn complete(&mut self) {
        if let Some(guard) = self.guard.take() {
            let tokens = self.scanner.finish();
            guard.finish(self.failed, tokens);
        }
    }
}

impl<B> Body for MeteredBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BodyError>,
{
    type Data = Bytes;
    type Error = BodyError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.upstream).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    if this.scanner.push(data).is_err() {
                        this.failed = true;
                        this.complete();
                        return Poll::Ready(Some(Err(
                            "stream line exceeded the decode buffer limit".into(),
                        )));
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.failed = true;
                this.complete();
                Poll::Ready(Some(Err(e.into())))
            }
            Poll::Ready(None) => {
                this.complete();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<B> Drop for MeteredBody<B> {
    fn drop(&mut self) {
        self.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, InstanceConfig};
    use futures_util::stream;
    use http_body_util::{BodyExt, StreamBody};

    fn store_with_one(name: &str) -> ModelStore {
        let mut cfg = GatewayConfig::default();
        cfg.models.insert(
            "m".into(),
            vec![InstanceConfig {
                name: name.into(),
                url: "http://10.0.0.1:11434".into(),
                initial_weight: 20,
                load_threshold: 100.0,
            }],
        );
        let store = ModelStore::new();
        store.initialize(&cfg);
        store
    }

    fn chunked_body(
        chunks: Vec<Result<&'static str, BodyError>>,
    ) -> impl Body<Data = Bytes, Error = BodyError> + Unpin {
        StreamBody::new(stream::iter(chunks.into_iter().map(|r| {
            r.map(|s| Frame::data(Bytes::from_static(s.as_bytes())))
        })))
    }

    fn guard_for(store: &ModelStore) -> CommitGuard {
        let selection = store.select("m").unwrap();
        CommitGuard::new(store.clone(), "m".into(), selection.instance, true)
    }

    #[tokio::test]
    async fn test_bytes_pass_through_unchanged() {
        let store = store_with_one("A");
        let chunks = vec![
            Ok("data: {\"id\":\"x\"}\n"),
            Ok("data: {\"prompt_eval_count\":7,\"eval_count\":5}\n"),
            Ok("data: {\"usage\":{\"total_tokens\":99}}\n"),
        ];
        let expected: String = [
            "data: {\"id\":\"x\"}\n",
            "data: {\"prompt_eval_count\":7,\"eval_count\":5}\n",
            "data: {\"usage\":{\"total_tokens\":99}}\n",
        ]
        .concat();

        let body = MeteredBody::new(chunked_body(chunks), guard_for(&store));
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from(expected));

        let nodes = store.snapshot_nodes();
        let node = &nodes["m"][0];
        assert_eq!(node.token_total, 99);
        assert_eq!(node.status, crate::balancer::InstanceStatus::Healthy);
        assert!(node.last_response_time_ms > 0.0);
    }

    #[tokio::test]
    async fn test_zero_total_commits_zero_without_error() {
        let store = store_with_one("A");
        let chunks = vec![Ok("data: {\"usage\":{\"total_tokens\":0}}\n")];
        let body = MeteredBody::new(chunked_body(chunks), guard_for(&store));
        body.collect().await.unwrap();

        let map_nodes = store.snapshot_nodes();
        let node = &map_nodes["m"][0];
        assert_eq!(node.token_total, 0);
        let global = store.snapshot_global();
        assert_eq!(global["m"].healthy, 1);
    }

    #[tokio::test]
    async fn test_upstream_error_commits_error() {
        let store = store_with_one("A");
        let chunks = vec![
            Ok("data: {\"prompt_eval_count\":3,\"eval_count\":4}\n"),
            Err(BodyError::from("connection reset")),
        ];
        let body = MeteredBody::new(chunked_body(chunks), guard_for(&store));
        assert!(body.collect().await.is_err());

        let map = store.snapshot_nodes();
        let node = &map["m"][0];
        // The partial count still lands; the failure decays the weight.
        assert_eq!(node.token_total, 7);
        assert!((node.effective_weight - 16.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_downstream_drop_still_commits() {
        let store = store_with_one("A");
        let chunks = vec![Ok("data: {\"prompt_eval_count\":1,\"eval_count\":1}\n")];
        let body = MeteredBody::new(chunked_body(chunks), guard_for(&store));
        drop(body);

        let map = store.snapshot_nodes();
        let node = &map["m"][0];
        // Client cancellation is not an upstream failure.
        assert!((node.effective_weight - 21.0).abs() < 1e-9);
        let global = store.snapshot_global();
        assert_eq!(global["m"].healthy, 1);
    }

    #[tokio::test]
    async fn test_guard_drop_commits_once() {
        let store = store_with_one("A");
        {
            let _guard = guard_for(&store);
            // Dropped without finish: cancellation verdict (error).
        }
        let map = store.snapshot_nodes();
        let node = &map["m"][0];
        assert!((node.effective_weight - 16.0).abs() < 1e-9);

        let global = store.snapshot_global();
        // Exactly one request was recorded.
        assert!((global["m"].throughput - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_line_overflow_is_stream_error() {
        let store = store_with_one("A");
        let big: &'static str = Box::leak(
            format!("data: {}", "x".repeat(crate::proxy::tokens::MAX_LINE_BYTES + 8)).into_boxed_str(),
        );
        let body = MeteredBody::new(chunked_body(vec![Ok(big)]), guard_for(&store));
        assert!(body.collect().await.is_err());

        let map = store.snapshot_nodes();
        assert!((map["m"][0].effective_weight - 16.0).abs() < 1e-9);
    }
}
