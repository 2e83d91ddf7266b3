use crate::balancer::ModelStore;
use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::proxy::context::BoxBody;
use crate::tools::ToolMonitor;
use anyhow::Result;
use arc_swap::ArcSwap;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;

/// A rustls `ServerCertVerifier` that accepts any certificate without
/// validation. Used when `tls_verify` is off, the common case for internal
/// fleets where encryption is wanted but upstream identity verification is
/// not.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Shared gateway state, cheaply cloneable.
///
/// The config snapshot is immutable after startup; the model store and tool
/// monitor are the only mutable pieces. Handlers receive this by value, and
/// tests construct the store and monitor directly.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub metrics: Metrics,
    pub models: ModelStore,
    pub tools: ToolMonitor,
    /// Pooled data-plane client for model and tool upstreams
    /// (http + https, ALPN h2).
    pub upstream_client: Client<HttpsConnector<HttpConnector>, BoxBody>,
    /// Control-plane client: health probes and external passthrough reads.
    pub control_client: reqwest::Client,
}

impl GatewayState {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let metrics = Metrics::install();

        let models = ModelStore::new();
        models.initialize(&config);

        let tools = ToolMonitor::new();
        tools.initialize(&config);

        let upstream_client = build_upstream_client(&config);
        let control_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        tracing::info!(
            "state: initialized, models={}, tools={}",
            models.model_count(),
            tools.service_count()
        );

        Ok(Self {
            config: Arc::new(ArcSwap::new(Arc::new(config))),
            metrics,
            models,
            tools,
            upstream_client,
            control_client,
        })
    }
}

/// Build the pooled hyper client used for all upstream traffic.
///
/// Plain `http://` goes through the inner `HttpConnector`; `https://` is
/// terminated with rustls (ring backend), with ALPN-negotiated HTTP/2. When
/// `tls_verify` is off, certificate validation is skipped.
fn build_upstream_client(config: &GatewayConfig) -> Client<HttpsConnector<HttpConnector>, BoxBody> {
    let pool_idle = Duration::from_secs(config.proxy.pool_idle_timeout_secs);

    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(pool_idle));
    http.set_connect_timeout(Some(Duration::from_secs_f64(config.proxy.connect_timeout_secs)));
    http.enforce_http(false);

    let https = if config.proxy.tls_verify {
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http)
    } else {
        let tls_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();

        hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http)
    };

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(pool_idle)
        .pool_max_idle_per_host(config.proxy.pool_max_idle_per_host)
        .build(https)
}
