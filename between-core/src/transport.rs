//! Network transport for rewritten requests.

use crate::admin::Metrics;
use crate::error::{HookError, ProxyError, TransportError};
use crate::hooks::{ExchangeInfo, InterceptHooks};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, CONNECTION};
use hyper::{Request, Response};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as LegacyClient;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::warn;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type used on both legs of an exchange.
pub type ProxyBody = BoxBody<Bytes, BoxError>;

// RFC 7230 Section 6.1: Hop-by-hop headers must not be forwarded by proxies.
static HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn incoming_body(body: Incoming) -> ProxyBody {
    body.map_err(|e| Box::new(e) as BoxError).boxed()
}

/// Executes the network round trip for one rewritten request.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(
        &self,
        req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, TransportError>;
}

/// Default transport: pooled hyper client, plain HTTP or HTTPS against
/// the native root store.
#[derive(Clone)]
pub struct HyperTransport {
    client: LegacyClient<hyper_rustls::HttpsConnector<HttpConnector>, ProxyBody>,
}

impl HyperTransport {
    pub fn new() -> Result<Self, ProxyError> {
        let https = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| ProxyError::Tls(format!("failed to load native roots: {}", e)))?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        Ok(Self::from_connector(https))
    }

    /// Use a caller-built client config, e.g. with a private root store.
    pub fn with_tls_config(config: rustls::ClientConfig) -> Self {
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(config)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        Self::from_connector(https)
    }

    fn from_connector(https: hyper_rustls::HttpsConnector<HttpConnector>) -> Self {
        let client = LegacyClient::builder(TokioExecutor::new()).build(https);
        Self { client }
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn round_trip(
        &self,
        mut req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, TransportError> {
        strip_hop_by_hop(req.headers_mut());

        let res = self
            .client
            .request(req)
            .await
            .map_err(|e| TransportError::Upstream(error_chain(&e)))?;

        let mut res = res.map(incoming_body);
        strip_hop_by_hop(res.headers_mut());
        Ok(res)
    }
}

/// Shared by both listeners: the single place where the response hook runs.
pub struct InterceptingTransport {
    inner: Arc<dyn Transport>,
    metrics: Arc<Metrics>,
}

impl InterceptingTransport {
    pub fn new(inner: Arc<dyn Transport>, metrics: Arc<Metrics>) -> Self {
        Self { inner, metrics }
    }

    /// Run the round trip, then `hooks.on_response` if it succeeded.
    ///
    /// A transport failure is returned as-is and the response hook is
    /// skipped. A hook failure is logged and the response is relayed,
    /// unless the hook lost the body, which fails the exchange.
    pub async fn round_trip(
        &self,
        req: Request<ProxyBody>,
        hooks: &dyn InterceptHooks,
    ) -> Result<Response<ProxyBody>, TransportError> {
        let info = ExchangeInfo {
            method: req.method().clone(),
            uri: req.uri().clone(),
        };

        let mut res = match self.inner.round_trip(req).await {
            Ok(res) => res,
            Err(e) => {
                self.metrics.transport_errors.fetch_add(1, Ordering::Relaxed);
                warn!(method = %info.method, uri = %info.uri, error = %e, "Round trip failed");
                return Err(e);
            }
        };

        res.extensions_mut().insert(info.clone());
        match hooks.on_response(&mut res).await {
            Ok(()) => {}
            Err(HookError::BodyLost(reason)) => {
                self.metrics.hook_errors.fetch_add(1, Ordering::Relaxed);
                warn!(method = %info.method, uri = %info.uri, %reason, "Response body lost in hook");
                return Err(TransportError::Upstream(format!(
                    "response body unavailable: {}",
                    reason
                )));
            }
            Err(e) => {
                self.metrics.hook_errors.fetch_add(1, Ordering::Relaxed);
                warn!(method = %info.method, uri = %info.uri, error = %e, "Response hook failed");
            }
        }
        Ok(res)
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
