//! Per-scheme request director.
//!
//! Redirected requests arrive in origin form (`GET /path`), addressed to the
//! proxy. The director restores the absolute destination from the `Host`
//! header and the listener's scheme, then hands the request to the request
//! hook.

use crate::admin::Metrics;
use crate::error::ProxyError;
use crate::hooks::InterceptHooks;
use crate::transport::ProxyBody;
use hyper::header::HOST;
use hyper::http::uri::{Authority, PathAndQuery, Scheme};
use hyper::{Request, Uri};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct Director {
    scheme: Scheme,
    metrics: Arc<Metrics>,
    listener: Option<SocketAddr>,
}

impl Director {
    pub fn new(scheme: Scheme, metrics: Arc<Metrics>) -> Self {
        Self {
            scheme,
            metrics,
            listener: None,
        }
    }

    /// Reject requests whose destination is this listener.
    pub fn with_listener(mut self, addr: SocketAddr) -> Self {
        self.listener = Some(addr);
        self
    }

    pub fn http(metrics: Arc<Metrics>) -> Self {
        Self::new(Scheme::HTTP, metrics)
    }

    pub fn https(metrics: Arc<Metrics>) -> Self {
        Self::new(Scheme::HTTPS, metrics)
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    /// Point `req` at its real origin. Only the URI's scheme and authority
    /// change; method, path, query, headers and body are left untouched.
    pub fn rewrite<B>(&self, req: &mut Request<B>) -> Result<(), ProxyError> {
        let authority = original_host(req)?;
        if let Some(local) = self.listener {
            if targets_listener(&authority, &self.scheme, local) {
                return Err(ProxyError::LoopDetected(authority.to_string()));
            }
        }
        let path_and_query = req
            .uri()
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        let uri = Uri::builder()
            .scheme(self.scheme.clone())
            .authority(authority)
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| ProxyError::InvalidHost(e.to_string()))?;

        *req.uri_mut() = uri;
        Ok(())
    }

    /// Rewrite the request, then run the request hook. A hook error is
    /// logged and does not stop the exchange.
    pub async fn direct(
        &self,
        req: &mut Request<ProxyBody>,
        hooks: &dyn InterceptHooks,
    ) -> Result<(), ProxyError> {
        self.rewrite(req)?;

        if let Err(e) = hooks.on_request(req).await {
            self.metrics.hook_errors.fetch_add(1, Ordering::Relaxed);
            warn!(method = %req.method(), uri = %req.uri(), error = %e, "Request hook failed");
        }
        Ok(())
    }
}

/// The destination the client asked for: the `Host` header, or the URI
/// authority when the request carries none (HTTP/2 `:authority`).
fn original_host<B>(req: &Request<B>) -> Result<Authority, ProxyError> {
    match req.headers().get(HOST) {
        Some(value) => {
            let host = value
                .to_str()
                .map_err(|_| ProxyError::InvalidHost("non-ASCII Host header".into()))?;
            host.parse::<Authority>()
                .map_err(|e| ProxyError::InvalidHost(format!("{}: {}", host, e)))
        }
        None => req
            .uri()
            .authority()
            .cloned()
            .ok_or_else(|| ProxyError::InvalidHost("no Host header".into())),
    }
}

/// Whether `authority` resolves to the listener bound at `local`.
fn targets_listener(authority: &Authority, scheme: &Scheme, local: SocketAddr) -> bool {
    let default_port = if *scheme == Scheme::HTTPS { 443 } else { 80 };
    if authority.port_u16().unwrap_or(default_port) != local.port() {
        return false;
    }

    let host = authority.host().trim_start_matches('[').trim_end_matches(']');
    let bound = local.ip();
    match host.parse::<IpAddr>() {
        Ok(ip) => {
            ip == bound
                || (bound.is_unspecified() && (ip.is_loopback() || ip.is_unspecified()))
                || (ip.is_unspecified() && bound.is_loopback())
        }
        Err(_) => {
            host.eq_ignore_ascii_case("localhost") && (bound.is_loopback() || bound.is_unspecified())
        }
    }
}
