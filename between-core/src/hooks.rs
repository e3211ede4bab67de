//! Hook contract for observing and mutating in-flight exchanges.
//!
//! Hooks are advisory: an error returned by either hook is logged and
//! counted, but never cancels the exchange or changes what is relayed.
//! The one exception is [`HookError::BodyLost`], returned when a response
//! hook consumed the body and cannot restore it; that exchange fails with
//! 502 rather than relaying an empty body.

use crate::error::HookError;
use crate::transport::{full_body, ProxyBody};
use async_trait::async_trait;
use bytes::Bytes;
use hyper::header::{HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::{Method, Request, Response, Uri};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Request line of the exchange a response belongs to.
///
/// Inserted into the response extensions before `on_response` runs.
#[derive(Debug, Clone)]
pub struct ExchangeInfo {
    pub method: Method,
    pub uri: Uri,
}

/// Caller-supplied callbacks, one per traffic direction.
///
/// `on_request` runs after the request has been rewritten to its real
/// origin and before the network round trip. `on_response` runs only after
/// a successful round trip and before the response is relayed.
#[async_trait]
pub trait InterceptHooks: Send + Sync {
    async fn on_request(&self, req: &mut Request<ProxyBody>) -> Result<(), HookError> {
        debug!("Request: {} {}", req.method(), req.uri());
        Ok(())
    }

    async fn on_response(&self, res: &mut Response<ProxyBody>) -> Result<(), HookError> {
        debug!("Response: {}", res.status());
        Ok(())
    }
}

/// Default hooks: log each leg and change nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughHooks;

#[async_trait]
impl InterceptHooks for PassthroughHooks {
    async fn on_request(&self, req: &mut Request<ProxyBody>) -> Result<(), HookError> {
        info!("Request: {} {}", req.method(), req.uri());
        Ok(())
    }

    async fn on_response(&self, res: &mut Response<ProxyBody>) -> Result<(), HookError> {
        info!(
            "Response: {} {}",
            res.status(),
            content_length(res).map_or_else(|| "-".to_string(), |n| n.to_string())
        );
        Ok(())
    }
}

/// The hooks currently installed on a proxy.
///
/// Each exchange takes one snapshot so both of its legs see the same hooks,
/// even if `replace` runs concurrently.
pub struct HookSet {
    current: RwLock<Arc<dyn InterceptHooks>>,
}

impl HookSet {
    pub fn new(hooks: Arc<dyn InterceptHooks>) -> Self {
        Self {
            current: RwLock::new(hooks),
        }
    }

    pub fn snapshot(&self) -> Arc<dyn InterceptHooks> {
        let guard = self
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Install new hooks for exchanges that start after this call.
    pub fn replace(&self, hooks: Arc<dyn InterceptHooks>) {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = hooks;
    }
}

impl Default for HookSet {
    fn default() -> Self {
        Self::new(Arc::new(PassthroughHooks))
    }
}

/// Replace the response body, keeping `Content-Length` in step with it.
pub fn replace_body(res: &mut Response<ProxyBody>, data: impl Into<Bytes>) {
    let data = data.into();
    let headers = res.headers_mut();
    headers.remove(TRANSFER_ENCODING);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(data.len()));
    *res.body_mut() = full_body(data);
}

/// Declared length of a response, from its header.
pub fn content_length<B>(res: &Response<B>) -> Option<u64> {
    res.headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}
