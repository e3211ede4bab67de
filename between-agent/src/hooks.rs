//! Hooks installed by the `between` binary.

use async_trait::async_trait;
use between_core::hooks::content_length;
use between_core::transport::empty_body;
use between_core::{replace_body, HookError, InterceptHooks, ProxyBody};
use http_body_util::BodyExt;
use hyper::header::{HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Logs both legs and asks origins for uncompressed bodies, so response
/// hooks can read payloads without decoding them first.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityEncodingHooks;

#[async_trait]
impl InterceptHooks for IdentityEncodingHooks {
    async fn on_request(&self, req: &mut Request<ProxyBody>) -> Result<(), HookError> {
        info!("Request: {} {}", req.method(), req.uri());
        req.headers_mut()
            .insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
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

/// Saves image payloads to a directory and re-serves the same bytes.
pub struct CaptureHooks {
    dir: PathBuf,
    inner: IdentityEncodingHooks,
}

impl CaptureHooks {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            inner: IdentityEncodingHooks,
        }
    }
}

/// File extension for a capturable content type.
fn image_extension(content_type: &str) -> Option<&'static str> {
    let essence = content_type.split(';').next().unwrap_or("").trim();
    match essence.to_ascii_lowercase().as_str() {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        _ => None,
    }
}

#[async_trait]
impl InterceptHooks for CaptureHooks {
    async fn on_request(&self, req: &mut Request<ProxyBody>) -> Result<(), HookError> {
        self.inner.on_request(req).await
    }

    async fn on_response(&self, res: &mut Response<ProxyBody>) -> Result<(), HookError> {
        self.inner.on_response(res).await?;

        if res.status() != StatusCode::OK {
            return Ok(());
        }
        let gzipped = res
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));
        if gzipped {
            return Ok(());
        }
        let Some(ext) = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(image_extension)
        else {
            return Ok(());
        };

        let body = std::mem::replace(res.body_mut(), empty_body());
        let data = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => return Err(HookError::BodyLost(e.to_string())),
        };
        replace_body(res, data.clone());

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| HookError::Message(e.to_string()))?
            .as_nanos();
        let path = self.dir.join(format!("{}.{}", nanos, ext));
        tokio::fs::write(&path, &data).await?;
        debug!("Captured {} bytes to {}", data.len(), path.display());
        Ok(())
    }
}
