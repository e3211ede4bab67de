use crate::{
    admin::Metrics,
    config::ProxyStartupConfig,
    director::Director,
    error::{ProxyError, TransportError},
    hooks::{HookSet, InterceptHooks},
    tls::create_tls_acceptor,
    transport::{full_body, incoming_body, BoxError, InterceptingTransport, ProxyBody, Transport},
    Result,
};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Dual-listener transparent proxy.
///
/// Both listeners share one transport and one hook set, so the response
/// hook runs the same way whichever listener a connection arrived on.
pub struct InterceptingProxy {
    http_listener: TcpListener,
    https_listener: TcpListener,
    acceptor: TlsAcceptor,
    shared: Shared,
}

/// State read by every exchange task.
#[derive(Clone)]
struct Shared {
    transport: Arc<InterceptingTransport>,
    hooks: Arc<HookSet>,
    metrics: Arc<Metrics>,
    exchange_timeout: Option<Duration>,
}

impl InterceptingProxy {
    /// Wrap two already bound listeners. Hooks default to pass-through.
    pub fn new(
        http_listener: TcpListener,
        https_listener: TcpListener,
        acceptor: TlsAcceptor,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let metrics = Arc::new(Metrics::default());
        Self {
            http_listener,
            https_listener,
            acceptor,
            shared: Shared {
                transport: Arc::new(InterceptingTransport::new(transport, metrics.clone())),
                hooks: Arc::new(HookSet::default()),
                metrics,
                exchange_timeout: None,
            },
        }
    }

    /// Bind both listeners and load the certificate pair named in `config`.
    pub async fn bind(config: &ProxyStartupConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let acceptor = create_tls_acceptor(&config.tls)?;
        let http_listener =
            bind_listener(SocketAddr::new(config.listen_address, config.http_port)).await?;
        let https_listener =
            bind_listener(SocketAddr::new(config.listen_address, config.https_port)).await?;

        let mut proxy = Self::new(http_listener, https_listener, acceptor, transport);
        proxy.shared.exchange_timeout = config.exchange_timeout();
        Ok(proxy)
    }

    pub fn with_hooks(self, hooks: Arc<dyn InterceptHooks>) -> Self {
        self.shared.hooks.replace(hooks);
        self
    }

    pub fn with_exchange_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.shared.exchange_timeout = timeout;
        self
    }

    /// Handle for swapping hooks while the proxy runs.
    pub fn hooks(&self) -> Arc<HookSet> {
        self.shared.hooks.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.shared.metrics.clone()
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        Ok(self.http_listener.local_addr()?)
    }

    pub fn https_addr(&self) -> Result<SocketAddr> {
        Ok(self.https_listener.local_addr()?)
    }

    /// Accept on both listeners until `shutdown` flips to `true` or its
    /// sender is dropped. In-flight connections are left to finish.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let http_addr = self.http_addr()?;
        let https_addr = self.https_addr()?;
        info!(http = %http_addr, https = %https_addr, "Intercepting proxy listening");

        let http = Endpoint {
            director: Director::http(self.shared.metrics.clone()).with_listener(http_addr),
            acceptor: None,
            shared: self.shared.clone(),
        };
        let https = Endpoint {
            director: Director::https(self.shared.metrics.clone()).with_listener(https_addr),
            acceptor: Some(self.acceptor),
            shared: self.shared,
        };

        tokio::join!(
            http.accept_loop(self.http_listener, shutdown.clone()),
            https.accept_loop(self.https_listener, shutdown),
        );

        info!("Intercepting proxy stopped");
        Ok(())
    }
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ProxyError::Network(format!("Failed to bind {}: {}", addr, e)))
}

/// One listener front-end: its scheme's director plus the shared state.
#[derive(Clone)]
struct Endpoint {
    director: Director,
    acceptor: Option<TlsAcceptor>,
    shared: Shared,
}

impl Endpoint {
    async fn accept_loop(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow() {
            return;
        }
        let mut failures = 0u32;
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            match accepted {
                Ok((stream, peer)) => {
                    failures = 0;
                    self.spawn_connection(stream, peer);
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = accept_backoff(failures);
                    warn!(
                        scheme = %self.director.scheme(),
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to accept connection"
                    );
                    // Accept errors such as EMFILE repeat until load drops.
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let endpoint = self.clone();
        tokio::spawn(async move {
            let metrics = endpoint.shared.metrics.clone();
            metrics.active_connections.fetch_add(1, Ordering::Relaxed);

            let result = match endpoint.acceptor.clone() {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls) => endpoint.serve(tls).await,
                    Err(e) => {
                        debug!(%peer, error = %e, "TLS handshake failed");
                        Ok(())
                    }
                },
                None => endpoint.serve(stream).await,
            };
            if let Err(e) = result {
                debug!(%peer, error = %e, "Connection closed with error");
            }

            metrics.active_connections.fetch_sub(1, Ordering::Relaxed);
        });
    }

    async fn serve<I>(&self, io: I) -> std::result::Result<(), BoxError>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let endpoint = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let endpoint = endpoint.clone();
            async move { Ok::<_, Infallible>(endpoint.handle(req.map(incoming_body)).await) }
        });

        let builder = auto::Builder::new(TokioExecutor::new());
        builder.serve_connection(TokioIo::new(io), service).await
    }

    /// Run one exchange and turn any failure into a client-facing response.
    async fn handle(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let metrics = &self.shared.metrics;
        metrics.total_requests.fetch_add(1, Ordering::Relaxed);

        // One snapshot per exchange: both legs see the same hooks.
        let hooks = self.shared.hooks.snapshot();
        let exchange = self.exchange(req, hooks.as_ref());

        let result = match self.shared.exchange_timeout {
            Some(limit) => match tokio::time::timeout(limit, exchange).await {
                Ok(result) => result,
                Err(_) => {
                    metrics.transport_errors.fetch_add(1, Ordering::Relaxed);
                    Err(TransportError::Timeout.into())
                }
            },
            None => exchange.await,
        };

        match result {
            Ok(res) => {
                metrics.responses_relayed.fetch_add(1, Ordering::Relaxed);
                res
            }
            Err(e) => {
                warn!(scheme = %self.director.scheme(), error = %e, "Exchange failed");
                error_response(&e)
            }
        }
    }

    async fn exchange(
        &self,
        mut req: Request<ProxyBody>,
        hooks: &dyn InterceptHooks,
    ) -> Result<Response<ProxyBody>> {
        self.director.direct(&mut req, hooks).await?;
        Ok(self.shared.transport.round_trip(req, hooks).await?)
    }
}

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause after the `failures`-th consecutive accept error.
fn accept_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_MIN
        .saturating_mul(1 << shift)
        .min(ACCEPT_BACKOFF_MAX)
}

fn status_for(err: &ProxyError) -> StatusCode {
    match err {
        ProxyError::InvalidHost(_) => StatusCode::BAD_REQUEST,
        ProxyError::LoopDetected(_) => StatusCode::LOOP_DETECTED,
        ProxyError::Transport(TransportError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn error_response(err: &ProxyError) -> Response<ProxyBody> {
    let mut res = Response::new(full_body(err.to_string()));
    *res.status_mut() = status_for(err);
    res.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    res
}
