//! Between Agent
//!
//! Runs the intercepting proxy on a host: installs the packet-filter
//! redirect, serves both listeners, and restores connectivity on shutdown.

use between_core::admin::start_admin_server;
use between_core::{
    FirewallController, FirewallError, FirewallState, HyperTransport, InterceptHooks,
    InterceptingProxy, ProxyError, RedirectGuard, Transport,
};
use clap::Parser;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

pub mod config;
pub mod hooks;
pub mod logging;

pub use config::{load_agent_config, AgentConfig, ConfigError};
pub use hooks::{CaptureHooks, IdentityEncodingHooks};

/// Startup failed.
pub const EXIT_FAILURE: u8 = 1;
/// Interrupted by a signal; the redirect has been released.
pub const EXIT_INTERRUPTED: u8 = 3;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "between", author, version, about, long_about = None)]
pub struct Args {
    /// Interface whose outbound HTTP/HTTPS traffic is intercepted [default: tap0]
    #[arg(long)]
    pub interface: Option<String>,

    /// Port of the plaintext listener [default: 8000]
    #[arg(long)]
    pub http_port: Option<u16>,

    /// Port of the TLS listener [default: 8001]
    #[arg(long)]
    pub https_port: Option<u16>,

    /// Address the listeners bind to and traffic is redirected to [default: 127.0.0.1]
    #[arg(long)]
    pub proxy_address: Option<IpAddr>,

    /// Owner of the proxy process, exempt from redirection [default: root]
    #[arg(long)]
    pub proxy_user: Option<String>,

    /// Certificate presented by the TLS listener (PEM) [default: ./sslKeys/server.crt]
    #[arg(long)]
    pub cert_file: Option<PathBuf>,

    /// Private key for the certificate (PEM) [default: ./sslKeys/server.key]
    #[arg(long)]
    pub key_file: Option<PathBuf>,

    /// Port to expose the Admin API (health/metrics)
    #[arg(long)]
    pub admin_port: Option<u16>,

    /// Deadline for each exchange, in seconds
    #[arg(long)]
    pub exchange_timeout_secs: Option<u64>,

    /// Save image responses to this directory
    #[arg(long)]
    pub capture_dir: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,

    /// Serve without installing the packet-filter redirect
    #[arg(long)]
    pub no_redirect: bool,

    /// Print the redirect ruleset and exit
    #[arg(long)]
    pub print_rules: bool,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Firewall(#[from] FirewallError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("Logging error: {0}")]
    Logging(String),

    #[error("Proxy task failed: {0}")]
    Task(String),
}

/// A configured agent that has not touched the host yet.
pub struct Agent {
    config: AgentConfig,
    firewall: Arc<FirewallController>,
    transport: Option<Arc<dyn Transport>>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            firewall: Arc::new(FirewallController::new()),
            transport: None,
        }
    }

    pub fn with_firewall(mut self, firewall: Arc<FirewallController>) -> Self {
        self.firewall = firewall;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    fn hooks(&self) -> Arc<dyn InterceptHooks> {
        match &self.config.capture_dir {
            Some(dir) => Arc::new(CaptureHooks::new(dir)),
            None => Arc::new(IdentityEncodingHooks),
        }
    }

    /// Verify the host, install and enable the redirect, then bind the
    /// listeners. Any failure after the redirect is enabled releases it.
    pub async fn start(self) -> Result<RunningAgent, AgentError> {
        info!("Starting between...");
        info!(
            "  Listen: {} (http {}, https {})",
            self.config.proxy.listen_address,
            self.config.proxy.http_port,
            self.config.proxy.https_port
        );

        let guard = if self.config.redirect_enabled {
            self.firewall.check_compatibility()?;
            self.firewall.configure(&self.config.redirect)?;
            Some(self.firewall.activate()?)
        } else {
            warn!("Packet-filter redirect disabled; only traffic sent to the listeners is intercepted");
            None
        };

        let hooks = self.hooks();
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::new()?),
        };
        let proxy = InterceptingProxy::bind(&self.config.proxy, transport)
            .await?
            .with_hooks(hooks);

        Ok(RunningAgent {
            proxy,
            guard,
            admin_addr: self
                .config
                .proxy
                .admin_port
                .map(|port| SocketAddr::new(self.config.proxy.listen_address, port)),
        })
    }
}

/// An agent with the redirect active and its listeners bound.
pub struct RunningAgent {
    proxy: InterceptingProxy,
    guard: Option<RedirectGuard>,
    admin_addr: Option<SocketAddr>,
}

impl RunningAgent {
    pub fn http_addr(&self) -> Result<SocketAddr, AgentError> {
        Ok(self.proxy.http_addr()?)
    }

    pub fn https_addr(&self) -> Result<SocketAddr, AgentError> {
        Ok(self.proxy.https_addr()?)
    }

    pub fn firewall_state(&self) -> Option<FirewallState> {
        self.guard.as_ref().map(|g| g.controller().state())
    }

    /// Serve until `shutdown` resolves, then release the redirect.
    ///
    /// Returns `Ok` only for a requested shutdown. A failed release is
    /// logged and does not turn the shutdown into an error.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), AgentError>
    where
        F: Future<Output = ()>,
    {
        let RunningAgent {
            proxy,
            guard,
            admin_addr,
        } = self;

        if let Some(addr) = admin_addr {
            let metrics = proxy.metrics();
            tokio::spawn(async move {
                if let Err(e) = start_admin_server(addr, metrics).await {
                    error!("Admin server failed: {}", e);
                }
            });
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut server = tokio::spawn(proxy.run(shutdown_rx));

        let outcome = tokio::select! {
            _ = shutdown => Ok(()),
            joined = &mut server => match joined {
                Ok(Ok(())) => Err(AgentError::Task("proxy stopped unexpectedly".into())),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(AgentError::Task(e.to_string())),
            },
        };

        let _ = shutdown_tx.send(true);

        if let Some(guard) = guard {
            match guard.release() {
                Ok(()) => info!("Deactivating proxy. Network connectivity should be restored."),
                Err(e) => error!("Failed to disable packet filter: {}", e),
            }
        }

        outcome
    }
}

/// Termination signals that end a run.
pub struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
    hangup: Signal,
    quit: Signal,
}

impl ShutdownSignals {
    pub fn register() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    pub async fn recv(mut self) {
        let name = tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.hangup.recv() => "SIGHUP",
            _ = self.quit.recv() => "SIGQUIT",
        };
        info!("Received {}, shutting down", name);
    }
}
