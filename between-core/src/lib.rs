//! Between Core Library
//!
//! This library provides the pieces of a transparent intercepting proxy:
//! the packet-filter controller that redirects outbound HTTP/HTTPS traffic to
//! loopback, and the dual-listener proxy that rewrites redirected requests back
//! to their real origin and runs them through caller-supplied hooks.

pub mod admin;
pub mod director;
pub mod firewall;
pub mod hooks;
/// Dual-listener intercepting proxy
pub mod proxy;
pub mod tls;
pub mod transport;

/// Configuration types and utilities
pub mod config;

/// Error types for firewall and proxy operations
pub mod error;

// Re-export commonly used types
pub use admin::{Metrics, MetricsSnapshot};
pub use config::{ProxyStartupConfig, RedirectConfig, TlsConfig};
pub use director::Director;
pub use error::{CompatibilityError, FirewallError, HookError, ProxyError, TransportError};
pub use firewall::{
    CommandOutput, CommandRunner, FirewallController, FirewallState, HostProbe, PfctlRunner,
    RedirectGuard, SystemProbe, ToolMarkers,
};
pub use hooks::{replace_body, HookSet, InterceptHooks, PassthroughHooks};
pub use proxy::InterceptingProxy;
pub use transport::{full_body, HyperTransport, InterceptingTransport, ProxyBody, Transport};

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;
