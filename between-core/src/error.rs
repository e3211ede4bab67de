//! Error types for firewall and proxy operations

use crate::firewall::FirewallState;
use thiserror::Error;

/// A host prerequisite for installing redirect rules is missing.
///
/// Checked in declaration order; the first failing check is reported.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompatibilityError {
    /// The process does not run with an effective uid of root.
    #[error("This needs to be run as root.")]
    Permission,
    /// The host platform has no supported packet-filter backend.
    #[error("Unsupported platform '{0}': currently only macOS is supported.")]
    Platform(String),
    /// The packet-filter control tool is not on the PATH.
    #[error("Could not find {0} in PATH.")]
    ToolNotFound(String),
}

/// Errors raised while managing the packet-filter redirect.
#[derive(Debug, Error)]
pub enum FirewallError {
    /// A prerequisite check failed; nothing was mutated.
    #[error(transparent)]
    Compatibility(#[from] CompatibilityError),

    /// The ruleset could not be loaded. `output` is the raw tool output.
    #[error("Cannot configure pf:\n{output}")]
    Configuration {
        /// Combined stdout/stderr of the control tool.
        output: String,
    },

    /// Enabling or disabling the packet filter failed.
    #[error("Cannot {action} pf:\n{output}")]
    Toggle {
        /// `"enable"` or `"disable"`.
        action: &'static str,
        /// Combined stdout/stderr of the control tool.
        output: String,
    },

    /// The interface name cannot be rendered into a ruleset.
    #[error("Invalid interface name '{0}'")]
    InvalidInterface(String),

    /// An operation was called before its prerequisite step.
    #[error("Cannot {operation} while firewall is {state}")]
    InvalidTransition {
        /// The rejected operation.
        operation: &'static str,
        /// The controller state at the time of the call.
        state: FirewallState,
    },
}

impl FirewallError {
    /// Raw control tool output, when the error carries one.
    pub fn tool_output(&self) -> Option<&str> {
        match self {
            FirewallError::Configuration { output } | FirewallError::Toggle { output, .. } => {
                Some(output)
            }
            _ => None,
        }
    }
}

/// Failure reported by a request or response hook. Advisory, except
/// for `BodyLost`.
#[derive(Debug, Error)]
pub enum HookError {
    /// I/O performed by the hook failed.
    #[error("hook I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Any other hook-specific failure.
    #[error("{0}")]
    Message(String),
    /// The hook took the response body and could not put it back. The
    /// exchange fails instead of relaying a truncated response.
    #[error("response body lost: {0}")]
    BodyLost(String),
}

/// Failure of the network round trip for one exchange.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The upstream request could not be built or sent.
    #[error("upstream request failed: {0}")]
    Upstream(String),
    /// The exchange exceeded its deadline.
    #[error("exchange timed out")]
    Timeout,
}

/// Main error type for proxy operations
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations, file access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS material could not be loaded or the handshake failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The inbound request carries no usable `Host` header.
    #[error("Missing or invalid Host header: {0}")]
    InvalidHost(String),

    /// The request names the proxy's own listener as its destination.
    #[error("Request loops back to the proxy: {0}")]
    LoopDetected(String),

    /// Network-related errors.
    #[error("Network error: {0}")]
    Network(String),

    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Round trip failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}
