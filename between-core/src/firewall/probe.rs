//! Host prerequisite probes.

use std::path::PathBuf;

/// Facts about the host consulted before any packet-filter mutation.
pub trait SystemProbe: Send + Sync {
    /// Whether the process runs with an effective uid of root.
    fn is_privileged(&self) -> bool;
    /// Operating system name as reported by `std::env::consts::OS`.
    fn platform(&self) -> String;
    /// Resolve `tool` on the PATH.
    fn find_tool(&self, tool: &str) -> Option<PathBuf>;
}

/// Probes the real host.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostProbe;

impl SystemProbe for HostProbe {
    fn is_privileged(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }

    fn platform(&self) -> String {
        std::env::consts::OS.to_string()
    }

    fn find_tool(&self, tool: &str) -> Option<PathBuf> {
        which::which(tool).ok()
    }
}
