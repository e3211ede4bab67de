//! Packet-filter controller.
//!
//! Installs the redirect ruleset that sends outbound HTTP/HTTPS traffic to the
//! local proxy listeners and toggles the filter on and off. The filter is a
//! single process-wide OS resource: calls are expected to be serialized by the
//! caller (startup once, shutdown once).
//!
//! ```text
//! Unknown --check_compatibility--> CompatibilityVerified --configure--> RulesLoaded
//!     RulesLoaded --enable--> Active --disable--> Inactive --enable--> Active
//! ```
//!
//! `disable` is accepted in every state because it is the cleanup path.

mod markers;
mod probe;
mod ruleset;
mod runner;

pub use markers::ToolMarkers;
pub use probe::{HostProbe, SystemProbe};
pub use ruleset::render_ruleset;
pub use runner::{CommandOutput, CommandRunner, PfctlRunner};

use crate::config::RedirectConfig;
use crate::error::{CompatibilityError, FirewallError};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Lifecycle of the redirect as seen by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallState {
    Unknown,
    CompatibilityVerified,
    RulesLoaded,
    Active,
    Inactive,
}

impl fmt::Display for FirewallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FirewallState::Unknown => "unknown",
            FirewallState::CompatibilityVerified => "compatibility-verified",
            FirewallState::RulesLoaded => "rules-loaded",
            FirewallState::Active => "active",
            FirewallState::Inactive => "inactive",
        };
        f.write_str(name)
    }
}

/// Owns the packet-filter redirect for the lifetime of the process.
pub struct FirewallController {
    runner: Arc<dyn CommandRunner>,
    probe: Arc<dyn SystemProbe>,
    markers: ToolMarkers,
    state: Mutex<FirewallState>,
}

impl FirewallController {
    /// Controller for macOS `pfctl` on the real host.
    pub fn new() -> Self {
        Self::with_parts(
            Arc::new(PfctlRunner::new()),
            Arc::new(HostProbe),
            ToolMarkers::pfctl(),
        )
    }

    pub fn with_parts(
        runner: Arc<dyn CommandRunner>,
        probe: Arc<dyn SystemProbe>,
        markers: ToolMarkers,
    ) -> Self {
        Self {
            runner,
            probe,
            markers,
            state: Mutex::new(FirewallState::Unknown),
        }
    }

    pub fn state(&self) -> FirewallState {
        *self.lock_state()
    }

    /// Verify privilege, platform and tool presence, in that order.
    pub fn check_compatibility(&self) -> Result<(), FirewallError> {
        if !self.probe.is_privileged() {
            return Err(CompatibilityError::Permission.into());
        }

        let platform = self.probe.platform();
        if platform != "macos" {
            return Err(CompatibilityError::Platform(platform).into());
        }

        let tool = self.runner.program().to_string();
        match self.probe.find_tool(&tool) {
            Some(path) => debug!("Found {} at {}", tool, path.display()),
            None => return Err(CompatibilityError::ToolNotFound(tool).into()),
        }

        let mut state = self.lock_state();
        if *state == FirewallState::Unknown {
            *state = FirewallState::CompatibilityVerified;
        }
        Ok(())
    }

    /// Render the ruleset for `config` and load it, replacing any active ruleset.
    pub fn configure(&self, config: &RedirectConfig) -> Result<(), FirewallError> {
        let current = self.state();
        if current == FirewallState::Unknown {
            return Err(FirewallError::InvalidTransition {
                operation: "configure",
                state: current,
            });
        }
        config.validate()?;

        let rules = render_ruleset(config);
        debug!("Loading pf ruleset:\n{}", rules);

        let output = self
            .runner
            .run(&["-f", "-"], Some(&rules))
            .map_err(|e| FirewallError::Configuration {
                output: format!("failed to run {}: {}", self.runner.program(), e),
            })?;

        if self.markers.configure_failed(&output) {
            return Err(FirewallError::Configuration {
                output: output.text,
            });
        }

        info!(
            interface = %config.interface_name,
            http_port = config.proxy_http_port,
            https_port = config.proxy_https_port,
            "Redirect rules loaded"
        );

        let mut state = self.lock_state();
        if *state != FirewallState::Active {
            *state = FirewallState::RulesLoaded;
        }
        Ok(())
    }

    /// Turn the packet filter on. Succeeds when it is already on.
    pub fn enable(&self) -> Result<(), FirewallError> {
        let current = self.state();
        if matches!(
            current,
            FirewallState::Unknown | FirewallState::CompatibilityVerified
        ) {
            return Err(FirewallError::InvalidTransition {
                operation: "enable",
                state: current,
            });
        }

        let output = self.toggle("enable", "-e")?;
        if !self.markers.enable_succeeded(&output) {
            return Err(FirewallError::Toggle {
                action: "enable",
                output: output.text,
            });
        }

        info!("Packet filter enabled");
        *self.lock_state() = FirewallState::Active;
        Ok(())
    }

    /// Turn the packet filter off. Safe to call in any state.
    pub fn disable(&self) -> Result<(), FirewallError> {
        let output = self.toggle("disable", "-d")?;
        if !self.markers.disable_succeeded(&output) {
            return Err(FirewallError::Toggle {
                action: "disable",
                output: output.text,
            });
        }

        info!("Packet filter disabled");
        *self.lock_state() = FirewallState::Inactive;
        Ok(())
    }

    /// Enable the filter and return a guard that disables it again.
    pub fn activate(self: &Arc<Self>) -> Result<RedirectGuard, FirewallError> {
        self.enable()?;
        info!(
            "In case connectivity is lost after the program exits run: sudo {} -d",
            self.runner.program()
        );
        Ok(RedirectGuard {
            controller: Arc::clone(self),
            released: false,
        })
    }

    fn toggle(&self, action: &'static str, flag: &str) -> Result<CommandOutput, FirewallError> {
        self.runner
            .run(&[flag], None)
            .map_err(|e| FirewallError::Toggle {
                action,
                output: format!("failed to run {}: {}", self.runner.program(), e),
            })
    }

    fn lock_state(&self) -> MutexGuard<'_, FirewallState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for FirewallController {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped ownership of an active redirect.
///
/// `release` disables the filter and reports failures. A guard dropped
/// without being released disables the filter best-effort, which covers
/// early returns and unwinding panics.
#[must_use = "dropping the guard disables the redirect"]
pub struct RedirectGuard {
    controller: Arc<FirewallController>,
    released: bool,
}

impl RedirectGuard {
    pub fn controller(&self) -> &Arc<FirewallController> {
        &self.controller
    }

    pub fn release(mut self) -> Result<(), FirewallError> {
        self.released = true;
        self.controller.disable()
    }
}

impl Drop for RedirectGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.controller.disable() {
            warn!("Failed to disable packet filter during cleanup: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::PathBuf;

    /// Replays scripted outputs and records every invocation.
    #[derive(Default)]
    struct ScriptedRunner {
        replies: Mutex<VecDeque<std::io::Result<CommandOutput>>>,
        calls: Mutex<Vec<(Vec<String>, Option<String>)>>,
    }

    impl ScriptedRunner {
        fn reply(self, success: bool, text: &str) -> Self {
            self.replies.lock().unwrap().push_back(Ok(CommandOutput {
                success,
                text: text.to_string(),
            }));
            self
        }

        fn fail(self) -> Self {
            self.replies
                .lock()
                .unwrap()
                .push_back(Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no such file",
                )));
            self
        }

        fn calls(&self) -> Vec<(Vec<String>, Option<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, args: &[&str], stdin: Option<&str>) -> std::io::Result<CommandOutput> {
            self.calls.lock().unwrap().push((
                args.iter().map(|a| a.to_string()).collect(),
                stdin.map(str::to_string),
            ));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(CommandOutput {
                    success: true,
                    text: String::new(),
                }))
        }

        fn program(&self) -> &str {
            "pfctl"
        }
    }

    struct FakeProbe {
        root: bool,
        platform: &'static str,
        tool: bool,
    }

    impl SystemProbe for FakeProbe {
        fn is_privileged(&self) -> bool {
            self.root
        }
        fn platform(&self) -> String {
            self.platform.to_string()
        }
        fn find_tool(&self, tool: &str) -> Option<PathBuf> {
            self.tool.then(|| PathBuf::from("/sbin").join(tool))
        }
    }

    fn compatible() -> FakeProbe {
        FakeProbe {
            root: true,
            platform: "macos",
            tool: true,
        }
    }

    fn controller(runner: ScriptedRunner, probe: FakeProbe) -> (Arc<FirewallController>, Arc<ScriptedRunner>) {
        let runner = Arc::new(runner);
        let controller = FirewallController::with_parts(
            runner.clone(),
            Arc::new(probe),
            ToolMarkers::pfctl(),
        );
        (Arc::new(controller), runner)
    }

    fn tap0() -> RedirectConfig {
        RedirectConfig::new(8000, 8001, "tap0").unwrap()
    }

    #[test]
    fn test_compatibility_checks_short_circuit_in_order() {
        let (fw, _) = controller(
            ScriptedRunner::default(),
            FakeProbe {
                root: false,
                platform: "linux",
                tool: false,
            },
        );
        assert!(matches!(
            fw.check_compatibility(),
            Err(FirewallError::Compatibility(CompatibilityError::Permission))
        ));

        let (fw, _) = controller(
            ScriptedRunner::default(),
            FakeProbe {
                root: true,
                platform: "linux",
                tool: false,
            },
        );
        assert!(matches!(
            fw.check_compatibility(),
            Err(FirewallError::Compatibility(CompatibilityError::Platform(p))) if p == "linux"
        ));

        let (fw, _) = controller(
            ScriptedRunner::default(),
            FakeProbe {
                root: true,
                platform: "macos",
                tool: false,
            },
        );
        assert!(matches!(
            fw.check_compatibility(),
            Err(FirewallError::Compatibility(CompatibilityError::ToolNotFound(t))) if t == "pfctl"
        ));
        assert_eq!(fw.state(), FirewallState::Unknown);
    }

    #[test]
    fn test_configure_submits_rendered_rules_on_stdin() {
        let (fw, runner) = controller(
            ScriptedRunner::default().reply(true, "pfctl: Use of -f option, could result in flushing of rules"),
            compatible(),
        );
        fw.check_compatibility().unwrap();
        fw.configure(&tap0()).unwrap();

        assert_eq!(fw.state(), FirewallState::RulesLoaded);
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, vec!["-f", "-"]);
        let rules = calls[0].1.as_deref().unwrap();
        assert!(rules.contains("Proxy_Http_Port = 8000"));
        assert!(rules.contains("Proxy_Https_Port = 8001"));
        assert!(rules.contains("Interface = tap0"));
    }

    #[test]
    fn test_configure_failure_marker_wins_over_exit_status() {
        let (fw, _) = controller(
            ScriptedRunner::default().reply(true, "pfctl: Syntax error in config file: pf rules not loaded"),
            compatible(),
        );
        fw.check_compatibility().unwrap();
        let err = fw.configure(&tap0()).unwrap_err();
        assert!(matches!(err, FirewallError::Configuration { .. }));
        assert!(err.tool_output().unwrap().contains("pf rules not loaded"));
        assert_eq!(fw.state(), FirewallState::CompatibilityVerified);
    }

    #[test]
    fn test_configure_invocation_failure() {
        let (fw, _) = controller(ScriptedRunner::default().fail(), compatible());
        fw.check_compatibility().unwrap();
        let err = fw.configure(&tap0()).unwrap_err();
        assert!(err.tool_output().unwrap().contains("no such file"));
    }

    #[test]
    fn test_configure_requires_compatibility() {
        let (fw, runner) = controller(ScriptedRunner::default(), compatible());
        assert!(matches!(
            fw.configure(&tap0()),
            Err(FirewallError::InvalidTransition { operation: "configure", .. })
        ));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_enable_requires_rules() {
        let (fw, runner) = controller(ScriptedRunner::default(), compatible());
        fw.check_compatibility().unwrap();
        assert!(matches!(
            fw.enable(),
            Err(FirewallError::InvalidTransition { operation: "enable", .. })
        ));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_enable_twice_is_idempotent() {
        let (fw, runner) = controller(
            ScriptedRunner::default()
                .reply(true, "")
                .reply(true, "No ALTQ support in kernel\npf enabled\n")
                .reply(false, "pfctl: pf already enabled\n"),
            compatible(),
        );
        fw.check_compatibility().unwrap();
        fw.configure(&tap0()).unwrap();

        fw.enable().unwrap();
        assert_eq!(fw.state(), FirewallState::Active);
        fw.enable().unwrap();
        assert_eq!(fw.state(), FirewallState::Active);

        let calls = runner.calls();
        assert_eq!(calls[1].0, vec!["-e"]);
        assert_eq!(calls[2].0, vec!["-e"]);
    }

    #[test]
    fn test_enable_unknown_output_fails_with_raw_output() {
        let (fw, _) = controller(
            ScriptedRunner::default()
                .reply(true, "")
                .reply(false, "pfctl: DIOCSTART: Operation not permitted"),
            compatible(),
        );
        fw.check_compatibility().unwrap();
        fw.configure(&tap0()).unwrap();
        let err = fw.enable().unwrap_err();
        assert!(matches!(err, FirewallError::Toggle { action: "enable", .. }));
        assert_eq!(err.tool_output(), Some("pfctl: DIOCSTART: Operation not permitted"));
        assert_eq!(fw.state(), FirewallState::RulesLoaded);
    }

    #[test]
    fn test_disable_from_unknown_state() {
        let (fw, runner) = controller(
            ScriptedRunner::default().reply(false, "pfctl: pf not enabled\n"),
            FakeProbe {
                root: false,
                platform: "linux",
                tool: false,
            },
        );
        fw.disable().unwrap();
        assert_eq!(fw.state(), FirewallState::Inactive);
        assert_eq!(runner.calls()[0].0, vec!["-d"]);
    }

    #[test]
    fn test_disable_failure() {
        let (fw, _) = controller(
            ScriptedRunner::default().reply(false, "pfctl: /dev/pf: Permission denied"),
            compatible(),
        );
        assert!(matches!(
            fw.disable(),
            Err(FirewallError::Toggle { action: "disable", .. })
        ));
    }

    #[test]
    fn test_enable_after_disable() {
        let (fw, _) = controller(
            ScriptedRunner::default()
                .reply(true, "")
                .reply(true, "pf enabled")
                .reply(true, "pf disabled")
                .reply(true, "pf enabled"),
            compatible(),
        );
        fw.check_compatibility().unwrap();
        fw.configure(&tap0()).unwrap();
        fw.enable().unwrap();
        fw.disable().unwrap();
        assert_eq!(fw.state(), FirewallState::Inactive);
        fw.enable().unwrap();
        assert_eq!(fw.state(), FirewallState::Active);
    }

    #[test]
    fn test_guard_release_disables() {
        let (fw, runner) = controller(
            ScriptedRunner::default()
                .reply(true, "")
                .reply(true, "pf enabled")
                .reply(true, "pf disabled"),
            compatible(),
        );
        fw.check_compatibility().unwrap();
        fw.configure(&tap0()).unwrap();

        let guard = fw.activate().unwrap();
        assert_eq!(fw.state(), FirewallState::Active);
        guard.release().unwrap();

        assert_eq!(fw.state(), FirewallState::Inactive);
        assert_eq!(runner.calls().len(), 3);
    }

    #[test]
    fn test_guard_drop_disables_once() {
        let (fw, runner) = controller(
            ScriptedRunner::default()
                .reply(true, "")
                .reply(true, "pf enabled")
                .reply(true, "pf disabled"),
            compatible(),
        );
        fw.check_compatibility().unwrap();
        fw.configure(&tap0()).unwrap();

        {
            let _guard = fw.activate().unwrap();
        }

        assert_eq!(fw.state(), FirewallState::Inactive);
        let calls = runner.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2].0, vec!["-d"]);
    }

    #[test]
    fn test_reconfigure_while_active_keeps_active() {
        let (fw, _) = controller(
            ScriptedRunner::default()
                .reply(true, "")
                .reply(true, "pf enabled")
                .reply(true, ""),
            compatible(),
        );
        fw.check_compatibility().unwrap();
        fw.configure(&tap0()).unwrap();
        fw.enable().unwrap();
        fw.configure(&RedirectConfig::new(9000, 9001, "en0").unwrap())
            .unwrap();
        assert_eq!(fw.state(), FirewallState::Active);
    }
}
