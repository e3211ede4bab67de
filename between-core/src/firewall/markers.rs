//! Output markers used to judge control tool invocations.
//!
//! `pfctl` exits non-zero for idempotent no-ops such as enabling an already
//! enabled filter, and can exit zero while refusing a ruleset, so its text
//! output is the success oracle. Matching is ASCII case-insensitive.

use super::runner::CommandOutput;

/// Substring contract for one control tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolMarkers {
    /// Any of these in the output of an enable call means success.
    pub enable_success: Vec<String>,
    /// Any of these in the output of a disable call means success.
    pub disable_success: Vec<String>,
    /// Any of these in the output of a ruleset load means failure.
    pub configure_failure: Vec<String>,
}

impl ToolMarkers {
    /// Markers printed by macOS `pfctl`.
    pub fn pfctl() -> Self {
        Self {
            enable_success: vec!["pf enabled".into(), "pf already enabled".into()],
            disable_success: vec!["pf disabled".into(), "pf not enabled".into()],
            configure_failure: vec!["pf rules not loaded".into(), "permission denied".into()],
        }
    }

    pub fn enable_succeeded(&self, output: &CommandOutput) -> bool {
        output.success || contains_any(&output.text, &self.enable_success)
    }

    pub fn disable_succeeded(&self, output: &CommandOutput) -> bool {
        output.success || contains_any(&output.text, &self.disable_success)
    }

    pub fn configure_failed(&self, output: &CommandOutput) -> bool {
        !output.success || contains_any(&output.text, &self.configure_failure)
    }
}

impl Default for ToolMarkers {
    fn default() -> Self {
        Self::pfctl()
    }
}

fn contains_any(text: &str, markers: &[String]) -> bool {
    let text = text.to_ascii_lowercase();
    markers
        .iter()
        .any(|marker| text.contains(&marker.to_ascii_lowercase()))
}
