//! Execution of the packet-filter control tool.

use std::io::Write;
use std::process::{Command, Stdio};
use tracing::debug;

/// Result of one control tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Whether the process exited with status zero.
    pub success: bool,
    /// Combined stdout and stderr, in that order.
    pub text: String,
}

/// Runs the control tool. Swapped for a scripted fake in tests.
pub trait CommandRunner: Send + Sync {
    /// Run the tool with `args`, writing `stdin` to it when given.
    fn run(&self, args: &[&str], stdin: Option<&str>) -> std::io::Result<CommandOutput>;

    /// Name of the tool, used in log lines and compatibility checks.
    fn program(&self) -> &str;
}

/// Invokes `pfctl` directly, without a shell.
#[derive(Debug, Clone)]
pub struct PfctlRunner {
    program: String,
}

impl PfctlRunner {
    pub fn new() -> Self {
        Self {
            program: "pfctl".to_string(),
        }
    }

    /// Use a specific binary, e.g. an absolute path.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for PfctlRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for PfctlRunner {
    fn run(&self, args: &[&str], stdin: Option<&str>) -> std::io::Result<CommandOutput> {
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())?;
            // dropping the pipe closes it so the tool sees EOF
        }

        let output = child.wait_with_output()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        debug!(
            "{} {} exited with {}: stdout={}, stderr={}",
            self.program,
            args.join(" "),
            output.status,
            stdout.trim_end(),
            stderr.trim_end()
        );

        Ok(CommandOutput {
            success: output.status.success(),
            text: format!("{stdout}{stderr}"),
        })
    }

    fn program(&self) -> &str {
        &self.program
    }
}
