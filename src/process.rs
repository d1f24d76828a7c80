//! Host command execution.
//!
//! Every external tool the pipeline drives (parted, losetup, mkfs, rsync, ...)
//! goes through [`Cmd`] so that invocations are logged the same way and a
//! non-zero exit becomes an error carrying the tool's stderr.

use anyhow::{bail, Context, Result};
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use tracing::debug;

/// Captured result of a finished command.
#[derive(Debug)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Builder for a single host command invocation.
#[derive(Debug)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Message used as the error context when the command fails.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return the result instead of an error on non-zero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    pub fn run(self) -> Result<CommandResult> {
        let line = self.display();
        debug!("running: {line}");

        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to run {}", self.program))?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() && !self.allow_fail {
            let msg = self
                .error_msg
                .unwrap_or_else(|| format!("{} failed", self.program));
            bail!("{msg}\n  command: {line}\n  status: {}\n  {}", result.status, result.stderr.trim());
        }

        Ok(result)
    }
}

/// Whether `program` can be found in PATH.
pub fn exists(program: &str) -> bool {
    which::which(program).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_success() {
        let result = Cmd::new("true").run().unwrap();
        assert!(result.success());
    }

    #[test]
    fn test_run_failure_is_error() {
        let err = Cmd::new("false").error_msg("expected failure").run().unwrap_err();
        assert!(err.to_string().contains("expected failure"));
    }

    #[test]
    fn test_allow_fail_returns_status() {
        let result = Cmd::new("false").allow_fail().run().unwrap();
        assert!(!result.success());
    }

    #[test]
    fn test_captures_stdout_and_stderr() {
        let result = Cmd::new("sh")
            .args(["-c", "echo out; echo err >&2; exit 3"])
            .allow_fail()
            .run()
            .unwrap();
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert_eq!(result.status.code(), Some(3));
    }

    #[test]
    fn test_failure_carries_stderr() {
        let err = Cmd::new("sh")
            .args(["-c", "echo 'no space left' >&2; exit 1"])
            .run()
            .unwrap_err();
        assert!(err.to_string().contains("no space left"));
    }

    #[test]
    fn test_exists() {
        assert!(exists("sh"));
        assert!(!exists("definitely_not_a_real_command_12345"));
    }
}
