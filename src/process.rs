//! Centralized command execution with consistent error handling.
//!
//! All external programs go through the `Cmd` builder. A non-zero exit
//! status becomes a typed failure carrying the program name, exit code
//! and captured stderr. Child stdout is inherited when debug logging is
//! active (so the user can watch rsync, mount etc. work) and discarded
//! otherwise, unless the caller asked to capture it for parsing; stderr
//! is likewise inherited at debug verbosity, and piped otherwise so a
//! failing tool's diagnostic survives into the error.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use tracing::{debug, enabled, Level};

use crate::error::CloneError;

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit status of the command.
    pub status: ExitStatus,
    /// Captured stdout; empty unless capture was requested.
    pub stdout: String,
    /// Captured stderr; empty when it was inherited (debug verbosity).
    pub stderr: String,
}

impl CommandResult {
    /// Returns true if the command exited successfully.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Get the exit code, or -1 if terminated by signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    /// Get stdout, trimmed of whitespace.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Builder for configuring command execution.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    input: Option<Vec<u8>>,
    capture_stdout: bool,
    /// If true, don't fail on non-zero exit.
    allow_fail: bool,
    /// Custom error message prefix.
    error_prefix: Option<String>,
}

impl Cmd {
    /// Create a new command builder.
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            input: None,
            capture_stdout: false,
            allow_fail: false,
            error_prefix: None,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    /// Add a path as an argument.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Feed the given bytes to the child's stdin.
    pub fn input(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.input = Some(data.into());
        self
    }

    /// Capture stdout for parsing instead of routing it by verbosity.
    pub fn capture_stdout(mut self) -> Self {
        self.capture_stdout = true;
        self
    }

    /// Allow non-zero exit codes without failing.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Set a custom error message prefix.
    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    /// Run the command synchronously.
    pub fn run(self) -> Result<CommandResult> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        // Child output routing: visible at debug verbosity, silent
        // otherwise. Captured stdout always goes through a pipe, and so
        // does non-inherited stderr, to keep the diagnostic of a failing
        // tool available for the error message.
        let passthrough = enabled!(Level::DEBUG);
        if self.capture_stdout {
            cmd.stdout(Stdio::piped());
        } else if passthrough {
            cmd.stdout(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::null());
        }
        if passthrough {
            cmd.stderr(Stdio::inherit());
        } else {
            cmd.stderr(Stdio::piped());
        }
        cmd.stdin(if self.input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        debug!("$ {} {}", self.program, self.args.join(" "));

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to execute '{}'. Is it installed?", self.program))?;

        if let Some(data) = &self.input {
            let mut stdin = child.stdin.take().context("child stdin not piped")?;
            stdin.write_all(data)?;
            // Dropping stdin closes the pipe so the child sees EOF.
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for '{}'", self.program))?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !self.allow_fail && !result.success() {
            let err = CloneError::Command {
                program: self.program.clone(),
                code: result.code(),
                detail: result.stderr.trim().to_string(),
            };
            return match self.error_prefix {
                Some(prefix) => Err(anyhow::Error::new(err).context(prefix)),
                None => Err(err.into()),
            };
        }

        Ok(result)
    }
}

/// Run a command with arguments. Fails with the exit code on error.
pub fn run<I, S>(program: &str, args: I) -> Result<CommandResult>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    Cmd::new(program).args(args).run()
}
