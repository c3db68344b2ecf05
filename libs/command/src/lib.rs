//! External command execution.
//!
//! Every collaborator the migration system drives (container runtime,
//! state sync utility, packet filter) is a black-box command. Success is a
//! zero exit status; on failure the combined stdout/stderr of the process is
//! the diagnostic that travels back to the caller.
//!
//! Components depend on the [`CommandRunner`] trait rather than on
//! [`tokio::process`] directly so tests can substitute a recording fake.

use std::fmt;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// A single command invocation: program plus arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program name or path.
    pub program: String,
    /// Arguments, in order.
    pub args: Vec<String>,
}

impl Invocation {
    /// Create an invocation with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Build a [`tokio::process::Command`] for this invocation.
    ///
    /// Stdin is closed; stdout and stderr are piped so callers can collect
    /// the diagnostic output.
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Errors from running an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The process could not be started at all (missing binary, permissions).
    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process ran and exited unsuccessfully.
    #[error("{command} failed ({status}): {output}")]
    Failed {
        command: String,
        status: String,
        output: String,
    },
}

impl CommandError {
    /// Build a failure from an exit status and captured output.
    pub fn failed(invocation: &Invocation, status: ExitStatus, output: String) -> Self {
        Self::Failed {
            command: invocation.to_string(),
            status: status.to_string(),
            output,
        }
    }

    /// Build a spawn error for an invocation.
    pub fn spawn(invocation: &Invocation, source: std::io::Error) -> Self {
        Self::Spawn {
            program: invocation.program.clone(),
            source,
        }
    }

    /// Combined output of the failed process, if it ran.
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Spawn { .. } => None,
            Self::Failed { output, .. } => Some(output),
        }
    }
}

/// Runs external commands to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the invocation and wait for it to exit.
    ///
    /// Returns the combined output on a zero exit status.
    async fn run(&self, invocation: &Invocation) -> Result<String, CommandError>;
}

/// Runs commands as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<String, CommandError> {
        debug!(command = %invocation, "Running command");

        let output = invocation
            .to_command()
            .output()
            .await
            .map_err(|e| CommandError::spawn(invocation, e))?;

        let combined = combine_output(&output.stdout, &output.stderr);

        if !output.status.success() {
            warn!(
                command = %invocation,
                status = %output.status,
                output = %combined,
                "Command failed"
            );
            return Err(CommandError::failed(invocation, output.status, combined));
        }

        Ok(combined)
    }
}

/// Join stdout and stderr into one diagnostic string.
pub fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::from_utf8_lossy(stdout).into_owned();
    let stderr = String::from_utf8_lossy(stderr);

    if !stderr.is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&stderr);
    }

    combined.trim_end().to_string()
}
