//! Command runner abstraction used for local device inspection.

use std::ffi::OsString;
use std::process::Command;

use thiserror::Error;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Returns the non-empty, trimmed lines of standard output.
    pub fn stdout_lines(&self) -> impl Iterator<Item = &str> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
    }
}

/// Errors raised while running external commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// Raised when the program cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error text.
        message: String,
    },
    /// Raised when the program exits unsuccessfully.
    #[error("{program} exited with status {status_text}: {stderr}")]
    Failure {
        /// Program that failed.
        program: String,
        /// Exit status if one was reported.
        status: Option<i32>,
        /// Printable exit status.
        status_text: String,
        /// Captured standard error.
        stderr: String,
    },
}

impl CommandError {
    /// Builds a [`CommandError::Failure`] from an unsuccessful output.
    #[must_use]
    pub fn failure(program: &str, output: &CommandOutput) -> Self {
        let status_text = output
            .code
            .map_or_else(|| String::from("unknown"), |code| code.to_string());
        Self::Failure {
            program: program.to_owned(),
            status: output.code,
            status_text,
            stderr: output.stderr.trim().to_owned(),
        }
    }
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError>;

    /// Runs `program` and turns a non-zero exit into an error.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Failure`] when the exit status is not zero, or
    /// any error raised by [`CommandRunner::run`].
    fn run_checked(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        let output = self.run(program, args)?;
        if output.is_success() {
            return Ok(output);
        }
        Err(CommandError::failure(program, &output))
    }
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| CommandError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
