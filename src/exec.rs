//! External process execution
//!
//! Java tools and `adb` are run through [`CommandExecutor`] so the pipeline
//! and the device bridge can be driven by fakes in tests.

use crate::error::{SideloadError, SideloadResult};
use crate::progress::Stage;
use std::ffi::OsString;
use std::process::Command;

/// Captured result of one process run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// Successful run with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed run with the given exit code and stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Human readable exit status
    pub fn status(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        }
    }

    /// stdout and stderr joined for diagnostics
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, true) => String::new(),
            (false, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (false, false) => format!("{}\n{}", stdout, stderr),
        }
    }

    /// Turn a non-zero exit into an `ExternalTool` error for `stage`
    pub fn check(self, stage: Stage) -> SideloadResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(SideloadError::ExternalTool {
                stage,
                status: self.status(),
                output: self.combined(),
            })
        }
    }
}

/// Abstraction for running external commands
pub trait CommandExecutor {
    /// Run `program` with `args`, blocking until it exits
    ///
    /// Only spawn failures are errors; a non-zero exit is reported through
    /// the returned [`ToolOutput`].
    fn run(&self, program: &str, args: &[OsString]) -> SideloadResult<ToolOutput>;
}

impl<T: CommandExecutor + ?Sized> CommandExecutor for Box<T> {
    fn run(&self, program: &str, args: &[OsString]) -> SideloadResult<ToolOutput> {
        (**self).run(program, args)
    }
}

/// Executes commands on the host system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandExecutor;

impl CommandExecutor for SystemCommandExecutor {
    fn run(&self, program: &str, args: &[OsString]) -> SideloadResult<ToolOutput> {
        tracing::debug!(target: "sideload::exec", program = %program, ?args, "Running command");

        let output = Command::new(program).args(args).output()?;

        Ok(ToolOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Build an argument vector from anything path- or string-like
pub fn args<I, S>(items: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    items.into_iter().map(Into::into).collect()
}
