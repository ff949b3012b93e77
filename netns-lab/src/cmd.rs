// Tsim: Network Namespace Reachability Simulator written in Rust
// Copyright (C) 2023-2024 Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Module for executing the external network binaries (`ip`, `iptables-restore`,
//! `iptables-save`, `ipset`), optionally inside a network namespace.

use std::{process::Stdio, string::FromUtf8Error, time::Duration};

use itertools::Itertools;
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command, time::timeout};

/// Executes external commands with a bounded runtime per command.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
}

impl CommandRunner {
    /// Create a runner whose commands are killed after the given timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// The configured per-command timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn command(&self, ns: Option<&str>, program: &str, args: &[&str]) -> (Command, String) {
        let (mut cmd, cmd_str) = match ns {
            Some(ns) => {
                let mut cmd = Command::new("ip");
                cmd.args(["netns", "exec", ns, program]);
                (cmd, format!("[{ns}] {program} {}", args.iter().join(" ")))
            }
            None => (
                Command::new(program),
                format!("{program} {}", args.iter().join(" ")),
            ),
        };
        cmd.args(args);
        cmd.kill_on_drop(true);
        (cmd, cmd_str)
    }

    /// Execute a command and return its STDOUT. The call checks that the exit code is zero; on
    /// failure, the error carries the command line and its STDERR.
    pub async fn run(
        &self,
        ns: Option<&str>,
        program: &str,
        args: &[&str],
    ) -> Result<String, CmdError> {
        let (mut cmd, cmd_str) = self.command(ns, program, args);
        log::trace!("[cmd] `{cmd_str}`");
        let output = match timeout(self.timeout, cmd.output()).await {
            Ok(result) => result?,
            Err(_) => {
                log::error!("[cmd] `{cmd_str}` timed out after {:?}", self.timeout);
                return Err(CmdError::Timeout(cmd_str, self.timeout));
            }
        };
        check_output(cmd_str, output)
    }

    /// Execute a command feeding `input` to its STDIN (used for `iptables-restore` and
    /// `ipset restore`).
    pub async fn run_with_input(
        &self,
        ns: Option<&str>,
        program: &str,
        args: &[&str],
        input: &str,
    ) -> Result<String, CmdError> {
        let (mut cmd, cmd_str) = self.command(ns, program, args);
        log::trace!("[cmd] `{cmd_str}` ({} bytes on stdin)", input.len());
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let run = async {
            let mut child = cmd.spawn()?;
            child
                .stdin
                .take()
                .expect("stdin was piped")
                .write_all(input.as_bytes())
                .await?;
            child.wait_with_output().await
        };
        let output = match timeout(self.timeout, run).await {
            Ok(result) => result?,
            Err(_) => {
                log::error!("[cmd] `{cmd_str}` timed out after {:?}", self.timeout);
                return Err(CmdError::Timeout(cmd_str, self.timeout));
            }
        };
        check_output(cmd_str, output)
    }

    /// Execute a command and return whether it exited successfully, without treating a non-zero
    /// exit code as an error.
    pub async fn run_status(
        &self,
        ns: Option<&str>,
        program: &str,
        args: &[&str],
    ) -> Result<bool, CmdError> {
        let (mut cmd, cmd_str) = self.command(ns, program, args);
        log::trace!("[cmd] `{cmd_str}`");
        let output = match timeout(self.timeout, cmd.output()).await {
            Ok(result) => result?,
            Err(_) => return Err(CmdError::Timeout(cmd_str, self.timeout)),
        };
        Ok(output.status.success())
    }
}

/// Check the output for a successful exit code and return the parsed STDOUT.
fn check_output(cmd_str: String, output: std::process::Output) -> Result<String, CmdError> {
    if output.status.success() {
        Ok(String::from_utf8(output.stdout)?)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        log::error!(
            "[cmd] `{}` exited with exit code {}{}{}",
            cmd_str,
            output.status.code().unwrap_or_default(),
            if output.stdout.is_empty() {
                String::new()
            } else {
                format!("\nSTDOUT:\n{}", String::from_utf8_lossy(&output.stdout))
            },
            if stderr.is_empty() {
                String::new()
            } else {
                format!("\nSTDERR:\n{stderr}")
            }
        );
        Err(CmdError::CommandError {
            cmd: cmd_str,
            code: output.status.code().unwrap_or_default(),
            stderr,
        })
    }
}

/// Errors thrown while executing external commands.
#[derive(Debug, Error)]
pub enum CmdError {
    /// I/O Error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The command did not finish within the per-namespace timeout.
    #[error("Command `{0}` timed out after {1:?}")]
    Timeout(String, Duration),
    /// The command exited with a non-zero code.
    #[error("Non-zero exit code of command `{cmd}`: {code}")]
    CommandError {
        /// The command line that failed.
        cmd: String,
        /// Its exit code.
        code: i32,
        /// Captured STDERR.
        stderr: String,
    },
    /// Cannot parse output as utf8
    #[error("Cannot parse output as UTF-8: {0}")]
    FromUtf8(#[from] FromUtf8Error),
}
