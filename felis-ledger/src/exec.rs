use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use felis_core::error::TaskFailed;

use crate::monitor::WaitMonitor;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
}
impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
    /// The first line of stdout, without the line terminator.
    pub fn first_line(&self) -> &str {
        self.stdout.lines().next().unwrap_or_default()
    }
}

/// Runs host commands on behalf of hooks and collectors.
pub trait CommandRunner: Send + Sync {
    /// Run `argv` to completion. A nonzero exit is not an error at this level.
    fn run(&self, argv: &[String]) -> Result<CommandOutput>;
}

/// Split a rendered command the way a POSIX shell would, without running a shell.
pub fn split(command: &str) -> Result<Vec<String>> {
    match shlex::split(command) {
        Some(argv) if !argv.is_empty() => Ok(argv),
        Some(_) => bail!("Empty command"),
        None => bail!("Could not parse command `{}'", command),
    }
}

/// Run `command` and turn a nonzero exit into [`TaskFailed`].
pub fn exec(runner: &dyn CommandRunner, command: &str) -> Result<CommandOutput> {
    let argv = split(command)?;
    tracing::info!(command, "exec");
    let output = runner.run(&argv)?;
    if !output.success() {
        return Err(TaskFailed {
            command: command.to_string(),
            exit_code: output.exit_code,
            stderr: output.stderr,
        }
        .into());
    }
    Ok(output)
}

/// Turn a [`TaskFailed`] into `Ok(None)`, for steps that may fail harmlessly.
/// Other errors still propagate.
pub fn best_effort<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) => match e.downcast_ref::<TaskFailed>() {
            Some(failed) => {
                tracing::warn!("ignoring failure: {}", failed);
                Ok(None)
            }
            None => Err(e),
        },
    }
}

/// Runs commands as root, through `sudo` unless the process already is root.
pub struct PrivilegedRunner {
    elevate: bool,
}

impl PrivilegedRunner {
    pub fn new(elevate: bool) -> Self {
        PrivilegedRunner {
            elevate: elevate && !nix::unistd::geteuid().is_root(),
        }
    }
}

impl CommandRunner for PrivilegedRunner {
    fn run(&self, argv: &[String]) -> Result<CommandOutput> {
        let (program, args) = match argv.split_first() {
            Some(split) => split,
            None => bail!("Empty command"),
        };
        let mut command = if self.elevate {
            let mut c = Command::new("sudo");
            c.arg("-n").arg(program);
            c
        } else {
            Command::new(program)
        };
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let monitor = WaitMonitor::new(format!("Waiting for {}", program));
        let output = command
            .output()
            .with_context(|| format!("Could not spawn process: {}", program))?;
        monitor.done();

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }
}
