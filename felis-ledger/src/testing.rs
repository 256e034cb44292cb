//! Test doubles for the command boundary.

use std::sync::Mutex;

use anyhow::Result;

use crate::{
    exec::{CommandOutput, CommandRunner},
    store::lock,
};

struct Script {
    prefix: String,
    output: CommandOutput,
}

/// Records every command instead of running it. Commands succeed with empty
/// output unless a scripted response matches their prefix; the most recently
/// scripted match wins.
#[derive(Default)]
pub struct RecordingRunner {
    commands: Mutex<Vec<String>>,
    argvs: Mutex<Vec<Vec<String>>>,
    scripts: Mutex<Vec<Script>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands starting with `prefix` exit with `exit_code` and `stderr`.
    pub fn fail_on(&self, prefix: &str, exit_code: i32, stderr: &str) {
        lock(&self.scripts).push(Script {
            prefix: prefix.to_string(),
            output: CommandOutput {
                stdout: String::new(),
                stderr: stderr.to_string(),
                exit_code: Some(exit_code),
            },
        });
    }

    /// Commands starting with `prefix` succeed and print `stdout`.
    pub fn respond(&self, prefix: &str, stdout: &str) {
        lock(&self.scripts).push(Script {
            prefix: prefix.to_string(),
            output: CommandOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code: Some(0),
            },
        });
    }

    /// Drop all scripted responses.
    pub fn reset(&self) {
        lock(&self.scripts).clear();
    }

    /// The commands seen so far, arguments joined by single spaces.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    /// The argument vectors seen so far, as passed to [`CommandRunner::run`].
    pub fn argvs(&self) -> Vec<Vec<String>> {
        lock(&self.argvs).clone()
    }

    pub fn clear_commands(&self) {
        lock(&self.commands).clear();
        lock(&self.argvs).clear();
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, argv: &[String]) -> Result<CommandOutput> {
        let command = argv.join(" ");
        lock(&self.commands).push(command.clone());
        lock(&self.argvs).push(argv.to_vec());
        let output = lock(&self.scripts)
            .iter()
            .rev()
            .find(|s| command.starts_with(&s.prefix))
            .map(|s| s.output.clone())
            .unwrap_or(CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: Some(0),
            });
        Ok(output)
    }
}
