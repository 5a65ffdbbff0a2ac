//! In-memory runner for stage tests: records every command and answers from
//! a list of `(needle, reply)` rules matched against the command line.
use super::{CommandOutput, CommandRunner, CommandSpec};
use anyhow::Result;
use std::cell::RefCell;

pub(crate) struct ScriptedRunner {
    rules: Vec<(String, CommandOutput)>,
    calls: RefCell<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub(crate) fn new() -> Self {
        Self {
            rules: Vec::new(),
            calls: RefCell::new(Vec::new()),
        }
    }

    /// Reply to the first command whose line contains `needle`.
    pub(crate) fn on(mut self, needle: &str, exit_code: i32, stdout: &str, stderr: &str) -> Self {
        self.rules.push((
            needle.to_string(),
            CommandOutput {
                exit_code: Some(exit_code),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                elapsed_ms: 0,
            },
        ));
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .map(CommandSpec::command_line)
            .collect()
    }

    pub(crate) fn specs(&self) -> Vec<CommandSpec> {
        self.calls.borrow().clone()
    }

    pub(crate) fn called(&self, needle: &str) -> bool {
        self.calls().iter().any(|line| line.contains(needle))
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let line = spec.command_line();
        self.calls.borrow_mut().push(spec.clone());
        let reply = self
            .rules
            .iter()
            .find(|(needle, _)| line.contains(needle.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or(CommandOutput {
                exit_code: Some(0),
                ..CommandOutput::default()
            });
        Ok(reply)
    }
}
