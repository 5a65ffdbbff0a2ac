//! External command execution.
//!
//! Every stage talks to the host through `CommandRunner` so the sequencer can
//! print instead of execute (`--dry-run`) and tests can script tool replies.
use crate::util::{first_line, truncate_string};
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

#[cfg(test)]
pub(crate) mod scripted;

const MAX_ERROR_DETAIL_BYTES: usize = 400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    /// Build from a configured argv such as `["docker", "compose"]`.
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| anyhow!("command argv must be non-empty"))?;
        Ok(Self::new(program.clone()).args(rest))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    /// Shell-quoted rendering for logs and dry runs.
    pub fn command_line(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.program.as_str());
        words.extend(self.args.iter().map(String::as_str));
        shell_words::join(words)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed_ms: u128,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn status_label(&self) -> String {
        match self.exit_code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

pub trait CommandRunner {
    /// Run to completion. `Err` means the process could not be started;
    /// a non-zero exit is reported through `CommandOutput`.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Runs commands on the local host.
pub struct SystemRunner {
    pub echo: bool,
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let command_line = spec.command_line();
        if self.echo {
            eprintln!(">>> {command_line}");
        }
        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        if let Some(cwd) = spec.cwd.as_ref() {
            command.current_dir(cwd);
        }
        let start = Instant::now();
        let output = command
            .output()
            .with_context(|| format!("run {command_line}"))?;
        let elapsed_ms = start.elapsed().as_millis();
        let exit_code = output.status.code();

        tracing::info!(
            program = %spec.program,
            exit_code = ?exit_code,
            elapsed_ms,
            stdout_bytes = output.stdout.len(),
            stderr_bytes = output.stderr.len(),
            "command complete"
        );

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            elapsed_ms,
        })
    }
}

/// Prints each command and reports success without touching the host.
pub struct DryRunRunner;

impl CommandRunner for DryRunRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        match spec.cwd.as_ref() {
            Some(cwd) => println!("[dry-run] (cd {}) {}", cwd.display(), spec.command_line()),
            None => println!("[dry-run] {}", spec.command_line()),
        }
        Ok(CommandOutput {
            exit_code: Some(0),
            ..CommandOutput::default()
        })
    }
}

/// Run and require exit code 0; the error names the step and the first stderr line.
pub fn run_checked(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
    label: &str,
) -> Result<CommandOutput> {
    let output = runner
        .run(spec)
        .with_context(|| format!("{label}: could not start {}", spec.program))?;
    if !output.success() {
        return Err(anyhow!(
            "{label} failed ({}): {}",
            output.status_label(),
            failure_detail(&output)
        ));
    }
    Ok(output)
}

pub fn failure_detail(output: &CommandOutput) -> String {
    let line = match first_line(&output.stderr) {
        "" => first_line(&output.stdout),
        line => line,
    };
    if line.is_empty() {
        return "no output".to_string();
    }
    truncate_string(line, MAX_ERROR_DETAIL_BYTES)
}
