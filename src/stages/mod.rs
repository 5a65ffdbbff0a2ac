//! The deployment stages.
//!
//! Each stage checks its own precondition first so reruns are safe, then
//! drives the external tools through the context's runners.
use crate::config::{DeployConfig, DeployPaths};
use crate::exec::{CommandRunner, CommandSpec};
use crate::state::StageId;
use anyhow::Result;
use std::fmt;
use std::path::PathBuf;

mod certificate;
mod compose;
mod probe;
mod proxy;
mod secrets;
mod source;

pub(crate) use certificate::issue_certificate;
pub(crate) use compose::{apply_migration, launch_services};
pub(crate) use proxy::activate_reverse_proxy;
pub(crate) use secrets::provision_secrets;
pub(crate) use source::acquire_source;

#[cfg(test)]
pub(crate) mod test_support;

pub(crate) struct StageContext<'a> {
    pub(crate) config: &'a DeployConfig,
    pub(crate) paths: &'a DeployPaths,
    /// Runs commands that change the host; prints them under `--dry-run`.
    pub(crate) runner: &'a dyn CommandRunner,
    /// Runs read-only queries (`remote get-url`, `ps`); always executes.
    pub(crate) probe: &'a dyn CommandRunner,
    /// Resolved compose argv prefix, e.g. `["docker", "compose"]`.
    pub(crate) compose: &'a [String],
    pub(crate) txn_id: &'a str,
    pub(crate) dry_run: bool,
}

impl StageContext<'_> {
    pub(crate) fn checkout_path(&self, rel: &str) -> PathBuf {
        self.config.checkout_path(rel)
    }

    pub(crate) fn compose_command<I, S>(&self, args: I) -> Result<CommandSpec>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let file = self.checkout_path(&self.config.compose.file);
        Ok(CommandSpec::from_argv(self.compose)?
            .arg("-f")
            .arg(file.display().to_string())
            .args(args)
            .current_dir(&self.config.target_dir))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StageOutcome {
    Completed {
        message: String,
        warnings: Vec<String>,
    },
    /// The precondition already holds; nothing was run.
    Skipped { reason: String },
    /// Halted until an operator edits `path`.
    Blocked { reason: String, path: PathBuf },
}

impl StageOutcome {
    pub(crate) fn completed(message: impl Into<String>) -> Self {
        Self::Completed {
            message: message.into(),
            warnings: Vec::new(),
        }
    }

    pub(crate) fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    pub(crate) fn with_warnings(self, extra: Vec<String>) -> Self {
        match self {
            Self::Completed {
                message,
                mut warnings,
            } => {
                warnings.extend(extra);
                Self::Completed { message, warnings }
            }
            other => other,
        }
    }
}

/// Error context marking a failure after `up` was issued.
#[derive(Debug)]
pub(crate) struct PartialServices;

impl fmt::Display for PartialServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("services may be partially started")
    }
}

pub(crate) fn run_stage(stage: StageId, ctx: &StageContext<'_>) -> Result<StageOutcome> {
    match stage {
        StageId::Source => acquire_source(ctx),
        StageId::Secrets => provision_secrets(ctx),
        StageId::Launch => launch_services(ctx),
        StageId::Migrate => apply_migration(ctx),
        StageId::Proxy => activate_reverse_proxy(ctx),
        StageId::Certificate => issue_certificate(ctx),
    }
}
