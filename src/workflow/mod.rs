//! Command implementations behind the CLI.
//!
//! Each command resolves the deploy root, loads what it needs, and returns a
//! `Decision` the binary maps to its exit code.
mod apply;
mod init;
mod reset;
mod status;
mod validate;

pub(crate) use apply::run_apply;
pub(crate) use init::run_init;
pub(crate) use reset::run_reset;
pub(crate) use status::run_status;
pub(crate) use validate::run_validate;

use crate::cli::RootSelector;
use crate::config::DeployPaths;
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// How a command finished when it did not fail outright.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Complete,
    /// Waiting on an operator edit (the secrets gate).
    Blocked,
    /// Stopped after a non-fatal stage failure; the application keeps serving.
    Halted,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Complete => "complete",
            Decision::Blocked => "blocked",
            Decision::Halted => "halted",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Decision::Complete => 0,
            Decision::Blocked | Decision::Halted => 2,
        }
    }
}

pub(crate) fn resolve_deploy_root(selector: &RootSelector) -> Result<DeployPaths> {
    deploy_root_from(selector.deploy_root.as_deref(), selector.name.as_deref())
}

/// Explicit root wins; otherwise `<data dir>/bdeploy/<name>`.
pub(crate) fn deploy_root_from(explicit: Option<&Path>, name: Option<&str>) -> Result<DeployPaths> {
    if let Some(path) = explicit {
        return Ok(DeployPaths::new(path.to_path_buf()));
    }
    let name = name.ok_or_else(|| anyhow!("pass --deploy-root <DIR> or --name <NAME>"))?;
    let data_dir: PathBuf = dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow!("cannot determine a data directory; pass --deploy-root"))?;
    Ok(DeployPaths::new(data_dir.join("bdeploy").join(name)))
}

/// Full `anyhow` chain on one line, as stored in `last_failure`.
pub(crate) fn error_chain_message(err: &anyhow::Error) -> String {
    format!("{err:#}")
}
