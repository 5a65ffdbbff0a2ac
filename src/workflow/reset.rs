//! Workflow reset step: rewind `state.json`. The host is never touched.
use super::resolve_deploy_root;
use crate::cli::ResetArgs;
use crate::config::{config_hash, DeployPaths};
use crate::state::{load_state_optional, write_state, DeployState, StageId};
use crate::util::now_epoch_ms;
use anyhow::Result;

pub fn run_reset(args: &ResetArgs) -> Result<()> {
    let paths = resolve_deploy_root(&args.root)?;
    match reset_state(&paths, args.to)? {
        Some((from, to)) => println!("state: {from} -> {to}"),
        None => println!("no state recorded at {}", paths.state_path().display()),
    }
    Ok(())
}

/// Rewind to `NotStarted`, or to the state preceding `to`, and adopt the
/// current config hash.
fn reset_state(
    paths: &DeployPaths,
    to: Option<StageId>,
) -> Result<Option<(DeployState, DeployState)>> {
    let Some(mut state) = load_state_optional(paths)? else {
        return Ok(None);
    };
    let from = state.state;
    let target = to
        .map(|stage| stage.required_state())
        .unwrap_or(DeployState::NotStarted);
    state.rewind_to(target)?;
    if paths.config_path().is_file() {
        state.config_hash = Some(config_hash(paths)?);
    }
    state.updated_at_epoch_ms = now_epoch_ms()?;
    write_state(paths, &state)?;
    tracing::info!(from = %from, to = %target, "state reset");
    Ok(Some((from, target)))
}
