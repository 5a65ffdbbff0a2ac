//! Workflow apply step: drive the stages from the recorded state.
//!
//! State is written before and after every stage, so an interrupted or failed
//! run resumes at the stage that did not finish. Dry runs share the same loop
//! but print commands and persist nothing.
use super::{error_chain_message, resolve_deploy_root, Decision};
use crate::cli::ApplyArgs;
use crate::config::{config_hash, load_config, validate_config, DeployConfig, DeployPaths};
use crate::exec::{CommandRunner, DryRunRunner, SystemRunner};
use crate::stages::{run_stage, PartialServices, StageContext, StageOutcome};
use crate::state::{
    append_history, fresh_state, load_state_optional, write_state, DeployState, DeployStateFile,
    FailureRecord, FailureSeverity, HistoryEntry, StageId, StageStatus, HISTORY_SCHEMA_VERSION,
};
use crate::tools::resolve_compose;
use crate::util::now_epoch_ms;
use anyhow::{anyhow, Result};
use std::fs;
use std::time::Instant;

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ApplyRequest {
    pub dry_run: bool,
    pub force: bool,
    pub from: Option<StageId>,
    pub only: Option<StageId>,
}

/// The host-facing pieces a run needs besides config and state.
pub(crate) struct ApplyHost<'a> {
    pub runner: &'a dyn CommandRunner,
    pub probe: &'a dyn CommandRunner,
    pub compose: &'a [String],
}

pub(crate) fn run_apply(args: &ApplyArgs) -> Result<Decision> {
    let paths = resolve_deploy_root(&args.root)?;
    let config = load_config(&paths)?;
    validate_config(&config)?;
    let compose = resolve_compose(&config.tools);
    let request = ApplyRequest {
        dry_run: args.dry_run,
        force: args.force,
        from: args.from,
        only: args.only,
    };

    let system = SystemRunner { echo: true };
    let runner: &dyn CommandRunner = if args.dry_run { &DryRunRunner } else { &system };
    let host = ApplyHost {
        runner,
        probe: &system,
        compose: &compose,
    };
    apply_with_host(&paths, &config, &request, &host)
}

pub(crate) fn apply_with_host(
    paths: &DeployPaths,
    config: &DeployConfig,
    request: &ApplyRequest,
    host: &ApplyHost<'_>,
) -> Result<Decision> {
    let started = Instant::now();
    let hash = config_hash(paths)?;
    let mut state = match load_state_optional(paths)? {
        Some(state) => state,
        None => fresh_state(Some(hash.clone()))?,
    };
    let stale = state
        .config_hash
        .as_deref()
        .is_some_and(|recorded| recorded != hash);
    if stale && !request.force {
        return Err(anyhow!(
            "{} changed since the recorded {} state; pass --force to resume with the new config or run `bdeploy reset`",
            paths.config_path().display(),
            state.state
        ));
    }
    let force_used = stale && request.force;
    state.config_hash = Some(hash);

    if let Some(stage) = request.from {
        state.rewind_to(stage.required_state())?;
    }
    let stages = stages_to_run(&state, request.only)?;
    if stages.is_empty() {
        println!("deployment already complete ({})", state.state);
        return Ok(Decision::Complete);
    }

    let txn_id = now_epoch_ms()?.to_string();
    let ctx = StageContext {
        config,
        paths,
        runner: host.runner,
        probe: host.probe,
        compose: host.compose,
        txn_id: &txn_id,
        dry_run: request.dry_run,
    };
    let mut run = StageRun {
        paths,
        state: &mut state,
        persist: !request.dry_run,
        force_used,
    };

    let mut outcome = Ok(Decision::Complete);
    for stage in stages {
        outcome = run.execute(stage, &ctx);
        if !matches!(outcome, Ok(Decision::Complete)) {
            break;
        }
    }
    cleanup_txn_dirs(paths, &txn_id);
    let decision = outcome?;
    if decision != Decision::Complete {
        return Ok(decision);
    }

    tracing::info!(
        state = %run.state.state,
        elapsed_ms = started.elapsed().as_millis(),
        dry_run = request.dry_run,
        "apply complete"
    );
    if request.dry_run {
        println!("dry run complete; nothing was changed");
    } else {
        println!("deployment state: {}", run.state.state);
    }
    Ok(Decision::Complete)
}

/// Drop the transaction dir once its backups are gone; kept backups stay.
fn cleanup_txn_dirs(paths: &DeployPaths, txn_id: &str) {
    let txn_root = paths.txns_root().join(txn_id);
    if txn_root.is_dir() {
        if let Err(err) = fs::remove_dir(&txn_root) {
            tracing::warn!(path = %txn_root.display(), %err, "transaction dir kept");
        }
    }
    let txns_root = paths.txns_root();
    if let Ok(mut entries) = fs::read_dir(&txns_root) {
        if entries.next().is_none() {
            if let Err(err) = fs::remove_dir(&txns_root) {
                tracing::debug!(path = %txns_root.display(), %err, "transactions root kept");
            }
        }
    }
}

fn stages_to_run(state: &DeployStateFile, only: Option<StageId>) -> Result<Vec<StageId>> {
    if let Some(stage) = only {
        if state.state < stage.required_state() {
            return Err(anyhow!(
                "cannot run {stage} alone: it requires state {} but the deployment is at {}",
                stage.required_state(),
                state.state
            ));
        }
        return Ok(vec![stage]);
    }
    Ok(StageId::ALL
        .into_iter()
        .filter(|stage| stage.required_state() >= state.state)
        .collect())
}

struct StageRun<'a> {
    paths: &'a DeployPaths,
    state: &'a mut DeployStateFile,
    persist: bool,
    force_used: bool,
}

impl StageRun<'_> {
    /// Run one stage; `Err` only for fatal failures.
    fn execute(&mut self, stage: StageId, ctx: &StageContext<'_>) -> Result<Decision> {
        let from = self.state.state;
        let started_at = now_epoch_ms()?;
        eprintln!("==> {} ({stage})", stage.display_name());
        self.state.record_mut(stage).start(started_at);
        self.save()?;

        let result = run_stage(stage, ctx);
        let finished_at = now_epoch_ms()?;
        let (status, message, decision) = match result {
            Ok(StageOutcome::Completed { message, warnings }) => {
                for warning in &warnings {
                    tracing::warn!(stage = %stage, %warning, "stage warning");
                    eprintln!("warning: {warning}");
                }
                self.succeed(stage);
                if stage == StageId::Proxy && self.state.state > stage.reached_state() {
                    // The reinstalled site dropped certbot's TLS directives.
                    self.state.rewind_to(stage.reached_state())?;
                }
                (StageStatus::Success, message, Decision::Complete)
            }
            Ok(StageOutcome::Skipped { reason }) => {
                self.succeed(stage);
                (StageStatus::Skipped, reason, Decision::Complete)
            }
            Ok(StageOutcome::Blocked { reason, path }) => {
                eprintln!("blocked: {reason}");
                eprintln!("edit {} and rerun apply", path.display());
                (StageStatus::Blocked, reason, Decision::Blocked)
            }
            Err(err) => {
                let severity = stage.failure_severity();
                let message = error_chain_message(&err);
                let partial = err.downcast_ref::<PartialServices>().is_some();
                self.state.last_failure = Some(FailureRecord {
                    stage,
                    severity,
                    message: message.clone(),
                    services_may_be_partial: partial,
                    at_epoch_ms: finished_at,
                });
                self.finish(stage, from, StageStatus::Failed, message, started_at, finished_at)?;
                tracing::warn!(stage = %stage, ?severity, partial, "stage failed");
                return match severity {
                    FailureSeverity::Fatal => Err(err),
                    FailureSeverity::NonFatal => {
                        eprintln!("error: {err:#}");
                        eprintln!("the application keeps serving; fix the cause and rerun apply");
                        Ok(Decision::Halted)
                    }
                };
            }
        };

        println!("{}: {} ({message})", stage, status.as_str());
        self.finish(stage, from, status, message, started_at, finished_at)?;
        tracing::info!(
            stage = %stage,
            from = %from,
            to = %self.state.state,
            elapsed_ms = finished_at.saturating_sub(started_at),
            "stage complete"
        );
        Ok(decision)
    }

    fn succeed(&mut self, stage: StageId) {
        self.state.advance(stage.reached_state());
        if self
            .state
            .last_failure
            .as_ref()
            .is_some_and(|failure| failure.stage == stage)
        {
            self.state.last_failure = None;
        }
    }

    fn finish(
        &mut self,
        stage: StageId,
        from: DeployState,
        status: StageStatus,
        message: String,
        started_at: u128,
        finished_at: u128,
    ) -> Result<()> {
        self.state
            .record_mut(stage)
            .finish(status, Some(message.clone()), finished_at);
        self.state.updated_at_epoch_ms = finished_at;
        self.save()?;
        if self.persist {
            append_history(
                self.paths,
                &HistoryEntry {
                    schema_version: HISTORY_SCHEMA_VERSION,
                    started_at_epoch_ms: started_at,
                    finished_at_epoch_ms: finished_at,
                    stage,
                    from,
                    to: self.state.state,
                    status,
                    message: Some(message),
                    force_used: self.force_used,
                },
            )?;
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        if self.persist {
            write_state(self.paths, self.state)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "apply_tests.rs"]
mod tests;
