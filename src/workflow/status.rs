//! Workflow status step.
//!
//! Status reads the deploy root without side effects and names one next
//! action: a command to run, or a file the operator must edit.
use super::{error_chain_message, resolve_deploy_root};
use crate::cli::StatusArgs;
use crate::config::{config_hash, load_config, validate_config, DeployConfig, DeployPaths};
use crate::state::{
    load_state_optional, DeployState, FailureRecord, StageId, StageRecord, StageStatus,
};
use crate::tools::resolve_compose;
use crate::util::now_epoch_ms;
use anyhow::{Context, Result};
use serde::Serialize;

pub const STATUS_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NextAction {
    Command { command: String, reason: String },
    Edit { path: String, reason: String },
    Done { reason: String },
}

#[derive(Debug, Serialize, Clone)]
pub struct StatusSummary {
    pub schema_version: u32,
    pub generated_at_epoch_ms: u128,
    pub deploy_root: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_error: Option<String>,
    pub state: DeployState,
    pub config_stale: bool,
    pub stages: Vec<StageRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<FailureRecord>,
    pub next_action: NextAction,
}

enum ConfigState {
    Missing,
    Valid(Box<DeployConfig>),
    Invalid(String),
}

fn load_config_state(paths: &DeployPaths) -> ConfigState {
    if !paths.config_path().is_file() {
        return ConfigState::Missing;
    }
    match load_config(paths).and_then(|config| validate_config(&config).map(|()| config)) {
        Ok(config) => ConfigState::Valid(Box::new(config)),
        Err(err) => ConfigState::Invalid(error_chain_message(&err)),
    }
}

pub fn build_status_summary(paths: &DeployPaths) -> Result<StatusSummary> {
    let config_state = load_config_state(paths);
    let recorded = load_state_optional(paths)?;
    let current_hash = if paths.config_path().is_file() {
        Some(config_hash(paths)?)
    } else {
        None
    };
    let config_stale = match (recorded.as_ref(), current_hash.as_deref()) {
        (Some(state), Some(hash)) => state
            .config_hash
            .as_deref()
            .is_some_and(|recorded| recorded != hash),
        _ => false,
    };

    let state = recorded
        .as_ref()
        .map(|state| state.state)
        .unwrap_or(DeployState::NotStarted);
    let stages = match recorded.as_ref() {
        Some(state) => state.stages.clone(),
        None => StageId::ALL.into_iter().map(StageRecord::new).collect(),
    };
    let last_failure = recorded.as_ref().and_then(|state| state.last_failure.clone());
    let blocked = recorded
        .as_ref()
        .and_then(|state| state.blocked_stage())
        .and_then(|stage| stages.iter().find(|record| record.stage == stage));

    let root = paths.root().display().to_string();
    let apply = format!("bdeploy apply --deploy-root {}", shell_words::quote(&root));
    let next_action = match &config_state {
        ConfigState::Missing => NextAction::Command {
            command: format!(
                "bdeploy init --deploy-root {} --name <NAME> --repo <URL> --target-dir <PATH> --domain <DOMAIN>",
                shell_words::quote(&root)
            ),
            reason: "deploy.json missing".to_string(),
        },
        ConfigState::Invalid(message) => NextAction::Edit {
            path: paths.config_path().display().to_string(),
            reason: message.clone(),
        },
        ConfigState::Valid(config) => next_action_for(NextActionInputs {
            config,
            apply: &apply,
            state,
            config_stale,
            blocked,
            last_failure: last_failure.as_ref(),
        }),
    };

    Ok(StatusSummary {
        schema_version: STATUS_SCHEMA_VERSION,
        generated_at_epoch_ms: now_epoch_ms()?,
        deploy_root: root,
        name: match &config_state {
            ConfigState::Valid(config) => Some(config.name.clone()),
            _ => None,
        },
        config_error: match &config_state {
            ConfigState::Invalid(message) => Some(message.clone()),
            _ => None,
        },
        state,
        config_stale,
        stages,
        last_failure,
        next_action,
    })
}

struct NextActionInputs<'a> {
    config: &'a DeployConfig,
    apply: &'a str,
    state: DeployState,
    config_stale: bool,
    blocked: Option<&'a StageRecord>,
    last_failure: Option<&'a FailureRecord>,
}

fn next_action_for(inputs: NextActionInputs<'_>) -> NextAction {
    let NextActionInputs {
        config,
        apply,
        state,
        config_stale,
        blocked,
        last_failure,
    } = inputs;

    if config_stale {
        return NextAction::Command {
            command: format!("{apply} --force"),
            reason: "deploy.json changed since the last run".to_string(),
        };
    }
    if let Some(record) = blocked {
        return NextAction::Edit {
            path: config
                .checkout_path(&config.secrets.output)
                .display()
                .to_string(),
            reason: record
                .message
                .clone()
                .unwrap_or_else(|| "fill in the deployment secrets".to_string()),
        };
    }
    if let Some(failure) = last_failure {
        if failure.services_may_be_partial {
            let mut ps = resolve_compose(&config.tools);
            ps.push("-f".to_string());
            ps.push(
                config
                    .checkout_path(&config.compose.file)
                    .display()
                    .to_string(),
            );
            ps.push("ps".to_string());
            return NextAction::Command {
                command: shell_words::join(&ps),
                reason: format!(
                    "{} failed after services were started; inspect them, then rerun `{apply}`",
                    failure.stage
                ),
            };
        }
        return NextAction::Command {
            command: apply.to_string(),
            reason: format!("retry {} after fixing: {}", failure.stage, failure.message),
        };
    }
    match state.next_stage() {
        None => NextAction::Done {
            reason: "deployment complete".to_string(),
        },
        Some(stage) => NextAction::Command {
            command: apply.to_string(),
            reason: format!("resume at {}", stage.display_name()),
        },
    }
}

pub fn run_status(args: &StatusArgs) -> Result<()> {
    let paths = resolve_deploy_root(&args.root)?;
    let summary = build_status_summary(&paths)?;
    if args.json {
        let text = serde_json::to_string_pretty(&summary).context("serialize status summary")?;
        println!("{text}");
    } else {
        print_status(&summary);
    }
    Ok(())
}

fn print_status(summary: &StatusSummary) {
    println!("deploy root: {}", summary.deploy_root);
    if let Some(name) = summary.name.as_ref() {
        println!("name: {name}");
    }
    if let Some(error) = summary.config_error.as_ref() {
        println!("config: invalid ({error})");
    }
    println!(
        "state: {}{}",
        summary.state,
        if summary.config_stale {
            " (config changed since last run)"
        } else {
            ""
        }
    );
    println!("stages:");
    for record in &summary.stages {
        let detail = match (record.duration_ms, record.message.as_deref()) {
            (Some(ms), Some(message)) => format!(" ({ms} ms: {message})"),
            (None, Some(message)) => format!(" ({message})"),
            (Some(ms), None) => format!(" ({ms} ms)"),
            (None, None) => String::new(),
        };
        println!(
            "  - {:<12} {}{detail}",
            record.stage.as_str(),
            record.status.as_str()
        );
    }
    if let Some(failure) = summary.last_failure.as_ref() {
        println!(
            "last failure: {} ({:?}){}: {}",
            failure.stage,
            failure.severity,
            if failure.services_may_be_partial {
                ", services may be partially started"
            } else {
                ""
            },
            failure.message
        );
    }
    let pending = pending_stages(summary);
    if !pending.is_empty() {
        let names: Vec<&str> = pending.iter().map(StageId::as_str).collect();
        println!("remaining: {}", names.join(", "));
    }
    match &summary.next_action {
        NextAction::Command { command, reason } => {
            println!("next: {command}");
            println!("next detail: {reason}");
        }
        NextAction::Edit { path, reason } => {
            println!("next edit: {path}");
            println!("next detail: {reason}");
        }
        NextAction::Done { reason } => println!("next: nothing to do ({reason})"),
    }
}

/// Stage records that still need attention, in pipeline order.
pub fn pending_stages(summary: &StatusSummary) -> Vec<StageId> {
    summary
        .stages
        .iter()
        .filter(|record| !matches!(record.status, StageStatus::Success | StageStatus::Skipped))
        .map(|record| record.stage)
        .collect()
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod tests;
