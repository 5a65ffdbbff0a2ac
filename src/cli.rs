//! CLI argument parsing for the deployment sequencer.
//!
//! The CLI stays thin: every command resolves a deploy root and hands off to
//! `workflow`.
use crate::state::StageId;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "bdeploy",
    version,
    about = "Resumable deployment of a compose application behind nginx and certbot",
    after_help = "Commands:\n  init --deploy-root <dir> ...   Write a default deploy.json\n  validate --deploy-root <dir>   Check config and host tools (writes nothing)\n  apply --deploy-root <dir>      Run or resume the deployment\n  status --deploy-root <dir>     Show state and next action\n  reset --deploy-root <dir>      Rewind recorded state (host untouched)\n\nExamples:\n  bdeploy init --deploy-root /var/lib/bdeploy/booking --name booking \\\n    --repo https://git.example.com/booking.git --target-dir /srv/booking \\\n    --domain example.com --domain www.example.com\n  bdeploy apply --deploy-root /var/lib/bdeploy/booking\n  bdeploy apply --deploy-root /var/lib/bdeploy/booking --only proxy\n  bdeploy status --deploy-root /var/lib/bdeploy/booking --json",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// Log stage progress and every external command at info level
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Init(InitArgs),
    Validate(ValidateArgs),
    Apply(ApplyArgs),
    Status(StatusArgs),
    Reset(ResetArgs),
}

/// Where the deploy root lives: explicit, or derived from a deployment name.
#[derive(Args, Debug, Clone)]
pub struct RootSelector {
    /// Directory holding deploy.json, state.json and history.jsonl
    #[arg(long, value_name = "DIR", conflicts_with = "name")]
    pub deploy_root: Option<PathBuf>,

    /// Deployment name; the root defaults to <data dir>/bdeploy/<name>
    #[arg(long, value_name = "NAME")]
    pub name: Option<String>,
}

#[derive(Parser, Debug)]
#[command(about = "Write a default deploy.json")]
pub struct InitArgs {
    /// Directory to create deploy.json in
    #[arg(long, value_name = "DIR")]
    pub deploy_root: Option<PathBuf>,

    /// Deployment name (also the nginx site name)
    #[arg(long, value_name = "NAME")]
    pub name: String,

    /// Repository URL to clone
    #[arg(long, value_name = "URL")]
    pub repo: String,

    /// Branch to check out instead of the remote default
    #[arg(long, value_name = "BRANCH")]
    pub branch: Option<String>,

    /// Absolute checkout directory on the host
    #[arg(long, value_name = "PATH")]
    pub target_dir: PathBuf,

    /// Domain for the certificate; repeat for each name, primary first
    #[arg(long = "domain", value_name = "DOMAIN", required = true)]
    pub domains: Vec<String>,

    /// Contact email for the certificate authority
    #[arg(long, value_name = "EMAIL")]
    pub email: Option<String>,

    /// Overwrite an existing deploy.json
    #[arg(long)]
    pub force: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Validate deploy.json and resolve host tools without writing")]
pub struct ValidateArgs {
    #[command(flatten)]
    pub root: RootSelector,
}

#[derive(Parser, Debug)]
#[command(about = "Run the deployment from the recorded state")]
pub struct ApplyArgs {
    #[command(flatten)]
    pub root: RootSelector,

    /// Print every command instead of running it; state is not persisted
    #[arg(long)]
    pub dry_run: bool,

    /// Resume even though deploy.json changed since the last run (recorded in history)
    #[arg(long)]
    pub force: bool,

    /// Rewind to just before this stage and continue from there
    #[arg(long, value_enum, value_name = "STAGE", conflicts_with = "only")]
    pub from: Option<StageId>,

    /// Run exactly this stage; its predecessor state must have been reached
    #[arg(long, value_enum, value_name = "STAGE")]
    pub only: Option<StageId>,
}

#[derive(Parser, Debug)]
#[command(about = "Summarize deployment state and next action")]
pub struct StatusArgs {
    #[command(flatten)]
    pub root: RootSelector,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Rewind recorded state; never touches the host")]
pub struct ResetArgs {
    #[command(flatten)]
    pub root: RootSelector,

    /// Rewind to the state preceding this stage instead of not_started
    #[arg(long, value_enum, value_name = "STAGE")]
    pub to: Option<StageId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_accepts_stage_names() {
        let args = RootArgs::try_parse_from([
            "bdeploy",
            "apply",
            "--deploy-root",
            "/var/lib/bdeploy/booking",
            "--only",
            "proxy",
            "--verbose",
        ])
        .expect("parse");
        assert!(args.verbose);
        match args.command {
            Command::Apply(apply) => {
                assert_eq!(apply.only, Some(StageId::Proxy));
                assert!(!apply.dry_run);
            }
            other => panic!("expected apply, got {other:?}"),
        }
    }

    #[test]
    fn from_and_only_conflict() {
        let err = RootArgs::try_parse_from([
            "bdeploy", "apply", "--name", "booking", "--from", "launch", "--only", "proxy",
        ])
        .expect_err("conflict");
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn init_collects_repeated_domains() {
        let args = RootArgs::try_parse_from([
            "bdeploy",
            "init",
            "--name",
            "booking",
            "--repo",
            "https://git.example.com/booking.git",
            "--target-dir",
            "/srv/booking",
            "--domain",
            "example.com",
            "--domain",
            "www.example.com",
        ])
        .expect("parse");
        let Command::Init(init) = args.command else {
            panic!("expected init");
        };
        assert_eq!(init.domains, vec!["example.com", "www.example.com"]);
        assert!(init.deploy_root.is_none());
    }
}
