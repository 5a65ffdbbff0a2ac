//! `bdeploy`: resumable deployment of a compose application behind nginx
//! and certbot.
use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
mod config;
mod exec;
mod stages;
mod staging;
mod state;
mod tools;
mod util;
mod workflow;

use cli::{Command, RootArgs};
use workflow::Decision;

const LOG_ENV: &str = "BDEPLOY_LOG";

fn main() {
    let args = RootArgs::parse();
    init_tracing(args.verbose);

    match run(&args) {
        Ok(Decision::Complete) => {}
        Ok(decision) => {
            tracing::info!(decision = decision.as_str(), "stopped before completion");
            std::process::exit(decision.exit_code());
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "info" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback)))
        .init();
}

fn run(args: &RootArgs) -> Result<Decision> {
    match &args.command {
        Command::Init(args) => workflow::run_init(args).map(|()| Decision::Complete),
        Command::Validate(args) => workflow::run_validate(args).map(|()| Decision::Complete),
        Command::Apply(args) => workflow::run_apply(args),
        Command::Status(args) => workflow::run_status(args).map(|()| Decision::Complete),
        Command::Reset(args) => workflow::run_reset(args).map(|()| Decision::Complete),
    }
}
