//! Workflow init step: write a default `deploy.json`.
use super::deploy_root_from;
use crate::cli::InitArgs;
use crate::config::{default_config, validate_config, write_config, ConfigSeed};
use anyhow::{anyhow, Context, Result};
use std::fs;

pub fn run_init(args: &InitArgs) -> Result<()> {
    let paths = deploy_root_from(args.deploy_root.as_deref(), Some(args.name.as_str()))?;
    let config_path = paths.config_path();
    if config_path.is_file() && !args.force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            config_path.display()
        ));
    }

    let config = default_config(&ConfigSeed {
        name: &args.name,
        repository_url: &args.repo,
        branch: args.branch.as_deref(),
        target_dir: &args.target_dir,
        domains: &args.domains,
        email: args.email.as_deref(),
    });
    validate_config(&config).context("refusing to write an invalid config")?;

    fs::create_dir_all(paths.root())
        .with_context(|| format!("create deploy root {}", paths.root().display()))?;
    write_config(&paths, &config)?;
    tracing::info!(path = %config_path.display(), "config written");
    println!("wrote {}", config_path.display());
    Ok(())
}
