//! Workflow validate step: preflight checks that never write.
use super::resolve_deploy_root;
use crate::cli::ValidateArgs;
use crate::config::{load_config, validate_config, DeployConfig};
use crate::tools::{check_tools, privileged_paths, resolve_compose, running_as_root, ToolCheck};
use anyhow::{anyhow, Result};

pub fn run_validate(args: &ValidateArgs) -> Result<()> {
    let paths = resolve_deploy_root(&args.root)?;
    let config = load_config(&paths)?;
    validate_config(&config)?;
    println!("config: {} (valid)", paths.config_path().display());

    let compose = resolve_compose(&config.tools);
    println!("compose: {}", shell_words::join(&compose));
    let checks = check_tools(&config, &compose);
    for check in &checks {
        match check.resolved.as_ref() {
            Some(path) => println!("tool {}: {} ({})", check.role, check.program, path.display()),
            None => println!("tool {}: {} (not found on PATH)", check.role, check.program),
        }
    }
    for warning in preflight_warnings(&config, running_as_root()) {
        eprintln!("warning: {warning}");
    }

    let missing = missing_tools(&checks);
    if !missing.is_empty() {
        return Err(anyhow!("tools not found on PATH: {}", missing.join(", ")));
    }
    Ok(())
}

fn missing_tools(checks: &[ToolCheck]) -> Vec<String> {
    checks
        .iter()
        .filter(|check| check.resolved.is_none())
        .map(|check| format!("{} ({})", check.program, check.role))
        .collect()
}

fn preflight_warnings(config: &DeployConfig, is_root: bool) -> Vec<String> {
    if is_root {
        return Vec::new();
    }
    privileged_paths(config)
        .into_iter()
        .map(|path| {
            format!(
                "not running as root; writing under {} will likely fail",
                path.display()
            )
        })
        .collect()
}
