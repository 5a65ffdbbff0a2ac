//! Host tool resolution for `validate` and the compose argv used by `apply`.
use crate::config::{DeployConfig, ToolsConfig};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Configured compose argv, else standalone `docker-compose` when on PATH,
/// else the docker CLI plugin.
pub fn resolve_compose(tools: &ToolsConfig) -> Vec<String> {
    if let Some(argv) = tools.compose.as_ref() {
        return argv.clone();
    }
    if which::which("docker-compose").is_ok() {
        return vec!["docker-compose".to_string()];
    }
    vec![tools.docker.clone(), "compose".to_string()]
}

#[derive(Debug, Serialize, Clone)]
pub struct ToolCheck {
    pub role: &'static str,
    pub program: String,
    pub resolved: Option<PathBuf>,
}

impl ToolCheck {
    fn lookup(role: &'static str, program: &str) -> Self {
        Self {
            role,
            program: program.to_string(),
            resolved: which::which(program).ok(),
        }
    }
}

/// Look up every program a full deploy will invoke.
pub fn check_tools(config: &DeployConfig, compose: &[String]) -> Vec<ToolCheck> {
    let tools = &config.tools;
    let mut checks = vec![ToolCheck::lookup("git", &tools.git)];
    if let Some(program) = compose.first() {
        checks.push(ToolCheck::lookup("compose", program));
    }
    checks.push(ToolCheck::lookup("nginx", &tools.nginx));
    if let Some(program) = tools.reload.first() {
        checks.push(ToolCheck::lookup("reload", program));
    }
    checks.push(ToolCheck::lookup("certbot", &tools.certbot));
    checks
}

pub fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Host paths the proxy and certificate stages write under.
pub fn privileged_paths(config: &DeployConfig) -> Vec<&Path> {
    [
        config.proxy.sites_available.as_path(),
        config.proxy.sites_enabled.as_path(),
        config.certificate.live_dir.as_path(),
    ]
    .into_iter()
    .filter(|path| path.starts_with("/etc"))
    .collect()
}
