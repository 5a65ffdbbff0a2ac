use super::StageContext;
use crate::config::{default_config, ConfigSeed, DeployConfig, DeployPaths};
use crate::exec::CommandRunner;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

pub(crate) const REPO_URL: &str = "https://git.example.com/booking.git";

/// A deploy root, checkout and nginx/letsencrypt dirs under one temp dir.
pub(crate) struct Fixture {
    pub(crate) dir: TempDir,
    pub(crate) config: DeployConfig,
    pub(crate) paths: DeployPaths,
    pub(crate) compose: Vec<String>,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let root = dir.path().to_path_buf();
        let domains = vec!["example.com".to_string(), "www.example.com".to_string()];
        let target_dir = root.join("checkout");
        let mut config = default_config(&ConfigSeed {
            name: "booking",
            repository_url: REPO_URL,
            branch: None,
            target_dir: &target_dir,
            domains: &domains,
            email: None,
        });
        config.secrets.required_keys = vec!["POSTGRES_PASSWORD".into(), "SECRET_KEY".into()];
        config.compose.launch_timeout_seconds = 0;
        config.proxy.sites_available = root.join("nginx/sites-available");
        config.proxy.sites_enabled = root.join("nginx/sites-enabled");
        config.certificate.live_dir = root.join("letsencrypt/live");
        config.certificate.verify_https = false;
        let paths = DeployPaths::new(root.join("deploy-root"));
        Self {
            dir,
            config,
            paths,
            compose: vec!["docker".into(), "compose".into()],
        }
    }

    pub(crate) fn ctx<'a>(&'a self, runner: &'a dyn CommandRunner) -> StageContext<'a> {
        StageContext {
            config: &self.config,
            paths: &self.paths,
            runner,
            probe: runner,
            compose: &self.compose,
            txn_id: "test-txn",
            dry_run: false,
        }
    }

    pub(crate) fn write_checkout_file(&self, rel: &str, contents: &str) -> PathBuf {
        let path = self.config.checkout_path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create checkout dir");
        }
        fs::write(&path, contents).expect("write checkout file");
        path
    }

    pub(crate) fn root(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }
}
