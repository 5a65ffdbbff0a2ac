//! Deployment configuration (`deploy.json`) and deploy-root layout.
//!
//! The config is parsed strictly so a typo in a key fails loudly instead of
//! silently falling back to a default path on the host.
use crate::util::{sha256_hex, write_atomic};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};

pub const CONFIG_SCHEMA_VERSION: u32 = 1;
pub const CONFIG_FILE_NAME: &str = "deploy.json";

pub const DEFAULT_SECRETS_TEMPLATE_REL: &str = "infra/.env.example";
pub const DEFAULT_SECRETS_OUTPUT_REL: &str = "infra/.env";
pub const DEFAULT_COMPOSE_FILE_REL: &str = "infra/docker-compose.yml";
pub const DEFAULT_MIGRATION_SERVICE: &str = "app";
pub const DEFAULT_MIGRATION_COMMAND: &str = "alembic upgrade head";
pub const DEFAULT_REVISION_COMMAND: &str = "alembic current";
pub const DEFAULT_LAUNCH_TIMEOUT_SECONDS: u64 = 60;
pub const MAX_LAUNCH_TIMEOUT_SECONDS: u64 = 3600;
pub const DEFAULT_SITES_AVAILABLE: &str = "/etc/nginx/sites-available";
pub const DEFAULT_SITES_ENABLED: &str = "/etc/nginx/sites-enabled";
pub const DEFAULT_CERT_LIVE_DIR: &str = "/etc/letsencrypt/live";

/// Keys the booking service requires in its `.env` at startup (settings
/// without a default).
pub const BOOKING_REQUIRED_ENV_KEYS: &[&str] = &[
    "POSTGRES_DB",
    "POSTGRES_USER",
    "POSTGRES_PASSWORD",
    "POSTGRES_PORT",
    "POSTGRES_HOST",
    "REDIS_HOST",
    "REDIS_PORT",
    "REDIS_DB",
    "REDIS_CACHE_TTL",
    "LOG_LEVEL",
    "LOG_ROTATION",
    "LOG_RETENTION",
    "SECRET_KEY",
    "RABBITMQ_DEFAULT_USER",
    "RABBITMQ_DEFAULT_PASS",
    "RABBITMQ_DEFAULT_VHOST",
    "RABBITMQ_DEFAULT_HOST",
    "RABBITMQ_DEFAULT_PORT",
    "ADMIN_USERNAME",
    "ADMIN_EMAIL",
    "ADMIN_PHONE",
    "ADMIN_TG_ID",
    "ADMIN_PASSWORD",
];

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DeployConfig {
    pub schema_version: u32,
    pub name: String,
    pub repository: RepositoryConfig,
    pub target_dir: PathBuf,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub compose: ComposeConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    pub certificate: CertificateConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RepositoryConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SecretsConfig {
    #[serde(default = "default_secrets_template")]
    pub template: String,
    #[serde(default = "default_secrets_output")]
    pub output: String,
    #[serde(default = "default_required_keys")]
    pub required_keys: Vec<String>,
    #[serde(default)]
    pub allow_unedited: bool,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            template: default_secrets_template(),
            output: default_secrets_output(),
            required_keys: default_required_keys(),
            allow_unedited: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ComposeConfig {
    #[serde(default = "default_compose_file")]
    pub file: String,
    #[serde(default = "default_migration_service")]
    pub service: String,
    #[serde(default = "default_migration_command")]
    pub migration_command: String,
    #[serde(default = "default_revision_command")]
    pub revision_command: Option<String>,
    /// Services that must report running; empty means every service in the file.
    #[serde(default)]
    pub expected_services: Vec<String>,
    #[serde(default = "default_launch_timeout")]
    pub launch_timeout_seconds: u64,
    #[serde(default)]
    pub health_checks: Vec<String>,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            file: default_compose_file(),
            service: default_migration_service(),
            migration_command: default_migration_command(),
            revision_command: default_revision_command(),
            expected_services: Vec::new(),
            launch_timeout_seconds: default_launch_timeout(),
            health_checks: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Site config inside the checkout; defaults to `infra/nginx/<name>.conf`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_config: Option<String>,
    #[serde(default = "default_sites_available")]
    pub sites_available: PathBuf,
    #[serde(default = "default_sites_enabled")]
    pub sites_enabled: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            source_config: None,
            sites_available: default_sites_available(),
            sites_enabled: default_sites_enabled(),
            site_name: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct CertificateConfig {
    pub domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default = "default_true")]
    pub redirect: bool,
    #[serde(default = "default_cert_live_dir")]
    pub live_dir: PathBuf,
    #[serde(default = "default_true")]
    pub verify_https: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ToolsConfig {
    #[serde(default = "default_git")]
    pub git: String,
    #[serde(default = "default_docker")]
    pub docker: String,
    /// Explicit compose argv prefix; detected from PATH when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose: Option<Vec<String>>,
    #[serde(default = "default_nginx")]
    pub nginx: String,
    #[serde(default = "default_reload")]
    pub reload: Vec<String>,
    #[serde(default = "default_certbot")]
    pub certbot: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            git: default_git(),
            docker: default_docker(),
            compose: None,
            nginx: default_nginx(),
            reload: default_reload(),
            certbot: default_certbot(),
        }
    }
}

fn default_secrets_template() -> String {
    DEFAULT_SECRETS_TEMPLATE_REL.to_string()
}

fn default_secrets_output() -> String {
    DEFAULT_SECRETS_OUTPUT_REL.to_string()
}

fn default_required_keys() -> Vec<String> {
    BOOKING_REQUIRED_ENV_KEYS
        .iter()
        .map(|key| key.to_string())
        .collect()
}

fn default_compose_file() -> String {
    DEFAULT_COMPOSE_FILE_REL.to_string()
}

fn default_migration_service() -> String {
    DEFAULT_MIGRATION_SERVICE.to_string()
}

fn default_migration_command() -> String {
    DEFAULT_MIGRATION_COMMAND.to_string()
}

fn default_revision_command() -> Option<String> {
    Some(DEFAULT_REVISION_COMMAND.to_string())
}

fn default_launch_timeout() -> u64 {
    DEFAULT_LAUNCH_TIMEOUT_SECONDS
}

fn default_sites_available() -> PathBuf {
    PathBuf::from(DEFAULT_SITES_AVAILABLE)
}

fn default_sites_enabled() -> PathBuf {
    PathBuf::from(DEFAULT_SITES_ENABLED)
}

fn default_cert_live_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CERT_LIVE_DIR)
}

fn default_true() -> bool {
    true
}

fn default_git() -> String {
    "git".to_string()
}

fn default_docker() -> String {
    "docker".to_string()
}

fn default_nginx() -> String {
    "nginx".to_string()
}

fn default_reload() -> Vec<String> {
    vec![
        "systemctl".to_string(),
        "reload".to_string(),
        "nginx".to_string(),
    ]
}

fn default_certbot() -> String {
    "certbot".to_string()
}

impl DeployConfig {
    /// Resolve a checkout-relative path against `target_dir`.
    pub fn checkout_path(&self, rel: &str) -> PathBuf {
        self.target_dir.join(rel)
    }

    pub fn site_name(&self) -> &str {
        self.proxy.site_name.as_deref().unwrap_or(&self.name)
    }

    pub fn proxy_source_rel(&self) -> String {
        match self.proxy.source_config.as_deref() {
            Some(rel) => rel.to_string(),
            None => format!("infra/nginx/{}.conf", self.name),
        }
    }

    pub fn primary_domain(&self) -> Result<&str> {
        self.certificate
            .domains
            .first()
            .map(String::as_str)
            .ok_or_else(|| anyhow!("certificate.domains must list at least one domain"))
    }

    pub fn migration_argv(&self) -> Result<Vec<String>> {
        split_command(&self.compose.migration_command, "compose.migration_command")
    }

    pub fn revision_argv(&self) -> Result<Option<Vec<String>>> {
        self.compose
            .revision_command
            .as_deref()
            .map(|command| split_command(command, "compose.revision_command"))
            .transpose()
    }
}

/// Inputs for a freshly bootstrapped config.
pub struct ConfigSeed<'a> {
    pub name: &'a str,
    pub repository_url: &'a str,
    pub branch: Option<&'a str>,
    pub target_dir: &'a Path,
    pub domains: &'a [String],
    pub email: Option<&'a str>,
}

pub fn default_config(seed: &ConfigSeed<'_>) -> DeployConfig {
    DeployConfig {
        schema_version: CONFIG_SCHEMA_VERSION,
        name: seed.name.to_string(),
        repository: RepositoryConfig {
            url: seed.repository_url.to_string(),
            branch: seed.branch.map(str::to_string),
        },
        target_dir: seed.target_dir.to_path_buf(),
        secrets: SecretsConfig::default(),
        compose: ComposeConfig::default(),
        proxy: ProxyConfig::default(),
        certificate: CertificateConfig {
            domains: seed.domains.to_vec(),
            email: seed.email.map(str::to_string),
            redirect: true,
            live_dir: default_cert_live_dir(),
            verify_https: true,
        },
        tools: ToolsConfig::default(),
    }
}

/// On-disk layout of a deploy root.
#[derive(Debug, Clone)]
pub struct DeployPaths {
    root: PathBuf,
}

impl DeployPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn history_path(&self) -> PathBuf {
        self.root.join("history.jsonl")
    }

    pub fn txns_root(&self) -> PathBuf {
        self.root.join("txns")
    }

    pub fn txn_backup_root(&self, txn_id: &str) -> PathBuf {
        self.txns_root().join(txn_id).join("backup")
    }
}

pub fn load_config(paths: &DeployPaths) -> Result<DeployConfig> {
    let path = paths.config_path();
    let bytes = fs::read(&path).with_context(|| format!("read config {}", path.display()))?;
    let config: DeployConfig =
        serde_json::from_slice(&bytes).context("parse deploy config JSON")?;
    Ok(config)
}

pub fn write_config(paths: &DeployPaths, config: &DeployConfig) -> Result<()> {
    let text = serde_json::to_string_pretty(config).context("serialize deploy config")?;
    write_atomic(&paths.config_path(), text.as_bytes())
}

/// Hash of the raw config bytes, recorded in state to detect edits between runs.
pub fn config_hash(paths: &DeployPaths) -> Result<String> {
    let path = paths.config_path();
    let bytes = fs::read(&path).with_context(|| format!("read config {}", path.display()))?;
    Ok(sha256_hex(&bytes))
}

pub fn validate_config(config: &DeployConfig) -> Result<()> {
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported deploy config schema_version {}",
            config.schema_version
        ));
    }
    validate_name(&config.name, "name")?;
    if let Some(site) = config.proxy.site_name.as_deref() {
        validate_name(site, "proxy.site_name")?;
    }
    if config.repository.url.trim().is_empty() {
        return Err(anyhow!("repository.url must be non-empty"));
    }
    validate_absolute(&config.target_dir, "target_dir")?;
    validate_absolute(&config.proxy.sites_available, "proxy.sites_available")?;
    validate_absolute(&config.proxy.sites_enabled, "proxy.sites_enabled")?;
    validate_absolute(&config.certificate.live_dir, "certificate.live_dir")?;

    validate_relative_path(&config.secrets.template, "secrets.template")?;
    validate_relative_path(&config.secrets.output, "secrets.output")?;
    validate_relative_path(&config.compose.file, "compose.file")?;
    validate_relative_path(&config.proxy_source_rel(), "proxy.source_config")?;
    if config.secrets.template == config.secrets.output {
        return Err(anyhow!("secrets.template and secrets.output must differ"));
    }

    if config.compose.service.trim().is_empty() {
        return Err(anyhow!("compose.service must be non-empty"));
    }
    config.migration_argv()?;
    config.revision_argv()?;
    if config.compose.launch_timeout_seconds > MAX_LAUNCH_TIMEOUT_SECONDS {
        return Err(anyhow!(
            "compose.launch_timeout_seconds must be at most {MAX_LAUNCH_TIMEOUT_SECONDS} (got {})",
            config.compose.launch_timeout_seconds
        ));
    }
    for url in &config.compose.health_checks {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(anyhow!(
                "compose.health_checks entries must be http(s) URLs (got {url:?})"
            ));
        }
    }

    if config.certificate.domains.is_empty() {
        return Err(anyhow!("certificate.domains must list at least one domain"));
    }
    for domain in &config.certificate.domains {
        if domain.trim().is_empty() || domain.contains(char::is_whitespace) {
            return Err(anyhow!(
                "certificate.domains entries must be non-empty host names (got {domain:?})"
            ));
        }
    }

    let tools = &config.tools;
    for (value, label) in [
        (&tools.git, "tools.git"),
        (&tools.docker, "tools.docker"),
        (&tools.nginx, "tools.nginx"),
        (&tools.certbot, "tools.certbot"),
    ] {
        if value.trim().is_empty() {
            return Err(anyhow!("{label} must be non-empty"));
        }
    }
    if tools.reload.is_empty() {
        return Err(anyhow!("tools.reload must be a non-empty argv"));
    }
    if tools.compose.as_ref().is_some_and(|argv| argv.is_empty()) {
        return Err(anyhow!("tools.compose must be a non-empty argv when set"));
    }
    Ok(())
}

fn split_command(command: &str, label: &str) -> Result<Vec<String>> {
    let argv = shell_words::split(command).with_context(|| format!("parse {label}: {command}"))?;
    if argv.is_empty() {
        return Err(anyhow!("{label} must be non-empty"));
    }
    Ok(argv)
}

fn validate_name(name: &str, label: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
    if !valid {
        return Err(anyhow!(
            "{label} must use only [A-Za-z0-9._-] and not start with '.' (got {name:?})"
        ));
    }
    Ok(())
}

fn validate_absolute(path: &Path, label: &str) -> Result<()> {
    if !path.is_absolute() {
        return Err(anyhow!(
            "{label} must be an absolute path (got {})",
            path.display()
        ));
    }
    Ok(())
}

fn validate_relative_path(rel: &str, label: &str) -> Result<()> {
    let path = Path::new(rel);
    if rel.is_empty() || path.is_absolute() || has_parent_components(path) {
        return Err(anyhow!(
            "{label} must be a relative path without '..' (got {rel:?})"
        ));
    }
    Ok(())
}

fn has_parent_components(path: &Path) -> bool {
    path.components()
        .any(|component| matches!(component, Component::ParentDir))
}
