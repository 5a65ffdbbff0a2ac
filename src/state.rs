//! Persisted deployment state machine.
//!
//! `state.json` holds the furthest state reached plus per-stage records so a
//! failed deploy resumes at the failed stage. `history.jsonl` is append-only.
use crate::config::DeployPaths;
use crate::util::{now_epoch_ms, write_atomic};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;

pub const STATE_SCHEMA_VERSION: u32 = 1;
pub const HISTORY_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeployState {
    NotStarted,
    SourceAcquired,
    SecretsProvisioned,
    ServicesRunning,
    MigrationApplied,
    ProxyActive,
    CertificateIssued,
}

impl DeployState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployState::NotStarted => "not_started",
            DeployState::SourceAcquired => "source_acquired",
            DeployState::SecretsProvisioned => "secrets_provisioned",
            DeployState::ServicesRunning => "services_running",
            DeployState::MigrationApplied => "migration_applied",
            DeployState::ProxyActive => "proxy_active",
            DeployState::CertificateIssued => "certificate_issued",
        }
    }

    /// The stage whose success moves the deployment out of this state.
    pub fn next_stage(&self) -> Option<StageId> {
        StageId::ALL
            .into_iter()
            .find(|stage| stage.required_state() == *self)
    }

    pub fn is_final(&self) -> bool {
        matches!(self, DeployState::CertificateIssued)
    }
}

impl fmt::Display for DeployState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Source,
    Secrets,
    Launch,
    Migrate,
    Proxy,
    Certificate,
}

impl StageId {
    pub const ALL: [StageId; 6] = [
        StageId::Source,
        StageId::Secrets,
        StageId::Launch,
        StageId::Migrate,
        StageId::Proxy,
        StageId::Certificate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Source => "source",
            StageId::Secrets => "secrets",
            StageId::Launch => "launch",
            StageId::Migrate => "migrate",
            StageId::Proxy => "proxy",
            StageId::Certificate => "certificate",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            StageId::Source => "Source Acquisition",
            StageId::Secrets => "Secret Provisioning",
            StageId::Launch => "Build & Launch",
            StageId::Migrate => "Schema Migration",
            StageId::Proxy => "Reverse-Proxy Activation",
            StageId::Certificate => "Certificate Issuance",
        }
    }

    pub fn required_state(&self) -> DeployState {
        match self {
            StageId::Source => DeployState::NotStarted,
            StageId::Secrets => DeployState::SourceAcquired,
            StageId::Launch => DeployState::SecretsProvisioned,
            StageId::Migrate => DeployState::ServicesRunning,
            StageId::Proxy => DeployState::MigrationApplied,
            StageId::Certificate => DeployState::ProxyActive,
        }
    }

    pub fn reached_state(&self) -> DeployState {
        match self {
            StageId::Source => DeployState::SourceAcquired,
            StageId::Secrets => DeployState::SecretsProvisioned,
            StageId::Launch => DeployState::ServicesRunning,
            StageId::Migrate => DeployState::MigrationApplied,
            StageId::Proxy => DeployState::ProxyActive,
            StageId::Certificate => DeployState::CertificateIssued,
        }
    }

    /// How a failure of this stage affects the already running application.
    pub fn failure_severity(&self) -> FailureSeverity {
        match self {
            StageId::Proxy | StageId::Certificate => FailureSeverity::NonFatal,
            _ => FailureSeverity::Fatal,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Blocked,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Success => "success",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
            StageStatus::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureSeverity {
    /// Deploy halted; the host may need operator cleanup.
    Fatal,
    /// Deploy halted but the application keeps serving.
    NonFatal,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StageRecord {
    pub stage: StageId,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_epoch_ms: Option<u128>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_epoch_ms: Option<u128>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u128>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StageRecord {
    pub fn new(stage: StageId) -> Self {
        Self {
            stage,
            status: StageStatus::Pending,
            started_at_epoch_ms: None,
            finished_at_epoch_ms: None,
            duration_ms: None,
            message: None,
        }
    }

    pub fn start(&mut self, now: u128) {
        self.started_at_epoch_ms = Some(now);
        self.finished_at_epoch_ms = None;
        self.duration_ms = None;
        self.message = None;
        self.status = StageStatus::Running;
    }

    pub fn finish(&mut self, status: StageStatus, message: Option<String>, now: u128) {
        self.finished_at_epoch_ms = Some(now);
        self.status = status;
        self.message = message;
        if let Some(started) = self.started_at_epoch_ms {
            self.duration_ms = Some(now.saturating_sub(started));
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.stage);
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FailureRecord {
    pub stage: StageId,
    pub severity: FailureSeverity,
    pub message: String,
    /// Set when a launch failed after `up` was issued; no teardown is attempted.
    #[serde(default)]
    pub services_may_be_partial: bool,
    pub at_epoch_ms: u128,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DeployStateFile {
    pub schema_version: u32,
    pub state: DeployState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
    pub updated_at_epoch_ms: u128,
    pub stages: Vec<StageRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<FailureRecord>,
}

impl DeployStateFile {
    pub fn new(config_hash: Option<String>, now: u128) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            state: DeployState::NotStarted,
            config_hash,
            updated_at_epoch_ms: now,
            stages: StageId::ALL.into_iter().map(StageRecord::new).collect(),
            last_failure: None,
        }
    }

    pub fn record(&self, stage: StageId) -> Option<&StageRecord> {
        self.stages.iter().find(|record| record.stage == stage)
    }

    pub fn record_mut(&mut self, stage: StageId) -> &mut StageRecord {
        if let Some(index) = self.stages.iter().position(|record| record.stage == stage) {
            return &mut self.stages[index];
        }
        self.stages.push(StageRecord::new(stage));
        self.stages.sort_by_key(|record| record.stage);
        let index = self
            .stages
            .iter()
            .position(|record| record.stage == stage)
            .unwrap_or_default();
        &mut self.stages[index]
    }

    /// Advance to `reached` unless a later state was already recorded.
    pub fn advance(&mut self, reached: DeployState) {
        if reached > self.state {
            self.state = reached;
        }
    }

    /// Move back to `target`; records of stages past it return to pending.
    pub fn rewind_to(&mut self, target: DeployState) -> Result<()> {
        if target > self.state {
            return Err(anyhow!(
                "cannot rewind forward from {} to {}",
                self.state,
                target
            ));
        }
        self.state = target;
        for record in &mut self.stages {
            if record.stage.reached_state() > target {
                record.reset();
            }
        }
        if self
            .last_failure
            .as_ref()
            .is_some_and(|failure| failure.stage.required_state() > target)
        {
            self.last_failure = None;
        }
        Ok(())
    }

    /// The stage recorded as blocked on operator action, if any.
    pub fn blocked_stage(&self) -> Option<StageId> {
        self.stages
            .iter()
            .find(|record| record.status == StageStatus::Blocked)
            .map(|record| record.stage)
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct HistoryEntry {
    pub schema_version: u32,
    pub started_at_epoch_ms: u128,
    pub finished_at_epoch_ms: u128,
    pub stage: StageId,
    pub from: DeployState,
    pub to: DeployState,
    pub status: StageStatus,
    pub message: Option<String>,
    pub force_used: bool,
}

pub fn load_state_optional(paths: &DeployPaths) -> Result<Option<DeployStateFile>> {
    let path = paths.state_path();
    if !path.is_file() {
        return Ok(None);
    }
    let bytes = fs::read(&path).with_context(|| format!("read state {}", path.display()))?;
    let state: DeployStateFile =
        serde_json::from_slice(&bytes).context("parse deploy state JSON")?;
    if state.schema_version != STATE_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported deploy state schema_version {}",
            state.schema_version
        ));
    }
    Ok(Some(state))
}

pub fn write_state(paths: &DeployPaths, state: &DeployStateFile) -> Result<()> {
    let text = serde_json::to_string_pretty(state).context("serialize deploy state")?;
    write_atomic(&paths.state_path(), text.as_bytes())
}

pub fn append_history(paths: &DeployPaths, entry: &HistoryEntry) -> Result<()> {
    let path = paths.history_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("create deploy root")?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open {}", path.display()))?;
    let line = serde_json::to_string(entry).context("serialize history entry")?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
    file.write_all(b"\n")
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

pub fn fresh_state(config_hash: Option<String>) -> Result<DeployStateFile> {
    Ok(DeployStateFile::new(config_hash, now_epoch_ms()?))
}
