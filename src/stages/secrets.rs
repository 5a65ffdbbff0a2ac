//! Secret provisioning: materialize `.env` from its template and hold the
//! deploy until an operator has filled it in.
use super::{StageContext, StageOutcome};
use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

#[derive(Debug, PartialEq, Eq)]
enum EnvGate {
    Ready,
    NeedsEdit(String),
}

pub(crate) fn provision_secrets(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    let secrets = &ctx.config.secrets;
    let template = ctx.checkout_path(&secrets.template);
    let output = ctx.checkout_path(&secrets.output);

    let mut copied = false;
    if !output.exists() {
        if ctx.dry_run {
            return Ok(StageOutcome::completed(format!(
                "would copy {} to {} and wait for it to be edited",
                template.display(),
                output.display()
            )));
        }
        if !template.is_file() {
            return Err(anyhow!(
                "secrets template {} not found in checkout",
                template.display()
            ));
        }
        copy_template(&template, &output)?;
        tracing::info!(path = %output.display(), "environment file created from template");
        copied = true;
    }

    match check_env_file(&template, &output, &secrets.required_keys, secrets.allow_unedited)? {
        EnvGate::Ready if copied => Ok(StageOutcome::completed(format!(
            "created {} from template",
            output.display()
        ))),
        EnvGate::Ready => Ok(StageOutcome::completed(format!(
            "{} present with required keys",
            output.display()
        ))),
        EnvGate::NeedsEdit(reason) => Ok(StageOutcome::Blocked {
            reason,
            path: output,
        }),
    }
}

/// Create `output` exactly once; an existing file is never overwritten.
fn copy_template(template: &Path, output: &Path) -> Result<()> {
    let bytes = fs::read(template).with_context(|| format!("read {}", template.display()))?;
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(output)
        .with_context(|| format!("create {}", output.display()))?;
    file.write_all(&bytes)
        .with_context(|| format!("write {}", output.display()))?;
    Ok(())
}

fn check_env_file(
    template: &Path,
    output: &Path,
    required_keys: &[String],
    allow_unedited: bool,
) -> Result<EnvGate> {
    let bytes = fs::read(output).with_context(|| format!("read {}", output.display()))?;
    if !allow_unedited && template.is_file() {
        let template_bytes =
            fs::read(template).with_context(|| format!("read {}", template.display()))?;
        if template_bytes == bytes {
            return Ok(EnvGate::NeedsEdit(format!(
                "{} is identical to its template; fill in the deployment secrets and rerun",
                output.display()
            )));
        }
    }

    let values = parse_env(&String::from_utf8_lossy(&bytes))?;
    let missing: Vec<&str> = required_keys
        .iter()
        .filter(|key| values.get(key.as_str()).is_none_or(|value| value.is_empty()))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Ok(EnvGate::NeedsEdit(format!(
            "{} is missing values for: {}",
            output.display(),
            missing.join(", ")
        )));
    }
    Ok(EnvGate::Ready)
}

/// Parse `KEY=VALUE` lines, tolerating `export`, comments and simple quoting.
fn parse_env(text: &str) -> Result<BTreeMap<String, String>> {
    let line_re = env_line_pattern()?;
    let mut values = BTreeMap::new();
    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some(captures) = line_re.captures(line) else {
            continue;
        };
        let key = captures[1].to_string();
        let value = unquote(&captures[2]);
        values.insert(key, value);
    }
    Ok(values)
}

fn env_line_pattern() -> Result<&'static Regex> {
    static ENV_LINE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    ENV_LINE
        .get_or_init(|| Regex::new(r"^\s*(?:export\s+)?([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(.*?)\s*$"))
        .as_ref()
        .map_err(|err| anyhow!("compile env line pattern: {err}"))
}

/// A quoted value ends at its closing quote; anything after it is a comment.
fn unquote(raw: &str) -> String {
    for quote in ['"', '\''] {
        if let Some(rest) = raw.strip_prefix(quote) {
            if let Some(end) = rest.find(quote) {
                return rest[..end].to_string();
            }
        }
    }
    match raw.find(" #") {
        Some(index) => raw[..index].trim_end().to_string(),
        None => raw.to_string(),
    }
}
