//! Build & launch through docker compose, then the schema migration.
use super::probe::{check_health, http_agent};
use super::{PartialServices, StageContext, StageOutcome};
use crate::exec::{failure_detail, run_checked};
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeSet;
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub(crate) fn launch_services(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    let compose = &ctx.config.compose;
    if !ctx.dry_run {
        let file = ctx.checkout_path(&compose.file);
        if !file.is_file() {
            return Err(anyhow!("compose file {} not found", file.display()));
        }
        let env = ctx.checkout_path(&ctx.config.secrets.output);
        if !env.is_file() {
            return Err(anyhow!(
                "{} is missing; secret provisioning must run first",
                env.display()
            ));
        }
    }

    let started = Instant::now();
    run_checked(ctx.runner, &ctx.compose_command(["build"])?, "compose build")?;
    run_checked(ctx.runner, &ctx.compose_command(["up", "-d"])?, "compose up")
        .context(PartialServices)?;
    if ctx.dry_run {
        return Ok(StageOutcome::completed("would build images and start services"));
    }

    let expected = expected_services(ctx).context(PartialServices)?;
    let running = wait_for_services(ctx, &expected).context(PartialServices)?;
    tracing::info!(
        services = running.len(),
        elapsed_ms = started.elapsed().as_millis(),
        "services running"
    );
    Ok(StageOutcome::completed(format!(
        "services running: {}",
        running.into_iter().collect::<Vec<_>>().join(", ")
    )))
}

fn expected_services(ctx: &StageContext<'_>) -> Result<BTreeSet<String>> {
    if !ctx.config.compose.expected_services.is_empty() {
        return Ok(ctx.config.compose.expected_services.iter().cloned().collect());
    }
    let listed = run_checked(
        ctx.probe,
        &ctx.compose_command(["config", "--services"])?,
        "compose config",
    )?;
    let services = service_lines(&listed.stdout);
    if services.is_empty() {
        return Err(anyhow!("compose file defines no services"));
    }
    Ok(services)
}

/// Poll `compose ps` until every expected service runs or the timeout passes.
fn wait_for_services(
    ctx: &StageContext<'_>,
    expected: &BTreeSet<String>,
) -> Result<BTreeSet<String>> {
    let timeout = Duration::from_secs(ctx.config.compose.launch_timeout_seconds);
    let deadline = Instant::now() + timeout;
    let query = ctx.compose_command(["ps", "--services", "--filter", "status=running"])?;
    loop {
        let output = run_checked(ctx.probe, &query, "compose ps")?;
        let running = service_lines(&output.stdout);
        let missing: Vec<&str> = expected
            .difference(&running)
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            return Ok(running);
        }
        if Instant::now() + POLL_INTERVAL > deadline {
            return Err(anyhow!(
                "services not running after {}s: {}",
                timeout.as_secs(),
                missing.join(", ")
            ));
        }
        tracing::debug!(missing = missing.len(), "waiting for services");
        thread::sleep(POLL_INTERVAL);
    }
}

fn service_lines(stdout: &str) -> BTreeSet<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn apply_migration(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    let compose = &ctx.config.compose;
    let migrate = ctx
        .compose_command(["exec", "-T", compose.service.as_str()])?
        .args(ctx.config.migration_argv()?);
    if ctx.dry_run {
        run_checked(ctx.runner, &migrate, "schema migration")?;
        return Ok(StageOutcome::completed(format!(
            "would run {} in service {}",
            compose.migration_command, compose.service
        )));
    }

    let mut warnings = Vec::new();
    let before = current_revision(ctx, &mut warnings)?;
    run_checked(ctx.runner, &migrate, "schema migration")?;
    let after = current_revision(ctx, &mut warnings)?;

    let message = match (before, after) {
        (Some(before), Some(after)) if before == after => {
            format!("schema already at {after}")
        }
        (Some(before), Some(after)) => format!("schema {before} -> {after}"),
        (None, Some(after)) => format!("schema at {after}"),
        _ => format!("ran {}", compose.migration_command),
    };
    tracing::info!(service = %compose.service, %message, "migration applied");

    if !compose.health_checks.is_empty() {
        let agent = http_agent();
        warnings.extend(
            compose
                .health_checks
                .iter()
                .filter_map(|url| check_health(&agent, url)),
        );
    }
    Ok(StageOutcome::completed(message).with_warnings(warnings))
}

/// Last non-blank line of the revision command, e.g. `3f2a1b9c (head)`.
fn current_revision(ctx: &StageContext<'_>, warnings: &mut Vec<String>) -> Result<Option<String>> {
    let Some(argv) = ctx.config.revision_argv()? else {
        return Ok(None);
    };
    let query = ctx
        .compose_command(["exec", "-T", ctx.config.compose.service.as_str()])?
        .args(argv);
    let output = match ctx.probe.run(&query) {
        Ok(output) => output,
        Err(err) => {
            warnings.push(format!("could not read schema revision: {err:#}"));
            return Ok(None);
        }
    };
    if !output.success() {
        warnings.push(format!(
            "could not read schema revision ({}): {}",
            output.status_label(),
            failure_detail(&output)
        ));
        return Ok(None);
    }
    Ok(output
        .stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string))
}
