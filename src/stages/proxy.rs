//! Reverse-proxy activation: install the site, validate, then reload.
//!
//! The reload is only issued after `nginx -t` passes. Any failure before that
//! puts the previous site file and link back, so the web server keeps serving
//! the configuration it already had.
use super::{StageContext, StageOutcome};
use crate::exec::{failure_detail, run_checked, CommandSpec};
use crate::staging::SiteTransaction;
use crate::util::sha256_hex;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::Path;

pub(crate) fn activate_reverse_proxy(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    let proxy = &ctx.config.proxy;
    let source = ctx.checkout_path(&ctx.config.proxy_source_rel());
    let installed = proxy.sites_available.join(ctx.config.site_name());
    let link = proxy.sites_enabled.join(ctx.config.site_name());

    if !ctx.dry_run && !source.is_file() {
        return Err(anyhow!("site config {} not found in checkout", source.display()));
    }
    if !ctx.dry_run && already_active(&source, &installed, &link)? {
        return Ok(StageOutcome::skipped(format!(
            "{} already installed and enabled",
            installed.display()
        )));
    }

    let validate = CommandSpec::new(&ctx.config.tools.nginx).arg("-t");
    let reload = CommandSpec::from_argv(&ctx.config.tools.reload)?;

    if ctx.dry_run {
        println!("[dry-run] install {} -> {}", source.display(), installed.display());
        println!("[dry-run] link {} -> {}", link.display(), installed.display());
        run_checked(ctx.runner, &validate, "nginx configuration test")?;
        run_checked(ctx.runner, &reload, "nginx reload")?;
        return Ok(StageOutcome::completed(format!(
            "would enable site {}",
            ctx.config.site_name()
        )));
    }

    let mut txn = SiteTransaction::begin(ctx.paths.txn_backup_root(ctx.txn_id))?;
    let staged = txn
        .install_file(&source, &installed)
        .and_then(|()| txn.link(&installed, &link));
    if let Err(err) = staged {
        return Err(restore(txn, err.context("install site files")));
    }

    let tested = ctx.runner.run(&validate);
    let rejection = match &tested {
        Ok(output) if output.success() => None,
        Ok(output) => Some(failure_detail(output)),
        Err(err) => Some(format!("{err:#}")),
    };
    if let Some(detail) = rejection {
        tracing::warn!(site = %installed.display(), %detail, "nginx rejected new site");
        return Err(restore(
            txn,
            anyhow!(
                "nginx configuration test failed: {detail}; previous configuration restored, reload withheld"
            ),
        ));
    }

    if let Err(err) = run_checked(ctx.runner, &reload, "nginx reload") {
        return Err(restore(txn, err));
    }
    txn.commit()?;
    tracing::info!(site = %installed.display(), "site enabled and web server reloaded");
    Ok(StageOutcome::completed(format!(
        "enabled {} and reloaded web server",
        link.display()
    )))
}

/// Roll back and return `cause`, chaining a rollback failure onto it.
fn restore(txn: SiteTransaction, cause: anyhow::Error) -> anyhow::Error {
    match txn.rollback() {
        Ok(()) => cause,
        Err(rollback_err) => rollback_err.context(format!("{cause:#}")),
    }
}

fn already_active(source: &Path, installed: &Path, link: &Path) -> Result<bool> {
    if !installed.is_file() {
        return Ok(false);
    }
    match fs::read_link(link) {
        Ok(target) if target == installed => {}
        _ => return Ok(false),
    }
    let wanted = fs::read(source).with_context(|| format!("read {}", source.display()))?;
    let current = fs::read(installed).with_context(|| format!("read {}", installed.display()))?;
    Ok(sha256_hex(&wanted) == sha256_hex(&current))
}
