//! TLS certificate issuance through certbot's nginx integration.
use super::probe::{http_agent, probe_https};
use super::{StageContext, StageOutcome};
use crate::exec::{run_checked, CommandSpec};
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

pub(crate) fn issue_certificate(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    let certificate = &ctx.config.certificate;
    let primary = ctx.config.primary_domain()?;
    let fullchain = certificate.live_dir.join(primary).join("fullchain.pem");
    let domains = certificate.domains.join(", ");

    if fullchain.is_file() {
        let site = ctx
            .config
            .proxy
            .sites_available
            .join(ctx.config.site_name());
        if site_references(&site, &fullchain)? {
            return Ok(StageOutcome::skipped(format!(
                "certificate for {primary} already installed in {}",
                site.display()
            )));
        }
        // The site was replaced after issuance; wire the existing lineage back in.
        let install = with_domains(
            CommandSpec::new(&ctx.config.tools.certbot)
                .args(["install", "--nginx", "--non-interactive", "--cert-name", primary])
                .arg(redirect_flag(certificate.redirect)),
            &certificate.domains,
        );
        run_checked(ctx.runner, &install, "certbot install")?;
        if ctx.dry_run {
            return Ok(StageOutcome::completed(format!(
                "would reinstall the certificate for {domains}"
            )));
        }
        tracing::info!(%domains, site = %site.display(), "certificate reinstalled");
        return Ok(verify(ctx, format!("certificate reinstalled for {domains}")));
    }

    let mut certbot = CommandSpec::new(&ctx.config.tools.certbot).args([
        "--nginx",
        "--non-interactive",
        "--agree-tos",
    ]);
    certbot = match certificate.email.as_deref() {
        Some(email) => certbot.args(["-m", email]),
        None => certbot.arg("--register-unsafely-without-email"),
    };
    let certbot = with_domains(
        certbot.arg(redirect_flag(certificate.redirect)),
        &certificate.domains,
    );
    run_checked(ctx.runner, &certbot, "certbot")?;

    if ctx.dry_run {
        return Ok(StageOutcome::completed(format!(
            "would request a certificate for {domains}"
        )));
    }
    tracing::info!(%domains, "certificate issued");
    Ok(verify(ctx, format!("certificate issued for {domains}")))
}

fn redirect_flag(redirect: bool) -> &'static str {
    if redirect {
        "--redirect"
    } else {
        "--no-redirect"
    }
}

fn with_domains(mut certbot: CommandSpec, domains: &[String]) -> CommandSpec {
    for domain in domains {
        certbot = certbot.args(["-d", domain.as_str()]);
    }
    certbot
}

/// Whether the installed site already points nginx at `fullchain`.
fn site_references(site: &Path, fullchain: &Path) -> Result<bool> {
    if !site.is_file() {
        return Ok(false);
    }
    let text = fs::read_to_string(site).with_context(|| format!("read {}", site.display()))?;
    Ok(text.contains(&fullchain.display().to_string()))
}

fn verify(ctx: &StageContext<'_>, message: String) -> StageOutcome {
    let certificate = &ctx.config.certificate;
    let mut warnings = Vec::new();
    if certificate.verify_https {
        let agent = http_agent();
        warnings.extend(
            certificate
                .domains
                .iter()
                .filter_map(|domain| probe_https(&agent, domain)),
        );
    }
    StageOutcome::completed(message).with_warnings(warnings)
}
