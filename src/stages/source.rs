//! Source acquisition: clone the repository into the target directory.
use super::{StageContext, StageOutcome};
use crate::exec::{run_checked, CommandSpec};
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::Path;

#[derive(Debug, PartialEq, Eq)]
enum TargetState {
    Absent,
    Empty,
    /// A checkout whose `origin` is the configured repository.
    Checkout,
    Conflict(String),
}

pub(crate) fn acquire_source(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    let repository = &ctx.config.repository;
    let target = &ctx.config.target_dir;

    match inspect_target(ctx, target, &repository.url)? {
        TargetState::Checkout => {
            return Ok(StageOutcome::skipped(format!(
                "{} is already a checkout of {}",
                target.display(),
                repository.url
            )));
        }
        TargetState::Conflict(reason) => {
            return Err(anyhow!(
                "target {} {reason}; refusing to clone over it",
                target.display()
            ));
        }
        TargetState::Absent | TargetState::Empty => {}
    }

    if !ctx.dry_run {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
    }

    let mut clone = CommandSpec::new(&ctx.config.tools.git).arg("clone");
    if let Some(branch) = repository.branch.as_deref() {
        clone = clone.args(["--branch", branch]);
    }
    let clone = clone
        .arg(repository.url.as_str())
        .arg(target.display().to_string());
    run_checked(ctx.runner, &clone, "git clone")?;

    if ctx.dry_run {
        return Ok(StageOutcome::completed(format!(
            "would clone {} into {}",
            repository.url,
            target.display()
        )));
    }
    if !target.is_dir() || !dir_has_entries(target)? {
        return Err(anyhow!(
            "git clone reported success but {} is empty",
            target.display()
        ));
    }
    tracing::info!(url = %repository.url, path = %target.display(), "repository cloned");
    Ok(StageOutcome::completed(format!(
        "cloned {} into {}",
        repository.url,
        target.display()
    )))
}

fn inspect_target(ctx: &StageContext<'_>, target: &Path, url: &str) -> Result<TargetState> {
    let Ok(meta) = fs::symlink_metadata(target) else {
        return Ok(TargetState::Absent);
    };
    if !meta.is_dir() {
        return Ok(TargetState::Conflict("exists and is not a directory".into()));
    }
    if !dir_has_entries(target)? {
        return Ok(TargetState::Empty);
    }
    if !target.join(".git").exists() {
        return Ok(TargetState::Conflict(
            "is not empty and is not a git checkout".into(),
        ));
    }

    let query = CommandSpec::new(&ctx.config.tools.git)
        .arg("-C")
        .arg(target.display().to_string())
        .args(["remote", "get-url", "origin"]);
    let output = ctx
        .probe
        .run(&query)
        .context("query origin of existing checkout")?;
    if !output.success() {
        return Ok(TargetState::Conflict(
            "is a git checkout without an origin remote".into(),
        ));
    }
    let origin = output.stdout.trim();
    if origin != url {
        return Ok(TargetState::Conflict(format!(
            "is a checkout of {origin}, not {url}"
        )));
    }
    Ok(TargetState::Checkout)
}

fn dir_has_entries(path: &Path) -> Result<bool> {
    let mut entries = fs::read_dir(path).with_context(|| format!("read {}", path.display()))?;
    Ok(entries.next().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::scripted::ScriptedRunner;
    use crate::stages::test_support::{Fixture, REPO_URL};

    #[test]
    fn clone_into_absent_target_must_leave_a_populated_checkout() {
        let fixture = Fixture::new();
        let runner = ScriptedRunner::new();
        // The scripted clone writes nothing, so the post-clone check must trip.
        let err = acquire_source(&fixture.ctx(&runner)).expect_err("empty after clone");
        assert!(err.to_string().contains("is empty"), "{err}");
        assert_eq!(
            runner.calls(),
            vec![format!(
                "git clone {REPO_URL} {}",
                fixture.config.target_dir.display()
            )]
        );
    }

    #[test]
    fn clone_passes_branch_when_configured() {
        let mut fixture = Fixture::new();
        fixture.config.repository.branch = Some("release".into());
        fs::create_dir_all(&fixture.config.target_dir).expect("empty target");
        let runner = ScriptedRunner::new();
        let _ = acquire_source(&fixture.ctx(&runner));
        assert!(runner.called("git clone --branch release"));
    }

    #[test]
    fn existing_checkout_of_same_origin_is_skipped() {
        let fixture = Fixture::new();
        fixture.write_checkout_file(".git/HEAD", "ref: refs/heads/main\n");
        let runner = ScriptedRunner::new().on("remote get-url origin", 0, &format!("{REPO_URL}\n"), "");
        let outcome = acquire_source(&fixture.ctx(&runner)).expect("skip");
        assert!(matches!(outcome, StageOutcome::Skipped { .. }));
        assert!(!runner.called("clone"));
    }

    #[test]
    fn non_empty_directory_is_a_conflict_and_git_is_never_run() {
        let fixture = Fixture::new();
        fixture.write_checkout_file("notes.txt", "operator files\n");
        let runner = ScriptedRunner::new();
        let err = acquire_source(&fixture.ctx(&runner)).expect_err("conflict");
        assert!(err.to_string().contains("not a git checkout"), "{err}");
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn checkout_of_another_repository_is_a_conflict() {
        let fixture = Fixture::new();
        fixture.write_checkout_file(".git/HEAD", "ref: refs/heads/main\n");
        let runner = ScriptedRunner::new().on(
            "remote get-url origin",
            0,
            "https://git.example.com/other.git\n",
            "",
        );
        let err = acquire_source(&fixture.ctx(&runner)).expect_err("conflict");
        assert!(err.to_string().contains("other.git"), "{err}");
        assert!(!runner.called("clone"));
    }

    #[test]
    fn failed_clone_surfaces_git_stderr() {
        let fixture = Fixture::new();
        let runner = ScriptedRunner::new().on(
            "git clone",
            128,
            "",
            "fatal: Authentication failed for 'https://git.example.com/booking.git/'\n",
        );
        let err = acquire_source(&fixture.ctx(&runner)).expect_err("clone failure");
        assert!(err.to_string().contains("Authentication failed"), "{err}");
    }
}
