//! Reversible installation of web-server site files.
//!
//! Every file or link replaced on the host is first moved into the
//! transaction's backup directory so a failed validation can put the previous
//! configuration back exactly as it was.
use crate::util::write_atomic;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub struct SiteTransaction {
    backup_root: PathBuf,
    backups: Vec<(PathBuf, PathBuf)>,
    created: Vec<PathBuf>,
}

impl SiteTransaction {
    pub fn begin(backup_root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&backup_root)
            .with_context(|| format!("create {}", backup_root.display()))?;
        Ok(Self {
            backup_root,
            backups: Vec::new(),
            created: Vec::new(),
        })
    }

    /// Copy `source` to `dest`, keeping whatever was at `dest` for rollback.
    pub fn install_file(&mut self, source: &Path, dest: &Path) -> Result<()> {
        let bytes = fs::read(source).with_context(|| format!("read {}", source.display()))?;
        self.set_aside(dest)?;
        write_atomic(dest, &bytes).with_context(|| format!("install {}", dest.display()))?;
        Ok(())
    }

    /// Point `link` at `target`, keeping whatever was at `link` for rollback.
    pub fn link(&mut self, target: &Path, link: &Path) -> Result<()> {
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        self.set_aside(link)?;
        std::os::unix::fs::symlink(target, link)
            .with_context(|| format!("link {} -> {}", link.display(), target.display()))?;
        Ok(())
    }

    /// Drop the backups; the installed files stay.
    pub fn commit(self) -> Result<()> {
        if self.backup_root.exists() {
            fs::remove_dir_all(&self.backup_root)
                .with_context(|| format!("remove {}", self.backup_root.display()))?;
        }
        Ok(())
    }

    /// Remove what was created and move every backup back into place.
    pub fn rollback(self) -> Result<()> {
        let mut failures = Vec::new();
        for path in self.created.iter().chain(self.backups.iter().map(|(dest, _)| dest)) {
            if fs::symlink_metadata(path).is_ok() {
                if let Err(err) = fs::remove_file(path) {
                    failures.push(format!("remove {}: {err}", path.display()));
                }
            }
        }
        for (dest, backup) in self.backups.iter().rev() {
            if let Err(err) = fs::rename(backup, dest) {
                failures.push(format!("restore {}: {err}", dest.display()));
            }
        }
        if !failures.is_empty() {
            return Err(anyhow!(
                "rollback incomplete (backups kept in {}): {}",
                self.backup_root.display(),
                failures.join("; ")
            ));
        }
        if let Err(err) = fs::remove_dir_all(&self.backup_root) {
            tracing::warn!(path = %self.backup_root.display(), %err, "backup dir kept after rollback");
        }
        Ok(())
    }

    fn set_aside(&mut self, dest: &Path) -> Result<()> {
        if fs::symlink_metadata(dest).is_err() {
            self.created.push(dest.to_path_buf());
            return Ok(());
        }
        let file_name = dest
            .file_name()
            .ok_or_else(|| anyhow!("{} has no file name", dest.display()))?;
        let backup = self
            .backup_root
            .join(format!("{}-{}", self.backups.len(), file_name.to_string_lossy()));
        fs::rename(dest, &backup).with_context(|| format!("backup {}", dest.display()))?;
        self.backups.push((dest.to_path_buf(), backup));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Site {
        _dir: TempDir,
        source: PathBuf,
        available: PathBuf,
        enabled: PathBuf,
        backup_root: PathBuf,
    }

    fn site() -> Site {
        let dir = TempDir::new().expect("temp dir");
        let root = dir.path().to_path_buf();
        fs::create_dir_all(root.join("available")).expect("available dir");
        fs::create_dir_all(root.join("enabled")).expect("enabled dir");
        let source = root.join("booking.conf");
        fs::write(&source, "server { listen 80; }\n").expect("source");
        Site {
            source,
            available: root.join("available/booking"),
            enabled: root.join("enabled/booking"),
            backup_root: root.join("txns/1/backup"),
            _dir: dir,
        }
    }

    #[test]
    fn rollback_on_first_install_removes_everything_created() {
        let site = site();
        let mut txn = SiteTransaction::begin(site.backup_root.clone()).expect("begin");
        txn.install_file(&site.source, &site.available).expect("install");
        txn.link(&site.available, &site.enabled).expect("link");
        assert!(site.available.is_file());
        assert_eq!(fs::read_link(&site.enabled).expect("link"), site.available);

        txn.rollback().expect("rollback");
        assert!(fs::symlink_metadata(&site.available).is_err());
        assert!(fs::symlink_metadata(&site.enabled).is_err());
        assert!(!site.backup_root.exists());
    }

    #[test]
    fn rollback_tolerates_a_missing_backup_dir() {
        let site = site();
        let mut txn = SiteTransaction::begin(site.backup_root.clone()).expect("begin");
        txn.install_file(&site.source, &site.available).expect("install");
        fs::remove_dir_all(&site.backup_root).expect("remove backup dir");

        txn.rollback().expect("rollback");
        assert!(fs::symlink_metadata(&site.available).is_err());
    }

    #[test]
    fn rollback_restores_previous_file_and_link() {
        let site = site();
        fs::write(&site.available, "previous\n").expect("previous file");
        std::os::unix::fs::symlink(&site.available, &site.enabled).expect("previous link");

        let mut txn = SiteTransaction::begin(site.backup_root.clone()).expect("begin");
        txn.install_file(&site.source, &site.available).expect("install");
        txn.link(&site.available, &site.enabled).expect("link");
        assert_eq!(
            fs::read_to_string(&site.available).expect("read"),
            "server { listen 80; }\n"
        );

        txn.rollback().expect("rollback");
        assert_eq!(fs::read_to_string(&site.available).expect("read"), "previous\n");
        assert_eq!(fs::read_link(&site.enabled).expect("link"), site.available);
    }

    #[test]
    fn commit_keeps_new_files_and_drops_backups() {
        let site = site();
        fs::write(&site.available, "previous\n").expect("previous file");
        let mut txn = SiteTransaction::begin(site.backup_root.clone()).expect("begin");
        txn.install_file(&site.source, &site.available).expect("install");
        txn.link(&site.available, &site.enabled).expect("link");
        txn.commit().expect("commit");

        assert_eq!(
            fs::read_to_string(&site.available).expect("read"),
            "server { listen 80; }\n"
        );
        assert!(!site.backup_root.exists());
    }
}
