use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
}

impl Role {
    pub fn is_primary(self) -> bool {
        matches!(self, Role::Primary)
    }
}

pub fn default_lock_path() -> PathBuf {
    if let Some(v) = std::env::var_os("CRAFTBOOT_LOCK") {
        if !v.is_empty() {
            return PathBuf::from(v);
        }
    }
    std::env::temp_dir().join("craftboot-primary.lock")
}

/// One-shot election among sibling processes sharing a filesystem. The first
/// process to exclusively create the lock file wins; everyone else sees
/// `AlreadyExists` and is secondary. The lock is never released: a fresh
/// election needs the file cleared externally.
pub fn elect(lock_path: &Path) -> Result<Role> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create_dir_all {}", parent.display()))?;
    }
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
    {
        Ok(mut f) => {
            let pid = std::process::id();
            f.write_all(format!("{pid}\n").as_bytes())
                .with_context(|| format!("write {}", lock_path.display()))?;
            Ok(Role::Primary)
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(Role::Secondary),
        Err(err) => {
            Err(err).with_context(|| format!("create lock {}", lock_path.display()))
        }
    }
}
