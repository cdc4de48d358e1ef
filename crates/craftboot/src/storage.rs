use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

pub const SCRATCH_DIR_NAME: &str = "downloads";

/// Writable base for installed runtimes plus the shared archive cache.
/// Resolved once per process; never re-evaluated mid-run.
#[derive(Debug, Clone)]
pub struct Storage {
    pub root: PathBuf,
    pub scratch: PathBuf,
}

/// Candidate bases in preference order: the `CRAFTBOOT_STORAGE` override,
/// the system temp directory, the home directory, the working directory.
pub fn default_candidates() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(v) = std::env::var_os("CRAFTBOOT_STORAGE") {
        if !v.is_empty() {
            out.push(PathBuf::from(v));
        }
    }
    out.push(std::env::temp_dir().join("craftboot"));
    if let Ok(home) = home_dir() {
        out.push(home.join(".craftboot"));
    }
    out.push(PathBuf::from(".craftboot"));
    out
}

pub fn resolve(candidates: &[PathBuf]) -> Result<Storage> {
    let mut checked: Vec<PathBuf> = Vec::new();

    for cand in candidates {
        checked.push(cand.clone());
        if !probe_writable(cand) {
            continue;
        }
        let scratch = cand.join(SCRATCH_DIR_NAME);
        std::fs::create_dir_all(&scratch)
            .with_context(|| format!("create_dir_all {}", scratch.display()))?;
        return Ok(Storage {
            root: cand.clone(),
            scratch,
        });
    }

    let checked = checked
        .into_iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");
    bail!("no writable storage base found\n\nlooked for:\n{checked}")
}

/// The candidate is usable when it can be created and a probe file can be
/// written and removed inside it.
fn probe_writable(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    let probe = dir.join(format!(".craftboot_probe_{}", std::process::id()));
    match std::fs::write(&probe, b"probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

pub fn home_dir() -> Result<PathBuf> {
    if let Some(v) = std::env::var_os("HOME") {
        if !v.is_empty() {
            return Ok(PathBuf::from(v));
        }
    }
    if let Some(v) = std::env::var_os("USERPROFILE") {
        if !v.is_empty() {
            return Ok(PathBuf::from(v));
        }
    }
    if let (Some(drive), Some(path)) = (std::env::var_os("HOMEDRIVE"), std::env::var_os("HOMEPATH"))
    {
        let mut s = OsString::new();
        s.push(drive);
        s.push(path);
        if !s.is_empty() {
            return Ok(PathBuf::from(s));
        }
    }
    bail!("could not determine home directory (HOME/USERPROFILE/HOMEDRIVE+HOMEPATH)")
}
