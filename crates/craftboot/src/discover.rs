use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::install;
use crate::report::Reporter;

/// Locate a pre-installed runtime by a one-level scan of `search_dir` and
/// alias it at the fixed install path. Zero or multiple matches leave the
/// identifier unresolved; both are warnings, not errors.
pub fn alias_runtime(
    root: &Path,
    search_dir: &Path,
    id: &str,
    reporter: &Reporter,
) -> Result<Option<PathBuf>> {
    let matches = find_matches(search_dir, id)?;
    let target = match matches.as_slice() {
        [one] => one.clone(),
        [] => {
            reporter.warn(&format!(
                "no runtime matching {id} under {}",
                search_dir.display()
            ));
            return Ok(None);
        }
        many => {
            let names = many
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            reporter.warn(&format!("ambiguous matches for {id}: {names}"));
            return Ok(None);
        }
    };

    let alias = install::install_dir(root, id);
    refresh_alias(&alias, &target)?;
    Ok(Some(alias))
}

fn find_matches(search_dir: &Path, id: &str) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(search_dir) {
        Ok(v) => v,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("read_dir {}", search_dir.display()))
        }
    };

    let needles = [format!("java-{id}"), format!("jdk-{id}")];
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if needles.iter().any(|n| name.contains(n.as_str())) {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

/// Replace a stale alias rather than erroring; a real directory already at
/// the alias path (a prior download install) is left untouched.
fn refresh_alias(alias: &Path, target: &Path) -> Result<()> {
    match std::fs::symlink_metadata(alias) {
        Ok(meta) if meta.file_type().is_symlink() => {
            std::fs::remove_file(alias)
                .with_context(|| format!("remove stale alias {}", alias.display()))?;
        }
        Ok(_) => return Ok(()),
        Err(_) => {}
    }
    if let Some(parent) = alias.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create_dir_all {}", parent.display()))?;
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(target, alias)
        .with_context(|| format!("symlink {} -> {}", alias.display(), target.display()))?;
    #[cfg(windows)]
    std::os::windows::fs::symlink_dir(target, alias)
        .with_context(|| format!("symlink {} -> {}", alias.display(), target.display()))?;
    Ok(())
}
