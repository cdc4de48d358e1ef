use std::fs::File;
use std::io::{Read as _, Write as _};
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use serde::Serialize;
use xz2::read::XzDecoder;

use crate::config::RuntimeSpec;
use crate::report::Reporter;
use crate::storage::Storage;

pub const INSTALL_PREFIX: &str = "java";
pub const MARKER_REL: &str = "bin/java";

pub fn install_dir(root: &Path, id: &str) -> PathBuf {
    root.join(format!("{INSTALL_PREFIX}-{id}"))
}

pub fn marker_path(root: &Path, id: &str) -> PathBuf {
    install_dir(root, id).join(MARKER_REL)
}

pub fn is_installed(root: &Path, id: &str) -> bool {
    verify_marker(&install_dir(root, id)).is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    Installed,
    AlreadyInstalled,
    Failed,
}

#[derive(Debug, Serialize)]
pub struct InstallOutcome {
    pub id: String,
    pub status: InstallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InstallSummary {
    pub outcomes: Vec<InstallOutcome>,
    pub had_errors: bool,
}

/// Install every runtime, one thread per identifier. Install directories and
/// cache filenames are identifier-qualified, so the only shared resource is
/// the scratch directory itself. One identifier failing never stops the
/// others; the summary carries the per-identifier outcomes.
pub fn ensure_all(storage: &Storage, specs: &[RuntimeSpec], reporter: &Reporter) -> InstallSummary {
    let outcomes: Vec<InstallOutcome> = std::thread::scope(|s| {
        let handles: Vec<_> = specs
            .iter()
            .map(|spec| s.spawn(move || outcome_for(storage, spec, reporter)))
            .collect();
        handles
            .into_iter()
            .zip(specs)
            .map(|(handle, spec)| match handle.join() {
                Ok(outcome) => outcome,
                Err(_) => InstallOutcome {
                    id: spec.id.clone(),
                    status: InstallStatus::Failed,
                    path: None,
                    error: Some("install thread panicked".to_string()),
                },
            })
            .collect()
    });
    let had_errors = outcomes
        .iter()
        .any(|o| o.status == InstallStatus::Failed);
    InstallSummary {
        outcomes,
        had_errors,
    }
}

fn outcome_for(storage: &Storage, spec: &RuntimeSpec, reporter: &Reporter) -> InstallOutcome {
    match ensure_one(storage, spec, reporter) {
        Ok((status, path)) => InstallOutcome {
            id: spec.id.clone(),
            status,
            path: Some(path.display().to_string()),
            error: None,
        },
        Err(err) => InstallOutcome {
            id: spec.id.clone(),
            status: InstallStatus::Failed,
            path: None,
            error: Some(format!("{err:#}")),
        },
    }
}

pub fn ensure_one(
    storage: &Storage,
    spec: &RuntimeSpec,
    reporter: &Reporter,
) -> Result<(InstallStatus, PathBuf)> {
    let final_dir = install_dir(&storage.root, &spec.id);

    if final_dir.is_dir() {
        if verify_marker(&final_dir).is_ok() {
            reporter.progress(&format!("runtime {} already installed", spec.id));
            return Ok((InstallStatus::AlreadyInstalled, final_dir));
        }
        // Stale partial state from an earlier run; clear it and retry.
        std::fs::remove_dir_all(&final_dir)
            .with_context(|| format!("remove stale install {}", final_dir.display()))?;
    }

    let url = spec
        .url
        .as_deref()
        .ok_or_else(|| anyhow!("no source url configured for runtime {}", spec.id))?;
    let format = ArchiveFormat::from_url(url)?;
    let archive = storage
        .scratch
        .join(format!("{INSTALL_PREFIX}-{}.{}", spec.id, format.ext()));

    // The cached archive is trusted by presence alone; a re-run never
    // re-transfers an archive that is already on disk.
    if archive.is_file() {
        reporter.progress(&format!("runtime {}: using cached archive", spec.id));
    } else {
        reporter.progress(&format!("download runtime {}: {url}", spec.id));
        download(url, &archive)?;
    }

    let tmp_dir = storage
        .root
        .join(format!(".tmp_{}_{}", spec.id, std::process::id()));
    if tmp_dir.exists() {
        std::fs::remove_dir_all(&tmp_dir).ok();
    }
    std::fs::create_dir_all(&tmp_dir)
        .with_context(|| format!("create_dir_all {}", tmp_dir.display()))?;

    reporter.progress(&format!("extract runtime {}", spec.id));
    let unpacked =
        extract_archive(&archive, format, &tmp_dir).and_then(|()| verify_marker(&tmp_dir));
    if let Err(err) = unpacked {
        let _ = std::fs::remove_dir_all(&tmp_dir);
        return Err(err);
    }

    std::fs::rename(&tmp_dir, &final_dir)
        .with_context(|| format!("rename {} -> {}", tmp_dir.display(), final_dir.display()))?;
    Ok((InstallStatus::Installed, final_dir))
}

/// Identifiers with a verified install (or alias) under the storage root.
pub fn list_installed(root: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(root) {
        Ok(v) => v,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read_dir {}", root.display())),
    };
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(id) = name.strip_prefix(&format!("{INSTALL_PREFIX}-")) else {
            continue;
        };
        if verify_marker(&entry.path()).is_ok() {
            out.push(id.to_string());
        }
    }
    out.sort();
    Ok(out)
}

/// The install is only as good as its marker: `bin/java` must exist and be
/// executable for the identifier to count as installed.
pub fn verify_marker(dir: &Path) -> Result<()> {
    let marker = dir.join(MARKER_REL);
    let meta = std::fs::metadata(&marker)
        .with_context(|| format!("missing marker executable {}", marker.display()))?;
    if !meta.is_file() {
        bail!("marker is not a file: {}", marker.display());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        if meta.permissions().mode() & 0o111 == 0 {
            bail!("marker is not executable: {}", marker.display());
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    TarXz,
    Zip,
}

impl ArchiveFormat {
    pub fn from_url(url: &str) -> Result<Self> {
        let file = url_filename(url)
            .ok_or_else(|| anyhow!("cannot derive archive filename from url: {url}"))?;
        if file.ends_with(".tar.gz") || file.ends_with(".tgz") {
            return Ok(Self::TarGz);
        }
        if file.ends_with(".tar.xz") || file.ends_with(".txz") {
            return Ok(Self::TarXz);
        }
        if file.ends_with(".zip") {
            return Ok(Self::Zip);
        }
        bail!("unsupported archive format: {file}")
    }

    pub fn ext(self) -> &'static str {
        match self {
            Self::TarGz => "tar.gz",
            Self::TarXz => "tar.xz",
            Self::Zip => "zip",
        }
    }
}

fn url_filename(url: &str) -> Option<String> {
    let parsed = url.split('?').next().unwrap_or(url);
    let file = parsed.rsplit('/').next()?;
    if file.is_empty() {
        return None;
    }
    Some(file.to_string())
}

fn download(url: &str, dest: &Path) -> Result<()> {
    let resp = ureq::get(url)
        .call()
        .with_context(|| format!("GET {url}"))?;
    let mut reader = resp.into_body().into_reader();

    let tmp = dest.with_extension("download.tmp");
    if let Some(parent) = tmp.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create_dir_all {}", parent.display()))?;
    }
    let mut f = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;

    let mut buf = [0u8; 1024 * 64];
    loop {
        let n = reader.read(&mut buf).context("read download stream")?;
        if n == 0 {
            break;
        }
        f.write_all(&buf[..n]).context("write download")?;
    }
    f.flush().ok();
    drop(f);

    rename_overwrite_file(&tmp, dest)?;
    Ok(())
}

fn extract_archive(path: &Path, format: ArchiveFormat, out_dir: &Path) -> Result<()> {
    match format {
        ArchiveFormat::TarGz => {
            let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
            extract_tar(GzDecoder::new(f), out_dir)
        }
        ArchiveFormat::TarXz => {
            let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
            extract_tar(XzDecoder::new(f), out_dir)
        }
        ArchiveFormat::Zip => extract_zip(path, out_dir),
    }
}

fn extract_tar<R: std::io::Read>(reader: R, out_dir: &Path) -> Result<()> {
    let mut ar = tar::Archive::new(reader);
    for entry in ar.entries().context("read tar entries")? {
        let mut entry = entry?;
        let entry_path = entry.path()?.to_path_buf();
        let rel = sanitize_rel_path(&entry_path)?;
        // The archive's own top-level directory is stripped so the marker
        // lands at the fixed relative sub-path.
        let Some(rel) = strip_first_component(&rel) else {
            continue;
        };
        let out_path = out_dir.join(rel);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create_dir_all {}", parent.display()))?;
        }
        entry
            .unpack(&out_path)
            .with_context(|| format!("unpack {}", out_path.display()))?;
    }
    Ok(())
}

fn extract_zip(path: &Path, out_dir: &Path) -> Result<()> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut z = zip::ZipArchive::new(f).context("open zip")?;
    for i in 0..z.len() {
        let mut file = z.by_index(i).context("zip entry")?;
        let name = file.name().to_string();
        let rel = sanitize_rel_path(Path::new(&name))?;
        let Some(rel) = strip_first_component(&rel) else {
            continue;
        };
        let out_path = out_dir.join(rel);
        if file.is_dir() {
            std::fs::create_dir_all(&out_path)
                .with_context(|| format!("create_dir_all {}", out_path.display()))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create_dir_all {}", parent.display()))?;
        }
        let mut out =
            File::create(&out_path).with_context(|| format!("create {}", out_path.display()))?;
        std::io::copy(&mut file, &mut out)
            .with_context(|| format!("write {}", out_path.display()))?;
        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt as _;
            std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode))
                .with_context(|| format!("chmod {}", out_path.display()))?;
        }
    }
    Ok(())
}

fn sanitize_rel_path(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::Prefix(_) | Component::RootDir => {
                bail!("invalid archive path (absolute): {}", path.display())
            }
            Component::ParentDir => bail!("invalid archive path (..): {}", path.display()),
            Component::CurDir => {}
            Component::Normal(p) => out.push(p),
        }
    }
    Ok(out)
}

fn strip_first_component(rel: &Path) -> Option<PathBuf> {
    let mut comps = rel.components();
    comps.next()?;
    let rest = comps.as_path();
    if rest.as_os_str().is_empty() {
        return None;
    }
    Some(rest.to_path_buf())
}

fn rename_overwrite_file(src: &Path, dst: &Path) -> Result<()> {
    if dst.exists() && dst.is_dir() {
        bail!("refusing to overwrite directory: {}", dst.display());
    }
    #[cfg(windows)]
    {
        if dst.exists() {
            std::fs::remove_file(dst).with_context(|| format!("remove {}", dst.display()))?;
        }
    }
    std::fs::rename(src, dst)
        .with_context(|| format!("rename {} -> {}", src.display(), dst.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_format_from_url() {
        assert_eq!(
            ArchiveFormat::from_url("https://example.com/jdk-17.tar.gz").unwrap(),
            ArchiveFormat::TarGz
        );
        assert_eq!(
            ArchiveFormat::from_url("https://example.com/jdk-21_linux.tar.xz?x=1").unwrap(),
            ArchiveFormat::TarXz
        );
        assert_eq!(
            ArchiveFormat::from_url("https://example.com/jdk-17.zip").unwrap(),
            ArchiveFormat::Zip
        );
        assert!(ArchiveFormat::from_url("https://example.com/jdk-17.rar").is_err());
    }

    #[test]
    fn strip_drops_the_archive_top_level() {
        assert_eq!(
            strip_first_component(Path::new("jdk-17.0.2/bin/java")),
            Some(PathBuf::from("bin/java"))
        );
        assert_eq!(strip_first_component(Path::new("jdk-17.0.2")), None);
    }

    #[test]
    fn sanitize_rejects_escapes() {
        assert!(sanitize_rel_path(Path::new("/etc/passwd")).is_err());
        assert!(sanitize_rel_path(Path::new("a/../../b")).is_err());
        assert!(sanitize_rel_path(Path::new("./a/b")).is_ok());
    }
}
