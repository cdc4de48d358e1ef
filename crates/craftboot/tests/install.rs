use std::io::{Read as _, Write as _};
use std::net::TcpListener;
use std::path::Path;
use std::time::Duration;

use craftboot::config::RuntimeSpec;
use craftboot::install::{self, InstallStatus};
use craftboot::report::Reporter;
use craftboot::storage::Storage;

const QUIET: Reporter = Reporter {
    json: false,
    quiet: true,
};

fn storage_at(dir: &Path) -> Storage {
    let root = dir.join("base");
    let scratch = root.join("downloads");
    std::fs::create_dir_all(&scratch).expect("create scratch");
    Storage { root, scratch }
}

/// In-memory `tar.gz` with the given (path, contents, mode) entries.
fn tar_gz_with(entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
    let enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(enc);
    for (path, data, mode) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(*mode);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).expect("append");
    }
    let enc = builder.into_inner().expect("finish tar");
    enc.finish().expect("finish gzip")
}

fn jdk_archive() -> Vec<u8> {
    tar_gz_with(&[("jdk-17.0.2/bin/java", b"#!/bin/sh\nexit 0\n", 0o755)])
}

/// One-shot HTTP server; answers a single request then goes away.
fn serve_once(status_line: &str, body: Vec<u8>, filename: &str) -> String {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
    let addr = listener.local_addr().expect("local_addr");

    let status_line = status_line.to_string();
    std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let _ = stream.set_read_timeout(Some(Duration::from_secs(1)));

        let mut buf = Vec::new();
        let mut tmp = [0u8; 4096];
        for _ in 0..64 {
            match stream.read(&mut tmp) {
                Ok(0) => break,
                Ok(n) => {
                    buf.extend_from_slice(&tmp[..n]);
                    if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        let head = format!(
            "HTTP/1.1 {status_line}\r\n\
Content-Type: application/octet-stream\r\n\
Content-Length: {}\r\n\
Connection: close\r\n\
\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes()).expect("write head");
        stream.write_all(&body).expect("write body");
        let _ = stream.flush();
    });

    format!("http://{addr}/{filename}")
}

fn spec(id: &str, url: &str) -> RuntimeSpec {
    RuntimeSpec {
        id: id.to_string(),
        url: Some(url.to_string()),
    }
}

/// Pre-seed an installed runtime with a valid marker.
fn seed_installed(root: &Path, id: &str) {
    let bin = install::install_dir(root, id).join("bin");
    std::fs::create_dir_all(&bin).expect("create bin");
    let marker = bin.join("java");
    std::fs::write(&marker, b"#!/bin/sh\nexit 0\n").expect("write marker");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(&marker, std::fs::Permissions::from_mode(0o755))
            .expect("chmod marker");
    }
}

#[test]
fn installs_and_verifies_marker() {
    let dir = tempfile::tempdir().expect("tempdir");
    let st = storage_at(dir.path());
    let url = serve_once("200 OK", jdk_archive(), "jdk-17.tar.gz");

    let summary = install::ensure_all(&st, &[spec("17", &url)], &QUIET);
    assert!(!summary.had_errors);
    assert_eq!(summary.outcomes.len(), 1);
    assert_eq!(summary.outcomes[0].status, InstallStatus::Installed);

    let marker = install::marker_path(&st.root, "17");
    assert!(marker.is_file(), "missing {}", marker.display());
    assert!(install::is_installed(&st.root, "17"));
}

#[test]
fn second_run_performs_zero_transfers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let st = storage_at(dir.path());
    let url = serve_once("200 OK", jdk_archive(), "jdk-17.tar.gz");

    let first = install::ensure_all(&st, &[spec("17", &url)], &QUIET);
    assert_eq!(first.outcomes[0].status, InstallStatus::Installed);

    // The one-shot server is gone; any transfer attempt now would fail.
    let second = install::ensure_all(&st, &[spec("17", &url)], &QUIET);
    assert!(!second.had_errors);
    assert_eq!(second.outcomes[0].status, InstallStatus::AlreadyInstalled);
    assert!(install::is_installed(&st.root, "17"));
}

#[test]
fn cached_archive_is_trusted_by_presence() {
    let dir = tempfile::tempdir().expect("tempdir");
    let st = storage_at(dir.path());
    std::fs::write(st.scratch.join("java-17.tar.gz"), jdk_archive()).expect("seed cache");

    // Unreachable source: the install must come from the cache alone.
    let dead = "http://127.0.0.1:1/jdk-17.tar.gz";
    let (status, _) = install::ensure_one(&st, &spec("17", dead), &QUIET).expect("install");
    assert_eq!(status, InstallStatus::Installed);
    assert!(install::is_installed(&st.root, "17"));
}

#[test]
fn failed_transfer_does_not_block_siblings() {
    let dir = tempfile::tempdir().expect("tempdir");
    let st = storage_at(dir.path());
    let good = serve_once("200 OK", jdk_archive(), "jdk-17.tar.gz");
    let bad = serve_once("404 Not Found", b"not found".to_vec(), "jdk-21.tar.gz");

    let summary = install::ensure_all(&st, &[spec("17", &good), spec("21", &bad)], &QUIET);
    assert!(summary.had_errors);
    assert_eq!(summary.outcomes[0].status, InstallStatus::Installed);
    assert_eq!(summary.outcomes[1].status, InstallStatus::Failed);
    assert!(install::is_installed(&st.root, "17"));
    assert!(!install::install_dir(&st.root, "21").exists());
}

#[test]
fn verification_failure_removes_partial_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let st = storage_at(dir.path());
    let no_marker = tar_gz_with(&[("jdk-17.0.2/readme.txt", b"no java here", 0o644)]);
    let url = serve_once("200 OK", no_marker, "jdk-17.tar.gz");

    let summary = install::ensure_all(&st, &[spec("17", &url)], &QUIET);
    assert!(summary.had_errors);
    assert_eq!(summary.outcomes[0].status, InstallStatus::Failed);
    assert!(!install::install_dir(&st.root, "17").exists());

    // No staging directory may survive either.
    for entry in std::fs::read_dir(&st.root).expect("read root") {
        let name = entry.expect("entry").file_name().to_string_lossy().to_string();
        assert!(!name.starts_with(".tmp_"), "leftover staging dir {name}");
    }
}

#[test]
fn three_identifier_scenario() {
    let dir = tempfile::tempdir().expect("tempdir");
    let st = storage_at(dir.path());
    seed_installed(&st.root, "8");

    let good = serve_once("200 OK", jdk_archive(), "jdk-17.tar.gz");
    let bad = serve_once("404 Not Found", b"gone".to_vec(), "jdk-21.tar.gz");

    let specs = [spec("17", &good), spec("21", &bad), spec("8", "http://127.0.0.1:1/unused.tar.gz")];
    let summary = install::ensure_all(&st, &specs, &QUIET);

    assert_eq!(summary.outcomes[0].status, InstallStatus::Installed);
    assert_eq!(summary.outcomes[1].status, InstallStatus::Failed);
    assert_eq!(summary.outcomes[2].status, InstallStatus::AlreadyInstalled);
    assert!(summary.had_errors);

    let installed = install::list_installed(&st.root).expect("list");
    assert_eq!(installed, vec!["17".to_string(), "8".to_string()]);
}
