use std::io::Write as _;

use anyhow::{Context, Result};
use serde::Serialize;

#[derive(Debug, Clone, Copy)]
pub struct Reporter {
    pub json: bool,
    pub quiet: bool,
}

impl Reporter {
    pub fn progress(&self, msg: &str) {
        if self.json || self.quiet {
            return;
        }
        eprintln!("{msg}");
    }

    pub fn warn(&self, msg: &str) {
        if self.json {
            return;
        }
        eprintln!("warning: {msg}");
    }
}

pub fn write_json_stdout<T: Serialize>(v: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec(v)?;
    bytes.push(b'\n');
    std::io::stdout()
        .write_all(&bytes)
        .context("write stdout")?;
    Ok(())
}
