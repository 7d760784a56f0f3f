//! Hosts file rule blocks
//!
//! Entries are written between a begin and an end marker carrying the block
//! name. Lines outside the block are preserved byte for byte.

use super::{DnsRevert, DnsRules, HostEntry};
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

const MARKER_PREFIX: &str = "# kube-tunnel";

pub struct HostsFile {
    path: PathBuf,
    // serializes read-modify-write of the file
    lock: Mutex<()>,
}

impl HostsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        HostsFile {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<String> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(Error::system(format!(
                "cannot read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn write(&self, content: &str) -> Result<()> {
        fs::write(&self.path, content).await.map_err(|e| {
            Error::system(format!("cannot write {}: {}", self.path.display(), e))
        })
    }
}

fn begin_marker(block: &str) -> String {
    format!("{} begin {}", MARKER_PREFIX, block)
}

fn end_marker(block: &str) -> String {
    format!("{} end {}", MARKER_PREFIX, block)
}

/// Content with the named block removed, and whether it was present
fn strip_block(content: &str, block: &str) -> (String, bool) {
    let begin = begin_marker(block);
    let end = end_marker(block);
    let mut out = String::with_capacity(content.len());
    let mut inside = false;
    let mut found = false;
    for line in content.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if trimmed == begin {
            inside = true;
            found = true;
            continue;
        }
        if inside {
            if trimmed == end {
                inside = false;
            }
            continue;
        }
        out.push_str(line);
    }
    (out, found)
}

fn render_block(block: &str, entries: &[HostEntry]) -> String {
    let mut out = begin_marker(block);
    out.push('\n');
    for entry in entries {
        out.push_str(&format!("{}\t{}\n", entry.ip, entry.names.join(" ")));
    }
    out.push_str(&end_marker(block));
    out.push('\n');
    out
}

#[async_trait]
impl DnsRules for HostsFile {
    async fn install(&self, block: &str, entries: &[HostEntry]) -> Result<DnsRevert> {
        let _guard = self.lock.lock().await;
        let (mut content, replaced) = strip_block(&self.read().await?, block);
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&render_block(block, entries));
        self.write(&content).await?;

        if replaced {
            debug!("Replaced stale hosts block {}", block);
        }
        info!("{} host entries written to {}", entries.len(), self.path.display());
        Ok(DnsRevert {
            block: block.to_string(),
            entries: entries.len(),
        })
    }

    async fn remove(&self, token: DnsRevert) -> Result<()> {
        let _guard = self.lock.lock().await;
        let (content, found) = strip_block(&self.read().await?, &token.block);
        if found {
            self.write(&content).await?;
            debug!("Hosts block {} removed from {}", token.block, self.path.display());
        }
        Ok(())
    }
}
