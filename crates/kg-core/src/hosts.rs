//! Hosts-file resource manager
//!
//! Lines owned by this tool carry a marker token (see
//! [`ClusterSpec::hosts_marker`](crate::types::ClusterSpec::hosts_marker)).
//! The block is always flushed and rewritten as a whole: every marked line
//! is removed, then one line per entry is appended. Nothing is edited in
//! place, so repeated runs never accumulate stale or duplicate entries.
//!
//! The hosts file is shared with the rest of the system and no lock is held
//! between reading and writing it. A concurrent writer inside that window
//! can lose its change.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::types::HostEntry;

/// Handle on a hosts file
#[derive(Debug, Clone)]
pub struct HostsFile {
    path: PathBuf,
}

impl HostsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current contents; a missing file reads as empty
    pub fn read(&self) -> io::Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    /// Fails if the file could not be rewritten in place
    ///
    /// Opens for append without writing anything. A missing file counts as
    /// writable when its directory exists, since a write would create it.
    pub fn check_writable(&self) -> io::Result<()> {
        if self.path.exists() {
            return fs::OpenOptions::new().append(true).open(&self.path).map(|_| ());
        }
        match self.path.parent() {
            Some(dir) if dir.as_os_str().is_empty() || dir.is_dir() => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "parent directory does not exist",
            )),
        }
    }

    /// Lines currently tagged with `marker`
    pub fn block(&self, marker: &str) -> io::Result<Vec<String>> {
        Ok(self
            .read()?
            .lines()
            .filter(|line| is_marked(line, marker))
            .map(str::to_string)
            .collect())
    }

    /// Delete every line tagged with `marker`
    ///
    /// Returns the number of lines removed. When nothing matches the file is
    /// not written at all.
    pub fn remove(&self, marker: &str) -> io::Result<usize> {
        let content = self.read()?;
        let (stripped, removed) = strip_marked(&content, marker);
        if removed > 0 {
            fs::write(&self.path, stripped)?;
            tracing::debug!("Removed {} line(s) tagged {} from {:?}", removed, marker, self.path);
        }
        Ok(removed)
    }

    /// Append one tagged line per entry
    pub fn add(&self, marker: &str, entries: &[HostEntry]) -> io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let content = self.read()?;
        fs::write(&self.path, append_entries(&content, marker, entries))?;
        tracing::debug!("Added {} line(s) tagged {} to {:?}", entries.len(), marker, self.path);
        Ok(())
    }

    /// Remove the whole block, then add `entries`
    pub fn rewrite(&self, marker: &str, entries: &[HostEntry]) -> io::Result<()> {
        self.remove(marker)?;
        self.add(marker, entries)
    }
}

/// Whether `line` carries `marker` as a whitespace-delimited token
///
/// Token matching keeps `#kind-gitops:dev` from also claiming lines tagged
/// `#kind-gitops:dev2`.
pub fn is_marked(line: &str, marker: &str) -> bool {
    line.split_whitespace().any(|token| token == marker)
}

/// Format one tagged hosts line
pub fn format_entry(entry: &HostEntry, marker: &str) -> String {
    format!("{}\t{} {}", entry.address, entry.hostname, marker)
}

/// `content` without the lines tagged `marker`, and how many were dropped
pub fn strip_marked(content: &str, marker: &str) -> (String, usize) {
    let mut kept = String::with_capacity(content.len());
    let mut removed = 0;
    // Unrelated lines keep their own terminators
    for line in content.split_inclusive('\n') {
        if is_marked(line, marker) {
            removed += 1;
        } else {
            kept.push_str(line);
        }
    }
    (kept, removed)
}

/// Line terminator used by `content`; CRLF files stay CRLF
fn line_ending(content: &str) -> &'static str {
    if content.contains("\r\n") {
        "\r\n"
    } else {
        "\n"
    }
}

/// `content` with one tagged line per entry appended
pub fn append_entries(content: &str, marker: &str, entries: &[HostEntry]) -> String {
    let eol = line_ending(content);
    let mut out = content.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push_str(eol);
    }
    for entry in entries {
        out.push_str(&format_entry(entry, marker));
        out.push_str(eol);
    }
    out
}

/// Full flush-and-rewrite of `content`
pub fn rewrite_content(content: &str, marker: &str, entries: &[HostEntry]) -> String {
    let (stripped, _) = strip_marked(content, marker);
    append_entries(&stripped, marker, entries)
}
