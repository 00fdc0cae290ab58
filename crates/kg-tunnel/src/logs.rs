//! Per-port tunnel log files

use std::io;
use std::path::Path;

/// Lines shown by `logs` when no count is given
pub const DEFAULT_TAIL_LINES: usize = 50;

/// Last `lines` lines of `path`, or `None` if the file does not exist
pub fn tail(path: &Path, lines: usize) -> io::Result<Option<String>> {
    let content = match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    Ok(Some(last_lines(&content, lines)))
}

fn last_lines(content: &str, lines: usize) -> String {
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
