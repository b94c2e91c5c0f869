/// Token usage scraped from project logs
///
/// Only the tail of each log is read. Within one file the first pattern that matches
/// anything wins and its last hits are summed; files are added together. Logs that are
/// missing or unreadable count as zero.
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::project::ProjectDescriptor;

/// How much of the end of each log we look at
const TAIL_BYTES: u64 = 150 * 1024;

/// Hits summed per file, counted from the end
const HITS_PER_FILE: usize = 100;

// Most specific first: JSON usage blocks, then free-form log lines
static TOKEN_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#""total_tokens"\s*:\s*(\d+)"#,
        r#""completion_tokens"\s*:\s*(\d+)"#,
        r#""prompt_tokens"\s*:\s*(\d+)"#,
        r"[Tt]otal[_ ]?[Tt]okens?\s*[:=]\s*(\d+)",
        r"[Tt]okens?\s+used\s*[:=]\s*(\d+)",
        r"input_tokens.*?(\d+)",
        r"output_tokens.*?(\d+)",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Token count in one chunk of log text
pub fn count_tokens(text: &str) -> u64 {
    for pattern in TOKEN_PATTERNS.iter() {
        let hits: Vec<&str> = pattern
            .captures_iter(text)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
            .collect();
        if hits.is_empty() {
            continue;
        }
        return hits
            .iter()
            .rev()
            .take(HITS_PER_FILE)
            .filter_map(|hit| hit.parse::<u64>().ok())
            .fold(0u64, u64::saturating_add);
    }
    0
}

/// Explicit `log_files` relative to the project path, else every `*.log` directly in it
pub fn log_paths(descriptor: &ProjectDescriptor) -> Vec<PathBuf> {
    if descriptor.path.is_empty() {
        return Vec::new();
    }
    let root = Path::new(&descriptor.path);
    if !descriptor.log_files.is_empty() {
        return descriptor.log_files.iter().map(|file| root.join(file)).collect();
    }

    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            let visible = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| !name.starts_with('.'));
            visible && path.is_file() && path.extension().is_some_and(|ext| ext == "log")
        })
        .collect();
    paths.sort();
    paths
}

fn read_tail(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(TAIL_BYTES)))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Total tokens reported across a project's logs. Blocking file I/O.
pub fn token_usage(descriptor: &ProjectDescriptor) -> u64 {
    log_paths(descriptor)
        .iter()
        .filter(|path| path.exists())
        .filter_map(|path| match read_tail(path) {
            Ok(text) => Some(count_tokens(&text)),
            Err(e) => {
                debug!("Skipping log {:?}: {}", path, e);
                None
            }
        })
        .fold(0u64, u64::saturating_add)
}
