//! Directory fingerprints for polling mode

use std::fs::Metadata;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use super::PollSettings;

fn nanos(time: std::io::Result<SystemTime>) -> u128 {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

fn file_hash(name: &str, meta: &Metadata) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{}|{}|{}|{}",
        name,
        meta.len(),
        nanos(meta.created()),
        nanos(meta.modified())
    ));
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Summarize every file under `dir` whose absolute path matches `pattern`.
///
/// Each file contributes a hash of its name, size, creation and write time.
/// Unreadable entries are skipped.
pub fn fingerprint(dir: &Path, pattern: &Regex) -> String {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| pattern.is_match(&entry.path().to_string_lossy()))
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            Some(file_hash(&entry.file_name().to_string_lossy(), &meta))
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Polling state carried across ticks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchState {
    last_fingerprint: Option<String>,
    last_access_time: Option<SystemTime>,
}

impl WatchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_fingerprint(&self) -> Option<&str> {
        self.last_fingerprint.as_deref()
    }

    pub fn last_access_time(&self) -> Option<SystemTime> {
        self.last_access_time
    }

    /// Take a new reading of `dir`. Returns true only when a previous
    /// fingerprint exists and differs from the current one; the first
    /// reading just sets the baseline.
    pub fn observe(&mut self, dir: &Path, pattern: &Regex, settings: PollSettings) -> bool {
        if settings.trust_access_time {
            let accessed = std::fs::metadata(dir).and_then(|m| m.accessed()).ok();
            if self.last_fingerprint.is_some()
                && accessed.is_some()
                && accessed == self.last_access_time
            {
                return false;
            }
            self.last_access_time = accessed;
        }

        let current = fingerprint(dir, pattern);
        let changed = matches!(&self.last_fingerprint, Some(previous) if *previous != current);
        self.last_fingerprint = Some(current);
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all() -> Regex {
        Regex::new(r"\.*").unwrap()
    }

    #[test]
    fn test_fingerprint_tracks_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.so"), b"one").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("b.so"), b"two").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let libs = Regex::new(r"\.so$").unwrap();
        let print = fingerprint(dir.path(), &libs);
        assert_eq!(print.split(';').count(), 2);
        assert!(print.split(';').all(|part| part.len() == 16));

        std::fs::write(dir.path().join("notes.txt"), b"still ignored").unwrap();
        assert_eq!(fingerprint(dir.path(), &libs), print);

        std::fs::write(dir.path().join("nested").join("b.so"), b"two, longer").unwrap();
        assert_ne!(fingerprint(dir.path(), &libs), print);
    }

    #[test]
    fn test_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(fingerprint(dir.path(), &all()), "");
    }

    #[test]
    fn test_first_observation_is_baseline() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.so"), b"v1").unwrap();

        let mut state = WatchState::new();
        assert!(state.last_fingerprint().is_none());
        assert!(!state.observe(dir.path(), &all(), PollSettings::default()));
        assert!(state.last_fingerprint().is_some());
        assert!(!state.observe(dir.path(), &all(), PollSettings::default()));

        std::fs::write(dir.path().join("app.so"), b"v2 is bigger").unwrap();
        assert!(state.observe(dir.path(), &all(), PollSettings::default()));
        assert!(!state.observe(dir.path(), &all(), PollSettings::default()));
    }

    #[test]
    fn test_empty_baseline_still_detects_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = WatchState::new();
        assert!(!state.observe(dir.path(), &all(), PollSettings::default()));

        std::fs::write(dir.path().join("app.so"), b"v1").unwrap();
        assert!(state.observe(dir.path(), &all(), PollSettings::default()));
    }
}
