//! Operator-facing status lines
//!
//! The supervisor reports what it is doing (listening address, watched
//! directory, change notices, fatal errors) through a [`StatusSink`].
//! Diagnostic logging goes through `tracing` separately.

use std::sync::Arc;

use colored::Colorize;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    /// Secondary information, rendered dimmed
    Detail,
    Warning,
    Error,
}

pub trait StatusSink: Send + Sync {
    fn emit(&self, level: StatusLevel, line: &str);

    fn info(&self, line: &str) {
        self.emit(StatusLevel::Info, line);
    }

    fn detail(&self, line: &str) {
        self.emit(StatusLevel::Detail, line);
    }

    fn warning(&self, line: &str) {
        self.emit(StatusLevel::Warning, line);
    }

    fn error(&self, line: &str) {
        self.emit(StatusLevel::Error, line);
    }
}

/// Colored lines on stdout
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleStatus;

impl StatusSink for ConsoleStatus {
    fn emit(&self, level: StatusLevel, line: &str) {
        match level {
            StatusLevel::Info => println!("{}", line),
            StatusLevel::Detail => println!("{}", line.dimmed()),
            StatusLevel::Warning => println!("{}", line.yellow()),
            StatusLevel::Error => println!("{}", line.red()),
        }
    }
}

/// Keeps every line in memory
#[derive(Debug, Default, Clone)]
pub struct RecordingStatus {
    lines: Arc<Mutex<Vec<(StatusLevel, String)>>>,
}

impl RecordingStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().map(|(_, l)| l.clone()).collect()
    }

    pub fn entries(&self) -> Vec<(StatusLevel, String)> {
        self.lines.lock().clone()
    }

    /// Whether any line contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|(_, l)| l.contains(needle))
    }

    /// Number of lines containing `needle`
    pub fn count(&self, needle: &str) -> usize {
        self.lines.lock().iter().filter(|(_, l)| l.contains(needle)).count()
    }
}

impl StatusSink for RecordingStatus {
    fn emit(&self, level: StatusLevel, line: &str) {
        self.lines.lock().push((level, line.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_status() {
        let status = RecordingStatus::new();
        let sink: &dyn StatusSink = &status;
        sink.info("Server listening at http://localhost:2020");
        sink.warning("A fatal error occurred!");

        assert_eq!(status.lines().len(), 2);
        assert!(status.contains("localhost:2020"));
        assert_eq!(status.count("fatal"), 1);
        assert_eq!(status.entries()[1].0, StatusLevel::Warning);
    }
}
