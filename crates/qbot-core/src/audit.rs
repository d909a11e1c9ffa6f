//! Submission audit trail: JSON lines on disk plus a short in-memory tail.

use std::{
    collections::VecDeque,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use crate::{domain::SubmissionRecord, Result};

const RECENT_CAPACITY: usize = 256;
const MAX_ERROR_TEXT: usize = 500;

pub struct SubmissionLog {
    path: Option<PathBuf>,
    recent: Mutex<VecDeque<SubmissionRecord>>,
}

impl SubmissionLog {
    /// Append-only log at `path`. The parent directory is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            recent: Mutex::new(VecDeque::new()),
        }
    }

    /// Keeps records in memory only.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            recent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record one submission. The in-memory tail is always updated; the
    /// returned error only concerns the file append.
    pub fn record(&self, mut record: SubmissionRecord) -> Result<()> {
        if let Some(err) = &record.error {
            record.error = Some(truncate_text(err, MAX_ERROR_TEXT));
        }

        {
            let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
            if recent.len() == RECENT_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(record.clone());
        }

        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(&record)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Most recent records, oldest first.
    pub fn recent(&self) -> Vec<SubmissionRecord> {
        self.recent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

pub fn truncate_text(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out = s.chars().take(max_chars).collect::<String>();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountId, Letter};
    use chrono::Utc;

    fn record(n: usize, delivered: bool) -> SubmissionRecord {
        SubmissionRecord {
            fingerprint: format!("fp{n}"),
            letter: Letter::A,
            account_id: AccountId("main".into()),
            submitted_at: Utc::now(),
            delivered,
            error: (!delivered).then(|| "send failed".to_string()),
        }
    }

    #[test]
    fn appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("submissions.log");
        let log = SubmissionLog::new(&path);

        log.record(record(1, true)).unwrap();
        log.record(record(2, false)).unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["fingerprint"], "fp1");
        assert_eq!(lines[0]["letter"], "A");
        assert!(lines[0].get("error").is_none());
        assert_eq!(lines[1]["delivered"], false);
        assert_eq!(lines[1]["error"], "send failed");
    }

    #[test]
    fn in_memory_tail_is_bounded() {
        let log = SubmissionLog::in_memory();
        for n in 0..RECENT_CAPACITY + 10 {
            log.record(record(n, true)).unwrap();
        }
        let recent = log.recent();
        assert_eq!(recent.len(), RECENT_CAPACITY);
        assert_eq!(recent[0].fingerprint, "fp10");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_text("hello", 10), "hello");
        assert_eq!(truncate_text("héllo wörld", 5), "héllo...");
    }
}
