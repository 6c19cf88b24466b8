//! Record of every remote object a run creates, deletes or leaves alone.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use floe_types::{Result, RunId};

pub const LEDGER_FILE: &str = "transfers.ndjson";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerAction {
    Upload,
    Delete,
    Keep,
    SkipYoung,
    ThawRequest,
    Download,
}

impl LedgerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerAction::Upload => "upload",
            LedgerAction::Delete => "delete",
            LedgerAction::Keep => "keep",
            LedgerAction::SkipYoung => "skip-young",
            LedgerAction::ThawRequest => "thaw-request",
            LedgerAction::Download => "download",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub time: DateTime<Utc>,
    pub run_id: String,
    pub action: LedgerAction,
    pub key: String,
    pub bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Live runs append each entry to `<log_dir>/transfers.ndjson` as it
/// happens; dry runs only keep them in memory.
#[derive(Debug)]
pub struct Ledger {
    run_id: RunId,
    dry_run: bool,
    path: Option<PathBuf>,
    entries: Mutex<Vec<LedgerEntry>>,
}

impl Ledger {
    pub fn new(run_id: RunId, dry_run: bool, log_dir: Option<PathBuf>) -> Self {
        let path = if dry_run {
            None
        } else {
            log_dir.map(|d| d.join(LEDGER_FILE))
        };
        Self {
            run_id,
            dry_run,
            path,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// In-memory only, for read-only commands and tests.
    pub fn ephemeral(run_id: RunId, dry_run: bool) -> Self {
        Self::new(run_id, dry_run, None)
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn record(
        &self,
        action: LedgerAction,
        key: &str,
        bytes: u64,
        etag: Option<&str>,
        note: Option<String>,
    ) {
        let entry = LedgerEntry {
            time: Utc::now(),
            run_id: self.run_id.to_hex(),
            action,
            key: key.to_string(),
            bytes,
            etag: etag.map(str::to_string),
            dry_run: self.dry_run,
            note,
        };
        let tag = if self.dry_run { "[dry-run] " } else { "" };
        info!("{tag}{} {key} ({bytes} bytes)", action.as_str());
        if let Some(path) = &self.path {
            if let Err(e) = append_line(path, &entry) {
                warn!("failed to append to transfer ledger {}: {e}", path.display());
            }
        }
        self.entries.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn count(&self, action: LedgerAction) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.action == action)
            .count()
    }
}

fn append_line(path: &std::path::Path, entry: &LedgerEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&line)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_ledger_appends_ndjson() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(RunId([1, 2, 3, 4]), false, Some(dir.path().to_path_buf()));
        ledger.record(LedgerAction::Upload, "k1", 10, Some("e1"), None);
        ledger.record(LedgerAction::Keep, "k2", 0, None, Some("unchanged".into()));

        let text = std::fs::read_to_string(dir.path().join(LEDGER_FILE)).unwrap();
        let lines: Vec<LedgerEntry> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].action, LedgerAction::Upload);
        assert_eq!(lines[0].run_id, "01020304");
        assert_eq!(ledger.count(LedgerAction::Keep), 1);
    }

    #[test]
    fn dry_run_ledger_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(RunId::generate(), true, Some(dir.path().to_path_buf()));
        ledger.record(LedgerAction::Delete, "k", 5, None, None);
        assert!(!dir.path().join(LEDGER_FILE).exists());
        assert_eq!(ledger.entries().len(), 1);
        assert!(ledger.entries()[0].dry_run);
    }
}
