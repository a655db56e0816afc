pub mod storage;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::pipeline::{OutcomeStatus, RunReport};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    pub timestamp: DateTime<Local>,
    pub package: String,
    pub status: OutcomeStatus,
    pub duration: f64,
    pub diagnostic_count: usize,
    pub output_lines: usize,
    #[serde(default)]
    pub first_diagnostic: Option<String>,
}

impl RunHistoryEntry {
    pub fn from_report(report: &RunReport) -> Self {
        let diagnostics = report.outcome.diagnostics();
        Self {
            timestamp: Local::now(),
            package: report.package.clone(),
            status: report.outcome.status(),
            duration: report.elapsed.as_secs_f64(),
            diagnostic_count: diagnostics.len(),
            output_lines: report.outcome.output().len(),
            first_diagnostic: diagnostics.first().cloned(),
        }
    }

    /// For runs that were rejected before producing an outcome.
    pub fn rejected(package: impl Into<String>, status: OutcomeStatus, reason: String) -> Self {
        Self {
            timestamp: Local::now(),
            package: package.into(),
            status,
            duration: 0.0,
            diagnostic_count: 1,
            output_lines: 0,
            first_diagnostic: Some(reason),
        }
    }
}

pub struct RunHistory {
    entries: Vec<RunHistoryEntry>,
    storage_path: PathBuf,
    max_runs: usize,
}

impl RunHistory {
    pub fn new(storage_path: PathBuf, max_runs: usize) -> anyhow::Result<Self> {
        let entries = storage::load_history(&storage_path)?;
        Ok(Self {
            entries,
            storage_path,
            max_runs,
        })
    }

    pub fn add_entry(&mut self, entry: RunHistoryEntry) -> anyhow::Result<()> {
        self.entries.push(entry);

        if self.entries.len() > self.max_runs {
            let excess = self.entries.len() - self.max_runs;
            self.entries.drain(..excess);
        }

        storage::save_history(&self.storage_path, &self.entries)
    }

    pub fn entries(&self) -> &[RunHistoryEntry] {
        &self.entries
    }

    pub fn last_entry(&self) -> Option<&RunHistoryEntry> {
        self.entries.last()
    }

    pub fn clear(&mut self) -> anyhow::Result<()> {
        self.entries.clear();
        storage::save_history(&self.storage_path, &self.entries)
    }
}
