//! Durable record of which flow cells and projects were finalised or
//! archived.
//!
//! Stored as CSV with the header `project,flowcell_path,timestamp,archived`.
//! Every mutation rewrites the whole file through a temp file and a rename.
//! A single controller process is the only writer.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use chrono::{Local, NaiveDateTime};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::utils::file::write_atomic;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub project: String,
    pub flowcell_path: String,
    pub timestamp: String,
    /// Empty until the flow cell is archived, then the archival timestamp.
    #[serde(default)]
    pub archived: String,
}

impl LedgerEntry {
    pub fn is_archived(&self) -> bool {
        !self.archived.trim().is_empty()
    }

    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(self.timestamp.trim(), TIMESTAMP_FORMAT).ok()
    }

    fn is_for(&self, flowcell_path: &str) -> bool {
        normalize(&self.flowcell_path) == normalize(flowcell_path)
    }
}

pub fn now_timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

fn normalize(path: &str) -> &str {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() { "/" } else { trimmed }
}

#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: PathBuf) -> Self {
        Ledger { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All rows. A ledger file that does not exist yet is empty.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(&self.path)
            .map_err(|e| anyhow!("Cannot open ledger {}: {}", self.path.display(), e))?;
        let mut rows = Vec::new();
        for record in reader.deserialize() {
            let row: LedgerEntry = record.map_err(|e| anyhow!("Corrupt ledger {}: {}", self.path.display(), e))?;
            rows.push(row);
        }
        Ok(rows)
    }

    fn write_all(&self, rows: &[LedgerEntry]) -> Result<()> {
        let mut writer = csv::WriterBuilder::new().has_headers(true).from_writer(Vec::new());
        if rows.is_empty() {
            writer.write_record(["project", "flowcell_path", "timestamp", "archived"])?;
        }
        for row in rows {
            writer.serialize(row)?;
        }
        let bytes = writer.into_inner().map_err(|e| anyhow!("Cannot encode ledger: {}", e))?;
        write_atomic(&self.path, &bytes)?;
        debug!("Wrote {} rows to {}", rows.len(), self.path.display());
        Ok(())
    }

    pub fn add(&self, project: &str, flowcell_path: &Path, timestamp: &str) -> Result<()> {
        let mut rows = self.entries()?;
        rows.push(LedgerEntry {
            project: project.to_string(),
            flowcell_path: flowcell_path.to_string_lossy().into_owned(),
            timestamp: timestamp.to_string(),
            archived: String::new(),
        });
        self.write_all(&rows)
    }

    /// Rows not yet archived.
    pub fn list(&self) -> Result<Vec<LedgerEntry>> {
        Ok(self.entries()?.into_iter().filter(|r| !r.is_archived()).collect())
    }

    pub fn list_all(&self) -> Result<Vec<LedgerEntry>> {
        self.entries()
    }

    pub fn list_project(&self, project: &str) -> Result<Vec<LedgerEntry>> {
        Ok(self.entries()?.into_iter().filter(|r| r.project == project).collect())
    }

    /// Unarchived rows for one flow cell.
    pub fn list_flowcell(&self, flowcell_path: &Path) -> Result<Vec<LedgerEntry>> {
        let key = flowcell_path.to_string_lossy();
        Ok(self
            .entries()?
            .into_iter()
            .filter(|r| r.is_for(&key) && !r.is_archived())
            .collect())
    }

    pub fn list_flowcell_all(&self, flowcell_path: &Path) -> Result<Vec<LedgerEntry>> {
        let key = flowcell_path.to_string_lossy();
        Ok(self.entries()?.into_iter().filter(|r| r.is_for(&key)).collect())
    }

    /// Deletes every row for the flow cell.
    ///
    /// # Returns
    /// Number of rows removed.
    pub fn delete_flowcell(&self, flowcell_path: &Path) -> Result<usize> {
        let key = flowcell_path.to_string_lossy();
        let rows = self.entries()?;
        let before = rows.len();
        let kept: Vec<LedgerEntry> = rows.into_iter().filter(|r| !r.is_for(&key)).collect();
        let removed = before - kept.len();
        if removed > 0 {
            self.write_all(&kept)?;
        }
        Ok(removed)
    }

    /// Stamps every unarchived row of the flow cell with `timestamp`.
    ///
    /// # Returns
    /// The rows that were stamped.
    pub fn mark_archived(&self, flowcell_path: &Path, timestamp: &str) -> Result<Vec<LedgerEntry>> {
        let key = flowcell_path.to_string_lossy();
        let mut rows = self.entries()?;
        let mut stamped = Vec::new();
        for row in rows.iter_mut() {
            if row.is_for(&key) && !row.is_archived() {
                row.archived = timestamp.to_string();
                stamped.push(row.clone());
            }
        }
        if !stamped.is_empty() {
            self.write_all(&rows)?;
        }
        Ok(stamped)
    }
}

/// Renders rows as an aligned table for the CLI.
pub fn format_entries(rows: &[LedgerEntry]) -> String {
    let headers = ["project", "flowcell_path", "timestamp", "archived"];
    let cells: Vec<[&str; 4]> = rows
        .iter()
        .map(|r| [r.project.as_str(), r.flowcell_path.as_str(), r.timestamp.as_str(), r.archived.as_str()])
        .collect();
    let mut widths = headers.map(|h| h.len());
    for row in &cells {
        for (w, cell) in widths.iter_mut().zip(row.iter()) {
            *w = (*w).max(cell.len());
        }
    }
    let mut out = String::new();
    let line = |out: &mut String, fields: &[&str; 4]| {
        let padded: Vec<String> = fields.iter().zip(widths.iter()).map(|(f, w)| format!("{:<width$}", f, width = *w)).collect();
        out.push_str(padded.join("  ").trim_end());
        out.push('\n');
    };
    line(&mut out, &headers);
    for row in &cells {
        line(&mut out, row);
    }
    out
}

/// Makes sure the directory holding the ledger exists.
pub fn ensure_ledger_dir(ledger: &Ledger) -> Result<()> {
    if let Some(dir) = ledger.path().parent() {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}
