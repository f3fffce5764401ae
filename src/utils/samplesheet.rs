/// Sample sheet (manifest) parsing and sub-sheet rendering.
///
/// Recognised layout, newest manifest revision only:
///
/// ```text
/// [CustomOptions]
/// Organism,Human
/// SingleCell,false
/// [Data]
/// Lane,Sample_ID,Sample_Name,index,index2,Sample_Project
/// 1,S1,liver,ACGTACGT,TTGGCCAA,GCF-0001
/// ```
///
/// Flags placed as top-level header lines by older revisions are ignored.
use std::collections::BTreeSet;
use std::fmt::Write as FmtWrite;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::config::defs::FULL_LANE_COUNT;
use crate::utils::sequence::reverse_complement;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CustomOptions {
    pub organism: String,
    pub libprep: String,
    pub submitter: String,
    pub rerun: bool,
    pub single_cell: bool,
    pub remove_human_reads: bool,
    pub sensitive_data: bool,
    pub reverse_complement_index_p5: bool,
    pub reverse_complement_index_p7: bool,
    pub trim_adapter: bool,
}

impl CustomOptions {
    /// Applies one `key,value` line. Unknown keys are ignored.
    fn set(&mut self, key: &str, value: &str) {
        match key.to_ascii_lowercase().as_str() {
            "organism" => self.organism = value.to_string(),
            "libprep" => self.libprep = value.to_string(),
            "submitter" => self.submitter = value.to_string(),
            "rerun" => self.rerun = str2bool(value),
            "singlecell" => self.single_cell = str2bool(value),
            "removehumanreads" => self.remove_human_reads = str2bool(value),
            "sensitivedata" => self.sensitive_data = str2bool(value),
            "reversecomplementindexp5" => self.reverse_complement_index_p5 = str2bool(value),
            "reversecomplementindexp7" => self.reverse_complement_index_p7 = str2bool(value),
            "trimadapter" => self.trim_adapter = str2bool(value),
            _ => {}
        }
    }
}

pub fn str2bool(s: &str) -> bool {
    let s = s.trim().to_ascii_lowercase();
    s == "true" || s == "1"
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Column {
    Lane,
    SampleId,
    SampleName,
    Index,
    Index2,
    SampleProject,
}

const COLUMN_ORDER: [Column; 6] = [
    Column::Lane,
    Column::SampleId,
    Column::SampleName,
    Column::Index,
    Column::Index2,
    Column::SampleProject,
];

impl Column {
    pub fn name(&self) -> &'static str {
        match self {
            Column::Lane => "Lane",
            Column::SampleId => "Sample_ID",
            Column::SampleName => "Sample_Name",
            Column::Index => "index",
            Column::Index2 => "index2",
            Column::SampleProject => "Sample_Project",
        }
    }

    fn from_header(field: &str) -> Option<Column> {
        COLUMN_ORDER.iter().copied().find(|c| c.name().eq_ignore_ascii_case(field.trim()))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleRow {
    pub lane: Option<u32>,
    pub sample_id: String,
    pub sample_name: String,
    pub index: String,
    pub index2: String,
    pub project: String,
}

impl SampleRow {
    fn field(&self, column: Column) -> String {
        match column {
            Column::Lane => self.lane.map(|l| l.to_string()).unwrap_or_default(),
            Column::SampleId => self.sample_id.clone(),
            Column::SampleName => self.sample_name.clone(),
            Column::Index => self.index.clone(),
            Column::Index2 => self.index2.clone(),
            Column::SampleProject => self.project.clone(),
        }
    }

    pub fn index_lengths(&self) -> (usize, usize) {
        (self.index.len(), self.index2.len())
    }
}

/// Rows sharing one (index1 length, index2 length) pair, demultiplexed in a
/// single invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct SubSheet {
    pub index_lengths: (usize, usize),
    pub columns: Vec<Column>,
    pub rows: Vec<SampleRow>,
    /// Lanes referenced by the rows. Empty means no lane restriction.
    pub lanes: BTreeSet<u32>,
}

impl SubSheet {
    pub fn has_lane_column(&self) -> bool {
        self.columns.contains(&Column::Lane)
    }

    /// Lane digits concatenated, e.g. `"125"`.
    pub fn lane_string(&self) -> String {
        self.lanes.iter().map(|l| l.to_string()).collect()
    }

    pub fn projects(&self) -> BTreeSet<String> {
        self.rows.iter().map(|r| r.project.clone()).filter(|p| !p.is_empty()).collect()
    }

    /// Renders a stand-alone sample sheet for the demultiplexer. The
    /// `[Settings]` block is only emitted when adapter sequences are given.
    pub fn render(&self, adapter: Option<&str>, adapter_read2: Option<&str>) -> String {
        let mut out = String::new();
        if adapter.is_some() || adapter_read2.is_some() {
            out.push_str("[Settings]\n");
            if let Some(a) = adapter {
                let _ = writeln!(out, "Adapter,{}", a);
            }
            if let Some(a) = adapter_read2 {
                let _ = writeln!(out, "AdapterRead2,{}", a);
            }
        }
        out.push_str("[Data]\n");
        let header: Vec<&str> = self.columns.iter().map(|c| c.name()).collect();
        let _ = writeln!(out, "{}", header.join(","));
        for row in &self.rows {
            let fields: Vec<String> = self.columns.iter().map(|c| row.field(*c)).collect();
            let _ = writeln!(out, "{}", fields.join(","));
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedSheet {
    pub sub_sheets: Vec<SubSheet>,
    pub options: CustomOptions,
    pub has_custom_options: bool,
    pub adapter: Option<String>,
    pub adapter_read2: Option<String>,
}

impl ParsedSheet {
    pub fn row_count(&self) -> usize {
        self.sub_sheets.iter().map(|s| s.rows.len()).sum()
    }

    pub fn projects(&self) -> BTreeSet<String> {
        self.sub_sheets.iter().flat_map(|s| s.projects()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    Preamble,
    CustomOptions,
    Settings,
    Data,
    Other,
}

pub fn parse_sample_sheet(path: &Path, lane_count: u32) -> Result<ParsedSheet> {
    let bytes = fs::read(path).map_err(|e| anyhow!("Cannot read {}: {}", path.display(), e))?;
    let text = String::from_utf8_lossy(&bytes);
    Ok(parse_sample_sheet_str(&text, lane_count))
}

/// Parses manifest text. Malformed rows never fail the parse; a manifest
/// without data rows yields no sub-sheets.
///
/// # Arguments
///
/// * `text` - Manifest contents.
/// * `lane_count` - Physical lane count from the run metadata. Below
///   `FULL_LANE_COUNT` the Lane column is dropped.
///
/// # Returns
/// ParsedSheet
pub fn parse_sample_sheet_str(text: &str, lane_count: u32) -> ParsedSheet {
    let lanes_meaningful = lane_count >= FULL_LANE_COUNT;
    let mut parsed = ParsedSheet::default();
    let mut section = Section::Preamble;
    let mut header: Option<Vec<Option<Column>>> = None;
    let mut rows: Vec<SampleRow> = Vec::new();

    for raw_line in text.trim_start_matches('\u{feff}').lines() {
        let line = raw_line.trim_end_matches('\r');
        let trimmed = line.trim();
        if trimmed.starts_with('[') {
            let name = trimmed.trim_start_matches('[').split(']').next().unwrap_or("");
            section = match name.to_ascii_lowercase().as_str() {
                "customoptions" => {
                    parsed.has_custom_options = true;
                    Section::CustomOptions
                }
                "settings" => Section::Settings,
                "data" => Section::Data,
                _ => Section::Other,
            };
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(|f| f.trim()).collect();
        if fields.iter().all(|f| f.is_empty()) {
            continue;
        }

        match section {
            Section::CustomOptions => {
                let value = fields.iter().skip(1).find(|f| !f.is_empty()).copied().unwrap_or("");
                parsed.options.set(fields[0], value);
            }
            Section::Settings => {
                let value = fields.get(1).copied().unwrap_or("");
                match fields[0] {
                    "Adapter" if !value.is_empty() => parsed.adapter = Some(value.to_string()),
                    "AdapterRead2" if !value.is_empty() => parsed.adapter_read2 = Some(value.to_string()),
                    _ => {}
                }
            }
            Section::Data => match &header {
                None => header = Some(fields.iter().map(|f| Column::from_header(f)).collect()),
                Some(columns) => rows.push(parse_row(columns, &fields, lanes_meaningful)),
            },
            Section::Preamble | Section::Other => {}
        }
    }

    if parsed.options.reverse_complement_index_p7 {
        for row in rows.iter_mut() {
            row.index = reverse_complement(&row.index);
        }
    }
    if parsed.options.reverse_complement_index_p5 {
        for row in rows.iter_mut() {
            row.index2 = reverse_complement(&row.index2);
        }
    }

    let present: BTreeSet<Column> = header
        .unwrap_or_default()
        .into_iter()
        .flatten()
        .filter(|c| lanes_meaningful || *c != Column::Lane)
        .collect();
    let columns: Vec<Column> = COLUMN_ORDER.iter().copied().filter(|c| present.contains(c)).collect();

    parsed.sub_sheets = group_by_index_lengths(rows, &columns);
    let all_lanes: BTreeSet<u32> = parsed.sub_sheets.iter().flat_map(|s| s.lanes.iter().copied()).collect();
    if parsed.sub_sheets.len() < 2 && all_lanes.len() == FULL_LANE_COUNT as usize {
        for sheet in parsed.sub_sheets.iter_mut() {
            sheet.lanes.clear();
        }
    }
    parsed
}

fn parse_row(columns: &[Option<Column>], fields: &[&str], lanes_meaningful: bool) -> SampleRow {
    let mut row = SampleRow::default();
    for (column, value) in columns.iter().zip(fields.iter()) {
        let value = value.to_string();
        match column {
            Some(Column::Lane) if lanes_meaningful => row.lane = value.parse().ok(),
            Some(Column::SampleId) => row.sample_id = value,
            Some(Column::SampleName) => row.sample_name = value,
            Some(Column::Index) => row.index = value,
            Some(Column::Index2) => row.index2 = value,
            Some(Column::SampleProject) => row.project = value,
            _ => {}
        }
    }
    row
}

/// Groups rows by barcode length pair, keeping first-appearance order.
fn group_by_index_lengths(rows: Vec<SampleRow>, columns: &[Column]) -> Vec<SubSheet> {
    let mut sheets: Vec<SubSheet> = Vec::new();
    for row in rows {
        let key = row.index_lengths();
        let position = match sheets.iter().position(|s| s.index_lengths == key) {
            Some(p) => p,
            None => {
                sheets.push(SubSheet {
                    index_lengths: key,
                    columns: columns.to_vec(),
                    rows: Vec::new(),
                    lanes: BTreeSet::new(),
                });
                sheets.len() - 1
            }
        };
        let sheet = &mut sheets[position];
        if let Some(lane) = row.lane {
            sheet.lanes.insert(lane);
        }
        sheet.rows.push(row);
    }
    sheets
}
