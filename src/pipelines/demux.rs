// Demultiplexing and filename normalisation, each guarded by a run marker.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use lazy_static::lazy_static;
use log::{debug, info};
use regex::Regex;

use crate::config::defs::{is_auxiliary_dir, PipelineError, RunContext, REPORTS_DIR, STATS_DIR};
use crate::utils::command::{bcl2fastq, ToolCommand, ToolRunner};
use crate::utils::file::{fastq_files_relative, touch, write_atomic};
use crate::utils::markers::{CompletionCheck, Marker};
use crate::utils::samplesheet::SubSheet;

lazy_static! {
    static ref DEMUX_NAME: Result<Regex, regex::Error> =
        Regex::new(r"^(?P<stem>.+?)_S\d+(?P<lane>_L\d{3})?_(?P<read>[RI][12])_001\.fastq\.gz$");
}

/// Lane digits of the operator's subset, e.g. `"12"` is lanes 1 and 2.
fn lane_subset(lanes: &str) -> BTreeSet<u32> {
    lanes.chars().filter_map(|c| c.to_digit(10)).collect()
}

/// The part of `sheet` inside the lane subset, or None when no row is left.
/// Sheets without lane restriction are kept whole.
fn restrict_to_lanes(sheet: &SubSheet, subset: &BTreeSet<u32>) -> Option<SubSheet> {
    if subset.is_empty() || sheet.lanes.is_empty() {
        return Some(sheet.clone());
    }
    let mut kept = sheet.clone();
    kept.rows.retain(|r| r.lane.is_none_or(|l| subset.contains(&l)));
    kept.lanes = sheet.lanes.intersection(subset).copied().collect();
    if kept.rows.is_empty() || kept.lanes.is_empty() {
        return None;
    }
    Some(kept)
}

/// One bcl2fastq pass per sub-sheet, restricted to the operator's lanes.
///
/// Sub-sheets are written to `SampleSheet.part<N>.csv`. With more than one
/// part every pass gets its own `Stats/part<N>` and `Reports/part<N>` so the
/// statistics of earlier passes survive.
///
/// # Returns
/// (sub-sheet path, sub-sheet contents, command) per pass.
pub fn demux_commands(ctx: &RunContext) -> Vec<(PathBuf, String, ToolCommand)> {
    let run = &ctx.run;
    let out_dir = run.output_dir();
    let (adapter, adapter_read2) = if run.options.trim_adapter {
        (ctx.settings.options.adapter.as_deref(), ctx.settings.options.adapter_read2.as_deref())
    } else {
        (None, None)
    };
    let subset = lane_subset(&run.lanes);
    let sheets: Vec<SubSheet> = run.sub_sheets.iter().filter_map(|s| restrict_to_lanes(s, &subset)).collect();
    let multi = sheets.len() > 1;
    let mut passes = Vec::new();
    for (i, sheet) in sheets.iter().enumerate() {
        let part = format!("part{}", i + 1);
        let sheet_path = out_dir.join(format!("SampleSheet.{}.csv", part));
        let lanes = if sheet.lanes.is_empty() { run.lanes.clone() } else { sheet.lane_string() };
        let (stats_dir, reports_dir) = if multi {
            (out_dir.join(STATS_DIR).join(&part), Some(out_dir.join(REPORTS_DIR).join(&part)))
        } else {
            (out_dir.join(STATS_DIR), None)
        };
        let cmd = bcl2fastq::command(
            &ctx.settings.tools.bcl2fastq,
            &run.instrument_dir,
            &out_dir,
            &sheet_path,
            ctx.settings.options.bcl2fastq_threads,
            &lanes,
            &stats_dir,
            reports_dir.as_deref(),
        );
        passes.push((sheet_path, sheet.render(adapter, adapter_read2), cmd));
    }
    passes
}

/// Runs the demultiplexer unless `bcl.done` exists, then writes the marker.
pub async fn demultiplex(
    ctx: &RunContext,
    runner: &dyn ToolRunner,
    check: &dyn CompletionCheck,
) -> Result<(), PipelineError> {
    let marker = Marker::BclDone.path_in(&ctx.run.output_dir());
    if check.is_done(&marker) {
        info!("{} already demultiplexed", ctx.run.run_id);
        return Ok(());
    }
    if ctx.run.sub_sheets.is_empty() {
        return Err(PipelineError::Precondition(format!("{} has no samples to demultiplex", ctx.run.run_id)));
    }
    let passes = demux_commands(ctx);
    if passes.is_empty() {
        return Err(PipelineError::Precondition(format!(
            "{} has no samples in lanes {}",
            ctx.run.run_id, ctx.run.lanes
        )));
    }
    for (sheet_path, contents, cmd) in passes {
        write_atomic(&sheet_path, contents.as_bytes())?;
        info!("Demultiplexing {} with {}", ctx.run.run_id, sheet_path.display());
        runner.run(&cmd).await?;
    }
    touch(&marker)?;
    Ok(())
}

/// `<name>_S<n>[_L00<l>]_<R|I><1|2>_001.fastq.gz` → `<name>[_L00<l>]_<R|I><1|2>.fastq.gz`
pub fn normalized_name(file_name: &str) -> Result<Option<String>, PipelineError> {
    let re = (*DEMUX_NAME)
        .as_ref()
        .map_err(|e| PipelineError::Other(anyhow!("Regex error: {}", e)))?;
    Ok(re.captures(file_name).map(|c| {
        format!(
            "{}{}_{}.fastq.gz",
            &c["stem"],
            c.name("lane").map_or("", |m| m.as_str()),
            &c["read"]
        )
    }))
}

fn project_dirs(out_dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(out_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() && !is_auxiliary_dir(&name) {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Strips the demultiplexer's sample number and chunk suffix from every read
/// file below the project directories, unless `files.renamed` exists.
///
/// # Returns
/// Number of files renamed.
pub fn fix_names(ctx: &RunContext, check: &dyn CompletionCheck) -> Result<usize, PipelineError> {
    let out_dir = ctx.run.output_dir();
    let marker = Marker::FilesRenamed.path_in(&out_dir);
    if check.is_done(&marker) {
        info!("{} file names already normalised", ctx.run.run_id);
        return Ok(0);
    }
    let mut renamed = 0;
    for project in project_dirs(&out_dir)? {
        for rel in fastq_files_relative(&project)? {
            let src = project.join(&rel);
            let Some(name) = src.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if let Some(new_name) = normalized_name(&name)? {
                let dest = src.with_file_name(&new_name);
                debug!("Renaming {} to {}", src.display(), new_name);
                fs::rename(&src, &dest)?;
                renamed += 1;
            }
        }
    }
    touch(&marker)?;
    info!("Renamed {} files for {}", renamed, ctx.run.run_id);
    Ok(renamed)
}
