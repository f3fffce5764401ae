use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local, NaiveDateTime};
use log::{debug, info, warn};

use crate::config::defs::{
    model_for_run, Platform, RunDescriptor, PLATFORMS, SAMPLE_SHEET_COPY, SAMPLE_SHEET_GLOB,
    SUBMISSION_FORM_GLOB,
};
use crate::config::settings::Settings;
use crate::utils::file::{copy_once, glob_under, remove_dir_if_exists};
use crate::utils::ledger::Ledger;
use crate::utils::markers::Marker;
use crate::utils::samplesheet::{parse_sample_sheet, ParsedSheet};
use crate::utils::stats::lane_count;

/// A run folder whose platform-specific completion file is present.
#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub run_dir: PathBuf,
    pub run_id: String,
    /// Instrument directory name under the base directory.
    pub sequencer: String,
    pub platform: &'static Platform,
}

/// Globs `<base>/*/data/*_<serial>*_*/<marker>` for every platform.
pub fn completed_runs(base_dir: &Path) -> Result<Vec<CompletedRun>> {
    let mut runs = Vec::new();
    for platform in PLATFORMS {
        let pattern = format!("*/data/*_{}*_*/{}", platform.serial, platform.completion_marker);
        for marker in glob_under(base_dir, &pattern)? {
            let Some(run_dir) = marker.parent() else { continue };
            let run_id = run_dir.file_name().map(|n| n.to_string_lossy().into_owned());
            let sequencer = run_dir
                .parent()
                .and_then(Path::parent)
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().into_owned());
            if let (Some(run_id), Some(sequencer)) = (run_id, sequencer) {
                runs.push(CompletedRun {
                    run_dir: run_dir.to_path_buf(),
                    run_id,
                    sequencer,
                    platform,
                });
            }
        }
    }
    Ok(runs)
}

/// A run is processed once `fastq.made` exists in its output directory or the
/// Ledger holds any row for that directory. Ledger rows survive archival and
/// deletion of the output, so an archived run is never rediscovered unless a
/// rerun is explicitly requested.
pub fn is_processed(out_dir: &Path, ledger: &Ledger) -> Result<bool> {
    if Marker::FastqMade.path_in(out_dir).exists() {
        return Ok(true);
    }
    Ok(!ledger.list_flowcell_all(out_dir)?.is_empty())
}

/// First manifest (by name) in the run folder that has at least one data row.
/// Unreadable or empty manifests mean "not ready yet".
pub fn find_sample_sheet(run_dir: &Path, lane_count: u32) -> Option<(PathBuf, ParsedSheet)> {
    let candidates = match glob_under(run_dir, SAMPLE_SHEET_GLOB) {
        Ok(c) => c,
        Err(e) => {
            warn!("Cannot list manifests in {}: {}", run_dir.display(), e);
            return None;
        }
    };
    for path in candidates {
        match parse_sample_sheet(&path, lane_count) {
            Ok(parsed) if parsed.row_count() > 0 => return Some((path, parsed)),
            Ok(_) => debug!("{} has no data rows yet", path.display()),
            Err(e) => debug!("Skipping {}: {}", path.display(), e),
        }
    }
    None
}

fn modified(path: &Path) -> Option<NaiveDateTime> {
    let mtime: SystemTime = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(DateTime::<Local>::from(mtime).naive_local())
}

/// Whether a processed run should be re-admitted.
///
/// Requires the manifest's rerun flag and a manifest newer than the
/// reference: the previously copied manifest if it still exists, else the
/// latest Ledger timestamp for the output directory.
pub fn rerun_requested(sheet: &Path, parsed: &ParsedSheet, out_dir: &Path, ledger: &Ledger) -> Result<bool> {
    if !parsed.options.rerun {
        return Ok(false);
    }
    let Some(sheet_time) = modified(sheet) else {
        return Ok(false);
    };
    let reference = match modified(&out_dir.join(SAMPLE_SHEET_COPY)) {
        Some(t) => Some(t),
        None => ledger
            .list_flowcell_all(out_dir)?
            .iter()
            .filter_map(|row| row.timestamp())
            .max(),
    };
    Ok(reference.is_some_and(|r| sheet_time > r))
}

/// Deletes the run's output directory and every Ledger row for it.
pub fn wipe_flowcell(ledger: &Ledger, out_dir: &Path) -> Result<()> {
    if remove_dir_if_exists(out_dir)? {
        info!("Removed {}", out_dir.display());
    }
    let removed = ledger.delete_flowcell(out_dir)?;
    info!("Removed {} ledger rows for {}", removed, out_dir.display());
    Ok(())
}

/// Creates the output directory and copies the manifest plus any submission
/// forms into it. Existing copies are never overwritten.
fn stage_output_dir(run: &CompletedRun, sheet: &Path, out_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(out_dir)
        .map_err(|e| anyhow!("Cannot create {}: {}", out_dir.display(), e))?;
    let copy = out_dir.join(SAMPLE_SHEET_COPY);
    if copy_once(sheet, &copy)? {
        debug!("Copied {} to {}", sheet.display(), copy.display());
    }
    for form in glob_under(&run.run_dir, SUBMISSION_FORM_GLOB)? {
        if let Some(name) = form.file_name() {
            copy_once(&form, &out_dir.join(name))?;
        }
    }
    Ok(copy)
}

fn evaluate(settings: &Settings, ledger: &Ledger, run: &CompletedRun) -> Result<Option<RunDescriptor>> {
    let out_dir = settings.run_output_dir(&run.run_id);
    let processed = is_processed(&out_dir, ledger)?;
    let lanes = lane_count(&run.run_dir);

    let Some((sheet, parsed)) = find_sample_sheet(&run.run_dir, lanes) else {
        if !processed {
            debug!("{} is complete but has no usable manifest yet", run.run_id);
        }
        return Ok(None);
    };

    if processed {
        if !rerun_requested(&sheet, &parsed, &out_dir, ledger)? {
            return Ok(None);
        }
        warn!("Rerun requested for {}, wiping {}", run.run_id, out_dir.display());
        wipe_flowcell(ledger, &out_dir)?;
    }

    let projects: Vec<String> = parsed.projects().into_iter().collect();
    info!("Found a new flow cell: {} ({})", run.run_id, projects.join(", "));
    let copy = stage_output_dir(run, &sheet, &out_dir)?;
    Ok(Some(RunDescriptor {
        run_id: run.run_id.clone(),
        sequencer: run.sequencer.clone(),
        model: model_for_run(&run.run_id).unwrap_or(run.platform.model).to_string(),
        lanes: settings.options.lanes.clone(),
        instrument_dir: run.run_dir.clone(),
        output_root: settings.paths.output_dir.clone(),
        sample_sheet: copy,
        lane_count: lanes,
        options: parsed.options.clone(),
        sub_sheets: parsed.sub_sheets,
    }))
}

/// Returns at most one run that is complete, unprocessed (or explicitly
/// rerun) and has a usable manifest. Never fails: problems with individual
/// candidates are logged and the scan moves on.
pub fn find_next_run(settings: &Settings, ledger: &Ledger) -> Option<RunDescriptor> {
    let runs = match completed_runs(&settings.paths.base_dir) {
        Ok(runs) => runs,
        Err(e) => {
            warn!("Unable to scan {}: {}", settings.paths.base_dir.display(), e);
            return None;
        }
    };
    for run in &runs {
        match evaluate(settings, ledger, run) {
            Ok(Some(descriptor)) => return Some(descriptor),
            Ok(None) => {}
            Err(e) => warn!("Skipping {}: {:#}", run.run_id, e),
        }
    }
    None
}
