mod common;

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Result};

use common::{instrument_run, settings_in, write_file, TWO_PROJECT_SHEET};
use flowcell_pipeline::config::settings::Settings;
use flowcell_pipeline::pipelines::discovery::find_next_run;
use flowcell_pipeline::utils::file::touch;
use flowcell_pipeline::utils::ledger::Ledger;

const FIRST: &str = "150416_SN7001334_0196_BC605HACXX";
const SECOND: &str = "150417_SN7001334_0197_AC605HBCXX";

const RERUN_SHEET: &str = "[CustomOptions]\n\
Rerun,true\n\
[Data]\n\
Sample_ID,Sample_Name,index,Sample_Project\n\
S1,a,ACGTACGT,GCF-0001\n";

fn ledger_for(settings: &Settings) -> Ledger {
    Ledger::new(settings.ledger_path())
}

fn age(path: &Path, secs: u64) -> Result<()> {
    let when = SystemTime::now() - Duration::from_secs(secs);
    fs::File::options().write(true).open(path)?.set_modified(when)?;
    Ok(())
}

#[test]
fn test_run_without_usable_manifest_is_not_ready() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = settings_in(dir.path());
    let ledger = ledger_for(&settings);

    let run_dir = instrument_run(&settings, FIRST, None)?;
    assert!(find_next_run(&settings, &ledger).is_none());

    write_file(&run_dir.join("SampleSheet.csv"), "[Data]\nSample_ID,Sample_Project\n")?;
    assert!(find_next_run(&settings, &ledger).is_none());
    assert!(!settings.run_output_dir(FIRST).exists());

    write_file(&run_dir.join("SampleSheet.csv"), TWO_PROJECT_SHEET)?;
    let run = find_next_run(&settings, &ledger).ok_or_else(|| anyhow!("run not discovered"))?;
    assert_eq!(run.run_id, FIRST);
    assert_eq!(run.model, "HiSeq2500");
    assert_eq!(run.options.organism, "Human");
    assert_eq!(run.sub_sheets.len(), 1);
    assert_eq!(run.sample_sheet, settings.run_output_dir(FIRST).join("SampleSheet.csv"));
    assert_eq!(fs::read_to_string(&run.sample_sheet)?, TWO_PROJECT_SHEET);
    Ok(())
}

#[test]
fn test_submission_forms_are_copied() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = settings_in(dir.path());
    let run_dir = instrument_run(&settings, FIRST, Some(TWO_PROJECT_SHEET))?;
    write_file(&run_dir.join("GCF-0001_Sample-Submission-Form.xlsx"), "form")?;

    find_next_run(&settings, &ledger_for(&settings)).ok_or_else(|| anyhow!("run not discovered"))?;
    let copied = settings.run_output_dir(FIRST).join("GCF-0001_Sample-Submission-Form.xlsx");
    assert_eq!(fs::read_to_string(copied)?, "form");
    Ok(())
}

#[test]
fn test_one_run_at_a_time_until_processed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = settings_in(dir.path());
    let ledger = ledger_for(&settings);
    instrument_run(&settings, FIRST, Some(TWO_PROJECT_SHEET))?;
    instrument_run(&settings, SECOND, Some(TWO_PROJECT_SHEET))?;

    let first = find_next_run(&settings, &ledger).ok_or_else(|| anyhow!("nothing found"))?;
    assert_eq!(first.run_id, FIRST);
    // Staged but unfinished runs are offered again so work can resume.
    let again = find_next_run(&settings, &ledger).ok_or_else(|| anyhow!("nothing found"))?;
    assert_eq!(again.run_id, FIRST);

    touch(&settings.run_output_dir(FIRST).join("fastq.made"))?;
    let second = find_next_run(&settings, &ledger).ok_or_else(|| anyhow!("nothing found"))?;
    assert_eq!(second.run_id, SECOND);

    // A ledger row alone marks a run as processed, even without its output.
    ledger.add("GCF-0001", &settings.run_output_dir(SECOND), "2024-01-01 00:00:00")?;
    assert!(find_next_run(&settings, &ledger).is_none());
    Ok(())
}

#[test]
fn test_lane_subset_changes_output_dir() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut settings = settings_in(dir.path());
    settings.options.lanes = "12".to_string();
    instrument_run(&settings, FIRST, Some(TWO_PROJECT_SHEET))?;

    let run = find_next_run(&settings, &ledger_for(&settings)).ok_or_else(|| anyhow!("nothing found"))?;
    assert_eq!(run.output_dir(), settings.paths.output_dir.join(format!("{}_lanes12", FIRST)));
    assert!(run.output_dir().join("SampleSheet.csv").exists());
    Ok(())
}

#[test]
fn test_rerun_wipes_output_and_ledger() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = settings_in(dir.path());
    let ledger = ledger_for(&settings);
    instrument_run(&settings, FIRST, Some(RERUN_SHEET))?;

    let out = settings.run_output_dir(FIRST);
    write_file(&out.join("SampleSheet.csv"), TWO_PROJECT_SHEET)?;
    write_file(&out.join("GCF-0001").join("a_R1.fastq.gz"), "old")?;
    touch(&out.join("fastq.made"))?;
    ledger.add("GCF-0001", &out, "2024-01-01 00:00:00")?;
    age(&out.join("SampleSheet.csv"), 3600)?;

    let run = find_next_run(&settings, &ledger).ok_or_else(|| anyhow!("rerun not admitted"))?;
    assert_eq!(run.run_id, FIRST);
    assert!(run.options.rerun);
    assert!(!out.join("GCF-0001").exists());
    assert!(!out.join("fastq.made").exists());
    assert!(ledger.list_flowcell_all(&out)?.is_empty());
    assert_eq!(fs::read_to_string(out.join("SampleSheet.csv"))?, RERUN_SHEET);
    Ok(())
}

#[test]
fn test_rerun_flag_needs_newer_manifest() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = settings_in(dir.path());
    let ledger = ledger_for(&settings);
    let run_dir = instrument_run(&settings, FIRST, Some(RERUN_SHEET))?;
    age(&run_dir.join("SampleSheet.csv"), 3600)?;

    let out = settings.run_output_dir(FIRST);
    write_file(&out.join("SampleSheet.csv"), RERUN_SHEET)?;
    touch(&out.join("fastq.made"))?;
    ledger.add("GCF-0001", &out, "2024-01-01 00:00:00")?;

    assert!(find_next_run(&settings, &ledger).is_none());
    assert!(out.join("fastq.made").exists());
    assert_eq!(ledger.list_flowcell_all(&out)?.len(), 1);
    Ok(())
}

#[test]
fn test_processed_run_without_rerun_flag_stays_processed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = settings_in(dir.path());
    let ledger = ledger_for(&settings);
    instrument_run(&settings, FIRST, Some(TWO_PROJECT_SHEET))?;

    let out = settings.run_output_dir(FIRST);
    write_file(&out.join("SampleSheet.csv"), TWO_PROJECT_SHEET)?;
    touch(&out.join("fastq.made"))?;
    age(&out.join("SampleSheet.csv"), 3600)?;

    assert!(find_next_run(&settings, &ledger).is_none());
    Ok(())
}

#[test]
fn test_archived_run_reruns_against_ledger_timestamp() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = settings_in(dir.path());
    let ledger = ledger_for(&settings);
    instrument_run(&settings, FIRST, Some(RERUN_SHEET))?;
    let out = settings.run_output_dir(FIRST);

    // Output directory gone; only a ledger row newer than the manifest.
    ledger.add("GCF-0001", &out, "2999-01-01 00:00:00")?;
    assert!(find_next_run(&settings, &ledger).is_none());

    ledger.delete_flowcell(&out)?;
    ledger.add("GCF-0001", &out, "2000-01-01 00:00:00")?;
    let run = find_next_run(&settings, &ledger).ok_or_else(|| anyhow!("rerun not admitted"))?;
    assert_eq!(run.run_id, FIRST);
    assert!(ledger.list_flowcell_all(&out)?.is_empty());
    Ok(())
}
