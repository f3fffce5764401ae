#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use futures::future::BoxFuture;

use flowcell_pipeline::config::defs::{PipelineError, RunDescriptor};
use flowcell_pipeline::config::settings::Settings;
use flowcell_pipeline::utils::command::{ToolCommand, ToolRunner};
use flowcell_pipeline::utils::samplesheet::parse_sample_sheet_str;

/// Records every invocation and materialises the files the command declares.
#[derive(Default)]
pub struct FakeRunner {
    pub calls: Mutex<Vec<ToolCommand>>,
    pub fail_tag: Option<&'static str>,
}

impl FakeRunner {
    pub fn failing(tag: &'static str) -> Self {
        FakeRunner { calls: Mutex::new(Vec::new()), fail_tag: Some(tag) }
    }

    pub fn calls(&self) -> Vec<ToolCommand> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn count(&self, tag: &str) -> usize {
        self.calls().iter().filter(|c| c.tag == tag).count()
    }
}

fn materialise(cmd: &ToolCommand) -> std::io::Result<()> {
    for output in &cmd.outputs {
        if let Some(dir) = output.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(output, b"")?;
    }
    if let Some(dest) = &cmd.stdout_to {
        if let Some(dir) = dest.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(dest, format!("{} output\n", cmd.tag))?;
    }
    Ok(())
}

impl ToolRunner for FakeRunner {
    fn run<'a>(&'a self, cmd: &'a ToolCommand) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(async move {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(cmd.clone());
            }
            if self.fail_tag == Some(cmd.tag) {
                return Err(PipelineError::ToolExecution {
                    tool: cmd.tag.to_string(),
                    error: "exit status: 1".to_string(),
                });
            }
            materialise(cmd)?;
            Ok(())
        })
    }
}

/// Settings rooted in a scratch directory.
pub fn settings_in(root: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.paths.base_dir = root.join("instruments");
    settings.paths.output_dir = root.join("out");
    settings.paths.report_dir = root.join("reports");
    settings.paths.ledger_dir = root.join("ledger");
    settings.options.min_space_gb = 0.0;
    settings
}

pub fn write_file(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, contents)
}

pub const TWO_PROJECT_SHEET: &str = "[CustomOptions]\n\
Organism,Human\n\
Libprep,TruSeq\n\
[Data]\n\
Sample_ID,Sample_Name,index,Sample_Project\n\
S1,a,ACGTACGT,GCF-0001\n\
S2,b,TTGGCCAA,GCF-0002\n";

/// A completed HiSeq 2500 run folder with the given manifest.
pub fn instrument_run(settings: &Settings, run_id: &str, sheet: Option<&str>) -> std::io::Result<PathBuf> {
    let run_dir = settings.paths.base_dir.join("hiseq2500").join("data").join(run_id);
    write_file(&run_dir.join("ImageAnalysis_Netcopy_complete.txt"), "")?;
    if let Some(text) = sheet {
        write_file(&run_dir.join("SampleSheet.csv"), text)?;
    }
    Ok(run_dir)
}

/// Run descriptor as discovery would build it from `sheet`.
pub fn descriptor(settings: &Settings, run_id: &str, sheet: &str) -> RunDescriptor {
    let parsed = parse_sample_sheet_str(sheet, 1);
    let out = settings.run_output_dir(run_id);
    RunDescriptor {
        run_id: run_id.to_string(),
        sequencer: "hiseq2500".to_string(),
        model: "HiSeq2500".to_string(),
        lanes: settings.options.lanes.clone(),
        instrument_dir: settings.paths.base_dir.join("hiseq2500").join("data").join(run_id),
        output_root: settings.paths.output_dir.clone(),
        sample_sheet: out.join("SampleSheet.csv"),
        lane_count: 1,
        options: parsed.options,
        sub_sheets: parsed.sub_sheets,
    }
}

/// Paired read files for each `(project, sample)`.
pub fn demultiplexed_reads(out_dir: &Path, samples: &[(&str, &str)], suffix: &str) -> std::io::Result<()> {
    for (project, sample) in samples {
        for read in ["R1", "R2"] {
            write_file(&out_dir.join(project).join(format!("{}_{}{}", sample, read, suffix)), "@r\nACGT\n+\nIIII\n")?;
        }
    }
    Ok(())
}
