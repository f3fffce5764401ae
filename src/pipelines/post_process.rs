//! Post-demultiplexing orchestration.
//!
//! Enumerates the read files and projects of a run output directory and
//! drives the fixed stage sequence over them: host-read removal, clumpify
//! deduplication, FastQC, md5 manifests, FastQ Screen, per-project MultiQC
//! and the run-wide statistics reports. Every stage drains its worker pool
//! before the next starts, and every unit of work is skipped when its output
//! already exists, so the whole pass can be repeated after a crash.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use serde::Serialize;

use crate::config::defs::{
    is_auxiliary_dir, PipelineError, RunContext, RunDescriptor, CONTAMINATED_DIR, FASTQC_DIR,
    FASTQ_GZ_EXT, FASTQ_SCREEN_DIR, FILTERED_DIR, INTEROP_SUMMARY, MD5SUMS, QC_PREFIX,
    SETTINGS_SNAPSHOT, STAGED_SUFFIX, STATS_DIR,
};
use crate::config::settings::Settings;
use crate::utils::command::{
    bbmap, clumpify, fastq_screen, fastqc, interop, md5sum, multiqc, ToolCommand, ToolRunner,
};
use crate::utils::file::{fastq_base, fastq_files_relative, glob_under, touch, write_atomic};
use crate::utils::markers::{CompletionCheck, Marker};
use crate::utils::pool::parallel_map;
use crate::utils::stats::{format_undetermined, read_geometry, undetermined_per_lane};
use crate::utils::system::free_space_message;

const PROJECT_FASTQ_GLOBS: [&str; 2] = ["*/*.fastq.gz", "*/*/*.fastq.gz"];
const SAMPLE_GLOBS: [&str; 3] = ["*/*R[12].fastq.gz", "*/*/*R[12].fastq.gz", "*/*/*R[12]_001.fastq.gz"];

/// Which mate a read file holds, from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mate {
    R1,
    R2,
}

pub fn mate(path: &Path) -> Option<Mate> {
    let name = path.file_name()?.to_string_lossy().into_owned();
    let stem = name.strip_suffix(FASTQ_GZ_EXT)?;
    let stem = stem.strip_suffix("_001").unwrap_or(stem);
    if stem.ends_with("R1") {
        Some(Mate::R1)
    } else if stem.ends_with("R2") {
        Some(Mate::R2)
    } else {
        None
    }
}

/// The R2 file name matching an R1 file name.
fn mate_name(r1_name: &str) -> Option<String> {
    let (stem, suffix) = match r1_name.strip_suffix("R1_001.fastq.gz") {
        Some(stem) => (stem, "R2_001.fastq.gz"),
        None => (r1_name.strip_suffix("R1.fastq.gz")?, "R2.fastq.gz"),
    };
    Some(format!("{}{}", stem, suffix))
}

/// One read file, or a pair driven by its R1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadSet {
    pub r1: PathBuf,
    pub r2: Option<PathBuf>,
}

impl ReadSet {
    fn dir(&self) -> &Path {
        self.r1.parent().unwrap_or(Path::new("."))
    }

    fn staged(&self, subdir: &str) -> (PathBuf, Option<PathBuf>) {
        let stage = |p: &Path| self.dir().join(subdir).join(p.file_name().unwrap_or_default());
        (stage(&self.r1), self.r2.as_deref().map(stage))
    }

    /// `filtered/<R1 base>.<stage>.staged`: both mates of the stage's output
    /// are complete and only the moves into place remain.
    fn staged_marker(&self, stage: &str) -> PathBuf {
        self.dir()
            .join(FILTERED_DIR)
            .join(format!("{}.{}{}", fastq_base(&self.r1), stage, STAGED_SUFFIX))
    }
}

/// Files and projects produced by demultiplexing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunLayout {
    pub out_dir: PathBuf,
    /// Project directory names, sorted.
    pub projects: Vec<String>,
    /// R1/R2 read files, sorted.
    pub samples: Vec<PathBuf>,
}

fn relative_parts(out_dir: &Path, path: &Path) -> Vec<String> {
    path.strip_prefix(out_dir)
        .map(|rel| rel.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect())
        .unwrap_or_default()
}

/// Read files inside staging directories or outside project directories
/// are never enumerated.
fn is_deliverable(parts: &[String]) -> bool {
    match parts.split_last() {
        Some((_, dirs)) if !dirs.is_empty() => {
            !is_auxiliary_dir(&dirs[0]) && !dirs.iter().any(|d| d == CONTAMINATED_DIR || d == FILTERED_DIR)
        }
        _ => false,
    }
}

impl RunLayout {
    pub fn scan(out_dir: &Path) -> Result<RunLayout, PipelineError> {
        let mut projects = BTreeSet::new();
        for pattern in PROJECT_FASTQ_GLOBS {
            for path in glob_under(out_dir, pattern)? {
                let parts = relative_parts(out_dir, &path);
                if is_deliverable(&parts) {
                    projects.insert(parts[0].clone());
                }
            }
        }
        let mut samples = BTreeSet::new();
        for pattern in SAMPLE_GLOBS {
            for path in glob_under(out_dir, pattern)? {
                if is_deliverable(&relative_parts(out_dir, &path)) {
                    samples.insert(path);
                }
            }
        }
        Ok(RunLayout {
            out_dir: out_dir.to_path_buf(),
            projects: projects.into_iter().collect(),
            samples: samples.into_iter().collect(),
        })
    }

    /// Read sets keyed by R1. R2 files without an R1 are single-end sets.
    pub fn read_sets(&self) -> Vec<ReadSet> {
        let all: BTreeSet<&PathBuf> = self.samples.iter().collect();
        let mut sets = Vec::new();
        let mut paired_r2 = BTreeSet::new();
        for r1 in self.samples.iter().filter(|p| mate(p) == Some(Mate::R1)) {
            let r2 = r1
                .file_name()
                .and_then(|n| mate_name(&n.to_string_lossy()))
                .map(|n| r1.with_file_name(n))
                .filter(|p| all.contains(p));
            if let Some(r2) = &r2 {
                paired_r2.insert(r2.clone());
            }
            sets.push(ReadSet { r1: r1.clone(), r2 });
        }
        for r2 in self.samples.iter().filter(|p| mate(p) == Some(Mate::R2)) {
            if !paired_r2.contains(r2) {
                sets.push(ReadSet { r1: r2.clone(), r2: None });
            }
        }
        sets
    }

    pub fn project_dir(&self, project: &str) -> PathBuf {
        self.out_dir.join(project)
    }

    pub fn qc_dir(&self, project: &str) -> PathBuf {
        self.out_dir.join(format!("{}{}", QC_PREFIX, project))
    }

    /// `(project, library)` of a read file; library is the directory between
    /// the project and the file, when there is one.
    pub fn origin(&self, sample: &Path) -> Option<(String, Option<String>)> {
        let parts = relative_parts(&self.out_dir, sample);
        match parts.len() {
            2 => Some((parts[0].clone(), None)),
            n if n > 2 => Some((parts[0].clone(), Some(parts[1].clone()))),
            _ => None,
        }
    }

    pub fn project_report(&self, project: &str) -> PathBuf {
        self.qc_dir(project).join(format!("multiqc_{}.html", project))
    }
}

/// Multiqc configuration overlay for one project report.
pub fn multiqc_config(
    template: Option<&str>,
    settings: &Settings,
    run: &RunDescriptor,
    project: &str,
    geometry: Option<&str>,
) -> String {
    let quote = |s: &str| format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""));
    let mut out = String::new();
    if let Some(text) = template {
        out.push_str(text.trim_end());
        out.push('\n');
    }
    out.push_str(&format!("title: {}\n", quote(&format!("{} {}", settings.options.facility_name, run.run_id))));
    out.push_str(&format!("subtitle: {}\n", quote(project)));
    out.push_str("report_header_info:\n");
    let rows = [
        ("Contact E-mail", settings.options.contact.as_str()),
        ("Sequencer", run.model.as_str()),
        ("Read geometry", geometry.unwrap_or("NA")),
        ("Organism", run.options.organism.as_str()),
        ("Library prep", run.options.libprep.as_str()),
    ];
    for (key, value) in rows {
        out.push_str(&format!("  - {}: {}\n", key, quote(value)));
    }
    out
}

#[derive(Serialize)]
struct SettingsSnapshot<'a> {
    run: &'a RunDescriptor,
    settings: &'a Settings,
}

fn rename_over(src: &Path, dest: &Path) -> Result<(), PipelineError> {
    fs::rename(src, dest).map_err(|e| {
        PipelineError::IOError(format!("Cannot move {} to {}: {}", src.display(), dest.display(), e))
    })
}

/// Moves staged outputs into place. Sources already moved by an interrupted
/// attempt are skipped, so a pair is never mixed with fresh tool output.
fn finish_moves(moves: &[(PathBuf, PathBuf)]) -> Result<(), PipelineError> {
    for (src, dest) in moves {
        if src.exists() {
            rename_over(src, dest)?;
        }
    }
    Ok(())
}

fn remove_empty_dir(dir: &Path) {
    // Leaves non-empty directories alone.
    let _ = fs::remove_dir(dir);
}

/// Drives the stage sequence for one run. Cheap to clone; every clone shares
/// the run context, tool runner and completion predicate.
#[derive(Clone)]
pub struct PostProcessor {
    ctx: Arc<RunContext>,
    runner: Arc<dyn ToolRunner>,
    check: Arc<dyn CompletionCheck>,
}

impl PostProcessor {
    pub fn new(ctx: Arc<RunContext>, runner: Arc<dyn ToolRunner>, check: Arc<dyn CompletionCheck>) -> Self {
        PostProcessor { ctx, runner, check }
    }

    fn settings(&self) -> &Settings {
        &self.ctx.settings
    }

    /// Runs every stage and returns the run summary: free space followed by
    /// one undetermined-index line per lane.
    pub async fn run(&self) -> Result<String, PipelineError> {
        let out_dir = self.ctx.run.output_dir();
        let layout = Arc::new(RunLayout::scan(&out_dir)?);
        info!(
            "{}: {} projects, {} read files",
            self.ctx.run.run_id,
            layout.projects.len(),
            layout.samples.len()
        );

        if self.ctx.run.options.remove_human_reads {
            self.remove_host_reads(&layout).await?;
        }
        self.clumpify(&layout).await?;
        self.fastqc(&layout).await?;
        self.md5sums(&layout).await?;
        self.fastq_screen(&layout).await?;
        self.project_reports(&layout).await?;
        self.run_reports().await?;

        self.write_snapshot()?;
        Ok(self.summary())
    }

    /// Stage 1: one sample at a time. Clean reads replace the originals,
    /// host hits move to `contaminated/`.
    async fn remove_host_reads(&self, layout: &Arc<RunLayout>) -> Result<(), PipelineError> {
        let reference = match &self.settings().paths.masked_reference {
            Some(r) if r.exists() => r.clone(),
            Some(r) => {
                return Err(PipelineError::Precondition(format!(
                    "Masked reference {} does not exist",
                    r.display()
                )))
            }
            None => {
                return Err(PipelineError::Precondition(
                    "RemoveHumanReads is set but paths.masked_reference is not configured".to_string(),
                ))
            }
        };
        info!("Removing host reads for {}", self.ctx.run.run_id);
        let this = self.clone();
        parallel_map("host removal", layout.read_sets(), 1, move |set| {
            let this = this.clone();
            let reference = reference.clone();
            async move { this.remove_host_reads_one(&reference, set).await }
        })
        .await
    }

    async fn remove_host_reads_one(&self, reference: &Path, set: ReadSet) -> Result<(), PipelineError> {
        let (hits_final_1, hits_final_2) = set.staged(CONTAMINATED_DIR);
        if self.check.is_done(&hits_final_1) {
            return Ok(());
        }
        let filtered = set.dir().join(FILTERED_DIR);
        let contaminated = set.dir().join(CONTAMINATED_DIR);
        fs::create_dir_all(&filtered)?;
        fs::create_dir_all(&contaminated)?;

        let (clean_1, clean_2) = set.staged(FILTERED_DIR);
        let hits = |p: &Path| filtered.join(format!("{}.host{}", fastq_base(p), FASTQ_GZ_EXT));
        let hits_1 = hits(&set.r1);
        let hits_2 = set.r2.as_deref().map(hits);

        let staged = set.staged_marker("host");
        if self.check.is_done(&staged) {
            info!("Finishing interrupted host removal of {}", set.r1.display());
        } else {
            let cmd = bbmap::command(
                &self.settings().tools.bbmap,
                reference,
                (&set.r1, set.r2.as_deref()),
                (&clean_1, clean_2.as_deref()),
                (&hits_1, hits_2.as_deref()),
            );
            self.runner.run(&cmd).await?;
            touch(&staged)?;
        }

        let mut moves = vec![(clean_1, set.r1.clone())];
        if let (Some(clean), Some(r2)) = (clean_2, &set.r2) {
            moves.push((clean, r2.clone()));
        }
        if let (Some(hits), Some(dest)) = (hits_2, hits_final_2) {
            moves.push((hits, dest));
        }
        // Moved last: its presence marks the sample as done.
        moves.push((hits_1, hits_final_1));
        finish_moves(&moves)?;
        let _ = fs::remove_file(&staged);
        remove_empty_dir(&filtered);
        Ok(())
    }

    /// Stage 2: guarded as a whole by `clumpify.done`, written after the
    /// pool drains. Single-cell runs are not deduplicated.
    async fn clumpify(&self, layout: &Arc<RunLayout>) -> Result<(), PipelineError> {
        let marker = Marker::ClumpifyDone.path_in(&layout.out_dir);
        if self.check.is_done(&marker) {
            info!("Skipping clumpify, {} exists", marker.display());
            return Ok(());
        }
        if self.ctx.run.options.single_cell {
            info!("Single-cell run, not deduplicating");
        } else {
            info!("Deduplicating {}", self.ctx.run.run_id);
            let this = self.clone();
            parallel_map(
                "clumpify",
                layout.read_sets(),
                self.settings().options.clumpify_worker_threads,
                move |set| {
                    let this = this.clone();
                    async move { this.clumpify_one(set).await }
                },
            )
            .await?;
        }
        touch(&marker)?;
        Ok(())
    }

    async fn clumpify_one(&self, set: ReadSet) -> Result<(), PipelineError> {
        let filtered = set.dir().join(FILTERED_DIR);
        fs::create_dir_all(&filtered)?;
        let (tmp_1, tmp_2) = set.staged(FILTERED_DIR);
        let staged = set.staged_marker("clumpify");
        if self.check.is_done(&staged) {
            info!("Finishing interrupted deduplication of {}", set.r1.display());
        } else {
            let cmd = clumpify::command(
                &self.settings().tools.clumpify,
                (&set.r1, set.r2.as_deref()),
                (&tmp_1, tmp_2.as_deref()),
            );
            self.runner.run(&cmd).await?;
            touch(&staged)?;
        }

        let mut moves = vec![(tmp_1, set.r1.clone())];
        if let (Some(tmp), Some(r2)) = (tmp_2, &set.r2) {
            moves.push((tmp, r2.clone()));
        }
        finish_moves(&moves)?;
        let _ = fs::remove_file(&staged);
        remove_empty_dir(&filtered);
        Ok(())
    }

    /// Stage 3: one FastQC run per read file, into
    /// `QC_<project>/FASTQC[/<library>]`.
    async fn fastqc(&self, layout: &Arc<RunLayout>) -> Result<(), PipelineError> {
        let mut jobs = Vec::new();
        for sample in &layout.samples {
            let Some((project, library)) = layout.origin(sample) else { continue };
            let flat = layout.qc_dir(&project).join(FASTQC_DIR);
            let nested = library.as_ref().map(|lib| flat.join(lib));
            let zip = format!("{}_fastqc.zip", fastq_base(sample));
            let mut candidates = vec![flat.join(&zip)];
            if let Some(dir) = &nested {
                candidates.push(dir.join(&zip));
            }
            if self.check.any_done(&candidates) {
                continue;
            }
            jobs.push(fastqc::command(&self.settings().tools.fastqc, sample, nested.as_deref().unwrap_or(flat.as_path())));
        }
        info!("FastQC: {} files to process", jobs.len());
        self.run_jobs("fastqc", jobs, self.settings().options.fastqc_threads).await
    }

    /// Stage 4: `md5sum` over every read file of a project.
    async fn md5sums(&self, layout: &Arc<RunLayout>) -> Result<(), PipelineError> {
        let mut jobs = Vec::new();
        for project in &layout.projects {
            let dir = layout.project_dir(project);
            let dest = dir.join(MD5SUMS);
            if self.check.is_done(&dest) {
                continue;
            }
            let files = fastq_files_relative(&dir)?;
            jobs.push(md5sum::command(&self.settings().tools.md5sum, &dir, &files, &dest));
        }
        info!("md5sum: {} projects to process", jobs.len());
        self.run_jobs("md5sum", jobs, self.settings().options.fastqc_threads).await
    }

    /// Stage 5: FastQ Screen over R1 in standard runs and over R2 (the cDNA
    /// read) in single-cell runs, into `QC_<project>/fastq_screen[/<library>]`.
    async fn fastq_screen(&self, layout: &Arc<RunLayout>) -> Result<(), PipelineError> {
        let wanted = if self.ctx.run.options.single_cell { Mate::R2 } else { Mate::R1 };
        let mut jobs = Vec::new();
        for sample in layout.samples.iter().filter(|s| mate(s) == Some(wanted)) {
            let Some((project, library)) = layout.origin(sample) else { continue };
            let flat = layout.qc_dir(&project).join(FASTQ_SCREEN_DIR);
            let out = match library {
                Some(lib) => flat.join(lib),
                None => flat,
            };
            let cmd = fastq_screen::command(&self.settings().tools.fastq_screen, sample, &out);
            if self.check.any_done(&cmd.outputs[..1]) {
                continue;
            }
            jobs.push(cmd);
        }
        info!("FastQ Screen: {} files to process", jobs.len());
        self.run_jobs("fastq_screen", jobs, self.settings().options.fastq_screen_threads).await
    }

    /// Stage 6: one MultiQC report per project.
    async fn project_reports(&self, layout: &Arc<RunLayout>) -> Result<(), PipelineError> {
        let template = match &self.settings().paths.multiqc_template {
            Some(path) => Some(fs::read_to_string(path).map_err(|e| {
                PipelineError::InvalidConfig(format!("Cannot read MultiQC template {}: {}", path.display(), e))
            })?),
            None => None,
        };
        let geometry = read_geometry(&self.ctx.run.instrument_dir);
        let mut jobs = Vec::new();
        for project in &layout.projects {
            if self.check.is_done(&layout.project_report(project)) {
                continue;
            }
            let qc_dir = layout.qc_dir(project);
            let config_path = qc_dir.join("multiqc_config.yaml");
            let config = multiqc_config(template.as_deref(), self.settings(), &self.ctx.run, project, geometry.as_deref());
            write_atomic(&config_path, config.as_bytes())?;
            jobs.push(multiqc::command(
                &self.settings().tools.multiqc,
                Some(&config_path),
                &format!("multiqc_{}", project),
                &qc_dir,
                &[qc_dir.clone()],
            ));
        }
        info!("MultiQC: {} project reports to build", jobs.len());
        self.run_jobs("multiqc", jobs, self.settings().options.fastqc_threads).await
    }

    /// Stage 7: InterOp summary of the run folder, then MultiQC over Stats.
    async fn run_reports(&self) -> Result<(), PipelineError> {
        let stats = self.ctx.run.stats_dir();
        fs::create_dir_all(&stats)?;

        let summary = stats.join(INTEROP_SUMMARY);
        if !self.check.is_done(&summary) {
            let cmd = interop::command(&self.settings().tools.interop_summary, &self.ctx.run.instrument_dir, &summary);
            self.runner.run(&cmd).await?;
        }

        let name = format!("multiqc_{}", STATS_DIR);
        let cmd = multiqc::command(&self.settings().tools.multiqc, None, &name, &stats, &[stats.clone()]);
        if !self.check.any_done(&cmd.outputs) {
            self.runner.run(&cmd).await?;
        }
        Ok(())
    }

    async fn run_jobs(
        &self,
        stage: &str,
        jobs: Vec<ToolCommand>,
        workers: usize,
    ) -> Result<(), PipelineError> {
        if jobs.is_empty() {
            return Ok(());
        }
        let runner = Arc::clone(&self.runner);
        parallel_map(stage, jobs, workers, move |cmd| {
            let runner = Arc::clone(&runner);
            async move {
                for output in &cmd.outputs {
                    if let Some(dir) = output.parent() {
                        fs::create_dir_all(dir)?;
                    }
                }
                runner.run(&cmd).await
            }
        })
        .await
    }

    /// Effective configuration and run options, as TOML, in the output
    /// directory.
    fn write_snapshot(&self) -> Result<(), PipelineError> {
        let snapshot = SettingsSnapshot {
            run: &self.ctx.run,
            settings: &self.ctx.settings,
        };
        let text = toml::to_string_pretty(&snapshot)
            .map_err(|e| PipelineError::Other(anyhow::anyhow!("Cannot serialise settings: {}", e)))?;
        write_atomic(&self.ctx.run.output_dir().join(SETTINGS_SNAPSHOT), text.as_bytes())?;
        Ok(())
    }

    fn summary(&self) -> String {
        let mut message = free_space_message(&self.settings().paths.output_dir);
        match undetermined_per_lane(&self.ctx.run.stats_dir()) {
            Ok(counts) => message.push_str(&format_undetermined(&counts)),
            Err(e) => warn!("Unable to read demultiplexing statistics: {}", e),
        }
        message
    }
}
