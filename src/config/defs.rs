use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lazy_static::lazy_static;
use serde::Serialize;
use thiserror::Error;

use crate::config::settings::Settings;
use crate::utils::samplesheet::{CustomOptions, SubSheet};

// External software
pub const BCL2FASTQ_TAG: &str = "bcl2fastq";
pub const BBMAP_TAG: &str = "bbmap.sh";
pub const CLUMPIFY_TAG: &str = "clumpify.sh";
pub const FASTQC_TAG: &str = "fastqc";
pub const MD5SUM_TAG: &str = "md5sum";
pub const FASTQ_SCREEN_TAG: &str = "fastq_screen";
pub const MULTIQC_TAG: &str = "multiqc";
pub const INTEROP_TAG: &str = "summary";
pub const SEVENZIP_TAG: &str = "7za";
pub const MAIL_TAG: &str = "sendmail";
pub const TRACKING_TAG: &str = "tracking";

// Marker files in the run output directory
pub const BCL_DONE: &str = "bcl.done";
pub const FILES_RENAMED: &str = "files.renamed";
pub const CLUMPIFY_DONE: &str = "clumpify.done";
pub const FASTQ_MADE: &str = "fastq.made";

// Static filenames
pub const SAMPLE_SHEET_GLOB: &str = "SampleSheet*.csv";
pub const SAMPLE_SHEET_COPY: &str = "SampleSheet.csv";
pub const SUBMISSION_FORM_GLOB: &str = "*Sample-Submission-Form*";
pub const RUN_INFO: &str = "RunInfo.xml";
pub const STATS_DIR: &str = "Stats";
pub const REPORTS_DIR: &str = "Reports";
pub const DEMUX_STATS_XML: &str = "DemultiplexingStats.xml";
pub const CONVERSION_STATS_XML: &str = "ConversionStats.xml";
pub const STATS_JSON: &str = "Stats.json";
pub const MD5SUMS: &str = "md5sums.txt";
pub const INTEROP_SUMMARY: &str = "interop_summary.csv";
pub const SETTINGS_SNAPSHOT: &str = "pipeline_settings.toml";
pub const LEDGER_FILE: &str = "flowcells.processed";

// Staging subdirectories inside a project tree, never enumerated as samples
pub const CONTAMINATED_DIR: &str = "contaminated";
pub const FILTERED_DIR: &str = "filtered";
/// Written next to a pair's staged outputs once the tool has finished them.
pub const STAGED_SUFFIX: &str = ".staged";

pub const QC_PREFIX: &str = "QC_";
pub const FASTQC_DIR: &str = "FASTQC";
pub const FASTQ_SCREEN_DIR: &str = "fastq_screen";

pub const FASTQ_GZ_EXT: &str = ".fastq.gz";

/// Top-level entries of a run output directory that are never projects.
pub fn is_auxiliary_dir(name: &str) -> bool {
    name == STATS_DIR
        || name == REPORTS_DIR
        || name == CONTAMINATED_DIR
        || name == FILTERED_DIR
        || name.starts_with(QC_PREFIX)
}

/// Flow cells are only treated as lane-partitioned at this lane count.
pub const FULL_LANE_COUNT: u32 = 8;

/// One instrument family: the serial fragment found in its run folder names
/// and the file it drops when sequencing is complete.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Platform {
    pub model: &'static str,
    pub serial: &'static str,
    pub completion_marker: &'static str,
}

pub const PLATFORMS: &[Platform] = &[
    Platform { model: "HiSeq2500", serial: "SN7001334", completion_marker: "ImageAnalysis_Netcopy_complete.txt" },
    Platform { model: "NextSeq500", serial: "NB501038", completion_marker: "RunCompletionStatus.xml" },
    Platform { model: "MiSeq", serial: "M026575", completion_marker: "ImageAnalysis_Netcopy_complete.txt" },
    Platform { model: "MiSeq", serial: "M03942", completion_marker: "ImageAnalysis_Netcopy_complete.txt" },
    Platform { model: "HiSeq4000", serial: "K00251", completion_marker: "SequencingComplete.txt" },
];

lazy_static! {
    pub static ref SERIAL_MODELS: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        for platform in PLATFORMS {
            m.insert(platform.serial, platform.model);
        }
        m
    };
}

/// Resolves the instrument model from a run ID such as
/// `150416_SN7001334_0196_BC605HACXX`.
pub fn model_for_run(run_id: &str) -> Option<&'static str> {
    let serial = run_id.split('_').nth(1)?;
    SERIAL_MODELS
        .iter()
        .find(|(prefix, _)| serial.starts_with(**prefix))
        .map(|(_, model)| *model)
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("{tool} failed: {error}")]
    ToolExecution { tool: String, error: String },

    #[error("I/O error: {0}")]
    IOError(String),

    #[error("Failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Variant name, used as the error type line of error reports.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidConfig(_) => "InvalidConfig",
            PipelineError::Precondition(_) => "Precondition",
            PipelineError::ToolExecution { .. } => "ToolExecution",
            PipelineError::IOError(_) => "IOError",
            PipelineError::Parse { .. } => "Parse",
            PipelineError::Other(_) => "Other",
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}

/// One sequencer run selected for processing. Only its on-disk projection
/// (output directory, markers, copied manifest) outlives a processing attempt.
#[derive(Debug, Clone, Serialize)]
pub struct RunDescriptor {
    pub run_id: String,
    /// Directory name under the instrument root, e.g. `hiseq2500`.
    pub sequencer: String,
    pub model: String,
    /// Lane digits the operator restricted processing to; empty means all.
    pub lanes: String,
    pub instrument_dir: PathBuf,
    pub output_root: PathBuf,
    pub sample_sheet: PathBuf,
    pub lane_count: u32,
    pub options: CustomOptions,
    #[serde(skip_serializing)]
    pub sub_sheets: Vec<SubSheet>,
}

impl RunDescriptor {
    /// `<outputRoot>/<runID>[_lanes<set>]`
    pub fn output_dir(&self) -> PathBuf {
        run_output_dir(&self.output_root, &self.run_id, &self.lanes)
    }

    pub fn stats_dir(&self) -> PathBuf {
        self.output_dir().join(STATS_DIR)
    }

    pub fn marker(&self, name: &str) -> PathBuf {
        self.output_dir().join(name)
    }
}

pub fn run_output_dir(output_root: &Path, run_id: &str, lanes: &str) -> PathBuf {
    if lanes.is_empty() {
        output_root.join(run_id)
    } else {
        output_root.join(format!("{}_lanes{}", run_id, lanes))
    }
}

/// Immutable snapshot handed to every stage and worker in place of any
/// process-wide "current run" state.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub settings: Settings,
    pub run: RunDescriptor,
}

impl RunContext {
    pub fn new(settings: Settings, run: RunDescriptor) -> Arc<Self> {
        Arc::new(RunContext { settings, run })
    }
}
