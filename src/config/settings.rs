// src/config/settings.rs: facility configuration file

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::config::defs::{run_output_dir, LEDGER_FILE};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub paths: Paths,
    pub options: Options,
    pub tools: Tools,
    pub notify: Notify,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Paths {
    /// Instrument root, laid out as `<base_dir>/<sequencer>/data/<runID>/`.
    pub base_dir: PathBuf,
    pub output_dir: PathBuf,
    pub report_dir: PathBuf,
    pub ledger_dir: PathBuf,
    pub masked_reference: Option<PathBuf>,
    pub multiqc_template: Option<PathBuf>,
}

impl Default for Paths {
    fn default() -> Self {
        Paths {
            base_dir: PathBuf::from("/instruments"),
            output_dir: PathBuf::from("/data/fastq"),
            report_dir: PathBuf::from("/data/reports"),
            ledger_dir: PathBuf::from("/data/ledger"),
            masked_reference: None,
            multiqc_template: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub sleep_hours: f64,
    pub min_space_gb: f64,
    pub lanes: String,
    pub bcl2fastq_threads: usize,
    pub clumpify_worker_threads: usize,
    pub fastqc_threads: usize,
    pub fastq_screen_threads: usize,
    pub archive_projects: bool,
    pub facility_name: String,
    pub contact: String,
    pub adapter: Option<String>,
    pub adapter_read2: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            sleep_hours: 1.0,
            min_space_gb: 200.0,
            lanes: String::new(),
            bcl2fastq_threads: 16,
            clumpify_worker_threads: 2,
            fastqc_threads: 8,
            fastq_screen_threads: 4,
            archive_projects: true,
            facility_name: "Genomics Core Facility".to_string(),
            contact: String::new(),
            adapter: None,
            adapter_read2: None,
        }
    }
}

/// Program name plus extra arguments for one external tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSettings {
    pub command: String,
    #[serde(default)]
    pub options: Vec<String>,
}

impl ToolSettings {
    pub fn new(command: &str, options: &[&str]) -> Self {
        ToolSettings {
            command: command.to_string(),
            options: options.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tools {
    pub bcl2fastq: ToolSettings,
    pub bbmap: ToolSettings,
    pub clumpify: ToolSettings,
    pub fastqc: ToolSettings,
    pub md5sum: ToolSettings,
    pub fastq_screen: ToolSettings,
    pub multiqc: ToolSettings,
    pub interop_summary: ToolSettings,
    pub archiver: ToolSettings,
}

impl Default for Tools {
    fn default() -> Self {
        Tools {
            bcl2fastq: ToolSettings::new("bcl2fastq", &["--barcode-mismatches", "1"]),
            bbmap: ToolSettings::new("bbmap.sh", &["minid=0.95", "maxindel=3", "bwr=0.16", "bw=12", "quickmatch", "fast", "minhits=2", "qtrim=rl", "trimq=10", "untrim"]),
            clumpify: ToolSettings::new("clumpify.sh", &["dedupe=t", "optical=t", "dupedist=2500"]),
            fastqc: ToolSettings::new("fastqc", &["-q", "-t", "2"]),
            md5sum: ToolSettings::new("md5sum", &[]),
            fastq_screen: ToolSettings::new("fastq_screen", &["--quiet", "--subset", "400000"]),
            multiqc: ToolSettings::new("multiqc", &["-q", "-f"]),
            interop_summary: ToolSettings::new("summary", &["--csv=1"]),
            archiver: ToolSettings::new("7za", &["-tzip", "-mx=1"]),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Notify {
    /// Receives a complete RFC 822 message on stdin, e.g. `sendmail -t`.
    pub mail: Option<ToolSettings>,
    pub from_address: String,
    pub finished_to: String,
    pub error_to: String,
    /// Called with the run ID after a successful run. Failures are advisory.
    pub tracking: Option<ToolSettings>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Settings> {
        let text = fs::read_to_string(path)
            .map_err(|e| anyhow!("Cannot read configuration {}: {}", path.display(), e))?;
        Settings::from_toml(&text)
            .map_err(|e| anyhow!("Invalid configuration {}: {}", path.display(), e))
    }

    pub fn from_toml(text: &str) -> Result<Settings> {
        let settings: Settings = toml::from_str(text)?;
        if settings.options.lanes.chars().any(|c| !c.is_ascii_digit()) {
            return Err(anyhow!("options.lanes must only contain lane digits, got '{}'", settings.options.lanes));
        }
        Ok(settings)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.paths.ledger_dir.join(LEDGER_FILE)
    }

    pub fn run_output_dir(&self, run_id: &str) -> PathBuf {
        run_output_dir(&self.paths.output_dir, run_id, &self.options.lanes)
    }
}
