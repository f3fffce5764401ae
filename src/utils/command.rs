/// Functions and structs for building and running external tool invocations.
///
/// Every tool has one wrapper module producing a `ToolCommand`: program,
/// explicit argument list and the files the tool is expected to write.
/// Nothing is ever passed through a shell.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures::future::BoxFuture;
use log::{debug, warn};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::defs::PipelineError;
use crate::config::settings::ToolSettings;
use crate::utils::file::write_atomic;

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCommand {
    pub tag: &'static str,
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub stdin: Option<Vec<u8>>,
    /// Stdout is captured and persisted here atomically on success.
    pub stdout_to: Option<PathBuf>,
    /// Files the tool is expected to produce.
    pub outputs: Vec<PathBuf>,
}

impl ToolCommand {
    pub fn new(tag: &'static str, tool: &ToolSettings) -> Self {
        ToolCommand {
            tag,
            program: tool.command.clone(),
            args: tool.options.clone(),
            ..Default::default()
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        let arg = path.to_string_lossy().into_owned();
        self.arg(arg)
    }

    /// `key=value` style argument used by the BBTools suite.
    pub fn kv_arg(self, key: &str, path: &Path) -> Self {
        let arg = format!("{}={}", key, path.display());
        self.arg(arg)
    }

    pub fn in_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    pub fn stdout_to(mut self, path: &Path) -> Self {
        self.stdout_to = Some(path.to_path_buf());
        self
    }

    pub fn with_stdin(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }

    pub fn output(mut self, path: PathBuf) -> Self {
        self.outputs.push(path);
        self
    }

    /// Command line for logs. Not shell-escaped.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        if let Some(dest) = &self.stdout_to {
            line.push_str(&format!(" > {}", dest.display()));
        }
        line
    }
}

/// Seam between the pipeline and process execution.
pub trait ToolRunner: Send + Sync {
    fn run<'a>(&'a self, cmd: &'a ToolCommand) -> BoxFuture<'a, Result<(), PipelineError>>;
}

/// Runs tools as child processes of the daemon.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ToolRunner for ProcessRunner {
    fn run<'a>(&'a self, cmd: &'a ToolCommand) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(run_process(cmd))
    }
}

fn tool_error(cmd: &ToolCommand, error: String) -> PipelineError {
    PipelineError::ToolExecution {
        tool: cmd.tag.to_string(),
        error,
    }
}

async fn run_process(cmd: &ToolCommand) -> Result<(), PipelineError> {
    debug!("Running {}", cmd.display());

    let mut command = Command::new(&cmd.program);
    command
        .args(&cmd.args)
        .stdin(if cmd.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(if cmd.stdout_to.is_some() { Stdio::piped() } else { Stdio::null() })
        .stderr(Stdio::piped());
    if let Some(dir) = &cmd.current_dir {
        command.current_dir(dir);
    }

    let mut child = command
        .spawn()
        .map_err(|e| tool_error(cmd, format!("Failed to spawn {}: {}. Is it installed?", cmd.program, e)))?;

    let stdin_task = match (&cmd.stdin, child.stdin.take()) {
        (Some(bytes), Some(mut stdin)) => {
            let bytes = bytes.clone();
            Some(tokio::spawn(async move {
                stdin.write_all(&bytes).await?;
                stdin.shutdown().await
            }))
        }
        _ => None,
    };

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| tool_error(cmd, format!("Failed waiting on {}: {}", cmd.program, e)))?;

    if let Some(task) = stdin_task {
        task.await
            .map_err(|e| tool_error(cmd, format!("stdin writer panicked: {}", e)))?
            .map_err(|e| tool_error(cmd, format!("Failed to write stdin: {}", e)))?;
    }

    if !output.status.success() {
        return Err(tool_error(
            cmd,
            format!("{} exited with {}: {}", cmd.display(), output.status, stderr_tail(&output.stderr)),
        ));
    }

    if let Some(dest) = &cmd.stdout_to {
        write_atomic(dest, &output.stdout).map_err(|e| tool_error(cmd, e.to_string()))?;
    }

    for expected in &cmd.outputs {
        if !expected.exists() {
            warn!("{} finished but did not produce {}", cmd.tag, expected.display());
        }
    }
    Ok(())
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Looks a program up on PATH, or checks it directly when given with a path.
pub fn locate_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    env::var_os("PATH").and_then(|paths| {
        env::split_paths(&paths)
            .map(|dir| dir.join(program))
            .find(|p| p.is_file())
    })
}

pub mod bcl2fastq {
    use std::path::Path;

    use crate::config::defs::{BCL2FASTQ_TAG, STATS_JSON};
    use crate::config::settings::ToolSettings;
    use super::ToolCommand;

    /// One demultiplexing pass over a run folder for a single sub-sheet.
    ///
    /// # Arguments
    ///
    /// * `run_dir` - Instrument run folder.
    /// * `out_dir` - Run output directory.
    /// * `sample_sheet` - Rendered sub-sheet.
    /// * `lanes` - Lane digits to restrict to, empty for all lanes.
    /// * `stats_dir` / `reports_dir` - Separate statistics directories when
    ///   several passes share one output directory.
    pub fn command(
        tool: &ToolSettings,
        run_dir: &Path,
        out_dir: &Path,
        sample_sheet: &Path,
        threads: usize,
        lanes: &str,
        stats_dir: &Path,
        reports_dir: Option<&Path>,
    ) -> ToolCommand {
        let mut cmd = ToolCommand::new(BCL2FASTQ_TAG, tool)
            .arg("--runfolder-dir")
            .path_arg(run_dir)
            .arg("--output-dir")
            .path_arg(out_dir)
            .arg("--sample-sheet")
            .path_arg(sample_sheet)
            .arg("-p")
            .arg(threads.max(1).to_string());
        if !lanes.is_empty() {
            cmd = cmd.arg("--tiles").arg(format!("s_[{}]", lanes));
        }
        if let Some(reports) = reports_dir {
            cmd = cmd
                .arg("--stats-dir")
                .path_arg(stats_dir)
                .arg("--reports-dir")
                .path_arg(reports);
        }
        cmd.output(stats_dir.join(STATS_JSON))
    }
}

pub mod bbmap {
    use std::path::Path;

    use crate::config::defs::BBMAP_TAG;
    use crate::config::settings::ToolSettings;
    use super::ToolCommand;

    /// Maps reads against the masked host reference. Unmapped reads go to
    /// `clean`, mapped reads to `hits`.
    pub fn command(
        tool: &ToolSettings,
        masked_reference: &Path,
        reads: (&Path, Option<&Path>),
        clean: (&Path, Option<&Path>),
        hits: (&Path, Option<&Path>),
    ) -> ToolCommand {
        let mut cmd = ToolCommand::new(BBMAP_TAG, tool)
            .kv_arg("path", masked_reference)
            .kv_arg("in", reads.0)
            .kv_arg("outu", clean.0)
            .kv_arg("outm", hits.0)
            .output(clean.0.to_path_buf())
            .output(hits.0.to_path_buf());
        if let (Some(r2), Some(c2), Some(h2)) = (reads.1, clean.1, hits.1) {
            cmd = cmd
                .kv_arg("in2", r2)
                .kv_arg("outu2", c2)
                .kv_arg("outm2", h2)
                .output(c2.to_path_buf())
                .output(h2.to_path_buf());
        }
        cmd
    }
}

pub mod clumpify {
    use std::path::Path;

    use crate::config::defs::CLUMPIFY_TAG;
    use crate::config::settings::ToolSettings;
    use super::ToolCommand;

    pub fn command(
        tool: &ToolSettings,
        reads: (&Path, Option<&Path>),
        out: (&Path, Option<&Path>),
    ) -> ToolCommand {
        let mut cmd = ToolCommand::new(CLUMPIFY_TAG, tool)
            .kv_arg("in", reads.0)
            .kv_arg("out", out.0)
            .output(out.0.to_path_buf());
        if let (Some(r2), Some(o2)) = (reads.1, out.1) {
            cmd = cmd.kv_arg("in2", r2).kv_arg("out2", o2).output(o2.to_path_buf());
        }
        cmd
    }
}

pub mod fastqc {
    use std::path::Path;

    use crate::config::defs::FASTQC_TAG;
    use crate::config::settings::ToolSettings;
    use crate::utils::file::fastq_base;
    use super::ToolCommand;

    pub fn command(tool: &ToolSettings, input: &Path, out_dir: &Path) -> ToolCommand {
        let base = fastq_base(input);
        ToolCommand::new(FASTQC_TAG, tool)
            .arg("-o")
            .path_arg(out_dir)
            .path_arg(input)
            .output(out_dir.join(format!("{}_fastqc.zip", base)))
            .output(out_dir.join(format!("{}_fastqc.html", base)))
    }
}

pub mod md5sum {
    use std::path::{Path, PathBuf};

    use crate::config::defs::MD5SUM_TAG;
    use crate::config::settings::ToolSettings;
    use super::ToolCommand;

    /// Checksums `files` (relative to `dir`) into `dest`.
    pub fn command(tool: &ToolSettings, dir: &Path, files: &[PathBuf], dest: &Path) -> ToolCommand {
        let mut cmd = ToolCommand::new(MD5SUM_TAG, tool).in_dir(dir);
        for file in files {
            cmd = cmd.path_arg(file);
        }
        cmd.stdout_to(dest).output(dest.to_path_buf())
    }
}

pub mod fastq_screen {
    use std::path::Path;

    use crate::config::defs::FASTQ_SCREEN_TAG;
    use crate::config::settings::ToolSettings;
    use crate::utils::file::fastq_base;
    use super::ToolCommand;

    pub fn command(tool: &ToolSettings, input: &Path, out_dir: &Path) -> ToolCommand {
        let base = fastq_base(input);
        ToolCommand::new(FASTQ_SCREEN_TAG, tool)
            .arg("--outdir")
            .path_arg(out_dir)
            .path_arg(input)
            .output(out_dir.join(format!("{}_screen.html", base)))
            .output(out_dir.join(format!("{}_screen.txt", base)))
    }
}

pub mod multiqc {
    use std::path::{Path, PathBuf};

    use crate::config::defs::MULTIQC_TAG;
    use crate::config::settings::ToolSettings;
    use super::ToolCommand;

    /// Aggregates QC outputs found under `inputs` into `<out_dir>/<name>.html`.
    pub fn command(
        tool: &ToolSettings,
        config: Option<&Path>,
        name: &str,
        out_dir: &Path,
        inputs: &[PathBuf],
    ) -> ToolCommand {
        let mut cmd = ToolCommand::new(MULTIQC_TAG, tool);
        if let Some(cfg) = config {
            cmd = cmd.arg("--config").path_arg(cfg);
        }
        cmd = cmd.arg("-n").arg(format!("{}.html", name)).arg("-o").path_arg(out_dir);
        for input in inputs {
            cmd = cmd.path_arg(input);
        }
        cmd.output(out_dir.join(format!("{}.html", name)))
    }
}

pub mod interop {
    use std::path::Path;

    use crate::config::defs::INTEROP_TAG;
    use crate::config::settings::ToolSettings;
    use super::ToolCommand;

    /// Sequencing metrics summary of the instrument's InterOp directory.
    pub fn command(tool: &ToolSettings, run_dir: &Path, dest: &Path) -> ToolCommand {
        ToolCommand::new(INTEROP_TAG, tool)
            .path_arg(run_dir)
            .stdout_to(dest)
            .output(dest.to_path_buf())
    }
}

pub mod sevenzip {
    use std::path::{Path, PathBuf};

    use crate::config::defs::SEVENZIP_TAG;
    use crate::config::settings::ToolSettings;
    use super::ToolCommand;

    /// Adds `members` (relative to `dir`) to `archive`, encrypted when a
    /// password is given.
    pub fn command(
        tool: &ToolSettings,
        dir: &Path,
        archive: &Path,
        password: Option<&str>,
        members: &[PathBuf],
    ) -> ToolCommand {
        let mut cmd = ToolCommand {
            tag: SEVENZIP_TAG,
            program: tool.command.clone(),
            args: vec!["a".to_string()],
            ..Default::default()
        };
        for opt in &tool.options {
            cmd = cmd.arg(opt.clone());
        }
        if let Some(pw) = password {
            cmd = cmd.arg(format!("-p{}", pw)).arg("-mem=AES256");
        }
        cmd = cmd.path_arg(archive);
        for member in members {
            cmd = cmd.path_arg(member);
        }
        cmd.in_dir(dir).output(archive.to_path_buf())
    }
}

pub mod mail {
    use crate::config::defs::MAIL_TAG;
    use crate::config::settings::ToolSettings;
    use super::ToolCommand;

    pub fn command(tool: &ToolSettings, message: String) -> ToolCommand {
        ToolCommand::new(MAIL_TAG, tool).with_stdin(message.into_bytes())
    }
}

pub mod tracking {
    use crate::config::defs::TRACKING_TAG;
    use crate::config::settings::ToolSettings;
    use super::ToolCommand;

    pub fn command(tool: &ToolSettings, run_id: &str) -> ToolCommand {
        ToolCommand::new(TRACKING_TAG, tool).arg(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(cmd: &str, opts: &[&str]) -> ToolSettings {
        ToolSettings::new(cmd, opts)
    }

    #[test]
    fn test_fastqc_command_contract() {
        let cmd = fastqc::command(
            &tool("fastqc", &["-q"]),
            Path::new("/out/P1/s1_R1.fastq.gz"),
            Path::new("/out/QC_P1/FASTQC"),
        );
        assert_eq!(cmd.program, "fastqc");
        assert_eq!(cmd.args, vec!["-q", "-o", "/out/QC_P1/FASTQC", "/out/P1/s1_R1.fastq.gz"]);
        assert_eq!(cmd.outputs[0], PathBuf::from("/out/QC_P1/FASTQC/s1_R1_fastqc.zip"));
    }

    #[test]
    fn test_bcl2fastq_lane_restriction_and_parts() {
        let cmd = bcl2fastq::command(
            &tool("bcl2fastq", &[]),
            Path::new("/seq/run"),
            Path::new("/out/run"),
            Path::new("/out/run/SampleSheet.part1.csv"),
            8,
            "34",
            Path::new("/out/run/Stats/part1"),
            Some(Path::new("/out/run/Reports/part1")),
        );
        let line = cmd.display();
        assert!(line.contains("--tiles s_[34]"));
        assert!(line.contains("--stats-dir /out/run/Stats/part1"));
        assert!(line.contains("-p 8"));
    }

    #[test]
    fn test_sevenzip_password_only_when_sensitive() {
        let members = vec![PathBuf::from("P1"), PathBuf::from("QC_P1")];
        let open = sevenzip::command(&tool("7za", &["-tzip"]), Path::new("/out"), Path::new("/out/P1.zip"), None, &members);
        assert_eq!(open.args, vec!["a", "-tzip", "/out/P1.zip", "P1", "QC_P1"]);
        let locked = sevenzip::command(&tool("7za", &[]), Path::new("/out"), Path::new("/out/P1.zip"), Some("secret"), &members);
        assert!(locked.args.contains(&"-psecret".to_string()));
        assert_eq!(locked.current_dir, Some(PathBuf::from("/out")));
    }

    #[test]
    fn test_paired_bbmap_outputs() {
        let cmd = bbmap::command(
            &tool("bbmap.sh", &[]),
            Path::new("/ref/hg38"),
            (Path::new("a_R1.fastq.gz"), Some(Path::new("a_R2.fastq.gz"))),
            (Path::new("f/a_R1.fastq.gz"), Some(Path::new("f/a_R2.fastq.gz"))),
            (Path::new("f/a_R1.host.fastq.gz"), Some(Path::new("f/a_R2.host.fastq.gz"))),
        );
        assert_eq!(cmd.outputs.len(), 4);
        assert!(cmd.args.contains(&"in2=a_R2.fastq.gz".to_string()));
        assert!(cmd.args.contains(&"path=/ref/hg38".to_string()));
    }

    #[tokio::test]
    async fn test_process_runner_captures_stdout() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let dest = dir.path().join("echo.txt");
        let cmd = ToolCommand {
            tag: "echo",
            program: "echo".to_string(),
            args: vec!["hello".to_string()],
            ..Default::default()
        }
        .stdout_to(&dest);
        ProcessRunner.run(&cmd).await?;
        assert_eq!(std::fs::read_to_string(&dest)?, "hello\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_process_runner_reports_failure() {
        let cmd = ToolCommand {
            tag: "false",
            program: "false".to_string(),
            ..Default::default()
        };
        let result = ProcessRunner.run(&cmd).await;
        assert!(matches!(result, Err(PipelineError::ToolExecution { .. })));
    }
}
