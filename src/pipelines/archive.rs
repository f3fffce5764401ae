use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use crate::config::defs::{PipelineError, RunContext, QC_PREFIX, SAMPLE_SHEET_COPY, STATS_DIR};
use crate::utils::command::{md5sum, sevenzip, ToolRunner};
use crate::utils::file::{glob_under, remove_dir_if_exists, remove_file_if_exists, write_atomic};
use crate::utils::ledger::{now_timestamp, Ledger, LedgerEntry};
use crate::utils::system::generate_passphrase;

const PASSPHRASE_LEN: usize = 24;

pub fn archive_path(out_dir: &Path, project: &str) -> PathBuf {
    out_dir.join(format!("{}.zip", project))
}

fn sidecar(archive: &Path, ext: &str) -> PathBuf {
    let mut name = archive.as_os_str().to_os_string();
    name.push(ext);
    PathBuf::from(name)
}

/// Archive members for one project, relative to the run output directory.
fn members(out_dir: &Path, project: &str) -> Result<Vec<PathBuf>, PipelineError> {
    let mut members = vec![PathBuf::from(project)];
    let qc = format!("{}{}", QC_PREFIX, project);
    for dir in [qc.as_str(), STATS_DIR] {
        if out_dir.join(dir).exists() {
            members.push(PathBuf::from(dir));
        }
    }
    for undetermined in glob_under(out_dir, "Undetermined*.fastq.gz")? {
        if let Some(name) = undetermined.file_name() {
            members.push(PathBuf::from(name));
        }
    }
    if out_dir.join(SAMPLE_SHEET_COPY).exists() {
        members.push(PathBuf::from(SAMPLE_SHEET_COPY));
    }
    Ok(members)
}

fn write_secret(path: &Path, secret: &str) -> Result<(), PipelineError> {
    write_atomic(path, secret.as_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Builds one archive per project, encrypted when the run is flagged as
/// sensitive, followed by its `.md5` checksum file.
///
/// # Arguments
///
/// * `ctx` - Run being archived.
/// * `runner` - Executes 7za and md5sum.
/// * `projects` - Project directory names.
///
/// # Returns
/// Paths of the archives written.
pub async fn archive_projects(
    ctx: &RunContext,
    runner: &dyn ToolRunner,
    projects: &[String],
) -> Result<Vec<PathBuf>, PipelineError> {
    let out_dir = ctx.run.output_dir();
    let mut archives = Vec::new();
    for project in projects {
        let archive = archive_path(&out_dir, project);
        let password_file = sidecar(&archive, ".password");
        let checksum_file = sidecar(&archive, ".md5");
        remove_file_if_exists(&archive)?;
        remove_file_if_exists(&checksum_file)?;

        let password = if ctx.run.options.sensitive_data {
            let secret = generate_passphrase(PASSPHRASE_LEN);
            write_secret(&password_file, &secret)?;
            Some(secret)
        } else {
            remove_file_if_exists(&password_file)?;
            None
        };

        info!("Archiving {} into {}", project, archive.display());
        let cmd = sevenzip::command(
            &ctx.settings.tools.archiver,
            &out_dir,
            &archive,
            password.as_deref(),
            &members(&out_dir, project)?,
        );
        runner.run(&cmd).await?;

        let archive_name = archive.file_name().map(PathBuf::from).unwrap_or_else(|| archive.clone());
        let cmd = md5sum::command(&ctx.settings.tools.md5sum, &out_dir, &[archive_name], &checksum_file);
        runner.run(&cmd).await?;
        archives.push(archive);
    }
    Ok(archives)
}

/// Deletes the decompressed project and QC directories of every unarchived
/// Ledger row of a flow cell, then stamps those rows as archived.
///
/// # Returns
/// The rows that were archived.
pub fn archive_flowcell(ledger: &Ledger, flowcell_path: &Path) -> anyhow::Result<Vec<LedgerEntry>> {
    let rows = ledger.list_flowcell(flowcell_path)?;
    for row in &rows {
        for dir in [row.project.clone(), format!("{}{}", QC_PREFIX, row.project)] {
            let path = flowcell_path.join(&dir);
            if remove_dir_if_exists(&path)? {
                info!("Removed {}", path.display());
            }
        }
    }
    ledger.mark_archived(flowcell_path, &now_timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_members_and_sidecars() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let out = dir.path();
        fs::create_dir_all(out.join("GCF-0001"))?;
        fs::create_dir_all(out.join("QC_GCF-0001"))?;
        fs::create_dir_all(out.join("Stats"))?;
        fs::write(out.join("Undetermined_R1.fastq.gz"), "")?;
        fs::write(out.join("SampleSheet.csv"), "")?;
        let found = members(out, "GCF-0001")?;
        let names: Vec<String> = found.iter().map(|p| p.display().to_string()).collect();
        assert_eq!(names, vec!["GCF-0001", "QC_GCF-0001", "Stats", "Undetermined_R1.fastq.gz", "SampleSheet.csv"]);

        let archive = archive_path(out, "GCF-0001");
        assert_eq!(sidecar(&archive, ".md5"), out.join("GCF-0001.zip.md5"));
        Ok(())
    }

    #[test]
    fn test_archive_flowcell_removes_projects() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let run = dir.path().join("RUN1");
        fs::create_dir_all(run.join("GCF-0001"))?;
        fs::create_dir_all(run.join("QC_GCF-0001"))?;
        fs::create_dir_all(run.join("Stats"))?;
        let ledger = Ledger::new(dir.path().join("flowcells.processed"));
        ledger.add("GCF-0001", &run, "2024-01-01 00:00:00")?;

        let archived = archive_flowcell(&ledger, &run)?;
        assert_eq!(archived.len(), 1);
        assert!(!run.join("GCF-0001").exists());
        assert!(!run.join("QC_GCF-0001").exists());
        assert!(run.join("Stats").exists());
        assert!(ledger.list_flowcell(&run)?.is_empty());
        Ok(())
    }
}
