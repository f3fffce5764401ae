// Error and finished reports: written to the report directory and optionally
// piped to the configured mail command.

use std::path::PathBuf;

use log::{error, info, warn};

use crate::config::defs::PipelineError;
use crate::config::settings::Settings;
use crate::utils::command::{mail, tracking, ToolRunner};
use crate::utils::file::write_atomic;

pub fn error_report_path(settings: &Settings, run_id: &str) -> PathBuf {
    settings.paths.report_dir.join(format!("{}.error", run_id))
}

pub fn finished_report_path(settings: &Settings, run_id: &str) -> PathBuf {
    settings.paths.report_dir.join(format!("{}.report", run_id))
}

/// Body of an error report: context, error type, error value and the full
/// debug trace including the cause chain.
pub fn error_body(context: &str, err: &PipelineError) -> String {
    format!(
        "{}\nError type: {}\nError value: {}\n{:?}\n",
        context,
        err.kind(),
        err,
        err
    )
}

fn mail_message(from: &str, to: &str, subject: &str, body: &str) -> String {
    format!("From: {}\nTo: {}\nSubject: {}\n\n{}\n", from, to, subject, body)
}

/// Records a stage failure. Never fails itself: problems writing or mailing
/// the report are logged.
pub async fn report_error(
    settings: &Settings,
    runner: &dyn ToolRunner,
    run_id: &str,
    context: &str,
    err: &PipelineError,
) {
    error!("{}: {}", context, err);
    let body = error_body(context, err);
    let path = error_report_path(settings, run_id);
    match write_atomic(&path, body.as_bytes()) {
        Ok(()) => info!("Error report written to {}", path.display()),
        Err(e) => error!("Unable to write error report {}: {}", path.display(), e),
    }

    if let Some(tool) = &settings.notify.mail {
        if settings.notify.error_to.is_empty() {
            return;
        }
        let message = mail_message(
            &settings.notify.from_address,
            &settings.notify.error_to,
            &format!("[flowcell-pipeline] Error processing {}", run_id),
            &body,
        );
        if let Err(e) = runner.run(&mail::command(tool, message)).await {
            error!("Unable to send error mail for {}: {}", run_id, e);
        }
    }
}

/// Text of the finished notification.
///
/// # Arguments
///
/// * `summary` - Message returned by post-processing.
/// * `metrics` - Conversion statistics table, if available.
/// * `reports` - Per-project aggregate QC reports.
pub fn finished_body(
    run_id: &str,
    run_time: &str,
    summary: &str,
    metrics: Option<&str>,
    reports: &[PathBuf],
) -> String {
    let mut body = format!("Flow cell: {}\nRun time: {}\n{}\n", run_id, run_time, summary);
    if let Some(table) = metrics {
        body.push('\n');
        body.push_str(table);
    }
    if !reports.is_empty() {
        body.push_str("\nProject reports:\n");
        for report in reports {
            body.push_str(&format!("  {}\n", report.display()));
        }
    }
    body
}

/// Writes `<report_dir>/<runID>.report` and mails it when a mail command is
/// configured. Any failure here fails the run's cycle.
pub async fn send_finished(
    settings: &Settings,
    runner: &dyn ToolRunner,
    run_id: &str,
    projects: &[String],
    body: &str,
) -> Result<PathBuf, PipelineError> {
    let path = finished_report_path(settings, run_id);
    write_atomic(&path, body.as_bytes())?;
    info!("Finished report written to {}", path.display());

    if let Some(tool) = &settings.notify.mail {
        if settings.notify.finished_to.is_empty() {
            warn!("Mail command configured without notify.finished_to, not mailing");
            return Ok(path);
        }
        let message = mail_message(
            &settings.notify.from_address,
            &settings.notify.finished_to,
            &format!("[flowcell-pipeline] {} processed", projects.join(", ")),
            body,
        );
        runner.run(&mail::command(tool, message)).await?;
    }
    Ok(path)
}

/// Notifies the external tracking system. Callers treat failures as advisory.
pub async fn update_tracking(settings: &Settings, runner: &dyn ToolRunner, run_id: &str) -> Result<(), PipelineError> {
    match &settings.notify.tracking {
        Some(tool) => runner.run(&tracking::command(tool, run_id)).await,
        None => Ok(()),
    }
}
