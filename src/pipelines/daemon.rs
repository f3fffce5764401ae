//! Outer control loop: reload settings, pick one run, drive it through every
//! stage, then rescan immediately or sleep until the next wake-up.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{error, info, warn};
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

use crate::config::defs::{PipelineError, RunContext};
use crate::config::settings::{Settings, ToolSettings};
use crate::pipelines::archive::archive_projects;
use crate::pipelines::demux::{demultiplex, fix_names};
use crate::pipelines::discovery::find_next_run;
use crate::pipelines::post_process::{PostProcessor, RunLayout};
use crate::utils::command::{locate_program, ToolRunner};
use crate::utils::file::touch;
use crate::utils::ledger::{ensure_ledger_dir, now_timestamp, Ledger};
use crate::utils::markers::{CompletionCheck, Marker};
use crate::utils::report::{finished_body, report_error, send_finished, update_tracking};
use crate::utils::stats::conversion_metrics;
use crate::utils::system::free_space_gb;

/// What one loop iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// No run qualified.
    Idle,
    /// The named run was finalised.
    Processed(String),
    /// The named run failed; an error report was written.
    Failed(String),
}

/// A stage failure with the context line used in the error report.
#[derive(Debug)]
struct StageFailure {
    context: &'static str,
    error: PipelineError,
}

fn at(context: &'static str) -> impl FnOnce(PipelineError) -> StageFailure {
    move |error| StageFailure { context, error }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

fn sleep_duration(hours: f64) -> Duration {
    let secs = (hours * 3600.0).clamp(0.0, 7.0 * 24.0 * 3600.0);
    Duration::from_secs_f64(if secs.is_finite() { secs } else { 0.0 })
}

/// Warns about configured tools that cannot be found on PATH.
pub fn check_tools(settings: &Settings) {
    let tools = &settings.tools;
    let mut configured: Vec<&ToolSettings> = vec![
        &tools.bcl2fastq,
        &tools.bbmap,
        &tools.clumpify,
        &tools.fastqc,
        &tools.md5sum,
        &tools.fastq_screen,
        &tools.multiqc,
        &tools.interop_summary,
        &tools.archiver,
    ];
    configured.extend(settings.notify.mail.iter());
    configured.extend(settings.notify.tracking.iter());
    for tool in configured {
        if locate_program(&tool.command).is_none() {
            warn!("{} was not found, stages using it will fail", tool.command);
        }
    }
}

pub struct Daemon {
    config_path: PathBuf,
    runner: Arc<dyn ToolRunner>,
    check: Arc<dyn CompletionCheck>,
}

impl Daemon {
    pub fn new(config_path: PathBuf, runner: Arc<dyn ToolRunner>, check: Arc<dyn CompletionCheck>) -> Self {
        Daemon { config_path, runner, check }
    }

    /// Runs until killed, or for a single iteration when `once` is set.
    /// A configuration that cannot be read at startup is fatal; later reload
    /// failures keep the previous configuration.
    pub async fn run(&self, once: bool) -> Result<()> {
        let mut settings = Settings::load(&self.config_path)?;
        check_tools(&settings);
        #[cfg(unix)]
        let mut hangup = signal(SignalKind::hangup())?;

        loop {
            match Settings::load(&self.config_path) {
                Ok(reloaded) => settings = reloaded,
                Err(e) => error!("Keeping previous configuration: {:#}", e),
            }

            let outcome = self.iteration(&settings).await;
            if once {
                info!("Single iteration finished: {:?}", outcome);
                return Ok(());
            }
            if let Outcome::Processed(_) = outcome {
                continue;
            }

            let duration = sleep_duration(settings.options.sleep_hours);
            info!("Sleeping for {:.2} hours", duration.as_secs_f64() / 3600.0);
            #[cfg(unix)]
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                _ = hangup.recv() => info!("Received SIGHUP, rescanning"),
            }
            #[cfg(not(unix))]
            tokio::time::sleep(duration).await;
        }
    }

    /// Discovers at most one run and processes it. Stage failures are
    /// reported, never propagated.
    pub async fn iteration(&self, settings: &Settings) -> Outcome {
        let ledger = Ledger::new(settings.ledger_path());
        if let Err(e) = ensure_ledger_dir(&ledger) {
            error!("Cannot create ledger directory: {:#}", e);
        }
        let Some(run) = find_next_run(settings, &ledger) else {
            info!("No new flow cells");
            return Outcome::Idle;
        };
        let run_id = run.run_id.clone();
        let ctx = RunContext::new(settings.clone(), run);

        match self.process(&ctx, &ledger).await {
            Ok(()) => {
                info!("Finished {}", run_id);
                Outcome::Processed(run_id)
            }
            Err(failure) => {
                report_error(settings, self.runner.as_ref(), &run_id, failure.context, &failure.error).await;
                Outcome::Failed(run_id)
            }
        }
    }

    async fn process(&self, ctx: &Arc<RunContext>, ledger: &Ledger) -> Result<(), StageFailure> {
        let started = Instant::now();
        let settings = &ctx.settings;
        let runner = self.runner.as_ref();
        let out_dir = ctx.run.output_dir();

        match free_space_gb(&settings.paths.output_dir) {
            Some(free) if free < settings.options.min_space_gb => {
                return Err(StageFailure {
                    context: "Insufficient free space",
                    error: PipelineError::Precondition(format!(
                        "{} has {:.1} GiB free, {:.1} GiB required",
                        settings.paths.output_dir.display(),
                        free,
                        settings.options.min_space_gb
                    )),
                });
            }
            Some(_) => {}
            None => warn!("Free space on {} is unknown", settings.paths.output_dir.display()),
        }

        demultiplex(ctx, runner, self.check.as_ref())
            .await
            .map_err(at("Demultiplexing failed"))?;
        fix_names(ctx, self.check.as_ref()).map_err(at("Renaming read files failed"))?;

        let processor = PostProcessor::new(Arc::clone(ctx), Arc::clone(&self.runner), Arc::clone(&self.check));
        let summary = processor.run().await.map_err(at("Post-processing failed"))?;

        let metrics = conversion_metrics(&ctx.run.stats_dir());
        let layout = RunLayout::scan(&out_dir).map_err(at("Post-processing failed"))?;

        if settings.options.archive_projects {
            archive_projects(ctx, runner, &layout.projects)
                .await
                .map_err(at("Archiving projects failed"))?;
        }

        if let Err(e) = update_tracking(settings, runner, &ctx.run.run_id).await {
            report_error(settings, runner, &ctx.run.run_id, "Tracking update failed", &e).await;
        }

        let reports: Vec<PathBuf> = layout.projects.iter().map(|p| layout.project_report(p)).collect();
        let body = finished_body(
            &ctx.run.run_id,
            &format_elapsed(started.elapsed()),
            &summary,
            metrics.as_deref(),
            &reports,
        );
        send_finished(settings, runner, &ctx.run.run_id, &layout.projects, &body)
            .await
            .map_err(at("Sending the finished notification failed"))?;

        touch(&Marker::FastqMade.path_in(&out_dir))
            .map_err(|e| StageFailure { context: "Marking the run finished failed", error: e.into() })?;
        let timestamp = now_timestamp();
        for project in &layout.projects {
            ledger
                .add(project, &out_dir, &timestamp)
                .map_err(|e| StageFailure { context: "Updating the ledger failed", error: e.into() })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(3725)), "1:02:05");
        assert_eq!(format_elapsed(Duration::from_secs(59)), "0:00:59");
    }

    #[test]
    fn test_sleep_duration_clamped() {
        assert_eq!(sleep_duration(0.5), Duration::from_secs(1800));
        assert_eq!(sleep_duration(-1.0), Duration::ZERO);
        assert_eq!(sleep_duration(f64::NAN), Duration::ZERO);
        assert_eq!(sleep_duration(1e12), Duration::from_secs(7 * 24 * 3600));
    }
}
