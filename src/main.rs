use std::sync::Arc;

use anyhow::Result;
use log::{debug, error, info};

use flowcell_pipeline::cli::{init_logger, parse};
use flowcell_pipeline::pipelines::daemon::Daemon;
use flowcell_pipeline::utils::command::ProcessRunner;
use flowcell_pipeline::utils::markers::OnDisk;
use flowcell_pipeline::utils::system::physical_cores;

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse();
    init_logger(args.verbose);

    println!("\n-------------\n Flowcell pipeline\n-------------\n");
    info!("Using configuration {}", args.config.display());
    debug!("Detected {} physical cores", physical_cores());

    let daemon = Daemon::new(args.config.clone(), Arc::new(ProcessRunner), Arc::new(OnDisk));
    if let Err(e) = daemon.run(args.once).await {
        error!("Fatal: {:#}", e);
        return Err(e);
    }
    Ok(())
}
