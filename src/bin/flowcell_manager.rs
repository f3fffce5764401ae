use std::io::{self, BufRead, Write};
use std::path::Path;

use anyhow::{anyhow, Result};
use log::info;

use flowcell_pipeline::cli::{init_logger, parse_manager, ManagerCommand};
use flowcell_pipeline::config::settings::Settings;
use flowcell_pipeline::pipelines::archive::archive_flowcell;
use flowcell_pipeline::pipelines::discovery::wipe_flowcell;
use flowcell_pipeline::utils::ledger::{ensure_ledger_dir, format_entries, Ledger, LedgerEntry};

/// Asks for an explicit `yes` on stdin.
fn confirm(prompt: &str) -> Result<bool> {
    print!("{} Type 'yes' to continue: ", prompt);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim() == "yes")
}

fn print_rows(ledger: &Ledger, rows: Result<Vec<LedgerEntry>>) -> Result<()> {
    let rows = rows?;
    if rows.is_empty() {
        println!("No matching rows in {}", ledger.path().display());
    } else {
        print!("{}", format_entries(&rows));
    }
    Ok(())
}

fn archive(ledger: &Ledger, path: &Path, force: bool) -> Result<()> {
    let rows = ledger.list_flowcell(path)?;
    if rows.is_empty() {
        return Err(anyhow!("{} has no unarchived rows", path.display()));
    }
    let projects: Vec<&str> = rows.iter().map(|r| r.project.as_str()).collect();
    let prompt = format!("This deletes {} and their QC directories under {}.", projects.join(", "), path.display());
    if !force && !confirm(&prompt)? {
        println!("Aborted");
        return Ok(());
    }
    let archived = archive_flowcell(ledger, path)?;
    info!("Archived {} projects of {}", archived.len(), path.display());
    Ok(())
}

fn rerun(ledger: &Ledger, path: &Path, force: bool) -> Result<()> {
    let prompt = format!("This deletes {} and all its ledger rows.", path.display());
    if !force && !confirm(&prompt)? {
        println!("Aborted");
        return Ok(());
    }
    wipe_flowcell(ledger, path)?;
    Ok(())
}

fn main() -> Result<()> {
    let args = parse_manager();
    init_logger(args.verbose);

    let settings = Settings::load(&args.config)?;
    let ledger = Ledger::new(settings.ledger_path());
    ensure_ledger_dir(&ledger)?;

    match args.command {
        ManagerCommand::Add { project, path, timestamp } => ledger.add(&project, &path, &timestamp),
        ManagerCommand::List => print_rows(&ledger, ledger.list()),
        ManagerCommand::ListAll => print_rows(&ledger, ledger.list_all()),
        ManagerCommand::ListProject { project } => print_rows(&ledger, ledger.list_project(&project)),
        ManagerCommand::ListFlowcell { path } => print_rows(&ledger, ledger.list_flowcell(&path)),
        ManagerCommand::ListFlowcellAll { path } => print_rows(&ledger, ledger.list_flowcell_all(&path)),
        ManagerCommand::ArchiveFlowcell { path, force } => archive(&ledger, &path, force),
        ManagerCommand::RerunFlowcell { path, force } => rerun(&ledger, &path, force),
    }
}
