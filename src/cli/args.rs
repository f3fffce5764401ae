use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Flow cell processing daemon.
#[derive(Parser, Debug, Clone)]
#[command(name = "flowcell-pipeline", version, about)]
pub struct Arguments {
    #[arg(short = 'c', long = "config", default_value = "/etc/flowcell-pipeline.toml", help = "Facility configuration file (TOML), re-read on every iteration")]
    pub config: PathBuf,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(long, action, help = "Run a single discovery/processing iteration and exit")]
    pub once: bool,
}

/// Inspect and edit the processed flow cell ledger.
#[derive(Parser, Debug, Clone)]
#[command(name = "flowcell-manager", version, about)]
pub struct ManagerArguments {
    #[arg(short = 'c', long = "config", default_value = "/etc/flowcell-pipeline.toml")]
    pub config: PathBuf,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: ManagerCommand,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ManagerCommand {
    /// Record a finished project.
    Add {
        project: String,
        path: PathBuf,
        timestamp: String,
    },
    /// Flow cells that are not archived yet.
    List,
    ListAll,
    ListProject {
        project: String,
    },
    /// Unarchived rows for one flow cell.
    ListFlowcell {
        path: PathBuf,
    },
    ListFlowcellAll {
        path: PathBuf,
    },
    /// Delete the decompressed projects of a flow cell and mark it archived.
    ArchiveFlowcell {
        path: PathBuf,
        #[arg(long, action)]
        force: bool,
    },
    /// Delete a flow cell's output and ledger rows so it is processed again.
    RerunFlowcell {
        path: PathBuf,
        #[arg(long, action)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_daemon_args() {
        let args = Arguments::parse_from(["flowcell-pipeline", "-c", "/tmp/p.toml", "--once"]);
        assert_eq!(args.config, PathBuf::from("/tmp/p.toml"));
        assert!(args.once);
        assert!(!args.verbose);
    }

    #[test]
    fn test_parse_manager_subcommands() {
        let args = ManagerArguments::parse_from(["flowcell-manager", "archive-flowcell", "/out/RUN1", "--force"]);
        assert_eq!(
            args.command,
            ManagerCommand::ArchiveFlowcell { path: PathBuf::from("/out/RUN1"), force: true }
        );
        let args = ManagerArguments::parse_from(["flowcell-manager", "add", "GCF-0001", "/out/RUN1", "2024-01-01 00:00:00"]);
        assert!(matches!(args.command, ManagerCommand::Add { .. }));
        assert!(ManagerArguments::try_parse_from(["flowcell-manager", "list-project"]).is_err());
    }
}
