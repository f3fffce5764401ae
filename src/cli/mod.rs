pub mod args;

use std::io::Write;

use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;

pub use args::{Arguments, ManagerArguments, ManagerCommand};

pub fn parse() -> Arguments {
    Arguments::parse()
}

pub fn parse_manager() -> ManagerArguments {
    ManagerArguments::parse()
}

/// `[YYYY-mm-dd HH:MM:SS] LEVEL: message` on stderr.
pub fn init_logger(verbose: bool) {
    let log_level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();
}
