pub mod command;
pub mod file;
pub mod ledger;
pub mod markers;
pub mod pool;
pub mod report;
pub mod samplesheet;
pub mod sequence;
pub mod stats;
pub mod system;
