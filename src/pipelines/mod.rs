pub mod archive;
pub mod daemon;
pub mod demux;
pub mod discovery;
pub mod post_process;
