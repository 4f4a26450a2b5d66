//! Process-level plumbing shared by the binaries: command line and
//! environment configuration, and terminal logging.

pub mod config;
pub mod logging;
