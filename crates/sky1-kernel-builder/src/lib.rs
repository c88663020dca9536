pub mod artifacts;
pub mod config;
pub mod control;
pub mod debpkg;
pub mod error;
pub mod executor;
pub mod kconfig;
pub mod kversion;
pub mod log_sanitize;
pub mod patchset;
pub mod planner;
pub mod repo;
pub mod stages;
pub mod tracks;
pub mod variants;
pub mod workspace;

pub use error::{Error, Result};
