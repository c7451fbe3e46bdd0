//! Core logic for a multi-boot firmware manager on SPI-NOR-flash devices:
//! the on-flash application catalog, a first-fit allocator with
//! defragmentation, the firmware-file installer, and the rewriter for the
//! boot ROM's partition table.

pub mod allocator;
pub mod catalog;
pub mod error;
pub mod firmware;
pub mod flash;
pub mod installer;
pub mod manager;
pub mod partition;
pub mod progress;

pub use crate::{
    error::Error,
    manager::{AppSort, AppSummary, BootEnvironment, BootManager},
};

pub mod logging {
    use env_logger::Env;
    use log::LevelFilter;

    pub fn initialize_logger(filter: LevelFilter) {
        env_logger::Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
