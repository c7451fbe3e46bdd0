//! Library-wide error types

use std::io;

use miette::Diagnostic;
use thiserror::Error;

use crate::partition::PARTS_MAX;

/// All possible errors returned by multifw
#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("Firmware file is not valid: {0}")]
    #[diagnostic(code(multifw::invalid_firmware))]
    InvalidFirmware(&'static str),

    #[error("Firmware checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    #[diagnostic(code(multifw::checksum_mismatch))]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[error("Firmware file declares more than {} partitions", PARTS_MAX)]
    #[diagnostic(code(multifw::too_many_partitions))]
    TooManyPartitions,

    /// Produced by the SD file chooser, not by this crate: the firmware
    /// directory held no `.fw` files to offer.
    #[error("No firmware files found on the SD card")]
    #[diagnostic(
        code(multifw::no_files_on_sd),
        help("Firmware files must have the `.fw` extension")
    )]
    NoFilesOnSd,

    #[error("Not enough free flash space: requested {requested:#x} bytes, {available:#x} free")]
    #[diagnostic(
        code(multifw::not_enough_space),
        help("Erase one of the installed applications to make room")
    )]
    NotEnoughSpace { requested: u32, available: u32 },

    #[error("The application catalog is full ({max} entries)")]
    #[diagnostic(code(multifw::catalog_full))]
    CatalogFull { max: usize },

    #[error("Application index {index} is out of range ({count} installed)")]
    #[diagnostic(code(multifw::app_index_out_of_range))]
    AppIndexOutOfRange { index: usize, count: usize },

    #[error("Flash read at {offset:#x} failed")]
    #[diagnostic(code(multifw::flash_read))]
    FlashRead { offset: u32 },

    #[error("Flash erase at {offset:#x} failed")]
    #[diagnostic(code(multifw::flash_erase))]
    FlashErase { offset: u32 },

    #[error("Flash write at {offset:#x} failed")]
    #[diagnostic(code(multifw::flash_write))]
    FlashWrite { offset: u32 },

    #[error("Reading the firmware file failed")]
    #[diagnostic(code(multifw::sd_read))]
    SdRead(#[source] io::Error),

    #[error("Seeking within the firmware file failed")]
    #[diagnostic(code(multifw::seek))]
    Seek(#[source] io::Error),

    #[error("The partition table contains no catalog data partition")]
    #[diagnostic(
        code(multifw::no_catalog_partition),
        help("The factory partition table must contain a data partition with subtype 0xFE")
    )]
    NoCatalogPartition,

    #[error("The selected application contains no OTA boot partition")]
    #[diagnostic(code(multifw::no_boot_partition))]
    NoBootPartition,

    #[error("The partition table contains no NVS data partition")]
    #[diagnostic(code(multifw::no_nvs_partition))]
    NoNvsPartition,
}

impl Error {
    /// Whether the chooser can recover by returning to the menu.
    ///
    /// Input and resource errors leave flash untouched (or at worst leave an
    /// unreferenced region that will be reclaimed as free space); media and
    /// configuration errors are fatal and the device halts.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::InvalidFirmware(_)
                | Error::ChecksumMismatch { .. }
                | Error::TooManyPartitions
                | Error::NoFilesOnSd
                | Error::NotEnoughSpace { .. }
                | Error::CatalogFull { .. }
                | Error::AppIndexOutOfRange { .. }
        )
    }

    /// One-line banner for the on-device display.
    pub fn banner(&self) -> &'static str {
        match self {
            Error::InvalidFirmware(_) => "INVALID FIRMWARE FILE",
            Error::ChecksumMismatch { .. } => "CHECKSUM MISMATCH ERROR",
            Error::TooManyPartitions => "INVALID FIRMWARE FILE",
            Error::NoFilesOnSd => "NO FILES ERROR",
            Error::NotEnoughSpace { .. } => "NOT ENOUGH FREE SPACE",
            Error::CatalogFull { .. } => "APP TABLE FULL",
            Error::AppIndexOutOfRange { .. } => "INVALID SELECTION",
            Error::FlashRead { .. } => "READ ERROR",
            Error::FlashErase { .. } => "ERASE ERROR",
            Error::FlashWrite { .. } => "WRITE ERROR",
            Error::SdRead(_) => "SD CARD ERROR",
            Error::Seek(_) => "SEEK ERROR",
            Error::NoCatalogPartition => "NO FACTORY PARTITION ERROR",
            Error::NoBootPartition => "NO BOOT PART ERROR",
            Error::NoNvsPartition => "NO NVM PARTITION ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_errors_are_recoverable() {
        assert!(Error::InvalidFirmware("bad header").is_recoverable());
        assert!(Error::ChecksumMismatch {
            expected: 1,
            computed: 2
        }
        .is_recoverable());
        assert!(Error::NotEnoughSpace {
            requested: 0x10000,
            available: 0
        }
        .is_recoverable());
    }

    #[test]
    fn media_and_configuration_errors_are_fatal() {
        assert!(!Error::FlashWrite { offset: 0x110000 }.is_recoverable());
        assert!(!Error::NoCatalogPartition.is_recoverable());
        assert!(!Error::NoBootPartition.is_recoverable());
    }

    #[test]
    fn banners_match_the_display_strings() {
        let err = Error::ChecksumMismatch {
            expected: 0xDEAD_BEEF,
            computed: 0,
        };
        assert_eq!(err.banner(), "CHECKSUM MISMATCH ERROR");
        assert_eq!(
            Error::NotEnoughSpace {
                requested: 1,
                available: 0
            }
            .banner(),
            "NOT ENOUGH FREE SPACE"
        );
    }
}
