//! Firmware installation
//!
//! The install pipeline: parse the file, verify its checksum, let the user
//! confirm, allocate a flash extent (defragmenting if needed), then per
//! partition erase and stream the payload in, and finally commit the new
//! record to the catalog. Nothing is persisted before the commit, so any
//! failure up to that point leaves the catalog as it was; a partially
//! written extent is unreferenced and simply becomes free space again.

use std::io::{Read, Seek, SeekFrom};

use log::{info, warn};

use crate::{
    allocator,
    catalog::{AppRecord, Catalog},
    error::Error,
    firmware::FirmwareInfo,
    flash::{align_up, FlashStorage, ERASE_BLOCK_SIZE, FLASH_BLOCK_SIZE},
    progress::FlashProgress,
};

/// Observable checkpoints of an install, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStage {
    /// The file enumerated cleanly.
    Parsed,
    /// The trailer checksum matched.
    Verified,
    /// A flash extent was reserved at this offset.
    Allocated { offset: u32 },
    /// Erasing the flash range of one partition.
    Erasing { part: usize },
    /// Streaming one partition's payload to flash.
    Writing { part: usize },
    /// One partition fully written.
    PartDone { part: usize },
    /// All partitions written.
    AllPartsDone,
    /// The new record is persisted in the catalog.
    CatalogCommitted,
    /// The partition table points at the new app; boot is imminent.
    BootReady,
}

/// How an install attempt ended (when it did not fail).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The app is installed and catalogued.
    Installed { start_offset: u32 },
    /// The user declined at the confirmation prompt; nothing was written.
    Cancelled,
}

/// Decision points and checkpoints surfaced to the UI layer.
pub trait InstallHooks {
    /// Called at each checkpoint of the pipeline.
    fn stage(&mut self, _stage: InstallStage) {}

    /// Ask the user whether to flash this firmware. Returning `false` aborts
    /// with no side effects.
    fn confirm_install(&mut self, _fw: &FirmwareInfo) -> bool {
        true
    }

    /// Ask the user whether to boot the freshly installed app right away.
    fn confirm_boot(&mut self) -> bool {
        false
    }
}

/// Hooks for headless operation: install without prompting, do not boot.
pub struct Unattended;

impl InstallHooks for Unattended {}

pub(crate) fn install<F, R, H>(
    catalog: &mut Catalog,
    flash: &mut F,
    reader: &mut R,
    filename: &str,
    scratch: &mut [u8],
    hooks: &mut H,
    progress: &mut dyn FlashProgress,
) -> Result<InstallOutcome, Error>
where
    F: FlashStorage,
    R: Read + Seek,
    H: InstallHooks + ?Sized,
{
    let fw = FirmwareInfo::parse(reader)?;
    hooks.stage(InstallStage::Parsed);

    fw.verify_checksum(reader, scratch)?;
    hooks.stage(InstallStage::Verified);

    if !hooks.confirm_install(&fw) {
        info!("install of '{}' cancelled", fw.description);
        return Ok(InstallOutcome::Cancelled);
    }

    if catalog.is_full() {
        warn!("catalog is full, refusing to install '{}'", fw.description);
        return Err(Error::CatalogFull {
            max: catalog.apps_max(),
        });
    }

    let start_offset = allocator::find_free_block(catalog, flash, fw.flash_size, scratch, progress)?;
    hooks.stage(InstallStage::Allocated {
        offset: start_offset,
    });
    info!(
        "installing '{}' ({} KiB) at {start_offset:#x}",
        fw.description,
        fw.flash_size / 1024
    );

    let mut app = AppRecord {
        flags: 0,
        start_offset,
        end_offset: 0,
        description: fw.description.clone(),
        filename: filename.into(),
        tile: fw.tile.clone(),
        parts: Vec::with_capacity(fw.parts.len()),
        install_seq: catalog.next_install_seq(),
    };

    let mut current = start_offset;
    for (index, part) in fw.parts.iter().enumerate() {
        hooks.stage(InstallStage::Erasing { part: index });
        let erase_len = align_up(part.descriptor.length, ERASE_BLOCK_SIZE as u32);
        flash.erase(current, erase_len)?;

        hooks.stage(InstallStage::Writing { part: index });
        progress.begin(current, part.data_length as usize);
        reader
            .seek(SeekFrom::Start(part.data_offset))
            .map_err(Error::Seek)?;

        let mut written = 0u32;
        while written < part.data_length {
            let chunk = (part.data_length - written).min(FLASH_BLOCK_SIZE as u32) as usize;
            let chunk = chunk.min(scratch.len());
            reader
                .read_exact(&mut scratch[..chunk])
                .map_err(Error::SdRead)?;
            flash.write(current + written, &scratch[..chunk])?;
            written += chunk as u32;
            progress.advance(written as usize);
        }
        progress.complete();

        app.parts.push(part.descriptor.clone());
        current += part.descriptor.length;
        hooks.stage(InstallStage::PartDone { part: index });
    }
    hooks.stage(InstallStage::AllPartsDone);

    app.end_offset = align_up(current, FLASH_BLOCK_SIZE as u32) - 1;
    catalog.add(flash, app)?;
    hooks.stage(InstallStage::CatalogCommitted);
    info!("'{}' installed at {start_offset:#x}", fw.description);

    Ok(InstallOutcome::Installed { start_offset })
}
