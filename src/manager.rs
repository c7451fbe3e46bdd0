//! The boot-manager context
//!
//! [`BootManager`] owns everything the chooser UI talks to: the flash
//! backend, the boot environment, the partition-table blob, the app catalog,
//! and the single 64 KiB scratch buffer shared by installs, verification,
//! and defragmentation. All state lives here; there are no process-wide
//! singletons.

use std::{
    fs::File,
    io::{Read, Seek},
    path::Path,
};

use log::{debug, info};

use crate::{
    allocator,
    catalog::Catalog,
    error::Error,
    flash::{FlashStorage, FLASH_BLOCK_SIZE},
    installer::{self, InstallHooks, InstallOutcome, InstallStage},
    partition::{PartitionTable, Type, SUBTYPE_NVS},
    progress::FlashProgress,
};

/// Services of the OTA-capable boot ROM.
///
/// On the device these wrap the SDK's partition-reload, OTA-data and reset
/// primitives; on the host they are mocked.
pub trait BootEnvironment {
    /// Ask the boot ROM to re-read the partition table from flash.
    fn reload_partition_table(&mut self) -> Result<(), Error>;

    /// Point the OTA boot selector at the application partition located at
    /// `offset`/`size`.
    fn set_boot_partition(&mut self, offset: u32, size: u32) -> Result<(), Error>;

    /// Hardware reset. On real hardware this does not return.
    fn restart(&mut self) -> Result<(), Error>;
}

/// Display ordering of the app list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppSort {
    /// Ascending flash offset (the on-flash order).
    Offset,
    /// Ascending install counter ("recently installed" view).
    Sequence,
}

/// What the chooser needs to render one app row.
#[derive(Debug, Clone)]
pub struct AppSummary {
    pub index: usize,
    pub description: String,
    pub filename: String,
    pub start_offset: u32,
    pub end_offset: u32,
    pub size: u32,
    pub install_seq: u16,
    pub tile: Vec<u16>,
}

#[derive(Debug)]
pub struct BootManager<F: FlashStorage, B: BootEnvironment> {
    flash: F,
    boot: B,
    table_offset: u32,
    table: PartitionTable,
    catalog: Catalog,
    scratch: Vec<u8>,
}

impl<F: FlashStorage, B: BootEnvironment> BootManager<F, B> {
    /// Load the partition table and the app catalog from flash.
    pub fn new(mut flash: F, boot: B, table_offset: u32) -> Result<Self, Error> {
        let table = PartitionTable::load(&mut flash, table_offset)?;
        let (_, catalog_part) = table.catalog_partition()?;
        let catalog = Catalog::load(&mut flash, &catalog_part)?;

        Ok(BootManager {
            flash,
            boot,
            table_offset,
            table,
            catalog,
            scratch: vec![0u8; FLASH_BLOCK_SIZE],
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn boot_env(&self) -> &B {
        &self.boot
    }

    /// Total free bytes and the number of free extents.
    pub fn free_space(&self) -> (u32, usize) {
        allocator::free_space(&self.catalog, self.flash.size())
    }

    /// The app list in the requested display order.
    pub fn app_summaries(&self, sort: AppSort) -> Vec<AppSummary> {
        let mut summaries: Vec<AppSummary> = self
            .catalog
            .apps()
            .iter()
            .enumerate()
            .map(|(index, app)| AppSummary {
                index,
                description: app.description.clone(),
                filename: app.filename.clone(),
                start_offset: app.start_offset,
                end_offset: app.end_offset,
                size: app.size(),
                install_seq: app.install_seq,
                tile: app.tile.clone(),
            })
            .collect();
        match sort {
            AppSort::Offset => summaries.sort_by_key(|s| s.start_offset),
            AppSort::Sequence => summaries.sort_by_key(|s| s.install_seq),
        }
        summaries
    }

    /// Install a firmware file from an open reader.
    ///
    /// `filename` is the source file's basename (with leading `/`), recorded
    /// in the catalog for display. If the hooks confirm booting, control
    /// passes to [`boot_app`](Self::boot_app) and, on hardware, does not
    /// come back.
    pub fn install<R: Read + Seek>(
        &mut self,
        reader: &mut R,
        filename: &str,
        hooks: &mut dyn InstallHooks,
        progress: &mut dyn FlashProgress,
    ) -> Result<InstallOutcome, Error> {
        let outcome = installer::install(
            &mut self.catalog,
            &mut self.flash,
            reader,
            filename,
            &mut self.scratch,
            hooks,
            progress,
        )?;

        if let InstallOutcome::Installed { start_offset } = outcome {
            if hooks.confirm_boot() {
                let index = self
                    .catalog
                    .apps()
                    .iter()
                    .position(|a| a.start_offset == start_offset)
                    .expect("freshly installed app is in the catalog");
                hooks.stage(InstallStage::BootReady);
                self.boot_app(index)?;
            }
        }
        Ok(outcome)
    }

    /// Install a firmware file from the SD card by path.
    pub fn install_file(
        &mut self,
        path: &Path,
        hooks: &mut dyn InstallHooks,
        progress: &mut dyn FlashProgress,
    ) -> Result<InstallOutcome, Error> {
        let filename = match path.file_name() {
            Some(name) => format!("/{}", name.to_string_lossy()),
            None => return Err(Error::InvalidFirmware("path has no file name")),
        };
        let mut file = File::open(path).map_err(Error::SdRead)?;
        self.install(&mut file, &filename, hooks, progress)
    }

    /// Activate an installed app and reboot into it.
    ///
    /// Rebuilds the partition-table tail from the app's partition list based
    /// at its flash extent, points the OTA selector at the app's OTA_0
    /// partition, and restarts.
    pub fn boot_app(&mut self, index: usize) -> Result<(), Error> {
        // The factory prefix is located from a fresh read; the cached blob
        // may predate an earlier rewrite.
        self.table = PartitionTable::load(&mut self.flash, self.table_offset)?;
        let (catalog_index, _) = self.table.catalog_partition()?;
        let start_entry = catalog_index + 1;

        if index >= self.catalog.apps().len() {
            return Err(Error::AppIndexOutOfRange {
                index,
                count: self.catalog.apps().len(),
            });
        }
        let app = &self.catalog.apps()[index];
        info!(
            "activating '{}' at {:#x}",
            app.description, app.start_offset
        );

        self.table
            .rewrite(&mut self.flash, start_entry, &app.parts, app.start_offset)?;
        self.boot.reload_partition_table()?;

        let mut offset = app.start_offset;
        let mut boot_slot = None;
        for part in &app.parts {
            if part.is_ota0() {
                boot_slot = Some((offset, part.length));
                break;
            }
            offset += part.length;
        }
        let (boot_offset, boot_size) = boot_slot.ok_or(Error::NoBootPartition)?;

        self.boot.set_boot_partition(boot_offset, boot_size)?;
        info!("boot partition set to {boot_offset:#x}, restarting");
        self.boot.restart()
    }

    /// Remove one app from the catalog. Its flash contents are left behind
    /// and the extent becomes free space.
    pub fn erase_app(&mut self, index: usize) -> Result<(), Error> {
        let removed = self.catalog.remove(&mut self.flash, index)?;
        info!(
            "erased '{}' ({:#x}..{:#x})",
            removed.description, removed.start_offset, removed.end_offset
        );
        Ok(())
    }

    /// Wipe the whole catalog. App flash contents are untouched; every
    /// extent is reclaimed as free space.
    pub fn erase_all(&mut self) -> Result<(), Error> {
        info!("erasing the app catalog");
        self.catalog.clear(&mut self.flash)
    }

    /// Erase the NVS key-value data partition.
    pub fn erase_nvm(&mut self) -> Result<(), Error> {
        let (_, nvs) = self
            .table
            .find(Type::Data, SUBTYPE_NVS)
            .ok_or(Error::NoNvsPartition)?;
        debug!("erasing NVS partition at {:#x} ({:#x} bytes)", nvs.offset, nvs.size);
        self.flash.erase(nvs.offset, nvs.size)
    }

    /// Reboot without changing the active app.
    pub fn restart(&mut self) -> Result<(), Error> {
        self.boot.restart()
    }
}
