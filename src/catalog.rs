//! On-flash application catalog
//!
//! The catalog lives in a dedicated data partition (subtype `0xFE`) directly
//! in front of the flashable region and holds back-to-back fixed-size app
//! records. A slot is populated iff its magic matches; erased slots read as
//! all `0xFF`. The store keeps the whole partition in memory and persists by
//! sorting populated records by flash offset, padding the tail, and rewriting
//! the partition in one erase + write pass.

use log::{debug, info};

use crate::{
    error::Error,
    flash::{align_up, FlashStorage, FLASH_BLOCK_SIZE},
    partition::{
        le_u16, le_u32, put_u16, put_u32, PartitionDescriptor, TableEntry, DESCRIPTOR_SIZE,
        PARTS_MAX,
    },
};

/// Magic of a populated app record.
pub const APP_MAGIC: u16 = 0x1207;

/// Displayed name length (also used for the source filename).
pub const DESCRIPTION_LEN: usize = 40;

pub const TILE_WIDTH: usize = 86;
pub const TILE_HEIGHT: usize = 48;

/// Menu tile, RGB565 row-major.
pub const TILE_PIXELS: usize = TILE_WIDTH * TILE_HEIGHT;

/// Encoded size of one app record.
pub const RECORD_SIZE: usize = 12 + 2 * DESCRIPTION_LEN + 2 * TILE_PIXELS + PARTS_MAX * DESCRIPTOR_SIZE + 4;

const DESCRIPTION_OFFSET: usize = 12;
const FILENAME_OFFSET: usize = 52;
const TILE_OFFSET: usize = 92;
const PARTS_OFFSET: usize = TILE_OFFSET + 2 * TILE_PIXELS;
const PARTS_COUNT_OFFSET: usize = PARTS_OFFSET + PARTS_MAX * DESCRIPTOR_SIZE;
const INSTALL_SEQ_OFFSET: usize = PARTS_COUNT_OFFSET + 2;

/// One installed application.
///
/// Created by the installer, relocated (offsets only) by the defragmenter,
/// destroyed by the erase operations. The flash extent `[start_offset,
/// end_offset]` is inclusive and `end_offset + 1` is always 64 KiB aligned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppRecord {
    pub flags: u16,
    pub start_offset: u32,
    pub end_offset: u32,
    pub description: String,
    pub filename: String,
    pub tile: Vec<u16>,
    pub parts: Vec<PartitionDescriptor>,
    pub install_seq: u16,
}

impl AppRecord {
    /// Size of the flash extent in bytes.
    pub fn size(&self) -> u32 {
        self.end_offset - self.start_offset + 1
    }

    /// Decode one record slot. `None` if the slot is not populated.
    fn decode(buf: &[u8]) -> Option<Self> {
        if le_u16(buf, 0) != APP_MAGIC {
            return None;
        }
        let parts_count = buf[PARTS_COUNT_OFFSET] as usize;
        if parts_count > PARTS_MAX {
            return None;
        }

        let tile = buf[TILE_OFFSET..TILE_OFFSET + 2 * TILE_PIXELS]
            .chunks_exact(2)
            .map(|px| u16::from_le_bytes([px[0], px[1]]))
            .collect();
        let parts = (0..parts_count)
            .map(|i| PartitionDescriptor::decode(&buf[PARTS_OFFSET + i * DESCRIPTOR_SIZE..]))
            .collect();

        Some(AppRecord {
            flags: le_u16(buf, 2),
            start_offset: le_u32(buf, 4),
            end_offset: le_u32(buf, 8),
            description: decode_padded_str(&buf[DESCRIPTION_OFFSET..][..DESCRIPTION_LEN]),
            filename: decode_padded_str(&buf[FILENAME_OFFSET..][..DESCRIPTION_LEN]),
            tile,
            parts,
            install_seq: le_u16(buf, INSTALL_SEQ_OFFSET),
        })
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[..RECORD_SIZE].fill(0);
        put_u16(buf, 0, APP_MAGIC);
        put_u16(buf, 2, self.flags);
        put_u32(buf, 4, self.start_offset);
        put_u32(buf, 8, self.end_offset);
        encode_padded_str(
            &mut buf[DESCRIPTION_OFFSET..][..DESCRIPTION_LEN],
            &self.description,
        );
        encode_padded_str(&mut buf[FILENAME_OFFSET..][..DESCRIPTION_LEN], &self.filename);
        for (i, px) in self.tile.iter().take(TILE_PIXELS).enumerate() {
            put_u16(buf, TILE_OFFSET + 2 * i, *px);
        }
        let parts_count = self.parts.len().min(PARTS_MAX);
        for (i, part) in self.parts.iter().take(parts_count).enumerate() {
            part.encode(&mut buf[PARTS_OFFSET + i * DESCRIPTOR_SIZE..]);
        }
        // Unused descriptor slots keep the erased-flash pattern
        buf[PARTS_OFFSET + parts_count * DESCRIPTOR_SIZE..PARTS_COUNT_OFFSET].fill(0xFF);
        buf[PARTS_COUNT_OFFSET] = parts_count as u8;
        put_u16(buf, INSTALL_SEQ_OFFSET, self.install_seq);
    }
}

/// The in-memory view of the catalog partition.
#[derive(Debug)]
pub struct Catalog {
    partition_offset: u32,
    partition_size: u32,
    apps_max: usize,
    start_flash_address: u32,
    next_install_seq: u16,
    apps: Vec<AppRecord>,
}

impl Catalog {
    /// Read the catalog partition and collect the populated prefix.
    pub fn load<F: FlashStorage>(flash: &mut F, catalog_part: &TableEntry) -> Result<Self, Error> {
        let mut blob = vec![0u8; catalog_part.size as usize];
        flash.read(catalog_part.offset, &mut blob)?;

        let apps_max = blob.len() / RECORD_SIZE;
        let mut apps = Vec::new();
        for slot in blob.chunks_exact(RECORD_SIZE).take(apps_max) {
            // Persist keeps populated slots in a contiguous prefix, so the
            // first unpopulated slot ends the scan.
            match AppRecord::decode(slot) {
                Some(record) => apps.push(record),
                None => break,
            }
        }

        let next_install_seq = apps
            .iter()
            .map(|a| a.install_seq)
            .max()
            .map_or(0, |seq| seq.saturating_add(1));
        let start_flash_address = align_up(
            catalog_part.offset + catalog_part.size,
            FLASH_BLOCK_SIZE as u32,
        );

        info!(
            "app catalog: {} of {apps_max} slots used, apps start at {start_flash_address:#x}",
            apps.len()
        );

        Ok(Catalog {
            partition_offset: catalog_part.offset,
            partition_size: catalog_part.size,
            apps_max,
            start_flash_address,
            next_install_seq,
            apps,
        })
    }

    /// Rewrite the whole catalog partition from the in-memory records.
    pub(crate) fn persist<F: FlashStorage>(&mut self, flash: &mut F) -> Result<(), Error> {
        self.sort_by_offset();

        let mut blob = vec![0xFF; self.partition_size as usize];
        for (record, slot) in self.apps.iter().zip(blob.chunks_exact_mut(RECORD_SIZE)) {
            record.encode(slot);
        }

        flash.erase(self.partition_offset, self.partition_size)?;
        flash.write(self.partition_offset, &blob)?;
        debug!("catalog persisted: {} records", self.apps.len());
        Ok(())
    }

    /// Append a freshly installed record and persist.
    pub fn add<F: FlashStorage>(&mut self, flash: &mut F, record: AppRecord) -> Result<(), Error> {
        if self.apps.len() >= self.apps_max {
            return Err(Error::CatalogFull { max: self.apps_max });
        }
        self.next_install_seq = self
            .next_install_seq
            .max(record.install_seq.saturating_add(1));
        self.apps.push(record);
        self.persist(flash)
    }

    /// Remove the record at `index` and persist. The app's flash contents are
    /// left in place and become free space.
    pub fn remove<F: FlashStorage>(
        &mut self,
        flash: &mut F,
        index: usize,
    ) -> Result<AppRecord, Error> {
        if index >= self.apps.len() {
            return Err(Error::AppIndexOutOfRange {
                index,
                count: self.apps.len(),
            });
        }
        let record = self.apps.remove(index);
        self.persist(flash)?;
        Ok(record)
    }

    /// Drop every record and persist an all-erased partition.
    pub fn clear<F: FlashStorage>(&mut self, flash: &mut F) -> Result<(), Error> {
        self.apps.clear();
        self.next_install_seq = 0;
        self.persist(flash)
    }

    pub fn apps(&self) -> &[AppRecord] {
        &self.apps
    }

    pub fn apps_max(&self) -> usize {
        self.apps_max
    }

    pub fn is_full(&self) -> bool {
        self.apps.len() >= self.apps_max
    }

    /// Install counter the next installed app will receive.
    pub fn next_install_seq(&self) -> u16 {
        self.next_install_seq
    }

    /// First flash byte available to applications.
    pub fn start_flash_address(&self) -> u32 {
        self.start_flash_address
    }

    pub(crate) fn sort_by_offset(&mut self) {
        self.apps.sort_by_key(|a| a.start_offset);
    }

    pub(crate) fn apps_mut(&mut self) -> &mut [AppRecord] {
        &mut self.apps
    }
}

fn decode_padded_str(buf: &[u8]) -> String {
    let len = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

fn encode_padded_str(buf: &mut [u8], s: &str) {
    // Leave room for the terminating NUL
    let max_len = buf.len() - 1;
    for (dst, src) in buf.iter_mut().zip(s.bytes().take(max_len)) {
        *dst = src;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::mem::MemFlash;
    use crate::partition::{Type, SUBTYPE_CATALOG};

    const CATALOG_OFFSET: u32 = 0x90000;
    const CATALOG_SIZE: u32 = 0x10000;

    fn catalog_entry() -> TableEntry {
        TableEntry {
            ty: Type::Data as u8,
            subtype: SUBTYPE_CATALOG,
            offset: CATALOG_OFFSET,
            size: CATALOG_SIZE,
            label: [0; 16],
            flags: 0,
        }
    }

    fn record(start: u32, size: u32, seq: u16, description: &str) -> AppRecord {
        AppRecord {
            flags: 0,
            start_offset: start,
            end_offset: start + size - 1,
            description: description.into(),
            filename: "/test.fw".into(),
            tile: vec![0x07E0; TILE_PIXELS],
            parts: vec![PartitionDescriptor {
                ty: 0,
                subtype: 0x10,
                label: [0; 16],
                flags: 0,
                length: size,
            }],
            install_seq: seq,
        }
    }

    fn fresh() -> (MemFlash, Catalog) {
        let mut flash = MemFlash::new(0x100000);
        let catalog = Catalog::load(&mut flash, &catalog_entry()).unwrap();
        (flash, catalog)
    }

    #[test]
    fn record_encoding_round_trips() {
        let original = record(0x110000, 0x200000, 7, "HelloApp");
        let mut buf = vec![0u8; RECORD_SIZE];
        original.encode(&mut buf);
        let decoded = AppRecord::decode(&buf).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn erased_slot_is_not_populated() {
        assert!(AppRecord::decode(&vec![0xFF; RECORD_SIZE]).is_none());
    }

    #[test]
    fn record_size_matches_the_on_flash_layout() {
        assert_eq!(RECORD_SIZE, 8912);
        assert_eq!(INSTALL_SEQ_OFFSET, 8910);
    }

    #[test]
    fn empty_catalog_loads_with_zero_sequence() {
        let (_, catalog) = fresh();
        assert!(catalog.apps().is_empty());
        assert_eq!(catalog.next_install_seq(), 0);
        assert_eq!(catalog.apps_max(), CATALOG_SIZE as usize / RECORD_SIZE);
        assert_eq!(catalog.start_flash_address(), 0xA0000);
    }

    #[test]
    fn persist_sorts_by_offset_and_reload_matches() {
        let (mut flash, mut catalog) = fresh();
        catalog
            .add(&mut flash, record(0x310000, 0x100000, 1, "second"))
            .unwrap();
        catalog
            .add(&mut flash, record(0x110000, 0x200000, 0, "first"))
            .unwrap();

        let reloaded = Catalog::load(&mut flash, &catalog_entry()).unwrap();
        assert_eq!(reloaded.apps().len(), 2);
        assert_eq!(reloaded.apps()[0].description, "first");
        assert_eq!(reloaded.apps()[1].description, "second");
        assert_eq!(reloaded.next_install_seq(), 2);

        // Slots after the populated prefix stay erased
        let tail_start = (CATALOG_OFFSET as usize) + 2 * RECORD_SIZE;
        let tail_end = (CATALOG_OFFSET + CATALOG_SIZE) as usize;
        assert!(flash.data()[tail_start..tail_end].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn remove_keeps_the_remaining_records() {
        let (mut flash, mut catalog) = fresh();
        catalog
            .add(&mut flash, record(0x110000, 0x100000, 0, "a"))
            .unwrap();
        catalog
            .add(&mut flash, record(0x210000, 0x100000, 1, "b"))
            .unwrap();
        catalog
            .add(&mut flash, record(0x310000, 0x100000, 2, "c"))
            .unwrap();

        // Last index: the shift must not run past the populated prefix
        let removed = catalog.remove(&mut flash, 2).unwrap();
        assert_eq!(removed.description, "c");

        let reloaded = Catalog::load(&mut flash, &catalog_entry()).unwrap();
        assert_eq!(reloaded.apps().len(), 2);
        assert_eq!(reloaded.apps()[0].description, "a");
        assert_eq!(reloaded.apps()[1].description, "b");

        assert!(matches!(
            catalog.remove(&mut flash, 5),
            Err(Error::AppIndexOutOfRange { .. })
        ));
    }

    #[test]
    fn clear_resets_the_sequence_counter() {
        let (mut flash, mut catalog) = fresh();
        catalog
            .add(&mut flash, record(0x110000, 0x100000, 4, "a"))
            .unwrap();
        catalog.clear(&mut flash).unwrap();

        let reloaded = Catalog::load(&mut flash, &catalog_entry()).unwrap();
        assert!(reloaded.apps().is_empty());
        assert_eq!(reloaded.next_install_seq(), 0);
    }

    #[test]
    fn add_fails_once_every_slot_is_used() {
        let (mut flash, mut catalog) = fresh();
        let max = catalog.apps_max();
        for i in 0..max {
            let start = 0xA0000 + (i as u32) * 0x10000;
            catalog
                .add(&mut flash, record(start, 0x10000, i as u16, "app"))
                .unwrap();
        }
        let overflow = record(0xA0000 + (max as u32) * 0x10000, 0x10000, 99, "late");
        assert!(matches!(
            catalog.add(&mut flash, overflow),
            Err(Error::CatalogFull { .. })
        ));
    }

    #[test]
    fn all_zero_tile_survives_a_round_trip() {
        let (mut flash, mut catalog) = fresh();
        let mut app = record(0x110000, 0x100000, 0, "dark");
        app.tile = vec![0; TILE_PIXELS];
        catalog.add(&mut flash, app).unwrap();

        let reloaded = Catalog::load(&mut flash, &catalog_entry()).unwrap();
        assert_eq!(reloaded.apps()[0].tile, vec![0; TILE_PIXELS]);
    }
}
