//! Boot-ROM partition-table codec
//!
//! The boot ROM keeps its partition directory as a fixed-length blob at a
//! board-defined flash offset: an array of 32-byte entries terminated by an
//! entry whose magic is `0xFFFF`. The factory prefix of the table (up to and
//! including the catalog data partition) is immutable; the tail is rewritten
//! every time a different application is activated. Persistence never relies
//! on native struct layout, every field is encoded at an explicit offset.

use log::{debug, warn};
use strum::FromRepr;

use crate::{
    error::Error,
    flash::{ERASE_BLOCK_SIZE, FlashStorage},
};

/// Maximum length of the partition-table blob.
pub const TABLE_MAX_LEN: usize = 0xC00;

/// Size of one boot-ROM table entry.
pub const TABLE_ENTRY_SIZE: usize = 32;

/// Maximum number of entries, including the terminator.
pub const TABLE_MAX_ENTRIES: usize = TABLE_MAX_LEN / TABLE_ENTRY_SIZE;

/// Magic of a populated boot-ROM table entry.
pub const TABLE_ENTRY_MAGIC: u16 = 0x50AA;

/// Maximum number of partitions per application.
pub const PARTS_MAX: usize = 20;

/// Subtype of the data partition holding the application catalog.
pub const SUBTYPE_CATALOG: u8 = 0xFE;

/// Subtype of the OTA_0 application slot.
pub const SUBTYPE_OTA_0: u8 = 0x10;

/// Subtype of the NVS key-value data partition.
pub const SUBTYPE_NVS: u8 = 0x02;

// The table must fit in the single erase block rewritten on activation.
const _: () = assert!(TABLE_MAX_LEN <= ERASE_BLOCK_SIZE);

/// Partition type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum Type {
    App = 0x00,
    Data = 0x01,
}

/// One entry of the boot-ROM partition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub ty: u8,
    pub subtype: u8,
    pub offset: u32,
    pub size: u32,
    pub label: [u8; 16],
    pub flags: u32,
}

impl TableEntry {
    /// Decode one 32-byte slot. `None` marks the `0xFFFF` terminator.
    fn decode(buf: &[u8]) -> Option<Result<Self, u16>> {
        let magic = le_u16(buf, 0);
        if magic == 0xFFFF {
            return None;
        }
        if magic != TABLE_ENTRY_MAGIC {
            return Some(Err(magic));
        }
        let mut label = [0u8; 16];
        label.copy_from_slice(&buf[12..28]);
        Some(Ok(TableEntry {
            ty: buf[2],
            subtype: buf[3],
            offset: le_u32(buf, 4),
            size: le_u32(buf, 8),
            label,
            flags: le_u32(buf, 28),
        }))
    }

    fn encode(&self, buf: &mut [u8]) {
        put_u16(buf, 0, TABLE_ENTRY_MAGIC);
        buf[2] = self.ty;
        buf[3] = self.subtype;
        put_u32(buf, 4, self.offset);
        put_u32(buf, 8, self.size);
        buf[12..28].copy_from_slice(&self.label);
        put_u32(buf, 28, self.flags);
    }

    pub fn part_type(&self) -> Option<Type> {
        Type::from_repr(self.ty)
    }
}

/// Partition descriptor as carried by app records and firmware files.
///
/// 28 bytes on flash: `type u8 | subtype u8 | reserved u16 | label [u8; 16] |
/// flags u32 | length u32`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDescriptor {
    pub ty: u8,
    pub subtype: u8,
    pub label: [u8; 16],
    pub flags: u32,
    pub length: u32,
}

/// Encoded size of a [`PartitionDescriptor`].
pub const DESCRIPTOR_SIZE: usize = 28;

impl PartitionDescriptor {
    pub(crate) fn decode(buf: &[u8]) -> Self {
        let mut label = [0u8; 16];
        label.copy_from_slice(&buf[4..20]);
        PartitionDescriptor {
            ty: buf[0],
            subtype: buf[1],
            label,
            flags: le_u32(buf, 20),
            length: le_u32(buf, 24),
        }
    }

    pub(crate) fn encode(&self, buf: &mut [u8]) {
        buf[0] = self.ty;
        buf[1] = self.subtype;
        buf[2] = 0;
        buf[3] = 0;
        buf[4..20].copy_from_slice(&self.label);
        put_u32(buf, 20, self.flags);
        put_u32(buf, 24, self.length);
    }

    pub fn part_type(&self) -> Option<Type> {
        Type::from_repr(self.ty)
    }

    /// Whether this descriptor names the OTA_0 application slot.
    pub fn is_ota0(&self) -> bool {
        self.part_type() == Some(Type::App) && self.subtype == SUBTYPE_OTA_0
    }
}

/// The boot-ROM partition table blob and its flash location.
#[derive(Debug)]
pub struct PartitionTable {
    table_offset: u32,
    raw: Vec<u8>,
}

impl PartitionTable {
    /// Read the table blob from flash.
    pub fn load<F: FlashStorage>(flash: &mut F, table_offset: u32) -> Result<Self, Error> {
        let mut raw = vec![0u8; TABLE_MAX_LEN];
        flash.read(table_offset, &mut raw)?;
        let table = PartitionTable { table_offset, raw };
        debug!(
            "partition table at {:#x}: {} entries",
            table_offset,
            table.entries().count()
        );
        Ok(table)
    }

    /// Iterate the populated entries with their slot index.
    ///
    /// Stops at the `0xFFFF` terminator; slots with any other unexpected
    /// magic are skipped.
    pub fn entries(&self) -> impl Iterator<Item = (usize, TableEntry)> + '_ {
        self.raw
            .chunks_exact(TABLE_ENTRY_SIZE)
            .enumerate()
            .map_while(|(index, slot)| TableEntry::decode(slot).map(|entry| (index, entry)))
            .filter_map(|(index, entry)| match entry {
                Ok(entry) => Some((index, entry)),
                Err(magic) => {
                    warn!("table entry {index} has unexpected magic {magic:#06x}, skipping");
                    None
                }
            })
    }

    /// The first entry matching `ty`/`subtype`.
    pub fn find(&self, ty: Type, subtype: u8) -> Option<(usize, TableEntry)> {
        self.entries()
            .find(|(_, e)| e.ty == ty as u8 && e.subtype == subtype)
    }

    /// The catalog data partition and its slot index.
    pub fn catalog_partition(&self) -> Result<(usize, TableEntry), Error> {
        self.find(Type::Data, SUBTYPE_CATALOG)
            .ok_or(Error::NoCatalogPartition)
    }

    /// Rewrite the table tail to expose an application's partitions.
    ///
    /// Entries `[0, start_entry)` are preserved verbatim. One entry is
    /// emitted per descriptor, located at `base_offset` plus the lengths of
    /// the descriptors before it; the remainder of the blob is filled with
    /// `0xFF`. The single erase block holding the table is erased and the
    /// whole blob written back. The caller must then ask the boot ROM to
    /// reload the table.
    pub fn rewrite<F: FlashStorage>(
        &mut self,
        flash: &mut F,
        start_entry: usize,
        parts: &[PartitionDescriptor],
        base_offset: u32,
    ) -> Result<(), Error> {
        debug!(
            "rewriting partition table: {} app partitions at {:#x}, preserving {} factory entries",
            parts.len(),
            base_offset,
            start_entry
        );

        self.raw[start_entry * TABLE_ENTRY_SIZE..].fill(0xFF);

        let mut offset = base_offset;
        for (i, part) in parts.iter().enumerate() {
            let entry = TableEntry {
                ty: part.ty,
                subtype: part.subtype,
                offset,
                size: part.length,
                label: part.label,
                flags: part.flags,
            };
            let slot = (start_entry + i) * TABLE_ENTRY_SIZE;
            entry.encode(&mut self.raw[slot..slot + TABLE_ENTRY_SIZE]);
            offset += part.length;
        }

        flash.erase(self.table_offset, ERASE_BLOCK_SIZE as u32)?;
        flash.write(self.table_offset, &self.raw)?;
        Ok(())
    }
}

pub(crate) fn le_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

pub(crate) fn le_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

pub(crate) fn put_u16(buf: &mut [u8], off: usize, value: u16) {
    buf[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}
