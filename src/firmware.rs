//! Firmware-file parsing and verification
//!
//! A firmware file is self-describing: a fixed header (magic string,
//! description, menu tile) followed by one on-file entry per partition (a
//! 28-byte descriptor, a `data_length` word, then `data_length` payload
//! bytes) and a trailing CRC-32 over everything before it. Parsing is one
//! forward pass; payload bytes are skipped, not read, so enumerating a file
//! is cheap enough for the file browser to call per directory entry.

use std::io::{Read, Seek, SeekFrom};

use crc::{Crc, CRC_32_ISO_HDLC};
use log::debug;

use crate::{
    catalog::{DESCRIPTION_LEN, TILE_PIXELS},
    error::Error,
    partition::{le_u32, PartitionDescriptor, DESCRIPTOR_SIZE, PARTS_MAX},
};

/// Magic string opening every firmware file.
pub const FIRMWARE_HEADER: &[u8; 24] = b"ODROIDGO_FIRMWARE_V00_01";

/// File offset of the first partition entry.
pub const DATA_OFFSET: u64 = (FIRMWARE_HEADER.len() + DESCRIPTION_LEN + 2 * TILE_PIXELS) as u64;

/// On-file partition entry: descriptor plus the `data_length` word.
const FILE_ENTRY_SIZE: usize = DESCRIPTOR_SIZE + 4;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// One partition as described by a firmware file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwarePart {
    pub descriptor: PartitionDescriptor,
    /// Bytes of payload present in the file; the remainder of the partition
    /// up to `descriptor.length` stays erased.
    pub data_length: u32,
    /// File offset of this partition's payload.
    pub data_offset: u64,
}

/// Everything known about a firmware file after the enumeration pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub description: String,
    pub tile: Vec<u16>,
    pub parts: Vec<FirmwarePart>,
    /// Total flash the firmware occupies: the sum of partition lengths.
    pub flash_size: u32,
    pub file_size: u64,
    /// Expected CRC-32 from the file trailer.
    pub checksum: u32,
}

impl FirmwareInfo {
    /// Enumerate a firmware file in a single forward pass.
    pub fn parse<R: Read + Seek>(reader: &mut R) -> Result<Self, Error> {
        let file_size = reader.seek(SeekFrom::End(0)).map_err(Error::Seek)?;
        reader.rewind().map_err(Error::Seek)?;

        if file_size < DATA_OFFSET + 4 {
            return Err(Error::InvalidFirmware("file too short"));
        }

        let mut header = [0u8; DATA_OFFSET as usize];
        reader.read_exact(&mut header).map_err(Error::SdRead)?;
        if &header[..FIRMWARE_HEADER.len()] != FIRMWARE_HEADER {
            return Err(Error::InvalidFirmware("unrecognized header magic"));
        }

        let description = {
            let field = &header[FIRMWARE_HEADER.len()..][..DESCRIPTION_LEN];
            let len = field.iter().position(|b| *b == 0).unwrap_or(DESCRIPTION_LEN - 1);
            String::from_utf8_lossy(&field[..len]).into_owned()
        };
        let tile = header[FIRMWARE_HEADER.len() + DESCRIPTION_LEN..]
            .chunks_exact(2)
            .map(|px| u16::from_le_bytes([px[0], px[1]]))
            .collect();

        let payload_end = file_size - 4;
        let mut parts: Vec<FirmwarePart> = Vec::new();
        let mut flash_size = 0u32;
        let mut pos = DATA_OFFSET;

        while pos < payload_end {
            if parts.len() >= PARTS_MAX {
                return Err(Error::TooManyPartitions);
            }
            if pos + FILE_ENTRY_SIZE as u64 > payload_end {
                return Err(Error::InvalidFirmware("truncated partition entry"));
            }

            let mut entry = [0u8; FILE_ENTRY_SIZE];
            reader.read_exact(&mut entry).map_err(Error::SdRead)?;
            let descriptor = PartitionDescriptor::decode(&entry);
            let data_length = le_u32(&entry, DESCRIPTOR_SIZE);
            pos += FILE_ENTRY_SIZE as u64;

            if descriptor.ty == 0xFF {
                return Err(Error::InvalidFirmware("erased partition type"));
            }
            if data_length > descriptor.length {
                return Err(Error::InvalidFirmware("data length exceeds partition length"));
            }
            if pos + data_length as u64 > payload_end {
                return Err(Error::InvalidFirmware("partition data overruns the file"));
            }

            flash_size = flash_size
                .checked_add(descriptor.length)
                .ok_or(Error::InvalidFirmware("flash size overflows"))?;
            parts.push(FirmwarePart {
                descriptor,
                data_length,
                data_offset: pos,
            });

            pos += data_length as u64;
            reader
                .seek(SeekFrom::Start(pos))
                .map_err(Error::Seek)?;
        }

        if parts.is_empty() {
            return Err(Error::InvalidFirmware("no partition entries"));
        }

        let mut trailer = [0u8; 4];
        reader.read_exact(&mut trailer).map_err(Error::SdRead)?;
        let checksum = u32::from_le_bytes(trailer);

        debug!(
            "firmware '{description}': {} partitions, {} KiB of flash, checksum {checksum:#010x}",
            parts.len(),
            flash_size / 1024
        );

        Ok(FirmwareInfo {
            description,
            tile,
            parts,
            flash_size,
            file_size,
            checksum,
        })
    }

    /// Stream the file once more and compare its CRC-32 with the trailer.
    ///
    /// The checksum covers every byte of the file except the trailer itself.
    pub fn verify_checksum<R: Read + Seek>(
        &self,
        reader: &mut R,
        scratch: &mut [u8],
    ) -> Result<(), Error> {
        reader.rewind().map_err(Error::Seek)?;

        let mut digest = CRC32.digest();
        let mut remaining = self.file_size - 4;
        while remaining > 0 {
            let chunk = (scratch.len() as u64).min(remaining) as usize;
            reader.read_exact(&mut scratch[..chunk]).map_err(Error::SdRead)?;
            digest.update(&scratch[..chunk]);
            remaining -= chunk as u64;
        }

        let computed = digest.finalize();
        if computed != self.checksum {
            return Err(Error::ChecksumMismatch {
                expected: self.checksum,
                computed,
            });
        }
        debug!("checksum verified: {computed:#010x}");
        Ok(())
    }
}
