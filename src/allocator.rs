//! Free-space tracking and defragmentation
//!
//! Applications occupy contiguous flash extents, so free space is simply the
//! set of gaps between catalog records (plus the gap in front of the first
//! app and the tail up to the end of flash). Allocation is first-fit by
//! ascending offset; when no single gap is large enough but the total free
//! space would suffice, the apps are slid down once to coalesce the gaps.

use log::{debug, info};

use crate::{
    catalog::Catalog,
    error::Error,
    flash::{FlashStorage, FLASH_BLOCK_SIZE},
    progress::FlashProgress,
};

/// A maximal contiguous range of unused flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeExtent {
    pub offset: u32,
    pub size: u32,
}

/// Enumerate the free extents between `start_flash_address` and the end of
/// flash, in ascending offset order.
pub fn free_extents(catalog: &Catalog, flash_size: u32) -> Vec<FreeExtent> {
    let mut extents = Vec::new();

    let mut apps: Vec<(u32, u32)> = catalog
        .apps()
        .iter()
        .map(|a| (a.start_offset, a.end_offset))
        .collect();
    apps.sort_unstable();

    let mut cursor = catalog.start_flash_address();
    for (start, end) in apps {
        if start > cursor {
            extents.push(FreeExtent {
                offset: cursor,
                size: start - cursor,
            });
        }
        cursor = end + 1;
    }
    if flash_size > cursor {
        extents.push(FreeExtent {
            offset: cursor,
            size: flash_size - cursor,
        });
    }

    for extent in &extents {
        debug!(
            "free extent: {:#x}..{:#x} ({} KiB)",
            extent.offset,
            extent.offset + extent.size,
            extent.size / 1024
        );
    }
    extents
}

/// Total free bytes and number of free extents.
pub fn free_space(catalog: &Catalog, flash_size: u32) -> (u32, usize) {
    let extents = free_extents(catalog, flash_size);
    (extents.iter().map(|e| e.size).sum(), extents.len())
}

/// Find a free extent of at least `requested` bytes, first-fit.
///
/// If no single extent is large enough but the gaps sum to `requested`, the
/// flash is defragmented and the search retried exactly once.
pub fn find_free_block<F: FlashStorage>(
    catalog: &mut Catalog,
    flash: &mut F,
    requested: u32,
    scratch: &mut [u8],
    progress: &mut dyn FlashProgress,
) -> Result<u32, Error> {
    let flash_size = flash.size();

    let extents = free_extents(catalog, flash_size);
    if let Some(extent) = extents.iter().find(|e| e.size >= requested) {
        return Ok(extent.offset);
    }

    let available: u32 = extents.iter().map(|e| e.size).sum();
    if available < requested {
        return Err(Error::NotEnoughSpace {
            requested,
            available,
        });
    }

    defrag(catalog, flash, scratch, progress)?;

    free_extents(catalog, flash_size)
        .iter()
        .find(|e| e.size >= requested)
        .map(|e| e.offset)
        .ok_or(Error::NotEnoughSpace {
            requested,
            available,
        })
}

/// Slide every app down so the catalog has no internal gaps.
///
/// Apps are moved in ascending offset order, one 64 KiB block at a time.
/// Each block is read into `scratch` *before* the destination block is
/// erased; together with the forward block order this keeps the copy correct
/// even when source and destination ranges overlap. The catalog is persisted
/// once, after all moves.
pub fn defrag<F: FlashStorage>(
    catalog: &mut Catalog,
    flash: &mut F,
    scratch: &mut [u8],
    progress: &mut dyn FlashProgress,
) -> Result<(), Error> {
    let block = FLASH_BLOCK_SIZE.min(scratch.len());
    debug_assert_eq!(block % crate::flash::ERASE_BLOCK_SIZE, 0);

    catalog.sort_by_offset();

    // Prepass: how much data the moves will touch, for the progress bar
    let mut cursor = catalog.start_flash_address();
    let mut total_to_move = 0usize;
    for app in catalog.apps() {
        if app.start_offset > cursor {
            total_to_move += app.size() as usize;
        }
        cursor += app.size();
    }

    if total_to_move == 0 {
        debug!("defrag: nothing to move");
        return Ok(());
    }

    info!("defrag: moving {} KiB", total_to_move / 1024);
    progress.begin(catalog.start_flash_address(), total_to_move);

    let mut moved = 0usize;
    let mut cursor = catalog.start_flash_address();
    for app in catalog.apps_mut() {
        let size = app.end_offset - app.start_offset + 1;
        if app.start_offset > cursor {
            let src = app.start_offset;
            debug!("defrag: sliding {src:#x}..{:#x} down to {cursor:#x}", src + size);

            let mut done = 0;
            while done < size {
                let chunk = (size - done).min(block as u32);
                flash.read(src + done, &mut scratch[..chunk as usize])?;
                flash.erase(cursor + done, chunk)?;
                flash.write(cursor + done, &scratch[..chunk as usize])?;

                done += chunk;
                moved += chunk as usize;
                progress.advance(moved);
            }

            app.start_offset = cursor;
            app.end_offset = cursor + size - 1;
        }
        cursor = app.end_offset + 1;
    }

    progress.complete();
    catalog.persist(flash)
}
