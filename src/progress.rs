//! Progress reporting for long flash operations

/// Receives progress for one flash transfer at a time.
///
/// The installer reports one transfer per partition it writes, the
/// defragmenter one for the whole compaction (sized by the prepass byte
/// total). A transfer is a flash offset plus a byte count, so the UI can
/// render both a bar and the destination address.
pub trait FlashProgress {
    /// A transfer of `total_bytes` to flash offset `offset` starts.
    fn begin(&mut self, offset: u32, total_bytes: usize);
    /// `bytes_done` of the current transfer have reached flash.
    fn advance(&mut self, bytes_done: usize);
    /// The current transfer is done.
    fn complete(&mut self);
}

/// Discards all progress updates.
pub struct NoProgress;

impl FlashProgress for NoProgress {
    fn begin(&mut self, _offset: u32, _total_bytes: usize) {}
    fn advance(&mut self, _bytes_done: usize) {}
    fn complete(&mut self) {}
}
