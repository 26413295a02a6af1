//! Download window and ordered-assembly bookkeeping.
//!
//! [`DownloadState`] is the synchronous core of the block downloader: it
//! decides which block to fetch next and which downloaded blocks form a
//! complete image. It does no I/O, so the downloader holds it under a
//! short-lived lock and does all networking and file work outside.
//!
//! # Block States
//!
//! | State | Meaning |
//! |-------|---------|
//! | `ReadyToDownload` | Announced by the scanner, not started |
//! | `Downloading` | A fetch is in flight |
//! | `WaitingForMoreParts` | Stored on disk, not yet delivered |
//! | `Completed` | Delivered (or discarded) as part of an image |
//! | `Failed` | The fetch failed; never retried |
//!
//! # Ordering
//!
//! Images are delivered strictly in block order. The watermark is the
//! lowest undelivered block; a run starting there is taken once it is
//! contiguous and ends in a block that closes its file.

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::protocol::BlockAddress;

// ============================================================================
// Constants
// ============================================================================

/// Blocks downloaded at once unless configured otherwise.
pub const DEFAULT_WINDOW_SIZE: usize = 3;

/// Scanners number blocks from 1.
const FIRST_BLOCK: u32 = 1;

// ============================================================================
// BlockState
// ============================================================================

/// Download state of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockState {
    /// Announced, not started.
    ReadyToDownload,
    /// Fetch in flight.
    Downloading,
    /// Stored, awaiting the rest of its image.
    WaitingForMoreParts,
    /// Delivered or discarded.
    Completed,
    /// Fetch failed.
    Failed,
}

// ============================================================================
// DownloadedBlock
// ============================================================================

/// A block whose bytes are stored in its part file.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadedBlock {
    /// Block number.
    pub block: u32,
    /// Where the block belongs.
    pub address: BlockAddress,
    /// Metadata that accompanied the block.
    pub metadata: Value,
    /// `false` if the binary part was missing or truncated.
    pub intact: bool,
}

// ============================================================================
// DownloadState
// ============================================================================

/// Window and watermark bookkeeping for one session.
#[derive(Debug, Clone)]
pub struct DownloadState {
    window_size: usize,
    states: BTreeMap<u32, BlockState>,
    downloaded: FxHashMap<u32, DownloadedBlock>,
    watermark: u32,
    active: usize,
    assembling: usize,
    stopping: bool,
}

impl DownloadState {
    /// Creates empty bookkeeping allowing `window_size` concurrent fetches.
    #[must_use]
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
            states: BTreeMap::new(),
            downloaded: FxHashMap::default(),
            watermark: FIRST_BLOCK,
            active: 0,
            assembling: 0,
            stopping: false,
        }
    }

    /// Starts tracking announced blocks.
    ///
    /// Blocks already tracked are ignored. Returns how many were new.
    pub fn track(&mut self, blocks: &[u32]) -> usize {
        let mut added = 0;
        for &block in blocks {
            if block < self.watermark {
                continue;
            }
            self.states.entry(block).or_insert_with(|| {
                added += 1;
                BlockState::ReadyToDownload
            });
        }
        added
    }

    /// Claims the lowest ready block if the window has room.
    ///
    /// The claimed block moves to `Downloading` and occupies a slot until
    /// [`complete`](Self::complete) or [`fail`](Self::fail).
    pub fn claim_next(&mut self) -> Option<u32> {
        if self.stopping || self.active >= self.window_size {
            return None;
        }

        let (&block, state) = self
            .states
            .iter_mut()
            .find(|(_, state)| **state == BlockState::ReadyToDownload)?;
        *state = BlockState::Downloading;
        self.active += 1;
        Some(block)
    }

    /// Records a finished fetch and frees its window slot.
    ///
    /// The block counts as assembling until
    /// [`finish_assembly`](Self::finish_assembly). Returns `false` if the
    /// block was not downloading.
    pub fn complete(&mut self, downloaded: DownloadedBlock) -> bool {
        match self.states.get_mut(&downloaded.block) {
            Some(state @ BlockState::Downloading) => {
                *state = BlockState::WaitingForMoreParts;
                self.downloaded.insert(downloaded.block, downloaded);
                self.active = self.active.saturating_sub(1);
                self.assembling += 1;
                true
            }
            _ => false,
        }
    }

    /// Ends the assembly pass started by a completed block.
    pub fn finish_assembly(&mut self) {
        self.assembling = self.assembling.saturating_sub(1);
    }

    /// Records a failed fetch and frees its slot.
    ///
    /// Returns `false` if the block was not downloading.
    pub fn fail(&mut self, block: u32) -> bool {
        match self.states.get_mut(&block) {
            Some(state @ BlockState::Downloading) => {
                *state = BlockState::Failed;
                self.active = self.active.saturating_sub(1);
                true
            }
            _ => false,
        }
    }

    /// Takes the next deliverable run of blocks, advancing the watermark.
    ///
    /// Returns `None` until the blocks from the watermark onward are
    /// contiguous and end in a block that closes its file.
    pub fn take_run(&mut self) -> Option<Vec<DownloadedBlock>> {
        let mut end = self.watermark;
        loop {
            let block = self.downloaded.get(&end)?;
            if block.address.more_parts.ends_file() {
                break;
            }
            end = end.checked_add(1)?;
        }

        let run: Vec<DownloadedBlock> = (self.watermark..=end)
            .filter_map(|block| self.downloaded.remove(&block))
            .collect();
        for block in self.watermark..=end {
            self.states.insert(block, BlockState::Completed);
        }
        self.watermark = end + 1;
        Some(run)
    }

    /// Stops claiming new blocks; in-flight fetches are unaffected.
    pub fn stop(&mut self) {
        self.stopping = true;
    }

    /// Returns `true` once [`stop`](Self::stop) was called.
    #[inline]
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// Number of slots in use.
    #[inline]
    #[must_use]
    pub fn active(&self) -> usize {
        self.active
    }

    /// Completed blocks whose assembly pass has not finished.
    #[inline]
    #[must_use]
    pub fn assembling(&self) -> usize {
        self.assembling
    }

    /// Lowest undelivered block number.
    #[inline]
    #[must_use]
    pub fn watermark(&self) -> u32 {
        self.watermark
    }

    /// Returns the state of `block`, if tracked.
    #[inline]
    #[must_use]
    pub fn state(&self, block: u32) -> Option<BlockState> {
        self.states.get(&block).copied()
    }

    /// Returns `true` if no fetch or assembly is in progress.
    #[inline]
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.active == 0 && self.assembling == 0
    }

    /// Returns `true` if every tracked block has been delivered or failed.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.is_settled()
            && self
                .states
                .values()
                .all(|s| matches!(s, BlockState::Completed | BlockState::Failed))
    }
}

impl Default for DownloadState {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;
    use serde_json::json;

    use crate::protocol::MoreParts;

    fn downloaded(block: u32, more_parts: MoreParts) -> DownloadedBlock {
        DownloadedBlock {
            block,
            address: BlockAddress {
                sheet_number: 1,
                image_number: 1,
                image_part: 1,
                more_parts,
            },
            metadata: json!({"block": block}),
            intact: true,
        }
    }

    fn finish(state: &mut DownloadState, block: u32, more_parts: MoreParts) {
        assert!(state.complete(downloaded(block, more_parts)));
        state.finish_assembly();
    }

    #[test]
    fn test_track_is_idempotent() {
        let mut state = DownloadState::new(3);
        assert_eq!(state.track(&[1, 2, 3]), 3);
        assert_eq!(state.track(&[2, 3, 4]), 1);
        assert_eq!(state.state(4), Some(BlockState::ReadyToDownload));
    }

    #[test]
    fn test_claims_lowest_within_window() {
        let mut state = DownloadState::new(2);
        state.track(&[5, 3, 4, 1]);

        assert_eq!(state.claim_next(), Some(1));
        assert_eq!(state.claim_next(), Some(3));
        assert_eq!(state.claim_next(), None);
        assert_eq!(state.active(), 2);

        assert!(state.fail(1));
        assert_eq!(state.claim_next(), Some(4));
    }

    #[test]
    fn test_out_of_order_run() {
        let mut state = DownloadState::new(3);
        state.track(&[1, 2]);
        state.claim_next();
        state.claim_next();

        finish(&mut state, 2, MoreParts::LastPart);
        assert!(state.take_run().is_none());

        finish(&mut state, 1, MoreParts::MorePartsPending);
        let run = state.take_run().expect("run");
        assert_eq!(run.iter().map(|b| b.block).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(state.watermark(), 3);
        assert!(state.take_run().is_none());
        assert!(state.is_drained());
    }

    #[test]
    fn test_more_parts_pending_blocks_run() {
        let mut state = DownloadState::new(3);
        state.track(&[1]);
        state.claim_next();
        finish(&mut state, 1, MoreParts::MorePartsPending);

        assert!(state.take_run().is_none());
        assert!(!state.is_drained());
    }

    #[test]
    fn test_stop_prevents_new_claims() {
        let mut state = DownloadState::new(2);
        state.track(&[1, 2, 3]);
        state.claim_next();
        state.claim_next();
        state.stop();

        finish(&mut state, 1, MoreParts::LastPart);
        assert_eq!(state.claim_next(), None);
        assert_eq!(state.state(3), Some(BlockState::ReadyToDownload));

        finish(&mut state, 2, MoreParts::LastPart);
        assert!(state.is_settled());
    }

    #[test]
    fn test_complete_frees_slot_before_assembly() {
        let mut state = DownloadState::new(1);
        state.track(&[1, 2]);
        assert_eq!(state.claim_next(), Some(1));
        assert_eq!(state.claim_next(), None);

        assert!(state.complete(downloaded(1, MoreParts::MorePartsPending)));
        assert_eq!(state.active(), 0);
        assert_eq!(state.assembling(), 1);
        assert!(!state.is_settled());
        assert_eq!(state.claim_next(), Some(2));

        state.finish_assembly();
        assert_eq!(state.assembling(), 0);
        assert!(!state.is_settled());
    }

    #[test]
    fn test_delivered_blocks_are_not_retracked() {
        let mut state = DownloadState::new(1);
        state.track(&[1]);
        state.claim_next();
        finish(&mut state, 1, MoreParts::LastPart);
        state.take_run().expect("run");

        assert_eq!(state.track(&[1]), 0);
        assert_eq!(state.claim_next(), None);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue(Vec<u32>),
        Finish(usize, bool),
        Fail(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            prop::collection::vec(1u32..24, 1..6).prop_map(Op::Enqueue),
            (any::<usize>(), any::<bool>()).prop_map(|(i, last)| Op::Finish(i, last)),
            any::<usize>().prop_map(Op::Fail),
        ]
    }

    proptest! {
        #[test]
        fn prop_window_and_ordering(window in 1usize..5, ops in prop::collection::vec(op(), 1..60)) {
            let mut state = DownloadState::new(window);
            let mut in_flight: Vec<u32> = Vec::new();
            let mut started: Vec<u32> = Vec::new();
            let mut delivered: Vec<u32> = Vec::new();
            let mut finished: FxHashMap<u32, bool> = FxHashMap::default();

            for op in ops {
                match op {
                    Op::Enqueue(blocks) => { state.track(&blocks); }
                    Op::Finish(i, last) if !in_flight.is_empty() => {
                        let block = in_flight.remove(i % in_flight.len());
                        let more = if last { MoreParts::LastPart } else { MoreParts::MorePartsPending };
                        prop_assert!(state.complete(downloaded(block, more)));
                        finished.insert(block, last);
                        while let Some(run) = state.take_run() {
                            let blocks: Vec<u32> = run.iter().map(|b| b.block).collect();
                            // Contiguous and ends in a file-closing block.
                            for pair in blocks.windows(2) {
                                prop_assert_eq!(pair[0] + 1, pair[1]);
                            }
                            let last_block = *blocks.last().expect("non-empty run");
                            prop_assert!(finished[&last_block]);
                            delivered.extend(blocks);
                        }
                        state.finish_assembly();
                        prop_assert_eq!(state.assembling(), 0);
                    }
                    Op::Fail(i) if !in_flight.is_empty() => {
                        let block = in_flight.remove(i % in_flight.len());
                        prop_assert!(state.fail(block));
                    }
                    _ => {}
                }

                while let Some(block) = state.claim_next() {
                    prop_assert!(!started.contains(&block), "block {} started twice", block);
                    started.push(block);
                    in_flight.push(block);
                }
                prop_assert!(state.active() <= window);
                prop_assert_eq!(state.active(), in_flight.len());
            }

            for pair in delivered.windows(2) {
                prop_assert!(pair[0] < pair[1]);
            }
        }
    }
}
