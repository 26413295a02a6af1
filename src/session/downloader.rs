//! Windowed block download and ordered image assembly.
//!
//! The downloader turns "block N is available" announcements into complete
//! images. Up to `window_size` blocks are fetched at once, lowest number
//! first; each fetch runs in its own task and stores the block bytes in a
//! part file. Finished blocks are assembled strictly in block order: the run
//! starting at the watermark is concatenated into its first part file,
//! renamed to `<sheet>-<image>-<part>.pdf` and handed to the consumer.
//!
//! Bookkeeping lives in [`DownloadState`] behind a mutex that is never held
//! across an await. File assembly is serialized by a separate async gate so
//! that images reach the consumer in order even when blocks finish together.
//!
//! The session learns about finished fetches through [`DownloadProgress`],
//! which it uses to release blocks on the scanner and to detect failures.

// ============================================================================
// Imports
// ============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::SessionId;
use crate::protocol::BlockAddress;

use super::blocks::{DownloadState, DownloadedBlock};
use super::events::{ReceivedImage, SessionEvent};
use super::fetcher::BlockFetcher;

// ============================================================================
// DownloadProgress
// ============================================================================

/// Outcome of one block fetch, reported to the session.
#[derive(Debug)]
pub enum DownloadProgress {
    /// The block is stored and its window slot is free.
    Downloaded(u32),
    /// The fetch failed. The block is not retried.
    Failed {
        /// Block number.
        block: u32,
        /// Why it failed.
        error: Error,
    },
}

// ============================================================================
// BlockDownloader
// ============================================================================

struct DownloaderInner {
    state: Mutex<DownloadState>,
    fetcher: Arc<dyn BlockFetcher>,
    session_id: SessionId,
    temp_dir: PathBuf,
    assembly: tokio::sync::Mutex<()>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    progress_tx: mpsc::UnboundedSender<DownloadProgress>,
}

/// Downloads and assembles the blocks of one session.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct BlockDownloader {
    inner: Arc<DownloaderInner>,
}

impl BlockDownloader {
    /// Creates a downloader writing into `temp_dir`.
    ///
    /// Assembled images go to `events_tx`; per-block outcomes are returned
    /// through the progress receiver.
    #[must_use]
    pub fn new(
        fetcher: Arc<dyn BlockFetcher>,
        session_id: SessionId,
        temp_dir: PathBuf,
        window_size: usize,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<DownloadProgress>) {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();

        let downloader = Self {
            inner: Arc::new(DownloaderInner {
                state: Mutex::new(DownloadState::new(window_size)),
                fetcher,
                session_id,
                temp_dir,
                assembly: tokio::sync::Mutex::new(()),
                events_tx,
                progress_tx,
            }),
        };
        (downloader, progress_rx)
    }

    /// Tracks newly announced blocks and starts as many as the window allows.
    ///
    /// Blocks already tracked are ignored. Returns how many were new.
    pub fn enqueue(&self, blocks: &[u32]) -> usize {
        let added = self.inner.state.lock().track(blocks);
        if added > 0 {
            debug!(added, ?blocks, "Enqueued image blocks");
        }
        self.pump();
        added
    }

    /// Stops starting new downloads. In-flight downloads finish normally.
    pub fn stop(&self) {
        self.inner.state.lock().stop();
        debug!("Downloader stopping");
    }

    /// Returns `true` if no fetch or assembly is in progress.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.inner.state.lock().is_settled()
    }

    /// Returns `true` if every tracked block was delivered or failed.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.inner.state.lock().is_drained()
    }

    /// Lowest block number not yet delivered.
    #[must_use]
    pub fn watermark(&self) -> u32 {
        self.inner.state.lock().watermark()
    }

    /// Directory holding part files and images.
    #[inline]
    #[must_use]
    pub fn temp_dir(&self) -> &Path {
        &self.inner.temp_dir
    }

    // ========================================================================
    // Download Tasks
    // ========================================================================

    fn pump(&self) {
        loop {
            let next = self.inner.state.lock().claim_next();
            let Some(block) = next else {
                break;
            };

            debug!(block, "Starting block download");
            let downloader = self.clone();
            tokio::spawn(async move {
                downloader.download(block).await;
            });
        }
    }

    async fn download(self, block: u32) {
        match self.fetch_to_disk(block).await {
            Ok(downloaded) => {
                self.inner.state.lock().complete(downloaded);
                debug!(block, "Finished downloading block");
                self.pump();

                self.assemble().await;
                self.inner.state.lock().finish_assembly();
                let _ = self
                    .inner
                    .progress_tx
                    .send(DownloadProgress::Downloaded(block));
            }
            Err(e) => {
                error!(block, error = %e, "Block download failed");
                self.inner.state.lock().fail(block);
                self.pump();
                let _ = self
                    .inner
                    .progress_tx
                    .send(DownloadProgress::Failed { block, error: e });
            }
        }
    }

    async fn fetch_to_disk(&self, block: u32) -> Result<DownloadedBlock> {
        let fetched = self
            .inner
            .fetcher
            .fetch(&self.inner.session_id, block)
            .await?;
        let address = BlockAddress::from_metadata(&fetched.metadata)?;
        let intact = fetched.is_intact();

        match &fetched.content {
            Some(bytes) => {
                let path = self.part_path(&address, block);
                tokio::fs::write(&path, bytes).await?;
            }
            None => warn!(block, "Block has no content"),
        }

        Ok(DownloadedBlock {
            block,
            address,
            metadata: fetched.metadata,
            intact,
        })
    }

    // ========================================================================
    // Assembly
    // ========================================================================

    /// Delivers every run that is ready, in block order.
    async fn assemble(&self) {
        let _gate = self.inner.assembly.lock().await;

        loop {
            let run = self.inner.state.lock().take_run();
            let Some(run) = run else {
                break;
            };

            if let Err(e) = self.deliver(run).await {
                error!(error = %e, "Image assembly failed");
            }
        }
    }

    async fn deliver(&self, run: Vec<DownloadedBlock>) -> Result<()> {
        let Some((first, rest)) = run.split_first() else {
            return Ok(());
        };
        let last_block = rest.last().map_or(first.block, |b| b.block);

        if run.iter().any(|b| !b.intact) {
            error!(
                first_block = first.block,
                last_block, "Dropping image with missing or truncated block content"
            );
            for block in &run {
                let _ = tokio::fs::remove_file(self.part_path(&block.address, block.block)).await;
            }
            return Ok(());
        }

        let first_path = self.part_path(&first.address, first.block);
        self.concatenate(&first_path, rest)
            .await
            .map_err(|e| Error::assembly(first.block, e.to_string()))?;

        let image_path = self.inner.temp_dir.join(first.address.image_file_name());
        tokio::fs::rename(&first_path, &image_path)
            .await
            .map_err(|e| Error::assembly(first.block, e.to_string()))?;

        info!(
            first_block = first.block,
            last_block,
            path = %image_path.display(),
            "Image received"
        );

        let _ = self
            .inner
            .events_tx
            .send(SessionEvent::ImageReceived(ReceivedImage {
                path: image_path,
                metadata: first.metadata.clone(),
                address: first.address,
                first_block: first.block,
                last_block,
            }));
        Ok(())
    }

    async fn concatenate(&self, first_path: &Path, rest: &[DownloadedBlock]) -> Result<()> {
        if rest.is_empty() {
            return Ok(());
        }

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(first_path)
            .await?;

        for block in rest {
            let path = self.part_path(&block.address, block.block);
            let bytes = tokio::fs::read(&path).await?;
            file.write_all(&bytes).await?;
            tokio::fs::remove_file(&path).await?;
        }

        file.flush().await?;
        Ok(())
    }

    fn part_path(&self, address: &BlockAddress, block: u32) -> PathBuf {
        self.inner.temp_dir.join(address.part_file_name(block))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::time::timeout;

    use crate::protocol::MoreParts;
    use crate::session::testing::GatedFetcher;

    const WAIT: Duration = Duration::from_secs(5);

    async fn next_progress(rx: &mut mpsc::UnboundedReceiver<DownloadProgress>) -> DownloadProgress {
        timeout(WAIT, rx.recv())
            .await
            .expect("progress in time")
            .expect("progress channel open")
    }

    #[tokio::test]
    async fn test_out_of_order_blocks_assemble_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = Arc::new(
            GatedFetcher::new()
                .with_block(1, MoreParts::MorePartsPending, b"AAA")
                .with_block(2, MoreParts::LastPart, b"BBB")
                .gated(1)
                .gated(2),
        );
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (downloader, mut progress_rx) = BlockDownloader::new(
            fetcher.clone(),
            SessionId::new("s1"),
            dir.path().to_path_buf(),
            3,
            events_tx,
        );

        assert_eq!(downloader.enqueue(&[1, 2]), 2);

        fetcher.open(2);
        assert!(matches!(
            next_progress(&mut progress_rx).await,
            DownloadProgress::Downloaded(2)
        ));
        assert!(events_rx.try_recv().is_err());
        assert!(dir.path().join("1-2-1-2.part").exists());

        fetcher.open(1);
        assert!(matches!(
            next_progress(&mut progress_rx).await,
            DownloadProgress::Downloaded(1)
        ));

        let image = match events_rx.try_recv().expect("image event") {
            SessionEvent::ImageReceived(image) => image,
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(image.path, dir.path().join("1-1-1.pdf"));
        assert_eq!((image.first_block, image.last_block), (1, 2));
        assert_eq!(std::fs::read(&image.path).expect("image"), b"AAABBB");
        assert!(!dir.path().join("1-1-1-1.part").exists());
        assert!(!dir.path().join("1-2-1-2.part").exists());

        assert!(events_rx.try_recv().is_err());
        assert!(downloader.is_drained());
        assert_eq!(downloader.watermark(), 3);
    }

    #[tokio::test]
    async fn test_window_limits_concurrent_fetches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = Arc::new(
            GatedFetcher::new()
                .with_block(1, MoreParts::LastPart, b"1")
                .with_block(2, MoreParts::LastPart, b"2")
                .with_block(3, MoreParts::LastPart, b"3")
                .gated(1)
                .gated(2),
        );
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (downloader, mut progress_rx) = BlockDownloader::new(
            fetcher.clone(),
            SessionId::new("s1"),
            dir.path().to_path_buf(),
            2,
            events_tx,
        );

        downloader.enqueue(&[1, 2, 3]);
        tokio::task::yield_now().await;
        assert!(!fetcher.was_fetched(3));

        fetcher.open(1);
        next_progress(&mut progress_rx).await;
        fetcher.open(2);
        next_progress(&mut progress_rx).await;
        next_progress(&mut progress_rx).await;

        assert_eq!(fetcher.fetch_order(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_window_slot_frees_before_assembly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = Arc::new(
            GatedFetcher::new()
                .with_block(1, MoreParts::LastPart, b"1")
                .with_block(2, MoreParts::LastPart, b"2")
                .with_block(3, MoreParts::LastPart, b"3"),
        );
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (downloader, mut progress_rx) = BlockDownloader::new(
            fetcher.clone(),
            SessionId::new("s1"),
            dir.path().to_path_buf(),
            2,
            events_tx,
        );

        // Hold assembly so finished blocks cannot deliver.
        let gate = downloader.inner.assembly.lock().await;
        downloader.enqueue(&[1, 2, 3]);

        timeout(WAIT, async {
            while !fetcher.was_fetched(3) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("block 3 started while assembly was held");
        assert!(!downloader.is_settled());
        assert!(events_rx.try_recv().is_err());

        drop(gate);
        for _ in 0..3 {
            next_progress(&mut progress_rx).await;
        }

        let delivered: Vec<u32> = std::iter::from_fn(|| events_rx.try_recv().ok())
            .filter_map(|event| match event {
                SessionEvent::ImageReceived(image) => Some(image.first_block),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![1, 2, 3]);
        assert!(downloader.is_drained());
    }

    #[tokio::test]
    async fn test_truncated_image_is_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = Arc::new(
            GatedFetcher::new()
                .with_block(1, MoreParts::LastPart, b"AAA")
                .truncated(1)
                .with_block(2, MoreParts::LastPart, b"BBB"),
        );
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (downloader, mut progress_rx) = BlockDownloader::new(
            fetcher,
            SessionId::new("s1"),
            dir.path().to_path_buf(),
            1,
            events_tx,
        );

        downloader.enqueue(&[1, 2]);
        next_progress(&mut progress_rx).await;
        next_progress(&mut progress_rx).await;

        let image = match events_rx.try_recv().expect("image event") {
            SessionEvent::ImageReceived(image) => image,
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(image.first_block, 2);
        assert!(!dir.path().join("1-1-1-1.part").exists());
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fetch_failure_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = Arc::new(GatedFetcher::new());
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (downloader, mut progress_rx) = BlockDownloader::new(
            fetcher,
            SessionId::new("s1"),
            dir.path().to_path_buf(),
            3,
            events_tx,
        );

        downloader.enqueue(&[1]);
        match next_progress(&mut progress_rx).await {
            DownloadProgress::Failed { block, .. } => assert_eq!(block, 1),
            other => panic!("unexpected progress: {other:?}"),
        }
        assert!(downloader.is_settled());
        assert!(downloader.is_drained());
    }
}
