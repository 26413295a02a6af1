//! In-memory scanner fakes shared by the session tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};

use crate::error::{Error, Result};
use crate::identifiers::SessionId;
use crate::protocol::{Command, InfoEx, MoreParts, Response};

use super::channel::ScannerChannel;
use super::fetcher::{BlockFetcher, FetchedBlock};

// ============================================================================
// GatedFetcher
// ============================================================================

/// Serves scripted blocks; gated blocks wait until [`open`](Self::open).
///
/// Every block is addressed as sheet 1, image `<block>`, part 1.
#[derive(Default)]
pub struct GatedFetcher {
    blocks: FxHashMap<u32, (MoreParts, Vec<u8>)>,
    gates: FxHashMap<u32, Arc<Notify>>,
    truncated: FxHashSet<u32>,
    fetched: Mutex<Vec<u32>>,
}

impl GatedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block(mut self, block: u32, more_parts: MoreParts, bytes: &[u8]) -> Self {
        self.blocks.insert(block, (more_parts, bytes.to_vec()));
        self
    }

    pub fn gated(mut self, block: u32) -> Self {
        self.gates.insert(block, Arc::new(Notify::new()));
        self
    }

    pub fn truncated(mut self, block: u32) -> Self {
        self.truncated.insert(block);
        self
    }

    pub fn open(&self, block: u32) {
        if let Some(gate) = self.gates.get(&block) {
            gate.notify_one();
        }
    }

    pub fn was_fetched(&self, block: u32) -> bool {
        self.fetched.lock().contains(&block)
    }

    pub fn fetch_order(&self) -> Vec<u32> {
        self.fetched.lock().clone()
    }
}

#[async_trait]
impl BlockFetcher for GatedFetcher {
    async fn fetch(&self, _session_id: &SessionId, block: u32) -> Result<FetchedBlock> {
        self.fetched.lock().push(block);

        if let Some(gate) = self.gates.get(&block) {
            gate.notified().await;
        }

        let (more_parts, bytes) = self
            .blocks
            .get(&block)
            .cloned()
            .ok_or_else(|| Error::connection(format!("block {block} unavailable")))?;

        Ok(FetchedBlock {
            metadata: json!({
                "address": {
                    "sheetNumber": 1,
                    "imageNumber": block,
                    "imagePart": 1,
                    "moreParts": more_parts
                }
            }),
            content: Some(bytes),
            truncated: self.truncated.contains(&block),
        })
    }
}

// ============================================================================
// ScriptedChannel
// ============================================================================

/// Scanner that answers lifecycle commands and replays pushed events.
pub struct ScriptedChannel {
    sent: Mutex<Vec<&'static str>>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>,
    reject_releases: AtomicBool,
}

impl ScriptedChannel {
    /// Returns the channel and a sender for `waitForEvents` replies
    /// (`results` objects).
    pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<Value>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            events_rx: tokio::sync::Mutex::new(events_rx),
            reject_releases: AtomicBool::new(false),
        });
        (channel, events_tx)
    }

    pub fn sent(&self) -> Vec<&'static str> {
        self.sent.lock().clone()
    }

    /// Answers every `releaseImageBlocks` with a scanner failure.
    pub fn reject_releases(&self) {
        self.reject_releases.store(true, Ordering::SeqCst);
    }

    pub fn count(&self, method: &str) -> usize {
        self.sent.lock().iter().filter(|m| **m == method).count()
    }
}

/// A `results` object carrying a session snapshot.
pub fn session_results(state: &str, revision: u64) -> Value {
    json!({
        "success": true,
        "session": {"sessionId": "s1", "revision": revision, "state": state}
    })
}

#[async_trait]
impl ScannerChannel for ScriptedChannel {
    async fn info_ex(&self) -> Result<InfoEx> {
        Ok(InfoEx {
            privet_token: "token".to_string(),
            ..InfoEx::default()
        })
    }

    async fn send(&self, command: Command) -> Result<Response> {
        let method = command.method();
        self.sent.lock().push(method);

        let results = match command {
            Command::WaitForEvents { .. } => {
                let next = self.events_rx.lock().await.recv().await;
                match next {
                    Some(results) => results,
                    None => std::future::pending().await,
                }
            }
            Command::CreateSession {} | Command::SendTask { .. } => session_results("ready", 1),
            Command::ReleaseImageBlocks { .. } if self.reject_releases.load(Ordering::SeqCst) => {
                json!({"success": false, "code": "invalidImageBlockNumber"})
            }
            Command::StartCapturing { .. } | Command::ReleaseImageBlocks { .. } => {
                session_results("capturing", 2)
            }
            Command::StopCapturing { .. } => session_results("draining", 3),
            Command::CloseSession { .. } => session_results("closed", 4),
            Command::ReadImageBlock { .. } => {
                return Err(Error::protocol("blocks are served by the fetcher"));
            }
        };

        Response::from_value(json!({"method": method, "results": results}))
    }
}
