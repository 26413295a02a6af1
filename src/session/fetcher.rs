//! Block retrieval over either transport.
//!
//! A direct scanner answers `readImageBlock` with one `multipart/mixed`
//! body: a JSON part carrying the metadata and an `application/pdf` part
//! carrying the bytes. Through the cloud relay the same command returns the
//! metadata and a URL, and the bytes are fetched from that URL in a second
//! request. [`BlockFetcher`] hides the difference; the session picks one
//! implementation when it is created.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::SessionId;
use crate::protocol::{Command, Response, multipart};

use super::channel::{CloudChannel, LocalChannel, ScannerChannel};

// ============================================================================
// Constants
// ============================================================================

const READ_METHOD: &str = "readImageBlock";
const JSON_PART: &str = "application/json";
const CONTENT_PART: &str = "application/pdf";

// ============================================================================
// FetchedBlock
// ============================================================================

/// One block as received, before it is written to disk.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedBlock {
    /// Metadata, including the block `address`.
    pub metadata: Value,

    /// Block bytes; `None` if the reply had no content part.
    pub content: Option<Vec<u8>>,

    /// The content was shorter than its declared length.
    pub truncated: bool,
}

impl FetchedBlock {
    /// Returns `true` if the content is present and complete.
    #[inline]
    #[must_use]
    pub fn is_intact(&self) -> bool {
        self.content.is_some() && !self.truncated
    }
}

// ============================================================================
// BlockFetcher
// ============================================================================

/// Reads one image block from the scanner.
#[async_trait]
pub trait BlockFetcher: Send + Sync {
    /// Fetches block `block` of `session_id` with its metadata.
    ///
    /// # Errors
    ///
    /// Transport and protocol failures. A missing or truncated content
    /// part is not an error; it is reported through [`FetchedBlock`].
    async fn fetch(&self, session_id: &SessionId, block: u32) -> Result<FetchedBlock>;
}

fn read_command(session_id: &SessionId, block: u32) -> Command {
    Command::ReadImageBlock {
        session_id: session_id.clone(),
        image_block_num: block,
        with_metadata: true,
    }
}

// ============================================================================
// LocalBlockFetcher
// ============================================================================

/// Reads blocks directly from the scanner as multipart bodies.
pub struct LocalBlockFetcher {
    channel: Arc<LocalChannel>,
}

impl LocalBlockFetcher {
    /// Creates a fetcher sharing `channel`.
    #[must_use]
    pub fn new(channel: Arc<LocalChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl BlockFetcher for LocalBlockFetcher {
    async fn fetch(&self, session_id: &SessionId, block: u32) -> Result<FetchedBlock> {
        let response = self.channel.post(read_command(session_id, block)).await?;

        let content_type = response
            .header("content-type")
            .ok_or_else(|| Error::protocol("Block reply has no Content-Type"))?;
        let boundary = multipart::boundary(content_type)?;
        let parts = multipart::parse(&response.body, &boundary)?;

        let mut metadata = None;
        let mut content = None;
        let mut truncated = false;

        for part in parts {
            if part.is_content_type(JSON_PART) {
                let results = Response::from_slice(&part.body)?.into_results(READ_METHOD)?;
                metadata = results.metadata;
            } else if part.is_content_type(CONTENT_PART) {
                truncated = part.truncated;
                content = Some(part.body);
            }
        }

        let metadata =
            metadata.ok_or_else(|| Error::protocol(format!("Block {block} reply has no metadata")))?;

        if content.is_none() {
            warn!(block, "Block reply did not deliver an application/pdf part");
        }
        debug!(block, truncated, "Fetched block");

        Ok(FetchedBlock {
            metadata,
            content,
            truncated,
        })
    }
}

// ============================================================================
// CloudBlockFetcher
// ============================================================================

/// Reads blocks through the relay: metadata first, then the bytes.
pub struct CloudBlockFetcher {
    channel: Arc<CloudChannel>,
}

impl CloudBlockFetcher {
    /// Creates a fetcher sharing `channel`.
    #[must_use]
    pub fn new(channel: Arc<CloudChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl BlockFetcher for CloudBlockFetcher {
    async fn fetch(&self, session_id: &SessionId, block: u32) -> Result<FetchedBlock> {
        let results = self
            .channel
            .send(read_command(session_id, block))
            .await?
            .into_results(READ_METHOD)?;

        let metadata = results
            .metadata
            .ok_or_else(|| Error::protocol(format!("Block {block} reply has no metadata")))?;
        let location = results
            .image_block_url
            .ok_or_else(|| Error::protocol(format!("Block {block} reply has no imageBlockUrl")))?;
        let url = Url::parse(&location)?;

        let timeout = self.channel.options().block_read_timeout;
        let response = self.channel.get_authorized(url, timeout).await?;

        let declared = response
            .header("content-length")
            .and_then(|v| v.trim().parse::<usize>().ok());
        let truncated = declared.is_some_and(|len| response.body.len() < len);

        debug!(block, len = response.body.len(), truncated, "Fetched relayed block");

        Ok(FetchedBlock {
            metadata,
            content: Some(response.body),
            truncated,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
