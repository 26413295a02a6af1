//! Image block metadata.
//!
//! Each block read with `withMetadata` carries an `address` telling where
//! the block's bytes belong:
//!
//! ```json
//! {
//!   "address": {
//!     "sheetNumber": 1,
//!     "imageNumber": 1,
//!     "imagePart": 1,
//!     "moreParts": "lastPartInFile"
//!   }
//! }
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

// ============================================================================
// MoreParts
// ============================================================================

/// Whether more blocks follow for the same image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MoreParts {
    /// This block ends the image.
    #[serde(rename = "lastPartInFile", alias = "lastPart")]
    LastPart,

    /// This block ends the image; further parts of the same page follow
    /// in a separate file.
    #[serde(
        rename = "lastPartInFileMorePartsPending",
        alias = "lastPartMorePartsPending"
    )]
    LastPartMorePartsPending,

    /// More blocks follow for this image.
    #[serde(rename = "morePartsPending")]
    MorePartsPending,
}

impl MoreParts {
    /// Returns `true` if a run of blocks may end at this block.
    #[inline]
    #[must_use]
    pub const fn ends_file(&self) -> bool {
        !matches!(self, Self::MorePartsPending)
    }
}

// ============================================================================
// BlockAddress
// ============================================================================

/// Position of a block within the scan output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockAddress {
    /// Sheet counter, from 1.
    pub sheet_number: u32,
    /// Image counter, from 1.
    pub image_number: u32,
    /// Part of the image, from 1.
    pub image_part: u32,
    /// Whether more blocks follow.
    pub more_parts: MoreParts,
}

impl BlockAddress {
    /// Extracts the address from a block's metadata payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if `address` is missing or malformed.
    pub fn from_metadata(metadata: &Value) -> Result<Self> {
        let address = metadata
            .get("address")
            .ok_or_else(|| Error::protocol("Block metadata has no address"))?;
        serde_json::from_value(address.clone())
            .map_err(|e| Error::protocol(format!("Invalid block address: {e}")))
    }

    /// File name holding one block's bytes before assembly.
    #[must_use]
    pub fn part_file_name(&self, block: u32) -> String {
        format!(
            "{}-{}-{}-{}.part",
            self.sheet_number, self.image_number, self.image_part, block
        )
    }

    /// File name of the assembled image.
    #[must_use]
    pub fn image_file_name(&self) -> String {
        format!(
            "{}-{}-{}.pdf",
            self.sheet_number, self.image_number, self.image_part
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_from_metadata() {
        let metadata = json!({
            "address": {
                "sheetNumber": 2,
                "imageNumber": 3,
                "imagePart": 1,
                "moreParts": "morePartsPending"
            },
            "image": {"pixelFormat": "bw1"}
        });

        let address = BlockAddress::from_metadata(&metadata).expect("address");
        assert_eq!(address.sheet_number, 2);
        assert_eq!(address.more_parts, MoreParts::MorePartsPending);
        assert!(!address.more_parts.ends_file());
        assert_eq!(address.part_file_name(9), "2-3-1-9.part");
        assert_eq!(address.image_file_name(), "2-3-1.pdf");
    }

    #[test]
    fn test_more_parts_wire_names() {
        let last: MoreParts = serde_json::from_value(json!("lastPartInFile")).expect("parse");
        let pending: MoreParts =
            serde_json::from_value(json!("lastPartInFileMorePartsPending")).expect("parse");
        let short: MoreParts = serde_json::from_value(json!("lastPart")).expect("parse");

        assert_eq!(last, MoreParts::LastPart);
        assert_eq!(short, MoreParts::LastPart);
        assert_eq!(pending, MoreParts::LastPartMorePartsPending);
        assert!(pending.ends_file());
    }

    #[test]
    fn test_missing_address() {
        let err = BlockAddress::from_metadata(&json!({"image": {}})).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }
}
