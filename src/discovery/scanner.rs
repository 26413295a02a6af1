//! Scanner descriptors.
//!
//! A descriptor is what discovery hands the client: where the scanner's
//! TWAIN Direct endpoint lives, the address its `.local` name resolves to,
//! and the service record it advertised. Descriptors persist as a flat
//! JSON object:
//!
//! ```json
//! {
//!   "url": "https://scanner.local:34034/",
//!   "fqdn": "scanner.local",
//!   "ipaddr": "192.168.1.20",
//!   "txt": { "ty": "Office Scanner", "type": "twaindirect", "https": "1" }
//! }
//! ```
//!
//! Cloud-relayed scanners add a `cloud` object naming the API root and the
//! scanner's cloud ID.

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::transport::append_path;

// ============================================================================
// Reachability
// ============================================================================

/// How a scanner is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reachability {
    /// Directly on the local network.
    Local,
    /// Through the cloud relay.
    Cloud,
}

// ============================================================================
// TxtRecord
// ============================================================================

/// The scanner's advertised service record.
///
/// Well-known keys are typed; anything else is kept verbatim in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxtRecord {
    /// Friendly name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ty: Option<String>,

    /// Free-form note, often the location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,

    /// Service type, `twaindirect` for TWAIN Direct scanners.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,

    /// Cloud registration ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Cloud connection state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cs: Option<String>,

    /// `1` when the endpoint is served over HTTPS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https: Option<String>,

    /// Record version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txtvers: Option<String>,

    /// Keys without a typed field.
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl TxtRecord {
    /// Builds a record from raw discovery key/value pairs.
    #[must_use]
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut record = Self::default();
        for (key, value) in pairs {
            let key = key.into();
            let value = value.into();
            let slot = match key.as_str() {
                "ty" => Some(&mut record.ty),
                "note" => Some(&mut record.note),
                "type" => Some(&mut record.service_type),
                "id" => Some(&mut record.id),
                "cs" => Some(&mut record.cs),
                "https" => Some(&mut record.https),
                "txtvers" => Some(&mut record.txtvers),
                _ => None,
            };
            match slot {
                Some(slot) => *slot = Some(value),
                None => {
                    record.extra.insert(key, value);
                }
            }
        }
        record
    }

    /// Returns `true` if the scanner advertises an HTTPS endpoint.
    #[inline]
    #[must_use]
    pub fn uses_https(&self) -> bool {
        self.https.as_deref() == Some("1")
    }
}

// ============================================================================
// CloudTarget
// ============================================================================

/// Where a cloud-relayed scanner lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudTarget {
    /// Cloud API root.
    pub api_root: Url,
    /// Scanner ID within the cloud account.
    pub scanner_id: String,
}

// ============================================================================
// ScannerDescriptor
// ============================================================================

/// Everything needed to open a session with one scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannerDescriptor {
    /// TWAIN Direct endpoint.
    pub url: Url,

    /// Host name, usually a `.local` name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fqdn: Option<String>,

    /// Address the host name resolves to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipaddr: Option<IpAddr>,

    /// Advertised service record.
    #[serde(default)]
    pub txt: TxtRecord,

    /// Relay location for cloud scanners.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud: Option<CloudTarget>,
}

impl ScannerDescriptor {
    /// Describes a scanner reached directly.
    #[must_use]
    pub fn local(url: Url, ipaddr: Option<IpAddr>) -> Self {
        let fqdn = url.host_str().map(str::to_string);
        Self {
            url,
            fqdn,
            ipaddr,
            txt: TxtRecord::default(),
            cloud: None,
        }
    }

    /// Describes a scanner reached through the cloud relay.
    #[must_use]
    pub fn cloud(api_root: Url, scanner_id: impl Into<String>) -> Self {
        let scanner_id = scanner_id.into();
        let url = append_path(&api_root, &format!("scanners/{scanner_id}"));
        Self {
            url,
            fqdn: None,
            ipaddr: None,
            txt: TxtRecord::default(),
            cloud: Some(CloudTarget {
                api_root,
                scanner_id,
            }),
        }
    }

    /// Sets the service record.
    #[inline]
    #[must_use]
    pub fn with_txt(mut self, txt: TxtRecord) -> Self {
        self.txt = txt;
        self
    }

    /// Returns how the scanner is reached.
    #[inline]
    #[must_use]
    pub fn reachability(&self) -> Reachability {
        if self.cloud.is_some() {
            Reachability::Cloud
        } else {
            Reachability::Local
        }
    }

    /// Returns the advertised friendly name.
    #[inline]
    #[must_use]
    pub fn friendly_name(&self) -> Option<&str> {
        self.txt.ty.as_deref()
    }

    /// Serializes the descriptor for storage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Restores a descriptor saved with [`to_json`](Self::to_json).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the text is not a valid descriptor.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::config(format!("Invalid scanner descriptor: {e}")))
    }
}

// ============================================================================
// Tests
// ============================================================================
