//! Request and Response message types.
//!
//! Defines the JSON body posted to the session endpoint and the reply the
//! scanner returns, either directly over HTTP or through the cloud relay.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::CommandId;

use super::Command;
use super::event::{ScannerEvent, SessionInfo};

// ============================================================================
// Constants
// ============================================================================

/// Value of `kind` in every session request.
pub const REQUEST_KIND: &str = "twainlocalscanner";

/// Code reported when the scanner omits one on failure.
const UNKNOWN_CODE: &str = "unknown";

// ============================================================================
// Request
// ============================================================================

/// A session request.
///
/// # Format
///
/// ```json
/// {
///   "kind": "twainlocalscanner",
///   "commandId": "uuid",
///   "method": "startCapturing",
///   "params": { "sessionId": "..." }
/// }
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    /// Always `twainlocalscanner`.
    pub kind: &'static str,

    /// Unique identifier for request/response correlation.
    #[serde(rename = "commandId")]
    pub command_id: CommandId,

    /// Command with method and params.
    #[serde(flatten)]
    pub command: Command,
}

impl Request {
    /// Creates a new request with auto-generated ID.
    #[inline]
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self::with_id(CommandId::generate(), command)
    }

    /// Creates a new request with specific ID.
    #[inline]
    #[must_use]
    pub fn with_id(command_id: CommandId, command: Command) -> Self {
        Self {
            kind: REQUEST_KIND,
            command_id,
            command,
        }
    }

    /// Returns the wire method name.
    #[inline]
    #[must_use]
    pub fn method(&self) -> &'static str {
        self.command.method()
    }
}

// ============================================================================
// Response
// ============================================================================

/// A scanner reply.
///
/// # Format
///
/// ```json
/// {
///   "kind": "twainlocalscanner",
///   "commandId": "uuid",
///   "method": "startCapturing",
///   "results": {
///     "success": true,
///     "session": { ... }
///   }
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Echoed request kind.
    #[serde(default)]
    pub kind: Option<String>,

    /// Echoed correlation ID.
    #[serde(default)]
    pub command_id: Option<String>,

    /// Echoed method name.
    #[serde(default)]
    pub method: Option<String>,

    /// Outcome.
    pub results: Results,
}

impl Response {
    /// Parses a response from raw JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the body is not a session response.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map_err(|e| Error::protocol(format!("Malformed session response: {e}")))
    }

    /// Parses a response from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the value is not a session response.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| Error::protocol(format!("Malformed session response: {e}")))
    }

    /// Unwraps the results, turning `success: false` into an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Scanner`] carrying the scanner's failure code.
    pub fn into_results(self, method: &str) -> Result<Results> {
        if self.results.success {
            Ok(self.results)
        } else {
            let code = self
                .results
                .code
                .unwrap_or_else(|| UNKNOWN_CODE.to_string());
            Err(Error::scanner(method, code))
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// The `results` object of a reply.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Results {
    /// Whether the command succeeded.
    pub success: bool,

    /// Failure code when `success` is `false`.
    #[serde(default)]
    pub code: Option<String>,

    /// Session snapshot.
    #[serde(default)]
    pub session: Option<SessionInfo>,

    /// Events returned by `waitForEvents`.
    #[serde(default)]
    pub events: Vec<ScannerEvent>,

    /// Block metadata returned by `readImageBlock` through the relay.
    #[serde(default)]
    pub metadata: Option<Value>,

    /// Where to fetch the block bytes through the relay.
    #[serde(default)]
    pub image_block_url: Option<String>,
}

impl Results {
    /// Returns the session snapshot or a protocol error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the reply carries no session.
    pub fn require_session(&self, method: &str) -> Result<&SessionInfo> {
        self.session
            .as_ref()
            .ok_or_else(|| Error::protocol(format!("{method} reply has no session")))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::identifiers::SessionId;
    use crate::session::SessionState;

    #[test]
    fn test_request_serialization() {
        let id = CommandId::generate();
        let request = Request::with_id(
            id,
            Command::StartCapturing {
                session_id: SessionId::new("s1"),
            },
        );

        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(value["kind"], "twainlocalscanner");
        assert_eq!(value["commandId"], id.to_string());
        assert_eq!(value["method"], "startCapturing");
        assert_eq!(value["params"]["sessionId"], "s1");
    }

    #[test]
    fn test_success_response() {
        let response = Response::from_value(json!({
            "kind": "twainlocalscanner",
            "commandId": "c1",
            "method": "createSession",
            "results": {
                "success": true,
                "session": {"sessionId": "s1", "revision": 1, "state": "ready"}
            }
        }))
        .expect("parse");

        let results = response.into_results("createSession").expect("success");
        let session = results.require_session("createSession").expect("session");
        assert_eq!(session.state, SessionState::Ready);
    }

    #[test]
    fn test_failure_response_maps_code() {
        let response = Response::from_value(json!({
            "results": {"success": false, "code": "invalidSessionId"}
        }))
        .expect("parse");

        match response.into_results("startCapturing") {
            Err(Error::Scanner { method, code }) => {
                assert_eq!(method, "startCapturing");
                assert_eq!(code, "invalidSessionId");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_response() {
        let err = Response::from_slice(b"{\"nope\": 1}").unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn test_cloud_block_results() {
        let response = Response::from_value(json!({
            "results": {
                "success": true,
                "metadata": {"address": {"sheetNumber": 1}},
                "imageBlockUrl": "https://blocks.example.com/1"
            }
        }))
        .expect("parse");

        let results = response.into_results("readImageBlock").expect("success");
        assert!(results.metadata.is_some());
        assert_eq!(
            results.image_block_url.as_deref(),
            Some("https://blocks.example.com/1")
        );
        assert!(results.require_session("readImageBlock").is_err());
    }
}
