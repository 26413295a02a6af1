//! Correlation of relay-delivered replies with the requests that caused
//! them.
//!
//! In cloud mode the HTTP submission only acknowledges a command; the real
//! reply is published later to the account's MQTT topic. Each request
//! registers its command ID before submitting, and [`CommandRouter::dispatch`]
//! hands each inbound payload to the first registration with the same ID.
//!
//! # Envelope
//!
//! ```json
//! {
//!   "headers": { "content-type": "application/json; charset=UTF-8" },
//!   "statusCode": 200,
//!   "statusDescription": null,
//!   "body": "{\"commandId\":\"...\",\"results\":{...}}"
//! }
//! ```
//!
//! A body without `commandId` matches a registration made without one;
//! `privet/infoex` replies arrive that way.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::CommandId;

// ============================================================================
// Constants
// ============================================================================

/// Maximum pending registrations before rejecting new ones.
const MAX_PENDING_COMMANDS: usize = 100;

// ============================================================================
// Types
// ============================================================================

/// Called when the event broker link drops.
pub type ConnectionLostHandler = Box<dyn Fn(&str) + Send + Sync>;

/// One registration awaiting its reply.
struct PendingCommand {
    slot: u64,
    command_id: Option<CommandId>,
    reply_tx: oneshot::Sender<Result<Value>>,
}

/// Outer wrapper of a relay message.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(default)]
    status_code: Option<u16>,
    #[serde(default)]
    status_description: Option<String>,
    #[serde(default)]
    body: Option<String>,
}

// ============================================================================
// CommandRouter
// ============================================================================

struct RouterInner {
    pending: Mutex<Vec<PendingCommand>>,
    next_slot: AtomicU64,
    closed: AtomicBool,
    lost_handler: Mutex<Option<ConnectionLostHandler>>,
}

/// Routes relay replies to pending requests.
///
/// Cheap to clone; clones share registrations.
#[derive(Clone)]
pub struct CommandRouter {
    inner: Arc<RouterInner>,
}

impl fmt::Debug for CommandRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRouter")
            .field("pending", &self.pending_count())
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl Default for CommandRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRouter {
    /// Creates a router with no registrations.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RouterInner {
                pending: Mutex::new(Vec::new()),
                next_slot: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                lost_handler: Mutex::new(None),
            }),
        }
    }

    /// Registers interest in the reply to `command_id`.
    ///
    /// Register before submitting the command so a fast reply is not lost.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the link has been lost
    /// - [`Error::Protocol`] if too many registrations are pending
    pub fn register(&self, command_id: Option<CommandId>) -> Result<Registration> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let slot = self.inner.next_slot.fetch_add(1, Ordering::Relaxed);

        {
            let mut pending = self.inner.pending.lock();
            if pending.len() >= MAX_PENDING_COMMANDS {
                warn!(
                    pending = pending.len(),
                    max = MAX_PENDING_COMMANDS,
                    "Too many pending commands"
                );
                return Err(Error::protocol(format!(
                    "Too many pending commands: {}/{}",
                    pending.len(),
                    MAX_PENDING_COMMANDS
                )));
            }
            pending.push(PendingCommand {
                slot,
                command_id,
                reply_tx,
            });
        }

        trace!(?command_id, slot, "Registered pending command");
        Ok(Registration {
            router: self.clone(),
            slot,
            command_id,
            reply_rx,
        })
    }

    /// Delivers one relay payload.
    ///
    /// Malformed or unmatched payloads are logged and dropped.
    pub fn dispatch(&self, payload: &[u8]) {
        let envelope: Envelope = match serde_json::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Failed to parse relay envelope");
                return;
            }
        };

        let Some(body_text) = envelope.body else {
            warn!("Relay envelope has no body");
            return;
        };

        let body: Value = match serde_json::from_str(&body_text) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Failed to parse relay body");
                return;
            }
        };
        trace!(body = %body_text, "Relay message");

        let body_id = body.get("commandId").and_then(Value::as_str);

        let matched = {
            let mut pending = self.inner.pending.lock();
            pending
                .iter()
                .position(|p| keys_match(p.command_id, body_id))
                .map(|index| pending.remove(index))
        };

        let Some(matched) = matched else {
            warn!(command_id = ?body_id, "Relay message with no registered listener");
            return;
        };

        let result = match envelope.status_code {
            Some(status) if status != 200 => Err(Error::http_status(
                status,
                envelope
                    .status_description
                    .unwrap_or_else(|| "relay error".to_string()),
            )),
            _ => Ok(body),
        };

        debug!(command_id = ?matched.command_id, "Delivering relay reply");
        let _ = matched.reply_tx.send(result);
    }

    /// Returns the number of pending registrations.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Sets the handler called when the link drops.
    pub fn set_lost_handler(&self, handler: ConnectionLostHandler) {
        *self.inner.lost_handler.lock() = Some(handler);
    }

    /// Handles loss of the event broker link.
    ///
    /// Fails every pending registration and refuses new ones.
    pub fn connection_lost(&self, reason: &str) {
        self.inner.closed.store(true, Ordering::Release);
        self.fail_pending();

        if let Some(handler) = self.inner.lost_handler.lock().as_ref() {
            handler(reason);
        }
    }

    /// Fails every pending registration with [`Error::ConnectionClosed`].
    pub fn teardown(&self) {
        self.fail_pending();
    }

    fn fail_pending(&self) {
        let pending: Vec<_> = self.inner.pending.lock().drain(..).collect();
        let count = pending.len();

        for command in pending {
            let _ = command.reply_tx.send(Err(Error::ConnectionClosed));
        }

        if count > 0 {
            debug!(count, "Failed pending commands");
        }
    }

    fn remove(&self, slot: u64) {
        self.inner.pending.lock().retain(|p| p.slot != slot);
    }
}

fn keys_match(registered: Option<CommandId>, received: Option<&str>) -> bool {
    match (registered, received) {
        (None, None) => true,
        (Some(id), Some(text)) => CommandId::parse(text) == Some(id),
        _ => false,
    }
}

// ============================================================================
// Registration
// ============================================================================

/// A pending reply slot.
///
/// Dropping the registration removes it from the router.
pub struct Registration {
    router: CommandRouter,
    slot: u64,
    command_id: Option<CommandId>,
    reply_rx: oneshot::Receiver<Result<Value>>,
}

impl Registration {
    /// Waits for the reply body.
    ///
    /// # Errors
    ///
    /// - [`Error::RequestTimeout`] if nothing arrives within `wait_for`
    /// - [`Error::ConnectionClosed`] if the router was torn down
    /// - [`Error::HttpStatus`] if the relay reported a failure status
    pub async fn wait(mut self, wait_for: Duration) -> Result<Value> {
        let timeout_ms = wait_for.as_millis() as u64;

        match timeout(wait_for, &mut self.reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                warn!(command_id = ?self.command_id, timeout_ms, "Relay reply timed out");
                Err(match self.command_id {
                    Some(id) => Error::request_timeout(id, timeout_ms),
                    None => Error::connection_timeout(timeout_ms),
                })
            }
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.router.remove(self.slot);
    }
}

// ============================================================================
// Tests
// ============================================================================
