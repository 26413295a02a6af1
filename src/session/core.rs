//! Session handle and its driver task.
//!
//! A [`Session`] is a cheap handle; the protocol conversation itself runs in
//! a driver task that owns all session state. Lifecycle calls are sent to
//! the driver as commands and answered through a oneshot reply, so at most
//! one lifecycle request is outstanding per session and every call returns
//! exactly one result.
//!
//! The driver also consumes:
//!
//! - snapshots from the `waitForEvents` long-poll task, and
//! - per-block outcomes from the [`BlockDownloader`].
//!
//! Everything the consumer did not directly ask for arrives as a
//! [`SessionEvent`] on the receiver returned from the constructor.
//!
//! # Lifecycle
//!
//! | Call | From | To |
//! |------|------|----|
//! | [`Session::open`] | `noSession` | `ready` |
//! | [`Session::send_task`] | `ready` | `ready` |
//! | [`Session::start_capturing`] | `ready` | `capturing` |
//! | [`Session::stop`] | `capturing` | `draining` |
//! | [`Session::close`] | `ready` | `closed` |
//! | [`Session::close`] | `capturing`, `draining` | `draining`, then `closed` once drained |
//!
//! A connection or protocol failure at any point moves the session to
//! `noSession` and emits [`SessionEvent::ConnectionError`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::discovery::{Reachability, ScannerDescriptor};
use crate::error::{Error, Result};
use crate::identifiers::SessionId;
use crate::protocol::{Command, EventKind, Results, SessionInfo, Status};
use crate::transport::ReqwestClient;

use super::channel::{LocalChannel, ScannerChannel};
use super::downloader::{BlockDownloader, DownloadProgress};
use super::events::SessionEvent;
use super::fetcher::{BlockFetcher, LocalBlockFetcher};
use super::options::SessionOptions;
use super::state::SessionState;

// ============================================================================
// Types
// ============================================================================

type Reply<T> = oneshot::Sender<Result<T>>;

/// Lifecycle request sent to the driver.
enum DriverCommand {
    Open(Reply<SessionId>),
    SendTask(Value, Reply<Value>),
    StartCapturing(Reply<()>),
    Stop(Reply<()>),
    Close(Reply<()>),
}

/// Output of the long-poll task.
enum PollOutcome {
    Session(SessionInfo),
    Failed(Error),
}

/// State visible from the handle without a round trip.
#[derive(Debug, Default)]
struct Snapshot {
    state: SessionState,
    session_id: Option<SessionId>,
}

// ============================================================================
// Session
// ============================================================================

struct SessionInner {
    command_tx: mpsc::UnboundedSender<DriverCommand>,
    snapshot: Arc<Mutex<Snapshot>>,
}

/// Handle to one scanning session.
///
/// Cheap to clone; clones drive the same session. The driver task ends
/// when the last handle is dropped, removing any private temp directory.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("session_id", &self.session_id())
            .finish()
    }
}

impl Session {
    /// Creates a session over `channel`, fetching blocks with `fetcher`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `options` are invalid.
    pub fn new(
        channel: Arc<dyn ScannerChannel>,
        fetcher: Arc<dyn BlockFetcher>,
        options: SessionOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        options.validate().map_err(Error::config)?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        let snapshot = Arc::new(Mutex::new(Snapshot::default()));

        let driver = Driver {
            channel,
            fetcher,
            options,
            snapshot: Arc::clone(&snapshot),
            events_tx,
            poll_tx,
            poll_rx,
            state: SessionState::NoSession,
            session_id: None,
            revision: 0,
            status: None,
            downloader: None,
            progress_rx: None,
            poll: None,
            scanner_done: false,
            scanner_drained: false,
            stop_requested: false,
            close_sent: false,
            private_dir: None,
        };
        tokio::spawn(driver.run(command_rx));

        let session = Self {
            inner: Arc::new(SessionInner {
                command_tx,
                snapshot,
            }),
        };
        Ok((session, events_rx))
    }

    /// Creates a session with a scanner on the local network.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the descriptor is cloud-relayed or options are invalid
    /// - [`Error::Http`] if the HTTP client cannot be built
    pub fn local(
        descriptor: &ScannerDescriptor,
        options: SessionOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        if descriptor.reachability() == Reachability::Cloud {
            return Err(Error::config(
                "scanner is reachable only through the cloud relay",
            ));
        }

        let http = ReqwestClient::for_endpoint(&options.transport, &descriptor.url, descriptor.ipaddr)?;
        let channel = Arc::new(LocalChannel::new(
            Arc::new(http),
            descriptor.url.clone(),
            options.transport.clone(),
        ));
        let fetcher = Arc::new(LocalBlockFetcher::new(Arc::clone(&channel)));

        Self::new(channel, fetcher, options)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.snapshot.lock().state
    }

    /// Scanner-assigned session ID, once open.
    #[inline]
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.snapshot.lock().session_id.clone()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Opens a session on the scanner.
    ///
    /// Fetches the privet token, then sends `createSession`. On failure the
    /// session stays in `noSession`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if a session is already open
    /// - Transport, protocol or scanner errors from the requests
    pub async fn open(&self) -> Result<SessionId> {
        self.request(DriverCommand::Open).await
    }

    /// Sends a task document and returns the scanner's task reply.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] unless the session is `ready`
    /// - [`Error::Scanner`] if the scanner rejects the task
    pub async fn send_task(&self, task: Value) -> Result<Value> {
        self.request(|reply| DriverCommand::SendTask(task, reply))
            .await
    }

    /// Starts capturing.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] unless the session is `ready`
    /// - Transport, protocol or scanner errors from the request
    pub async fn start_capturing(&self) -> Result<()> {
        self.request(DriverCommand::StartCapturing).await
    }

    /// Requests a graceful stop.
    ///
    /// Blocks not yet started are skipped; blocks in flight finish and are
    /// delivered. The session closes once they have settled and the scanner
    /// reports that capturing is done.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] unless the session is capturing
    pub async fn stop(&self) -> Result<()> {
        self.request(DriverCommand::Stop).await
    }

    /// Requests that the session be closed.
    ///
    /// Completion is signalled by [`SessionEvent::DoneCapturing`]; while
    /// capturing, outstanding blocks drain first.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if no session is open
    pub async fn close(&self) -> Result<()> {
        self.request(DriverCommand::Close).await
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> DriverCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .command_tx
            .send(make(reply_tx))
            .map_err(|_| Error::ConnectionClosed)?;
        reply_rx.await?
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Owns the session state; runs in its own task.
struct Driver {
    channel: Arc<dyn ScannerChannel>,
    fetcher: Arc<dyn BlockFetcher>,
    options: SessionOptions,
    snapshot: Arc<Mutex<Snapshot>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    poll_tx: mpsc::UnboundedSender<PollOutcome>,
    poll_rx: mpsc::UnboundedReceiver<PollOutcome>,

    state: SessionState,
    session_id: Option<SessionId>,
    revision: u64,
    status: Option<Status>,
    downloader: Option<BlockDownloader>,
    progress_rx: Option<mpsc::UnboundedReceiver<DownloadProgress>>,
    poll: Option<JoinHandle<()>>,

    scanner_done: bool,
    scanner_drained: bool,
    stop_requested: bool,
    close_sent: bool,
    private_dir: Option<TempDir>,
}

impl Driver {
    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<DriverCommand>) {
        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            debug!("All session handles dropped");
                            break;
                        }
                    }
                }

                Some(outcome) = self.poll_rx.recv() => {
                    self.handle_poll(outcome).await;
                }

                Some(progress) = next_progress(&mut self.progress_rx) => {
                    self.handle_progress(progress).await;
                }
            }
        }

        self.shutdown();
    }

    async fn handle_command(&mut self, command: DriverCommand) {
        match command {
            DriverCommand::Open(reply) => {
                let result = self.open().await;
                let _ = reply.send(result);
            }
            DriverCommand::SendTask(task, reply) => {
                let result = self.send_task(task).await;
                let _ = reply.send(result);
            }
            DriverCommand::StartCapturing(reply) => {
                let result = self.start_capturing().await;
                let _ = reply.send(result);
            }
            DriverCommand::Stop(reply) => {
                let result = self.stop().await;
                let _ = reply.send(result);
            }
            DriverCommand::Close(reply) => {
                let result = self.close().await;
                let _ = reply.send(result);
            }
        }
    }

    // ========================================================================
    // Lifecycle Operations
    // ========================================================================

    async fn open(&mut self) -> Result<SessionId> {
        if self.state != SessionState::NoSession {
            return Err(Error::invalid_state("open", self.state));
        }

        let info = self.channel.info_ex().await?;
        debug!(name = ?info.name, "Opening session");

        let results = self
            .channel
            .send(Command::CreateSession {})
            .await?
            .into_results("createSession")?;
        let session = results.require_session("createSession")?.clone();
        let session_id = session.session_id.clone();

        let temp_dir = self.session_dir()?;
        let (downloader, progress_rx) = BlockDownloader::new(
            Arc::clone(&self.fetcher),
            session_id.clone(),
            temp_dir,
            self.options.window_size,
            self.events_tx.clone(),
        );

        self.session_id = Some(session_id.clone());
        self.revision = session.revision;
        self.downloader = Some(downloader);
        self.progress_rx = Some(progress_rx);
        self.scanner_done = false;
        self.scanner_drained = false;
        self.stop_requested = false;
        self.close_sent = false;
        self.set_state(SessionState::Ready);

        self.start_polling(session_id.clone());
        info!(%session_id, "Session open");
        Ok(session_id)
    }

    async fn send_task(&mut self, task: Value) -> Result<Value> {
        let session_id = self.require(SessionState::Ready, "sendTask")?;

        let results = self
            .lifecycle(Command::SendTask { session_id, task })
            .await?;
        let reply = results
            .session
            .and_then(|session| session.task)
            .unwrap_or(Value::Null);

        debug!("Task accepted");
        Ok(reply)
    }

    async fn start_capturing(&mut self) -> Result<()> {
        let session_id = self.require(SessionState::Ready, "startCapturing")?;

        let results = self
            .lifecycle(Command::StartCapturing { session_id })
            .await?;
        self.set_state(SessionState::Capturing);
        // Blocks announced with the reply.
        if let Some(session) = &results.session {
            self.apply_session(session);
        }

        info!("Capturing");
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if self.state == SessionState::Draining && self.stop_requested {
            return Ok(());
        }
        let session_id = self.require(SessionState::Capturing, "stop")?;

        self.stop_requested = true;
        if let Some(downloader) = &self.downloader {
            downloader.stop();
        }
        self.set_state(SessionState::Draining);

        self.lifecycle(Command::StopCapturing { session_id })
            .await?;
        self.check_done().await;

        info!("Stop requested");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let Some(session_id) = self.session_id.clone().filter(|_| self.state.is_open()) else {
            return Err(Error::invalid_state("close", self.state));
        };

        if self.close_sent {
            return Ok(());
        }
        self.close_sent = true;

        self.lifecycle(Command::CloseSession { session_id })
            .await?;

        match self.state {
            SessionState::Ready => self.finish().await,
            SessionState::Capturing => {
                self.set_state(SessionState::Draining);
                self.check_done().await;
            }
            _ => self.check_done().await,
        }

        debug!("Close requested");
        Ok(())
    }

    /// Sends a lifecycle command and applies its snapshot.
    ///
    /// Connection and protocol failures also tear the session down.
    async fn lifecycle(&mut self, command: Command) -> Result<Results> {
        let method = command.method();

        let outcome = match self.channel.send(command).await {
            Ok(response) => response.into_results(method),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(results) => {
                if let Some(session) = &results.session {
                    self.apply_session(session);
                }
                Ok(results)
            }
            Err(e) => {
                if is_session_fatal(&e) {
                    self.fail(duplicate(&e));
                }
                Err(e)
            }
        }
    }

    fn require(&self, expected: SessionState, operation: &'static str) -> Result<SessionId> {
        match &self.session_id {
            Some(session_id) if self.state == expected => Ok(session_id.clone()),
            _ => Err(Error::invalid_state(operation, self.state)),
        }
    }

    // ========================================================================
    // Asynchronous Inputs
    // ========================================================================

    async fn handle_poll(&mut self, outcome: PollOutcome) {
        if !self.state.is_open() {
            return;
        }

        match outcome {
            PollOutcome::Session(session) => {
                trace!(revision = session.revision, "Session event");
                self.apply_session(&session);
                self.check_done().await;
            }
            PollOutcome::Failed(e) => self.fail(e),
        }
    }

    async fn handle_progress(&mut self, progress: DownloadProgress) {
        if !self.state.is_capturing() {
            return;
        }

        match progress {
            DownloadProgress::Downloaded(block) => {
                if let Some(session_id) = self.session_id.clone() {
                    // Connection and protocol failures end the session in `lifecycle`.
                    let release = Command::release_block(session_id, block);
                    if let Err(e) = self.lifecycle(release).await {
                        if self.state.is_open() {
                            warn!(block, error = %e, "Scanner rejected block release");
                        } else {
                            debug!(block, error = %e, "Block release failed; session ended");
                        }
                    }
                }
                if self.state.is_capturing() {
                    self.check_done().await;
                }
            }
            DownloadProgress::Failed { block, error } => {
                error!(block, error = %error, "Block download failed; ending session");
                self.fail(error);
            }
        }
    }

    /// Folds a scanner snapshot into local state.
    fn apply_session(&mut self, session: &SessionInfo) {
        self.revision = self.revision.max(session.revision);

        if let Some(status) = &session.status
            && self.status.as_ref() != Some(status)
        {
            if !status.success {
                warn!(detected = %status.detected, "Scanner reported a condition");
            }
            self.status = Some(status.clone());
            let _ = self
                .events_tx
                .send(SessionEvent::StatusChanged(status.clone()));
        }

        if !session.image_blocks.is_empty()
            && self.state.is_capturing()
            && let Some(downloader) = &self.downloader
        {
            downloader.enqueue(&session.image_blocks);
        }

        // Drained is only meaningful once the scanner is done.
        if session.done_capturing {
            self.scanner_done = true;
            self.scanner_drained = session.image_blocks_drained;
        }
    }

    // ========================================================================
    // Completion and Teardown
    // ========================================================================

    /// Closes the session once capture is finished and delivered.
    async fn check_done(&mut self) {
        if !self.state.is_capturing() {
            return;
        }
        let Some(downloader) = &self.downloader else {
            return;
        };

        // After a stop, blocks never started are not waited for.
        let done = if self.stop_requested {
            self.scanner_done && downloader.is_settled()
        } else {
            self.scanner_done && self.scanner_drained && downloader.is_drained()
        };

        if done {
            self.finish().await;
        }
    }

    async fn finish(&mut self) {
        self.stop_polling();
        self.set_state(SessionState::Closed);

        if !self.close_sent
            && let Some(session_id) = self.session_id.clone()
        {
            self.close_sent = true;
            match self.channel.send(Command::CloseSession { session_id }).await {
                Ok(_) => debug!("Scanner session closed"),
                Err(e) => warn!(error = %e, "Failed to close scanner session"),
            }
        }

        info!("Done capturing");
        let _ = self.events_tx.send(SessionEvent::DoneCapturing);
    }

    /// Tears the session down to `noSession` and reports `error`.
    fn fail(&mut self, error: Error) {
        error!(error = %error, state = %self.state, "Session failed");

        self.stop_polling();
        if let Some(downloader) = self.downloader.take() {
            downloader.stop();
        }
        self.progress_rx = None;
        self.channel.teardown();
        self.session_id = None;
        self.set_state(SessionState::NoSession);

        let _ = self.events_tx.send(SessionEvent::ConnectionError(error));
    }

    fn shutdown(&mut self) {
        self.stop_polling();
        if let Some(downloader) = self.downloader.take() {
            downloader.stop();
        }
        self.channel.teardown();
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!(from = %self.state, to = %state, "Session state changed");
        self.state = state;

        {
            let mut snapshot = self.snapshot.lock();
            snapshot.state = state;
            snapshot.session_id = self.session_id.clone();
        }
        let _ = self.events_tx.send(SessionEvent::StateChanged(state));
    }

    fn session_dir(&mut self) -> Result<PathBuf> {
        if let Some(dir) = &self.options.temp_dir {
            return Ok(dir.clone());
        }
        if let Some(dir) = &self.private_dir {
            return Ok(dir.path().to_path_buf());
        }

        let dir = tempfile::Builder::new().prefix("twain-direct-").tempdir()?;
        let path = dir.path().to_path_buf();
        debug!(path = %path.display(), "Created session temp dir");
        self.private_dir = Some(dir);
        Ok(path)
    }

    // ========================================================================
    // Long Poll
    // ========================================================================

    fn start_polling(&mut self, session_id: SessionId) {
        self.stop_polling();
        let channel = Arc::clone(&self.channel);
        let poll_tx = self.poll_tx.clone();
        let revision = self.revision;

        self.poll = Some(tokio::spawn(poll_events(
            channel, session_id, revision, poll_tx,
        )));
    }

    fn stop_polling(&mut self) {
        if let Some(poll) = self.poll.take() {
            poll.abort();
        }
    }
}

/// Issues `waitForEvents` until the driver stops listening or a request
/// fails. A long poll that times out is simply issued again.
async fn poll_events(
    channel: Arc<dyn ScannerChannel>,
    session_id: SessionId,
    mut revision: u64,
    poll_tx: mpsc::UnboundedSender<PollOutcome>,
) {
    loop {
        let command = Command::WaitForEvents {
            session_id: session_id.clone(),
            session_revision: revision,
        };

        let outcome = match channel.send(command).await {
            Ok(response) => response.into_results("waitForEvents"),
            Err(e) => Err(e),
        };

        let results = match outcome {
            Ok(results) => results,
            Err(e @ (Error::ConnectionTimeout { .. } | Error::RequestTimeout { .. })) => {
                trace!(error = %e, "Long poll timed out; polling again");
                continue;
            }
            Err(e) => {
                let _ = poll_tx.send(PollOutcome::Failed(e));
                return;
            }
        };

        let mut snapshots = Vec::new();
        for event in results.events {
            match event.event {
                EventKind::SessionTimedOut => {
                    let _ = poll_tx.send(PollOutcome::Failed(Error::SessionTimedOut));
                    return;
                }
                EventKind::Critical => {
                    let _ = poll_tx.send(PollOutcome::Failed(Error::protocol(
                        "Scanner reported a critical event",
                    )));
                    return;
                }
                EventKind::ImageBlocks | EventKind::Other(_) => {
                    snapshots.extend(event.session);
                }
            }
        }
        snapshots.extend(results.session);

        for session in snapshots {
            revision = revision.max(session.revision);
            if poll_tx.send(PollOutcome::Session(session)).is_err() {
                return;
            }
        }
    }
}

async fn next_progress(
    progress_rx: &mut Option<mpsc::UnboundedReceiver<DownloadProgress>>,
) -> Option<DownloadProgress> {
    match progress_rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Failures that end the session rather than just the request.
fn is_session_fatal(error: &Error) -> bool {
    error.is_connection_error() || matches!(error, Error::Protocol { .. } | Error::Json(_))
}

/// Copy of a fatal error for the event stream; the error itself goes to the caller.
fn duplicate(error: &Error) -> Error {
    match error {
        Error::Protocol { .. } | Error::Json(_) => Error::protocol(error.to_string()),
        _ => Error::connection(error.to_string()),
    }
}

// ============================================================================
// Tests
// ============================================================================
