//! Protocol requests over either transport.
//!
//! A [`ScannerChannel`] issues one session command and returns exactly one
//! reply or one error, hiding how the reply travels:
//!
//! | Channel | Submission | Reply |
//! |---------|------------|-------|
//! | [`LocalChannel`] | `POST <scanner>/privet/twaindirect/session` | HTTP response body |
//! | [`CloudChannel`] | `POST <api>/scanners/<id>/twaindirect/session` | Relay message with the same `commandId` |
//!
//! Both send the privet token obtained from `infoex` as `X-Privet-Token`.
//! The cloud channel also sends the account's access token as
//! `Authorization` and retries once after a token refresh on 401.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};
use url::Url;

use crate::cloud::{CommandRouter, TokenBroker, send_authorized};
use crate::error::{Error, Result};
use crate::protocol::{Command, InfoEx, Request, Response};
use crate::transport::{HttpClient, HttpRequest, HttpResponse, TransportOptions, append_path};

// ============================================================================
// Constants
// ============================================================================

/// Header carrying the privet token.
pub const PRIVET_TOKEN_HEADER: &str = "X-Privet-Token";

const INFOEX_PATH: &str = "privet/infoex";
const SESSION_PATH: &str = "privet/twaindirect/session";
const CLOUD_SESSION_PATH: &str = "twaindirect/session";

// ============================================================================
// ScannerChannel
// ============================================================================

/// Issues session commands to one scanner.
#[async_trait]
pub trait ScannerChannel: Send + Sync {
    /// Fetches device info and remembers its privet token.
    async fn info_ex(&self) -> Result<InfoEx>;

    /// Sends one command and returns the scanner's reply.
    ///
    /// The reply is returned whatever its `success` flag; callers use
    /// [`Response::into_results`].
    async fn send(&self, command: Command) -> Result<Response>;

    /// Fails anything waiting on a reply. Called on session teardown.
    fn teardown(&self) {}
}

/// Picks the timeout for a command.
fn command_timeout(command: &Command, options: &TransportOptions) -> Duration {
    match command {
        Command::WaitForEvents { .. } => options.events_timeout,
        Command::ReadImageBlock { .. } => options.block_read_timeout,
        _ => options.read_timeout,
    }
}

// ============================================================================
// LocalChannel
// ============================================================================

/// Talks to a scanner directly over HTTP(S).
pub struct LocalChannel {
    http: Arc<dyn HttpClient>,
    base: Url,
    options: TransportOptions,
    privet_token: Mutex<String>,
}

impl LocalChannel {
    /// Creates a channel to the scanner at `base`.
    #[must_use]
    pub fn new(http: Arc<dyn HttpClient>, base: Url, options: TransportOptions) -> Self {
        Self {
            http,
            base,
            options,
            privet_token: Mutex::new(String::new()),
        }
    }

    /// Returns the transport options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Posts a command and returns the raw HTTP response.
    ///
    /// Used directly for block reads, whose reply is multipart.
    ///
    /// # Errors
    ///
    /// Returns a transport error, or [`Error::HttpStatus`] for a non-200 reply.
    pub async fn post(&self, command: Command) -> Result<HttpResponse> {
        let timeout = command_timeout(&command, &self.options);
        let request = Request::new(command);
        let method = request.method();
        let url = append_path(&self.base, SESSION_PATH);

        trace!(method, command_id = %request.command_id, "Sending session command");

        let token = self.privet_token.lock().clone();
        let http_request =
            HttpRequest::post_json(url, &request, timeout)?.header(PRIVET_TOKEN_HEADER, token);

        self.http.execute(http_request).await?.error_for_status()
    }
}

#[async_trait]
impl ScannerChannel for LocalChannel {
    async fn info_ex(&self) -> Result<InfoEx> {
        let url = append_path(&self.base, INFOEX_PATH);
        let request = HttpRequest::get(url, self.options.read_timeout).header(PRIVET_TOKEN_HEADER, "");

        let info: InfoEx = self.http.execute(request).await?.error_for_status()?.json()?;
        *self.privet_token.lock() = info.privet_token.clone();

        debug!(name = ?info.name, "Received scanner infoex");
        Ok(info)
    }

    async fn send(&self, command: Command) -> Result<Response> {
        let response = self.post(command).await?;
        Response::from_slice(&response.body)
    }
}

// ============================================================================
// CloudChannel
// ============================================================================

/// Talks to a scanner through the cloud relay.
pub struct CloudChannel {
    http: Arc<dyn HttpClient>,
    scanner_url: Url,
    broker: TokenBroker,
    router: CommandRouter,
    options: TransportOptions,
    privet_token: Mutex<String>,
}

impl CloudChannel {
    /// Creates a channel to the relayed scanner at `scanner_url`
    /// (`<api>/scanners/<id>`).
    #[must_use]
    pub fn new(
        http: Arc<dyn HttpClient>,
        scanner_url: Url,
        broker: TokenBroker,
        router: CommandRouter,
        options: TransportOptions,
    ) -> Self {
        Self {
            http,
            scanner_url,
            broker,
            router,
            options,
            privet_token: Mutex::new(String::new()),
        }
    }

    /// Returns the transport options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Fetches a URL with the account's access token.
    ///
    /// Used for the second step of a relayed block read.
    ///
    /// # Errors
    ///
    /// Returns a transport error, [`Error::HttpStatus`] for a non-200 reply,
    /// or the refresh/retry failure on 401.
    pub async fn get_authorized(&self, url: Url, timeout: Duration) -> Result<HttpResponse> {
        send_authorized(&self.broker, |token| {
            let request = HttpRequest::get(url.clone(), timeout).header("Authorization", token);
            async move { self.http.execute(request).await?.error_for_status() }
        })
        .await
    }

    /// Submits a request, retrying once after a token refresh on 401.
    async fn submit(&self, request: HttpRequest) -> Result<()> {
        send_authorized(&self.broker, |token| {
            let request = request.clone().header("Authorization", token);
            async move {
                self.http.execute(request).await?.error_for_status()?;
                Ok(())
            }
        })
        .await
    }
}

#[async_trait]
impl ScannerChannel for CloudChannel {
    async fn info_ex(&self) -> Result<InfoEx> {
        let registration = self.router.register(None)?;

        let url = append_path(&self.scanner_url, INFOEX_PATH);
        let request =
            HttpRequest::get(url, self.options.read_timeout).header(PRIVET_TOKEN_HEADER, "");
        self.submit(request).await?;

        let body = registration.wait(self.options.read_timeout).await?;
        let info: InfoEx = serde_json::from_value(body)
            .map_err(|e| Error::protocol(format!("Malformed infoex reply: {e}")))?;
        *self.privet_token.lock() = info.privet_token.clone();

        debug!(name = ?info.name, "Received relayed scanner infoex");
        Ok(info)
    }

    async fn send(&self, command: Command) -> Result<Response> {
        let timeout = command_timeout(&command, &self.options);
        let request = Request::new(command);
        let method = request.method();
        let registration = self.router.register(Some(request.command_id))?;

        trace!(method, command_id = %request.command_id, "Submitting relayed command");

        let url = append_path(&self.scanner_url, CLOUD_SESSION_PATH);
        let token = self.privet_token.lock().clone();
        let http_request =
            HttpRequest::post_json(url, &request, timeout)?.header(PRIVET_TOKEN_HEADER, token);
        self.submit(http_request).await?;

        let body = registration.wait(timeout).await?;
        Response::from_value(body)
    }

    fn teardown(&self) {
        self.router.teardown();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{Value, json};

    use crate::cloud::{TokenEndpoint, TokenPair};
    use crate::identifiers::SessionId;

    /// Scanner fake that answers every request from a script.
    struct ScriptedHttp {
        requests: Mutex<Vec<HttpRequest>>,
        replies: Mutex<Vec<HttpResponse>>,
        router: Option<CommandRouter>,
    }

    impl ScriptedHttp {
        fn new(replies: Vec<HttpResponse>, router: Option<CommandRouter>) -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                replies: Mutex::new(replies),
                router,
            })
        }
    }

    #[async_trait]
    impl HttpClient for ScriptedHttp {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
            let reply = self.replies.lock().remove(0);

            // Relay the scanner's answer once the submission is accepted.
            if reply.status == 200
                && let Some(router) = &self.router
                && let Some(body) = &request.body
            {
                let sent: Value = serde_json::from_slice(body).expect("request json");
                let relayed = json!({
                    "commandId": sent["commandId"],
                    "method": sent["method"],
                    "results": {
                        "success": true,
                        "session": {"sessionId": "s1", "revision": 1, "state": "ready"}
                    }
                });
                let envelope = json!({"statusCode": 200, "body": relayed.to_string()});
                router.dispatch(envelope.to_string().as_bytes());
            }

            self.requests.lock().push(request);
            Ok(reply)
        }
    }

    fn reply(status: u16, body: Value) -> HttpResponse {
        HttpResponse {
            status,
            headers: vec![("content-type".into(), "application/json".into())],
            body: body.to_string().into_bytes(),
        }
    }

    struct CountingEndpoint {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenEndpoint for CountingEndpoint {
        async fn refresh(&self, _tokens: &TokenPair) -> Result<TokenPair> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(TokenPair::new("fresh-access", "fresh-refresh"))
        }
    }

    fn header<'a>(request: &'a HttpRequest, name: &str) -> Option<&'a str> {
        request
            .headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    #[tokio::test]
    async fn test_local_info_ex_then_session_request_carries_token() {
        let http = ScriptedHttp::new(
            vec![
                reply(200, json!({"x-privet-token": "tok123", "name": "Scanner"})),
                reply(
                    200,
                    json!({
                        "results": {
                            "success": true,
                            "session": {"sessionId": "s1", "revision": 1, "state": "ready"}
                        }
                    }),
                ),
            ],
            None,
        );
        let channel = LocalChannel::new(
            http.clone(),
            Url::parse("https://scanner.local:34034/").expect("url"),
            TransportOptions::local(),
        );

        channel.info_ex().await.expect("infoex");
        let response = channel.send(Command::CreateSession {}).await.expect("send");
        assert!(response.results.success);

        let requests = http.requests.lock();
        assert_eq!(
            requests[0].url.as_str(),
            "https://scanner.local:34034/privet/infoex"
        );
        assert_eq!(header(&requests[0], PRIVET_TOKEN_HEADER), Some(""));
        assert_eq!(
            requests[1].url.as_str(),
            "https://scanner.local:34034/privet/twaindirect/session"
        );
        assert_eq!(header(&requests[1], PRIVET_TOKEN_HEADER), Some("tok123"));
    }

    #[tokio::test]
    async fn test_local_non_200_is_error() {
        let http = ScriptedHttp::new(vec![reply(500, json!({}))], None);
        let channel = LocalChannel::new(
            http,
            Url::parse("https://scanner.local/").expect("url"),
            TransportOptions::local(),
        );

        let err = channel
            .send(Command::StartCapturing {
                session_id: SessionId::new("s1"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HttpStatus { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_cloud_401_refresh_then_retry_succeeds() {
        let router = CommandRouter::new();
        let http = ScriptedHttp::new(
            vec![reply(401, json!({"message": "expired"})), reply(200, json!({}))],
            Some(router.clone()),
        );
        let endpoint = Arc::new(CountingEndpoint {
            calls: AtomicUsize::new(0),
        });
        let broker = TokenBroker::new(TokenPair::new("stale-access", "refresh"), endpoint.clone());
        let channel = CloudChannel::new(
            http.clone(),
            Url::parse("https://api.example.com/dev/scanners/abc").expect("url"),
            broker,
            router.clone(),
            TransportOptions::cloud(),
        );

        let response = channel.send(Command::CreateSession {}).await.expect("send");
        let results = response.into_results("createSession").expect("success");
        assert_eq!(
            results.session.expect("session").session_id.as_str(),
            "s1"
        );

        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
        assert_eq!(router.pending_count(), 0);

        let requests = http.requests.lock();
        assert_eq!(requests.len(), 2);
        assert_eq!(header(&requests[0], "Authorization"), Some("stale-access"));
        assert_eq!(header(&requests[1], "Authorization"), Some("fresh-access"));
        assert_eq!(
            requests[1].url.as_str(),
            "https://api.example.com/dev/scanners/abc/twaindirect/session"
        );
    }

    #[tokio::test]
    async fn test_cloud_reply_timeout() {
        let router = CommandRouter::new();
        // No router on the fake: the relay never answers.
        let http = ScriptedHttp::new(vec![reply(200, json!({}))], None);
        let broker = TokenBroker::new(
            TokenPair::new("a", "r"),
            Arc::new(CountingEndpoint {
                calls: AtomicUsize::new(0),
            }),
        );
        let channel = CloudChannel::new(
            http,
            Url::parse("https://api.example.com/scanners/abc").expect("url"),
            broker,
            router.clone(),
            TransportOptions::cloud().with_read_timeout(Duration::from_millis(20)),
        );

        let err = channel.send(Command::CreateSession {}).await.unwrap_err();
        assert!(matches!(err, Error::RequestTimeout { .. }));
        assert_eq!(router.pending_count(), 0);
    }

    #[test]
    fn test_command_timeouts() {
        let options = TransportOptions::cloud();
        let session_id = SessionId::new("s1");
        assert_eq!(
            command_timeout(
                &Command::ReadImageBlock {
                    session_id: session_id.clone(),
                    image_block_num: 1,
                    with_metadata: true,
                },
                &options
            ),
            Duration::from_secs(120)
        );
        assert_eq!(
            command_timeout(
                &Command::WaitForEvents {
                    session_id,
                    session_revision: 0,
                },
                &options
            ),
            options.events_timeout
        );
    }
}
