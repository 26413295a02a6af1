//! Cloud account API and relayed session bootstrap.
//!
//! | Endpoint | Returns |
//! |----------|---------|
//! | `GET <api>/user` | Account record with its `eventBroker` |
//! | `GET <api>/scanners` | Scanners registered to the account |
//! | `GET <api>/scanners/<id>` | One scanner |
//!
//! Every call carries the access token as `Authorization` and is retried
//! once after a refresh when the token is rejected.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;

use crate::error::{Error, Result};
use crate::session::{CloudBlockFetcher, CloudChannel, Session, SessionEvent, SessionOptions};
use crate::transport::{
    HttpClient, HttpRequest, HttpResponse, ReqwestClient, TransportOptions, append_path,
};

use super::mqtt::{EventBrokerInfo, MqttLink};
use super::router::CommandRouter;
use super::token::{HttpTokenEndpoint, TokenBroker, TokenPair, send_authorized};

// ============================================================================
// Constants
// ============================================================================

const MQTT_BROKER: &str = "mqtt";

// ============================================================================
// Wire Types
// ============================================================================

/// A scanner registered to the cloud account.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CloudScanner {
    /// Scanner ID.
    pub id: String,
    /// Friendly name.
    #[serde(default)]
    pub name: Option<String>,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserRecord {
    event_broker: EventBrokerInfo,
}

/// List bodies arrive either bare or wrapped in `{"array": [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ScannerList {
    Wrapped { array: Vec<CloudScanner> },
    Bare(Vec<CloudScanner>),
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

// ============================================================================
// CloudApi
// ============================================================================

/// Authorized access to one cloud account.
#[derive(Clone)]
pub struct CloudApi {
    api_root: Url,
    http: Arc<dyn HttpClient>,
    broker: TokenBroker,
    options: TransportOptions,
}

impl CloudApi {
    /// Creates an API client for `api_root` holding `tokens`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the HTTP client cannot be built.
    pub fn new(api_root: Url, tokens: TokenPair, options: TransportOptions) -> Result<Self> {
        let http: Arc<dyn HttpClient> = Arc::new(ReqwestClient::new(&options)?);
        let endpoint = HttpTokenEndpoint::new(
            api_root.clone(),
            Arc::clone(&http),
            options.read_timeout,
        );
        let broker = TokenBroker::new(tokens, Arc::new(endpoint));
        Ok(Self::with_client(api_root, http, broker, options))
    }

    /// Creates an API client from existing parts.
    #[must_use]
    pub fn with_client(
        api_root: Url,
        http: Arc<dyn HttpClient>,
        broker: TokenBroker,
        options: TransportOptions,
    ) -> Self {
        Self {
            api_root,
            http,
            broker,
            options,
        }
    }

    /// Token broker shared by every request against this account.
    #[inline]
    #[must_use]
    pub fn broker(&self) -> &TokenBroker {
        &self.broker
    }

    /// Relay URL of a scanner.
    #[must_use]
    pub fn scanner_url(&self, scanner_id: &str) -> Url {
        append_path(&self.api_root, &format!("scanners/{scanner_id}"))
    }

    /// Fetches the account's event broker record.
    ///
    /// # Errors
    ///
    /// Transport and authorization failures; [`Error::HttpStatus`] carries
    /// the service's `message` when it sends one.
    pub async fn event_broker_info(&self) -> Result<EventBrokerInfo> {
        let user: UserRecord = self.get_json("user").await?;
        debug!(topic = %user.event_broker.topic, "Received event broker info");
        Ok(user.event_broker)
    }

    /// Lists the account's scanners.
    ///
    /// # Errors
    ///
    /// Transport and authorization failures.
    pub async fn scanners(&self) -> Result<Vec<CloudScanner>> {
        let list: ScannerList = self.get_json("scanners").await?;
        Ok(match list {
            ScannerList::Wrapped { array } => array,
            ScannerList::Bare(scanners) => scanners,
        })
    }

    /// Fetches one scanner's record.
    ///
    /// # Errors
    ///
    /// Transport and authorization failures.
    pub async fn scanner_info(&self, scanner_id: &str) -> Result<CloudScanner> {
        self.get_json(&format!("scanners/{scanner_id}")).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = append_path(&self.api_root, path);
        let timeout = self.options.read_timeout;

        let response = send_authorized(&self.broker, |token| {
            let request = HttpRequest::get(url.clone(), timeout).header("Authorization", token);
            async move { check_status(self.http.execute(request).await?) }
        })
        .await?;

        response
            .json()
            .map_err(|e| Error::protocol(format!("Malformed reply from {path}: {e}")))
    }
}

/// Like [`HttpResponse::error_for_status`], preferring the service's
/// `message` field as the reason.
fn check_status(response: HttpResponse) -> Result<HttpResponse> {
    if response.is_ok() {
        return Ok(response);
    }

    let message = serde_json::from_slice::<ErrorBody>(&response.body)
        .ok()
        .and_then(|body| body.message);

    match (response.status, message) {
        (401, Some(message)) => Err(Error::unauthorized(message)),
        (status, Some(message)) => Err(Error::http_status(status, message)),
        _ => response.error_for_status(),
    }
}

// ============================================================================
// CloudSession
// ============================================================================

/// A session with a cloud-relayed scanner and the event link feeding it.
///
/// Dropping the value disconnects the event link, which fails any request
/// still waiting for a relayed reply.
pub struct CloudSession {
    session: Session,
    api: CloudApi,
    _link: MqttLink,
}

impl CloudSession {
    /// Connects to the account's event broker and creates a session with
    /// `scanner_id`.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `options` are invalid
    /// - Transport and authorization failures from the account API
    /// - [`Error::Protocol`] if the account has no MQTT event broker
    /// - [`Error::Connection`] / [`Error::ConnectionTimeout`] if the broker link fails
    pub async fn connect(
        api_root: Url,
        scanner_id: &str,
        tokens: TokenPair,
        options: SessionOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        options.validate().map_err(Error::config)?;
        let api = CloudApi::new(api_root, tokens, options.transport.clone())?;
        Self::connect_with(api, scanner_id, options).await
    }

    /// Like [`connect`](Self::connect), reusing an existing account client.
    ///
    /// # Errors
    ///
    /// As for [`connect`](Self::connect).
    pub async fn connect_with(
        api: CloudApi,
        scanner_id: &str,
        options: SessionOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        let broker_info = api.event_broker_info().await?;
        if !broker_info.broker_type.eq_ignore_ascii_case(MQTT_BROKER) {
            return Err(Error::protocol(format!(
                "Unsupported event broker type '{}'",
                broker_info.broker_type
            )));
        }

        let router = CommandRouter::new();
        let on_publish = {
            let router = router.clone();
            Box::new(move |payload: &[u8]| router.dispatch(payload))
        };
        let on_lost = {
            let router = router.clone();
            Box::new(move |reason: &str| router.connection_lost(reason))
        };
        let link = MqttLink::connect(
            &broker_info,
            options.transport.connect_timeout,
            on_publish,
            on_lost,
        )
        .await?;

        let channel = Arc::new(CloudChannel::new(
            Arc::clone(&api.http),
            api.scanner_url(scanner_id),
            api.broker.clone(),
            router,
            options.transport.clone(),
        ));
        let fetcher = Arc::new(CloudBlockFetcher::new(Arc::clone(&channel)));
        let (session, events) = Session::new(channel, fetcher, options)?;

        info!(scanner_id, "Cloud session ready");
        Ok((
            Self {
                session,
                api,
                _link: link,
            },
            events,
        ))
    }

    /// The session handle.
    #[inline]
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The account client, for token persistence and scanner queries.
    #[inline]
    #[must_use]
    pub fn api(&self) -> &CloudApi {
        &self.api
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use crate::cloud::TokenEndpoint;

    struct RoutedHttp {
        replies: Mutex<Vec<(String, u16, serde_json::Value)>>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl RoutedHttp {
        fn new(replies: Vec<(&str, u16, serde_json::Value)>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|(path, status, body)| (path.to_string(), status, body))
                        .collect(),
                ),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HttpClient for RoutedHttp {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
            let mut replies = self.replies.lock();
            let index = replies
                .iter()
                .position(|(path, _, _)| request.url.path().ends_with(path.as_str()))
                .expect("scripted reply");
            let (_, status, body) = replies.remove(index);
            self.seen.lock().push(request);

            Ok(HttpResponse {
                status,
                headers: Vec::new(),
                body: body.to_string().into_bytes(),
            })
        }
    }

    struct CountingEndpoint(AtomicUsize);

    #[async_trait]
    impl TokenEndpoint for CountingEndpoint {
        async fn refresh(&self, _tokens: &TokenPair) -> Result<TokenPair> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(TokenPair::new("fresh", "next"))
        }
    }

    fn api(http: Arc<RoutedHttp>) -> (CloudApi, Arc<CountingEndpoint>) {
        let endpoint = Arc::new(CountingEndpoint(AtomicUsize::new(0)));
        let broker = TokenBroker::new(TokenPair::new("access", "refresh"), endpoint.clone());
        let api = CloudApi::with_client(
            Url::parse("https://api.example.com/dev").expect("url"),
            http,
            broker,
            TransportOptions::cloud(),
        );
        (api, endpoint)
    }

    #[tokio::test]
    async fn test_event_broker_info() {
        let http = RoutedHttp::new(vec![(
            "/dev/user",
            200,
            json!({
                "id": "u1",
                "eventBroker": {"type": "mqtt", "url": "wss://broker.example.com/mqtt", "topic": "users/u1"}
            }),
        )]);
        let (api, _) = api(http.clone());

        let info = api.event_broker_info().await.expect("broker info");
        assert_eq!(info.broker_type, "mqtt");
        assert_eq!(info.topic, "users/u1");

        let seen = http.seen.lock();
        assert_eq!(seen[0].url.as_str(), "https://api.example.com/dev/user");
        assert_eq!(
            seen[0].headers[0],
            ("Authorization".to_string(), "access".to_string())
        );
    }

    #[tokio::test]
    async fn test_scanner_list_wrapped_and_bare() {
        let http = RoutedHttp::new(vec![
            (
                "/scanners",
                200,
                json!({"array": [{"id": "a", "name": "Front desk"}]}),
            ),
            ("/scanners", 200, json!([{"id": "b"}, {"id": "c"}])),
        ]);
        let (api, _) = api(http);

        let wrapped = api.scanners().await.expect("wrapped");
        assert_eq!(wrapped.len(), 1);
        assert_eq!(wrapped[0].name.as_deref(), Some("Front desk"));

        let bare = api.scanners().await.expect("bare");
        assert_eq!(
            bare.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec!["b", "c"]
        );
    }

    #[tokio::test]
    async fn test_error_message_is_surfaced() {
        let http = RoutedHttp::new(vec![(
            "/scanners/missing",
            404,
            json!({"message": "Scanner not found"}),
        )]);
        let (api, _) = api(http);

        match api.scanner_info("missing").await {
            Err(Error::HttpStatus { status, reason }) => {
                assert_eq!(status, 404);
                assert_eq!(reason, "Scanner not found");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejected_token_refreshes_once() {
        let http = RoutedHttp::new(vec![
            ("/scanners/abc", 401, json!({"message": "Token expired"})),
            ("/scanners/abc", 200, json!({"id": "abc"})),
        ]);
        let (api, endpoint) = api(http.clone());

        let scanner = api.scanner_info("abc").await.expect("retry succeeds");
        assert_eq!(scanner.id, "abc");
        assert_eq!(endpoint.0.load(Ordering::SeqCst), 1);

        let seen = http.seen.lock();
        assert_eq!(seen[1].headers[0].1, "fresh");
    }

    #[test]
    fn test_scanner_url() {
        let http = RoutedHttp::new(Vec::new());
        let (api, _) = api(http);
        assert_eq!(
            api.scanner_url("abc").as_str(),
            "https://api.example.com/dev/scanners/abc"
        );
    }
}
