//! OAuth2 token coordination for the cloud relay.
//!
//! A [`TokenBroker`] owns the access/refresh pair for one cloud account and
//! is shared by every request against that account. Refreshes are
//! single-flight: while one is running, other callers join it and see its
//! real outcome instead of starting their own.
//!
//! Each successful refresh bumps a generation counter. A caller that got a
//! 401 passes the generation its token came from; if the broker has moved
//! on since, the token was already replaced and the caller retries without
//! refreshing again.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::transport::{HttpClient, HttpRequest, append_path};

// ============================================================================
// Types
// ============================================================================

/// Called with the new pair after every successful refresh.
pub type RefreshHandler = Box<dyn Fn(&TokenPair) + Send + Sync>;

/// Outcome shared between everyone waiting on one refresh.
type RefreshFuture = Shared<BoxFuture<'static, std::result::Result<u64, String>>>;

// ============================================================================
// TokenPair
// ============================================================================

/// An access token and the refresh token that renews it.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    /// Sent as `Authorization` on every cloud request.
    pub access_token: String,
    /// Exchanged for a new pair when the access token expires.
    pub refresh_token: String,
}

impl TokenPair {
    /// Creates a token pair.
    #[inline]
    #[must_use]
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// An access token tagged with the refresh generation it belongs to.
#[derive(Debug, Clone)]
pub struct TokenLease {
    /// Token to send.
    pub access_token: String,
    /// Generation the token was issued in.
    pub generation: u64,
}

// ============================================================================
// TokenEndpoint
// ============================================================================

/// Exchanges a refresh token for a new pair.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Performs one refresh exchange.
    async fn refresh(&self, tokens: &TokenPair) -> Result<TokenPair>;
}

/// Refresh reply body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshReply {
    authorization_token: String,
    refresh_token: String,
}

/// The cloud service's `authentication/refresh` endpoint.
pub struct HttpTokenEndpoint {
    api_root: Url,
    http: Arc<dyn HttpClient>,
    timeout: Duration,
}

impl HttpTokenEndpoint {
    /// Creates an endpoint under `api_root`.
    #[must_use]
    pub fn new(api_root: Url, http: Arc<dyn HttpClient>, timeout: Duration) -> Self {
        Self {
            api_root,
            http,
            timeout,
        }
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn refresh(&self, tokens: &TokenPair) -> Result<TokenPair> {
        let path = format!(
            "authentication/refresh/{}",
            urlencoding::encode(&tokens.refresh_token)
        );
        let url = append_path(&self.api_root, &path);
        let request = HttpRequest::get(url, self.timeout)
            .header("Authorization", tokens.access_token.as_str());

        let response = self
            .http
            .execute(request)
            .await
            .map_err(|e| Error::token_refresh(e.to_string()))?;

        if !response.is_ok() {
            return Err(Error::token_refresh(format!(
                "refresh endpoint returned {}",
                response.status
            )));
        }

        let reply: RefreshReply = response
            .json()
            .map_err(|e| Error::token_refresh(format!("malformed refresh reply: {e}")))?;

        Ok(TokenPair::new(reply.authorization_token, reply.refresh_token))
    }
}

// ============================================================================
// TokenBroker
// ============================================================================

struct BrokerState {
    tokens: TokenPair,
    generation: u64,
    in_flight: Option<RefreshFuture>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    endpoint: Arc<dyn TokenEndpoint>,
    refresh_handler: Mutex<Option<RefreshHandler>>,
}

/// Shared owner of one account's tokens.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TokenBroker {
    inner: Arc<BrokerInner>,
}

impl fmt::Debug for TokenBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBroker")
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl TokenBroker {
    /// Creates a broker holding `tokens`.
    #[must_use]
    pub fn new(tokens: TokenPair, endpoint: Arc<dyn TokenEndpoint>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState {
                    tokens,
                    generation: 0,
                    in_flight: None,
                }),
                endpoint,
                refresh_handler: Mutex::new(None),
            }),
        }
    }

    /// Returns the current access token and its generation.
    #[must_use]
    pub fn current(&self) -> TokenLease {
        let state = self.inner.state.lock();
        TokenLease {
            access_token: state.tokens.access_token.clone(),
            generation: state.generation,
        }
    }

    /// Returns a copy of the current pair.
    #[must_use]
    pub fn tokens(&self) -> TokenPair {
        self.inner.state.lock().tokens.clone()
    }

    /// Returns the number of successful refreshes so far.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.state.lock().generation
    }

    /// Sets the handler notified after each successful refresh.
    pub fn set_refresh_handler(&self, handler: RefreshHandler) {
        *self.inner.refresh_handler.lock() = Some(handler);
    }

    /// Refreshes the tokens, unless generation `seen` is already stale.
    ///
    /// Joins an in-flight refresh instead of starting another.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenRefresh`] if the refresh this call started or
    /// joined failed. Stored tokens are unchanged in that case.
    pub async fn refresh(&self, seen: u64) -> Result<()> {
        let refresh = {
            let mut state = self.inner.state.lock();

            if state.generation != seen {
                debug!(
                    seen,
                    current = state.generation,
                    "Token already refreshed"
                );
                return Ok(());
            }

            match &state.in_flight {
                Some(refresh) => {
                    debug!("Joining in-flight token refresh");
                    refresh.clone()
                }
                None => {
                    let refresh = Self::run_refresh(Arc::clone(&self.inner), state.tokens.clone())
                        .boxed()
                        .shared();
                    state.in_flight = Some(refresh.clone());
                    refresh
                }
            }
        };

        refresh.await.map(|_| ()).map_err(Error::token_refresh)
    }

    async fn run_refresh(
        inner: Arc<BrokerInner>,
        tokens: TokenPair,
    ) -> std::result::Result<u64, String> {
        debug!("Refreshing access token");
        let outcome = inner.endpoint.refresh(&tokens).await;

        let (generation, fresh) = {
            let mut state = inner.state.lock();
            state.in_flight = None;

            match outcome {
                Ok(fresh) => {
                    state.tokens = fresh.clone();
                    state.generation += 1;
                    (state.generation, fresh)
                }
                Err(e) => {
                    warn!(error = %e, "Token refresh failed");
                    return Err(e.to_string());
                }
            }
        };

        info!(generation, "Access token refreshed");
        if let Some(handler) = inner.refresh_handler.lock().as_ref() {
            handler(&fresh);
        }
        Ok(generation)
    }
}

// ============================================================================
// Authorized Requests
// ============================================================================

/// Runs `send` with the current access token, refreshing and retrying
/// exactly once if the token is rejected.
///
/// # Errors
///
/// - Whatever `send` returns, if it is not an authorization failure
/// - [`Error::TokenRefresh`] if the refresh fails
/// - The second attempt's error, including a second 401
pub async fn send_authorized<T, F, Fut>(broker: &TokenBroker, mut send: F) -> Result<T>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let lease = broker.current();

    match send(lease.access_token).await {
        Err(e) if is_rejected_token(&e) => {
            debug!(generation = lease.generation, "Access token rejected");
            broker.refresh(lease.generation).await?;
            send(broker.current().access_token).await
        }
        other => other,
    }
}

fn is_rejected_token(err: &Error) -> bool {
    matches!(
        err,
        Error::Unauthorized { .. } | Error::HttpStatus { status: 401, .. }
    )
}

// ============================================================================
// Tests
// ============================================================================
