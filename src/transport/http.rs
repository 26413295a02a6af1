//! One HTTP exchange against a scanner or the cloud relay.
//!
//! [`HttpClient`] is the seam every higher layer talks through; it carries
//! one request and returns the raw status, headers and body. The
//! [`ReqwestClient`] implementation adds the two things scanners need:
//!
//! - TLS trust relaxed for the self-signed certificate a scanner issues for
//!   its own `.local` name.
//! - DNS pinned to the IP reported by discovery, since `.local` names often
//!   do not resolve through the system resolver.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace};
use url::Url;

use crate::error::{Error, Result};

use super::options::TransportOptions;

// ============================================================================
// Constants
// ============================================================================

/// Content type for JSON request bodies.
pub const JSON_CONTENT_TYPE: &str = "application/json; charset=UTF-8";

/// Longest body excerpt included in status errors.
const ERROR_EXCERPT_LEN: usize = 200;

// ============================================================================
// HttpMethod
// ============================================================================

/// HTTP methods used by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// `GET`
    Get,
    /// `POST`
    Post,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => f.write_str("GET"),
            Self::Post => f.write_str("POST"),
        }
    }
}

// ============================================================================
// HttpRequest
// ============================================================================

/// A single HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Request method.
    pub method: HttpMethod,
    /// Target URL.
    pub url: Url,
    /// Extra headers, in order.
    pub headers: Vec<(String, String)>,
    /// Request body, if any.
    pub body: Option<Vec<u8>>,
    /// Total time allowed for the exchange.
    pub timeout: Duration,
}

impl HttpRequest {
    /// Creates a `GET` request.
    #[inline]
    #[must_use]
    pub fn get(url: Url, timeout: Duration) -> Self {
        Self {
            method: HttpMethod::Get,
            url,
            headers: Vec::new(),
            body: None,
            timeout,
        }
    }

    /// Creates a `POST` request with a JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the body cannot be serialized.
    pub fn post_json<T: Serialize>(url: Url, body: &T, timeout: Duration) -> Result<Self> {
        let body = serde_json::to_vec(body)?;
        Ok(Self {
            method: HttpMethod::Post,
            url,
            headers: vec![("Content-Type".to_string(), JSON_CONTENT_TYPE.to_string())],
            body: Some(body),
            timeout,
        })
    }

    /// Adds a header.
    #[inline]
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

// ============================================================================
// HttpResponse
// ============================================================================

/// A minimal HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// The HTTP status code.
    pub status: u16,

    /// Response headers (lowercase keys).
    pub headers: Vec<(String, String)>,

    /// The response body bytes.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Look up a response header by name (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k == &lower)
            .map(|(_, v)| v.as_str())
    }

    /// Returns `true` for a 200 response.
    #[inline]
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    /// Turns any non-200 status into an error.
    ///
    /// # Errors
    ///
    /// - [`Error::Unauthorized`] for 401
    /// - [`Error::HttpStatus`] for any other non-200 status
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_ok() {
            return Ok(self);
        }

        let excerpt: String = String::from_utf8_lossy(&self.body)
            .chars()
            .take(ERROR_EXCERPT_LEN)
            .collect();
        trace!(status = self.status, body = %excerpt, "Non-200 response body");

        if self.status == 401 {
            return Err(Error::unauthorized(format!("HTTP 401 {excerpt}")));
        }

        let reason = reqwest::StatusCode::from_u16(self.status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown Status");
        Err(Error::http_status(self.status, reason))
    }

    /// Decodes the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the body is not valid for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

// ============================================================================
// HttpClient
// ============================================================================

/// A minimal async HTTP client.
///
/// Implementations handle the mechanics of making HTTP requests (TLS,
/// connection pooling, DNS) while this trait exposes only what the protocol
/// needs.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Executes one request and returns the response, whatever its status.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

// ============================================================================
// ReqwestClient
// ============================================================================

/// A [`reqwest`]-backed implementation of [`HttpClient`].
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    inner: reqwest::Client,
}

impl ReqwestClient {
    /// Creates a client using the system resolver.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the TLS backend cannot be initialized.
    pub fn new(options: &TransportOptions) -> Result<Self> {
        Self::build(options, None)
    }

    /// Creates a client that resolves the endpoint's host to `ip`.
    ///
    /// When `ip` is `None` or the endpoint host is already a literal
    /// address, the system resolver is used.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the TLS backend cannot be initialized.
    pub fn for_endpoint(
        options: &TransportOptions,
        endpoint: &Url,
        ip: Option<IpAddr>,
    ) -> Result<Self> {
        Self::build(options, resolve_override(endpoint, ip))
    }

    fn build(options: &TransportOptions, resolve: Option<(String, SocketAddr)>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .danger_accept_invalid_certs(options.accept_invalid_certs);

        if let Some((host, addr)) = resolve {
            debug!(%host, %addr, "Pinning scanner host to discovered address");
            builder = builder.resolve(&host, addr);
        }

        Ok(Self {
            inner: builder.build()?,
        })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let HttpRequest {
            method,
            url,
            headers,
            body,
            timeout,
        } = request;

        trace!(%method, %url, "HTTP request");

        let mut builder = match method {
            HttpMethod::Get => self.inner.get(url),
            HttpMethod::Post => self.inner.post(url),
        };
        builder = builder.timeout(timeout);
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;
        let status = response.status().as_u16();

        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_lowercase(), v.to_string()))
            })
            .collect();

        let body = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?
            .to_vec();

        trace!(status, len = body.len(), "HTTP response");

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Appends `path` to the path of `base`, handling leading and trailing
/// slashes on either side.
#[must_use]
pub fn append_path(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    let joined = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    url
}

/// Computes the `(host, addr)` pin for an endpoint, if one applies.
fn resolve_override(endpoint: &Url, ip: Option<IpAddr>) -> Option<(String, SocketAddr)> {
    let ip = ip?;
    match endpoint.host()? {
        url::Host::Domain(host) => {
            let port = endpoint.port_or_known_default()?;
            Some((host.to_string(), SocketAddr::new(ip, port)))
        }
        url::Host::Ipv4(_) | url::Host::Ipv6(_) => None,
    }
}

/// Maps reqwest failures onto the crate taxonomy.
fn map_reqwest_error(err: reqwest::Error, timeout: Duration) -> Error {
    if err.is_timeout() {
        Error::connection_timeout(timeout.as_millis() as u64)
    } else if err.is_connect() {
        Error::connection(err.to_string())
    } else {
        Error::Http(err)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::Ipv4Addr;

    fn url(s: &str) -> Url {
        Url::parse(s).expect("valid url")
    }

    #[test]
    fn test_append_path_slashes() {
        let base = url("https://scanner.local:34034/");
        assert_eq!(
            append_path(&base, "/privet/infoex").as_str(),
            "https://scanner.local:34034/privet/infoex"
        );

        let base = url("https://api.example.com/dev");
        assert_eq!(
            append_path(&base, "scanners/abc").as_str(),
            "https://api.example.com/dev/scanners/abc"
        );
    }

    #[test]
    fn test_resolve_override_for_mdns_name() {
        let endpoint = url("https://scanner.local:34034/");
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));

        let (host, addr) = resolve_override(&endpoint, Some(ip)).expect("pin");
        assert_eq!(host, "scanner.local");
        assert_eq!(addr, SocketAddr::new(ip, 34034));
    }

    #[test]
    fn test_resolve_override_skips_literal_ip() {
        let endpoint = url("http://192.168.1.20:34034/");
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));
        assert!(resolve_override(&endpoint, Some(ip)).is_none());
        assert!(resolve_override(&url("https://scanner.local/"), None).is_none());
    }

    #[test]
    fn test_error_for_status() {
        let ok = HttpResponse {
            status: 200,
            headers: Vec::new(),
            body: b"{}".to_vec(),
        };
        assert!(ok.error_for_status().is_ok());

        let unauthorized = HttpResponse {
            status: 401,
            headers: Vec::new(),
            body: b"expired".to_vec(),
        };
        assert!(matches!(
            unauthorized.error_for_status(),
            Err(Error::Unauthorized { .. })
        ));

        let missing = HttpResponse {
            status: 404,
            headers: Vec::new(),
            body: Vec::new(),
        };
        match missing.error_for_status() {
            Err(Error::HttpStatus { status, reason }) => {
                assert_eq!(status, 404);
                assert_eq!(reason, "Not Found");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let response = HttpResponse {
            status: 200,
            headers: vec![("content-type".into(), "multipart/mixed; boundary=x".into())],
            body: Vec::new(),
        };
        assert_eq!(
            response.header("Content-Type"),
            Some("multipart/mixed; boundary=x")
        );
        assert_eq!(response.header("Content-Length"), None);
    }

    #[test]
    fn test_post_json_sets_content_type() {
        let request = HttpRequest::post_json(
            url("https://scanner.local/privet/twaindirect/session"),
            &serde_json::json!({"method": "createSession"}),
            Duration::from_secs(30),
        )
        .expect("request")
        .header("X-Privet-Token", "token");

        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.headers[0].1, JSON_CONTENT_TYPE);
        assert_eq!(request.headers[1].0, "X-Privet-Token");
        assert!(request.body.is_some());
    }
}
