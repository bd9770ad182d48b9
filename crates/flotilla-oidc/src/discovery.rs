//! OIDC provider discovery and metadata caching.
//!
//! Auth methods name their provider by a discovery URL; everything else
//! (authorization endpoint, token endpoint, JWKS URI) comes from the
//! provider's `.well-known/openid-configuration` document. This module
//! fetches that document and caches it per issuer.
//!
//! # Security
//!
//! - Only HTTPS discovery URLs are accepted unless the auth method opts
//!   into HTTP for testing.
//! - The `issuer` in the returned document must match the URL it was
//!   fetched from (OIDC Discovery 1.0, section 4.3).
//! - Responses are size-capped and requests time-bounded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use url::Url;

/// Errors that can occur while fetching provider metadata.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The discovery URL scheme is not allowed.
    #[error("discovery URL scheme {0:?} not allowed (only HTTPS)")]
    InvalidScheme(String),

    /// A network error occurred while fetching the document.
    #[error("failed to fetch discovery document: {0}")]
    Network(String),

    /// The provider returned a non-success status code.
    #[error("discovery endpoint returned HTTP {0}")]
    Http(u16),

    /// The response exceeded the maximum allowed size.
    #[error("discovery document exceeds maximum size of {max_size} bytes")]
    ResponseTooLarge {
        /// The maximum allowed size.
        max_size: usize,
    },

    /// The document could not be parsed.
    #[error("failed to parse discovery document: {0}")]
    Parse(String),

    /// The document issuer does not match the URL it was fetched from.
    #[error("issuer mismatch: document claims {actual}, fetched from {expected}")]
    IssuerMismatch {
        /// The discovery URL the document was fetched from.
        expected: String,
        /// The issuer claimed inside the document.
        actual: String,
    },
}

/// Provider metadata from `.well-known/openid-configuration`.
///
/// Only the fields this crate reads are deserialized; providers ship many
/// more and serde ignores them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    /// Issuer identifier, which must match the discovery URL.
    pub issuer: String,

    /// Endpoint users are redirected to for login.
    pub authorization_endpoint: String,

    /// Endpoint authorization codes are exchanged at.
    pub token_endpoint: String,

    /// Location of the provider's signing keys.
    pub jwks_uri: String,

    /// Response types the provider supports.
    #[serde(default)]
    pub response_types_supported: Vec<String>,

    /// Subject identifier types the provider supports.
    #[serde(default)]
    pub subject_types_supported: Vec<String>,

    /// JWS algorithms the provider signs ID tokens with.
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Vec<String>,

    /// Scopes the provider supports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes_supported: Option<Vec<String>>,

    /// Grant types the provider supports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant_types_supported: Option<Vec<String>>,

    /// UserInfo endpoint, if the provider has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_endpoint: Option<String>,
}

/// Configuration for the discovery cache.
#[derive(Debug, Clone)]
pub struct DiscoveryCacheConfig {
    /// Time-to-live for cached documents (default: 1 hour).
    pub ttl: Duration,

    /// Maximum response size in bytes (default: 1 MB).
    pub max_response_size: usize,

    /// Whether to allow HTTP (non-HTTPS) discovery URLs.
    /// This should only be enabled for testing.
    pub allow_http: bool,
}

impl Default for DiscoveryCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_response_size: 1024 * 1024,
            allow_http: false,
        }
    }
}

impl DiscoveryCacheConfig {
    /// Sets the cache TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the maximum response size.
    #[must_use]
    pub fn with_max_response_size(mut self, size: usize) -> Self {
        self.max_response_size = size;
        self
    }

    /// Allows HTTP (non-HTTPS) discovery URLs. Testing only.
    #[must_use]
    pub fn with_allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }
}

struct CachedDocument {
    document: DiscoveryDocument,
    fetched_at: Instant,
}

/// TTL cache of provider metadata, keyed by normalized discovery URL.
///
/// The HTTP client is supplied by the caller so the auth method's CA trust
/// material and timeout apply to discovery fetches as well.
pub struct DiscoveryCache {
    http_client: reqwest::Client,
    config: DiscoveryCacheConfig,
    cache: Arc<RwLock<HashMap<String, CachedDocument>>>,
}

impl DiscoveryCache {
    /// Creates a discovery cache using the given HTTP client.
    #[must_use]
    pub fn new(http_client: reqwest::Client, config: DiscoveryCacheConfig) -> Self {
        Self {
            http_client,
            config,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns the provider metadata for a discovery URL, fetching it if
    /// the cache has no fresh copy.
    ///
    /// # Errors
    ///
    /// Returns a `DiscoveryError` if the document cannot be fetched,
    /// parsed, or fails issuer validation.
    pub async fn get(&self, discovery_url: &Url) -> Result<DiscoveryDocument, DiscoveryError> {
        let key = normalize_issuer_key(discovery_url);

        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(&key)
                && cached.fetched_at.elapsed() < self.config.ttl
            {
                tracing::trace!(issuer = %discovery_url, "discovery cache hit");
                return Ok(cached.document.clone());
            }
        }

        self.refresh(discovery_url).await
    }

    /// Fetches fresh provider metadata, bypassing and updating the cache.
    ///
    /// # Errors
    ///
    /// Returns a `DiscoveryError` if the document cannot be fetched,
    /// parsed, or fails issuer validation.
    pub async fn refresh(&self, discovery_url: &Url) -> Result<DiscoveryDocument, DiscoveryError> {
        let document = self.fetch(discovery_url).await?;

        let mut cache = self.cache.write().await;
        cache.insert(
            normalize_issuer_key(discovery_url),
            CachedDocument {
                document: document.clone(),
                fetched_at: Instant::now(),
            },
        );

        Ok(document)
    }

    /// Removes the cached entry for a discovery URL.
    pub async fn invalidate(&self, discovery_url: &Url) {
        let mut cache = self.cache.write().await;
        cache.remove(&normalize_issuer_key(discovery_url));
    }

    /// Removes all expired entries from the cache.
    pub async fn cleanup(&self) {
        let ttl = self.config.ttl;
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, v| v.fetched_at.elapsed() < ttl);
        let removed = before - cache.len();
        if removed > 0 {
            tracing::debug!(removed, "removed expired discovery cache entries");
        }
    }

    /// Returns the number of cached documents.
    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Returns `true` if nothing is cached.
    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }

    async fn fetch(&self, discovery_url: &Url) -> Result<DiscoveryDocument, DiscoveryError> {
        self.validate_scheme(discovery_url)?;

        let endpoint = well_known_url(discovery_url);
        tracing::debug!(issuer = %discovery_url, "fetching OIDC discovery document");

        let response = self
            .http_client
            .get(endpoint.as_str())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(issuer = %discovery_url, error = %e, "discovery fetch failed");
                DiscoveryError::Network(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(DiscoveryError::Http(response.status().as_u16()));
        }

        if let Some(len) = response.content_length()
            && len as usize > self.config.max_response_size
        {
            return Err(DiscoveryError::ResponseTooLarge {
                max_size: self.config.max_response_size,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| DiscoveryError::Network(e.to_string()))?;
        if body.len() > self.config.max_response_size {
            return Err(DiscoveryError::ResponseTooLarge {
                max_size: self.config.max_response_size,
            });
        }

        let document: DiscoveryDocument = serde_json::from_slice(&body)
            .map_err(|e| DiscoveryError::Parse(e.to_string()))?;

        validate_issuer(&document, discovery_url)?;
        Ok(document)
    }

    fn validate_scheme(&self, discovery_url: &Url) -> Result<(), DiscoveryError> {
        match discovery_url.scheme() {
            "https" => Ok(()),
            "http" if self.config.allow_http => Ok(()),
            scheme => Err(DiscoveryError::InvalidScheme(scheme.to_string())),
        }
    }
}

/// Builds `{issuer}/.well-known/openid-configuration` from a discovery URL.
fn well_known_url(discovery_url: &Url) -> Url {
    let mut endpoint = discovery_url.clone();
    let path = discovery_url.path().trim_end_matches('/');
    endpoint.set_path(&format!("{path}/.well-known/openid-configuration"));
    endpoint
}

/// The issuer returned in the document must be identical to the URL used
/// to retrieve it (modulo a trailing slash).
fn validate_issuer(
    document: &DiscoveryDocument,
    discovery_url: &Url,
) -> Result<(), DiscoveryError> {
    let expected = discovery_url.as_str().trim_end_matches('/');
    let actual = document.issuer.trim_end_matches('/');
    if expected != actual {
        return Err(DiscoveryError::IssuerMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// Normalizes a discovery URL for use as a cache key.
fn normalize_issuer_key(discovery_url: &Url) -> String {
    discovery_url.as_str().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_document(issuer: &str) -> serde_json::Value {
        serde_json::json!({
            "issuer": issuer,
            "authorization_endpoint": format!("{issuer}/authorize"),
            "token_endpoint": format!("{issuer}/token"),
            "jwks_uri": format!("{issuer}/.well-known/jwks.json"),
            "response_types_supported": ["code"],
            "subject_types_supported": ["public"],
            "id_token_signing_alg_values_supported": ["RS256"]
        })
    }

    fn test_cache(allow_http: bool) -> DiscoveryCache {
        DiscoveryCache::new(
            reqwest::Client::new(),
            DiscoveryCacheConfig::default().with_allow_http(allow_http),
        )
    }

    #[test]
    fn test_well_known_url() {
        let url = Url::parse("https://auth.example.com").unwrap();
        assert_eq!(
            well_known_url(&url).as_str(),
            "https://auth.example.com/.well-known/openid-configuration"
        );

        let url = Url::parse("https://auth.example.com/tenant/abc/").unwrap();
        assert_eq!(
            well_known_url(&url).as_str(),
            "https://auth.example.com/tenant/abc/.well-known/openid-configuration"
        );
    }

    #[test]
    fn test_normalize_issuer_key() {
        let a = Url::parse("https://auth.example.com").unwrap();
        let b = Url::parse("https://auth.example.com/").unwrap();
        assert_eq!(normalize_issuer_key(&a), normalize_issuer_key(&b));
    }

    #[tokio::test]
    async fn test_rejects_http_by_default() {
        let cache = test_cache(false);
        let url = Url::parse("http://auth.example.com").unwrap();
        let result = cache.get(&url).await;
        assert!(matches!(result, Err(DiscoveryError::InvalidScheme(_))));
    }

    #[tokio::test]
    async fn test_fetch_and_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(test_document(&server.uri())))
            .expect(1)
            .mount(&server)
            .await;

        let cache = test_cache(true);
        let url = Url::parse(&server.uri()).unwrap();

        let doc = cache.get(&url).await.unwrap();
        assert_eq!(doc.issuer, server.uri());
        assert_eq!(doc.token_endpoint, format!("{}/token", server.uri()));

        // Second get is served from the cache; expect(1) verifies it.
        cache.get(&url).await.unwrap();
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_issuer_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(test_document("https://somebody-else.example.com")),
            )
            .mount(&server)
            .await;

        let cache = test_cache(true);
        let url = Url::parse(&server.uri()).unwrap();
        let result = cache.get(&url).await;
        assert!(matches!(result, Err(DiscoveryError::IssuerMismatch { .. })));
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let cache = test_cache(true);
        let url = Url::parse(&server.uri()).unwrap();
        assert!(matches!(cache.get(&url).await, Err(DiscoveryError::Http(500))));
    }

    #[tokio::test]
    async fn test_response_size_cap() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(64)))
            .mount(&server)
            .await;

        let cache = DiscoveryCache::new(
            reqwest::Client::new(),
            DiscoveryCacheConfig::default()
                .with_allow_http(true)
                .with_max_response_size(16),
        );
        let url = Url::parse(&server.uri()).unwrap();
        assert!(matches!(
            cache.get(&url).await,
            Err(DiscoveryError::ResponseTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalidate_and_cleanup() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(test_document(&server.uri())))
            .mount(&server)
            .await;

        let cache = test_cache(true);
        let url = Url::parse(&server.uri()).unwrap();

        cache.get(&url).await.unwrap();
        assert_eq!(cache.len().await, 1);

        cache.invalidate(&url).await;
        assert!(cache.is_empty().await);

        cache.get(&url).await.unwrap();
        cache.cleanup().await;
        // Entry is still fresh, cleanup keeps it.
        assert_eq!(cache.len().await, 1);
    }
}
