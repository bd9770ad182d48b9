//! Provider signing-key fetching and caching.
//!
//! ID tokens are verified against the provider's published JSON Web Key
//! Set. This module caches that key set per JWKS URI and resolves keys by
//! `kid`. The cache TTL follows the provider's `Cache-Control: max-age`
//! when present, clamped to configured bounds; a miss triggers one fresh
//! fetch before the key is declared unknown.
//!
//! Key rotation is handled by the verifier: when a cached key fails
//! signature verification, it invalidates this cache and retries once
//! against a freshly fetched set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{Jwk, JwkSet, KeyAlgorithm};
use jsonwebtoken::{Algorithm, DecodingKey};
use tokio::sync::RwLock;
use url::Url;

/// Errors that can occur during JWKS operations.
#[derive(Debug, thiserror::Error)]
pub enum JwksError {
    /// A network error occurred while fetching the key set.
    #[error("failed to fetch JWKS: {0}")]
    Network(String),

    /// The provider returned a non-success status code.
    #[error("JWKS endpoint returned HTTP {0}")]
    Http(u16),

    /// The key set could not be parsed.
    #[error("failed to parse JWKS: {0}")]
    Parse(String),

    /// No key with the requested ID exists, even after a fresh fetch.
    #[error("no key with id {0:?} in provider JWKS")]
    KeyNotFound(String),

    /// The key exists but could not be converted for verification.
    #[error("unusable key {0:?} in provider JWKS")]
    InvalidKey(String),

    /// The JWKS URI scheme is not allowed.
    #[error("JWKS URI scheme not allowed (only HTTPS)")]
    InvalidScheme,

    /// The response exceeded the maximum allowed size.
    #[error("JWKS response exceeds maximum size of {max_size} bytes")]
    ResponseTooLarge {
        /// The maximum allowed size.
        max_size: usize,
    },
}

/// Configuration for the JWKS cache.
#[derive(Debug, Clone)]
pub struct JwksCacheConfig {
    /// TTL used when the provider sends no Cache-Control (default: 1 hour).
    pub default_ttl: Duration,

    /// Upper bound on the TTL regardless of Cache-Control (default: 24 h).
    pub max_ttl: Duration,

    /// Lower bound on the TTL regardless of Cache-Control (default: 5 min).
    pub min_ttl: Duration,

    /// Maximum response size in bytes (default: 1 MB).
    pub max_response_size: usize,

    /// Whether to allow HTTP (non-HTTPS) JWKS URIs. Testing only.
    pub allow_http: bool,
}

impl Default for JwksCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            max_ttl: Duration::from_secs(86400),
            min_ttl: Duration::from_secs(300),
            max_response_size: 1024 * 1024,
            allow_http: false,
        }
    }
}

impl JwksCacheConfig {
    /// Sets the default TTL.
    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Sets the maximum TTL.
    #[must_use]
    pub fn with_max_ttl(mut self, ttl: Duration) -> Self {
        self.max_ttl = ttl;
        self
    }

    /// Sets the minimum TTL.
    #[must_use]
    pub fn with_min_ttl(mut self, ttl: Duration) -> Self {
        self.min_ttl = ttl;
        self
    }

    /// Sets the maximum response size.
    #[must_use]
    pub fn with_max_response_size(mut self, size: usize) -> Self {
        self.max_response_size = size;
        self
    }

    /// Allows HTTP (non-HTTPS) JWKS URIs. Testing only.
    #[must_use]
    pub fn with_allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }
}

struct CachedJwks {
    jwks: JwkSet,
    expires_at: Instant,
}

/// TTL cache of provider key sets, keyed by JWKS URI.
///
/// The HTTP client is supplied by the caller so the auth method's CA trust
/// material and timeout apply to key fetches as well.
pub struct JwksCache {
    http_client: reqwest::Client,
    config: JwksCacheConfig,
    cache: Arc<RwLock<HashMap<String, CachedJwks>>>,
}

impl JwksCache {
    /// Creates a JWKS cache using the given HTTP client.
    #[must_use]
    pub fn new(http_client: reqwest::Client, config: JwksCacheConfig) -> Self {
        Self {
            http_client,
            config,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Resolves a verification key by `kid`.
    ///
    /// Serves from the cache when the set is fresh; otherwise fetches once
    /// and retries the lookup against the fresh set.
    ///
    /// # Errors
    ///
    /// - `KeyNotFound` if the freshly fetched set has no such key.
    /// - `InvalidKey` if the key cannot be used for verification.
    /// - Fetch errors when the key set cannot be retrieved.
    pub async fn get_key(
        &self,
        jwks_uri: &Url,
        kid: &str,
    ) -> Result<(DecodingKey, Option<Algorithm>), JwksError> {
        if let Some(result) = self.cached_key(jwks_uri, kid).await {
            tracing::trace!(%kid, uri = %jwks_uri, "JWKS cache hit");
            return result;
        }

        tracing::debug!(%kid, uri = %jwks_uri, "JWKS cache miss, fetching key set");
        self.refresh(jwks_uri).await?;

        match self.cached_key(jwks_uri, kid).await {
            Some(result) => result,
            None => Err(JwksError::KeyNotFound(kid.to_string())),
        }
    }

    /// Fetches the key set and updates the cache, regardless of freshness.
    ///
    /// # Errors
    ///
    /// Returns a `JwksError` if the set cannot be fetched or parsed.
    pub async fn refresh(&self, jwks_uri: &Url) -> Result<(), JwksError> {
        self.validate_scheme(jwks_uri)?;

        let response = self
            .http_client
            .get(jwks_uri.as_str())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(uri = %jwks_uri, error = %e, "JWKS fetch failed");
                JwksError::Network(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(JwksError::Http(response.status().as_u16()));
        }

        if let Some(len) = response.content_length()
            && len as usize > self.config.max_response_size
        {
            return Err(JwksError::ResponseTooLarge {
                max_size: self.config.max_response_size,
            });
        }

        let ttl = cache_control_ttl(response.headers(), &self.config);

        let body = response
            .bytes()
            .await
            .map_err(|e| JwksError::Network(e.to_string()))?;
        if body.len() > self.config.max_response_size {
            return Err(JwksError::ResponseTooLarge {
                max_size: self.config.max_response_size,
            });
        }

        let jwks: JwkSet =
            serde_json::from_slice(&body).map_err(|e| JwksError::Parse(e.to_string()))?;

        tracing::debug!(
            uri = %jwks_uri,
            keys = jwks.keys.len(),
            ttl_secs = ttl.as_secs(),
            "cached provider JWKS"
        );

        let mut cache = self.cache.write().await;
        cache.insert(
            normalize_uri(jwks_uri),
            CachedJwks {
                jwks,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    /// Removes the cached key set for a JWKS URI.
    pub async fn invalidate(&self, jwks_uri: &Url) {
        let mut cache = self.cache.write().await;
        cache.remove(&normalize_uri(jwks_uri));
        tracing::debug!(uri = %jwks_uri, "invalidated JWKS cache");
    }

    /// Removes all expired entries from the cache.
    pub async fn cleanup(&self) {
        let now = Instant::now();
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, v| v.expires_at > now);
        let removed = before - cache.len();
        if removed > 0 {
            tracing::debug!(removed, "removed expired JWKS cache entries");
        }
    }

    /// Returns the number of cached key sets.
    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Returns `true` if nothing is cached.
    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }

    async fn cached_key(
        &self,
        jwks_uri: &Url,
        kid: &str,
    ) -> Option<Result<(DecodingKey, Option<Algorithm>), JwksError>> {
        let cache = self.cache.read().await;
        let cached = cache.get(&normalize_uri(jwks_uri))?;
        if Instant::now() >= cached.expires_at {
            return None;
        }

        let jwk = cached
            .jwks
            .keys
            .iter()
            .find(|k| k.common.key_id.as_deref() == Some(kid))?;

        Some(
            DecodingKey::from_jwk(jwk)
                .map(|key| (key, jwk_algorithm(jwk)))
                .map_err(|_| JwksError::InvalidKey(kid.to_string())),
        )
    }

    fn validate_scheme(&self, uri: &Url) -> Result<(), JwksError> {
        match uri.scheme() {
            "https" => Ok(()),
            "http" if self.config.allow_http => Ok(()),
            _ => Err(JwksError::InvalidScheme),
        }
    }
}

/// Derives the cache TTL from a `Cache-Control: max-age` directive,
/// clamped to the configured bounds.
fn cache_control_ttl(headers: &reqwest::header::HeaderMap, config: &JwksCacheConfig) -> Duration {
    let ttl = headers
        .get(reqwest::header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.split(',').find_map(|directive| {
                directive
                    .trim()
                    .strip_prefix("max-age=")
                    .and_then(|s| s.parse::<u64>().ok())
            })
        })
        .map(Duration::from_secs)
        .unwrap_or(config.default_ttl);

    ttl.clamp(config.min_ttl, config.max_ttl)
}

/// Extracts the declared algorithm from a JWK, when it is a signing
/// algorithm this crate understands.
fn jwk_algorithm(jwk: &Jwk) -> Option<Algorithm> {
    jwk.common.key_algorithm.as_ref().and_then(|alg| match alg {
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    })
}

/// Normalizes a JWKS URI for use as a cache key.
fn normalize_uri(uri: &Url) -> String {
    uri.as_str().trim_end_matches('/').to_string()
}
