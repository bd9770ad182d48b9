//! Per-auth-method OIDC provider client.
//!
//! A [`ProviderClient`] owns everything needed to talk to one provider:
//! an HTTP client carrying the method's CA trust material, a discovery
//! cache, and a JWKS cache. It covers the three provider-facing steps of
//! a login flow:
//!
//! 1. [`ProviderClient::build_auth_url`] - where to send the user;
//! 2. [`ProviderClient::exchange`] - authorization code for tokens;
//! 3. [`ProviderClient::verify`] - ID token to verified [`AuthClaims`].
//!
//! # Security
//!
//! - The redirect URI is checked against the method's allow-list before
//!   any network contact, in both `build_auth_url` and `exchange`.
//! - ID tokens are accepted only when signed with one of the method's
//!   configured algorithms by a key published in the provider's JWKS.
//! - The audience and nonce checks are done here, not left to callers.

use std::time::Duration;

use jsonwebtoken::{Algorithm, Validation, decode, decode_header};
use serde::Deserialize;
use url::Url;

use crate::claims::{AuthClaims, IdTokenClaims};
use crate::config::{AuthMethodConfig, ConfigError};
use crate::discovery::{DiscoveryCache, DiscoveryCacheConfig, DiscoveryDocument};
use crate::error::OidcError;
use crate::jwks::{JwksCache, JwksCacheConfig};

/// Clock skew tolerated when checking `exp` and `nbf`.
const VALIDATION_LEEWAY_SECS: u64 = 60;

/// Timeout applied to every provider request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Successful response from the token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// The OAuth access token, unused by this crate but carried along.
    #[serde(default)]
    pub access_token: Option<String>,

    /// The raw ID token to verify.
    #[serde(default)]
    pub id_token: Option<String>,

    /// Token type, normally `Bearer`.
    #[serde(default)]
    pub token_type: Option<String>,

    /// Access token lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Error body from the token endpoint (RFC 6749 section 5.2).
#[derive(Debug, Deserialize)]
struct OAuthErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Client for one auth method's OIDC provider.
pub struct ProviderClient {
    config: AuthMethodConfig,
    http_client: reqwest::Client,
    discovery: DiscoveryCache,
    jwks: JwksCache,
}

impl ProviderClient {
    /// Creates a provider client for the given auth method.
    ///
    /// Validates the configuration and builds the HTTP client with the
    /// method's CA trust material and a request timeout.
    ///
    /// # Errors
    ///
    /// Returns `OidcError::Config` if the configuration is invalid or a
    /// CA certificate cannot be parsed, and `OidcError::Network` if the
    /// HTTP client cannot be built.
    pub fn new(config: AuthMethodConfig) -> Result<Self, OidcError> {
        config.validate()?;

        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        for pem in &config.discovery_ca_pem {
            let cert = reqwest::Certificate::from_pem(pem.as_bytes())
                .map_err(|e| ConfigError::InvalidCaPem(e.to_string()))?;
            builder = builder.add_root_certificate(cert);
        }
        let http_client = builder.build()?;

        let discovery = DiscoveryCache::new(
            http_client.clone(),
            DiscoveryCacheConfig::default().with_allow_http(config.allow_http),
        );
        let jwks = JwksCache::new(
            http_client.clone(),
            JwksCacheConfig::default().with_allow_http(config.allow_http),
        );

        Ok(Self {
            config,
            http_client,
            discovery,
            jwks,
        })
    }

    /// Returns the auth method configuration.
    #[must_use]
    pub fn config(&self) -> &AuthMethodConfig {
        &self.config
    }

    /// Builds the provider authorization URL for a login flow.
    ///
    /// # Errors
    ///
    /// Returns `OidcError::RedirectNotAllowed` without contacting the
    /// provider when the redirect URI is outside the method's allow-list,
    /// or a discovery error when provider metadata cannot be obtained.
    pub async fn build_auth_url(
        &self,
        redirect_uri: &str,
        state: &str,
        nonce: &str,
    ) -> Result<Url, OidcError> {
        self.check_redirect_uri(redirect_uri)?;

        let document = self.discovery.get(&self.config.discovery_url).await?;
        let mut auth_url = Url::parse(&document.authorization_endpoint)?;

        let mut scope = String::from("openid");
        for extra in &self.config.oidc_scopes {
            scope.push(' ');
            scope.push_str(extra);
        }

        {
            let mut pairs = auth_url.query_pairs_mut();
            pairs
                .append_pair("client_id", &self.config.client_id)
                .append_pair("nonce", nonce)
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("response_type", "code")
                .append_pair("scope", &scope)
                .append_pair("state", state);
            if let Some(audience) = self.config.bound_audiences.first() {
                pairs.append_pair("audience", audience);
            }
        }

        Ok(auth_url)
    }

    /// Exchanges an authorization code for the provider's token response.
    ///
    /// # Errors
    ///
    /// Returns `OidcError::RedirectNotAllowed` without contacting the
    /// provider when the redirect URI is outside the allow-list,
    /// `OidcError::OAuth` when the provider returns a structured error,
    /// and `OidcError::ExchangeFailed` for other failures including a
    /// response carrying no ID token.
    pub async fn exchange(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, OidcError> {
        self.check_redirect_uri(redirect_uri)?;

        let document = self.discovery.get(&self.config.discovery_url).await?;

        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.config.client_id.as_str()),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let response = self
            .http_client
            .post(&document.token_endpoint)
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if let Ok(oauth) = serde_json::from_str::<OAuthErrorResponse>(&body) {
                tracing::warn!(
                    method = %self.config.name,
                    code = %oauth.error,
                    "token exchange rejected by provider"
                );
                return Err(OidcError::OAuth {
                    code: oauth.error,
                    description: oauth.error_description.unwrap_or_default(),
                });
            }
            return Err(OidcError::ExchangeFailed(format!(
                "token endpoint returned HTTP {}",
                status.as_u16()
            )));
        }

        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| OidcError::ExchangeFailed(format!("invalid token response: {e}")))?;

        if tokens.id_token.is_none() {
            return Err(OidcError::ExchangeFailed(
                "token response carried no ID token".to_string(),
            ));
        }

        Ok(tokens)
    }

    /// Verifies a raw ID token and extracts the mapped claims.
    ///
    /// Checks, in order: header algorithm against the method's allowed
    /// set, signature against the provider's published key for the
    /// header's `kid`, issuer, expiry and not-before (with leeway),
    /// bound audiences, and the nonce the flow was started with.
    ///
    /// A signature failure with a cached key triggers one JWKS refresh
    /// and retry, covering provider key rotation inside the cache TTL.
    ///
    /// # Errors
    ///
    /// Returns the precise token failure; see [`OidcError`].
    pub async fn verify(
        &self,
        raw_id_token: &str,
        expected_nonce: &str,
    ) -> Result<AuthClaims, OidcError> {
        let document = self.discovery.get(&self.config.discovery_url).await?;
        let jwks_uri = Url::parse(&document.jwks_uri)?;

        let header = decode_header(raw_id_token)
            .map_err(|e| OidcError::VerificationFailed(format!("malformed token header: {e}")))?;

        let allowed_algs = self.config.parsed_signing_algs()?;
        if !allowed_algs.contains(&header.alg) {
            tracing::warn!(
                method = %self.config.name,
                alg = ?header.alg,
                "ID token signed with disallowed algorithm"
            );
            return Err(OidcError::SignatureInvalid);
        }

        let kid = header.kid.ok_or(OidcError::MissingKeyId)?;

        let (key, _) = self.jwks.get_key(&jwks_uri, &kid).await?;
        let validation = self.validation(&allowed_algs, &document);

        let token = match decode::<IdTokenClaims>(raw_id_token, &key, &validation) {
            Ok(data) => data.claims,
            Err(err) if is_signature_failure(&err) => {
                // The cached key may predate a provider key rotation.
                // Refresh the key set and retry once.
                tracing::debug!(
                    method = %self.config.name,
                    %kid,
                    "signature failed with cached key, refreshing JWKS"
                );
                self.jwks.invalidate(&jwks_uri).await;
                let (key, _) = self.jwks.get_key(&jwks_uri, &kid).await?;
                decode::<IdTokenClaims>(raw_id_token, &key, &validation)
                    .map_err(map_decode_error)?
                    .claims
            }
            Err(err) => return Err(map_decode_error(err)),
        };

        if !self.config.bound_audiences.is_empty()
            && !self
                .config
                .bound_audiences
                .iter()
                .any(|aud| token.aud.contains(aud))
        {
            tracing::warn!(
                method = %self.config.name,
                audiences = ?token.aud.to_vec(),
                "ID token audience matches no bound audience"
            );
            return Err(OidcError::AudienceMismatch);
        }

        if token.nonce.as_deref() != Some(expected_nonce) {
            tracing::warn!(method = %self.config.name, "ID token nonce mismatch");
            return Err(OidcError::NonceMismatch);
        }

        Ok(AuthClaims::from_token(&self.config, &token))
    }

    fn check_redirect_uri(&self, redirect_uri: &str) -> Result<(), OidcError> {
        if !self.config.redirect_uri_allowed(redirect_uri) {
            tracing::warn!(
                method = %self.config.name,
                redirect_uri,
                "redirect URI rejected by allow-list"
            );
            return Err(OidcError::RedirectNotAllowed(redirect_uri.to_string()));
        }
        Ok(())
    }

    fn validation(&self, algs: &[Algorithm], document: &DiscoveryDocument) -> Validation {
        let mut validation = Validation::new(algs.first().copied().unwrap_or(Algorithm::RS256));
        validation.algorithms = algs.to_vec();
        validation.leeway = VALIDATION_LEEWAY_SECS;
        validation.set_issuer(&[&document.issuer]);
        // The aud claim is matched against bound audiences by hand.
        validation.validate_aud = false;
        validation
    }
}

impl std::fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderClient")
            .field("method", &self.config.name)
            .field("discovery_url", &self.config.discovery_url.as_str())
            .finish_non_exhaustive()
    }
}

fn is_signature_failure(err: &jsonwebtoken::errors::Error) -> bool {
    matches!(
        err.kind(),
        jsonwebtoken::errors::ErrorKind::InvalidSignature
    )
}

fn map_decode_error(err: jsonwebtoken::errors::Error) -> OidcError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => OidcError::TokenExpired,
        ErrorKind::ImmatureSignature => OidcError::TokenNotYetValid,
        ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => OidcError::SignatureInvalid,
        _ => OidcError::VerificationFailed(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn discovery_body(issuer: &str) -> serde_json::Value {
        serde_json::json!({
            "issuer": issuer,
            "authorization_endpoint": format!("{issuer}/authorize"),
            "token_endpoint": format!("{issuer}/token"),
            "jwks_uri": format!("{issuer}/jwks"),
            "response_types_supported": ["code"],
            "subject_types_supported": ["public"],
            "id_token_signing_alg_values_supported": ["RS256"]
        })
    }

    async fn mock_provider() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(discovery_body(&server.uri())))
            .mount(&server)
            .await;
        server
    }

    fn client_for(server: &MockServer) -> ProviderClient {
        let config = AuthMethodConfig::new(
            "mock",
            Url::parse(&server.uri()).unwrap(),
            "mock-client",
        )
        .with_client_secret("mock-secret")
        .with_bound_audiences(vec!["mock-client"])
        .with_allowed_redirect_uris(vec!["http://cluster.local/oidc/callback"])
        .with_allow_http(true);
        ProviderClient::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_build_auth_url_parameters() {
        let server = mock_provider().await;
        let client = client_for(&server);

        let url = client
            .build_auth_url("http://cluster.local/oidc/callback", "st_abc", "nonce-1")
            .await
            .unwrap();

        assert!(url.as_str().starts_with(&format!("{}/authorize?", server.uri())));
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params.get("client_id").map(String::as_str), Some("mock-client"));
        assert_eq!(params.get("response_type").map(String::as_str), Some("code"));
        assert_eq!(params.get("scope").map(String::as_str), Some("openid"));
        assert_eq!(params.get("state").map(String::as_str), Some("st_abc"));
        assert_eq!(params.get("nonce").map(String::as_str), Some("nonce-1"));
        assert_eq!(
            params.get("redirect_uri").map(String::as_str),
            Some("http://cluster.local/oidc/callback")
        );
        assert_eq!(params.get("audience").map(String::as_str), Some("mock-client"));
    }

    #[tokio::test]
    async fn test_build_auth_url_extra_scopes() {
        let server = mock_provider().await;
        let config = AuthMethodConfig::new(
            "mock",
            Url::parse(&server.uri()).unwrap(),
            "mock-client",
        )
        .with_allowed_redirect_uris(vec!["http://cb"])
        .with_scope("profile")
        .with_scope("email")
        .with_allow_http(true);
        let client = ProviderClient::new(config).unwrap();

        let url = client.build_auth_url("http://cb", "st_x", "n").await.unwrap();
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(
            params.get("scope").map(String::as_str),
            Some("openid profile email")
        );
    }

    #[tokio::test]
    async fn test_disallowed_redirect_uri_no_provider_contact() {
        let server = MockServer::start().await;
        // Any request at all fails the test.
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let result = client
            .build_auth_url("http://evil.example.com/cb", "st_x", "n")
            .await;
        assert!(matches!(result, Err(OidcError::RedirectNotAllowed(_))));

        let result = client.exchange("code", "http://evil.example.com/cb").await;
        assert!(matches!(result, Err(OidcError::RedirectNotAllowed(_))));
    }

    #[tokio::test]
    async fn test_exchange_posts_code_and_parses_tokens() {
        let server = mock_provider().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=auth-code"))
            .and(body_string_contains("client_secret=mock-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at",
                "id_token": "header.payload.sig",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let tokens = client
            .exchange("auth-code", "http://cluster.local/oidc/callback")
            .await
            .unwrap();
        assert_eq!(tokens.id_token.as_deref(), Some("header.payload.sig"));
    }

    #[tokio::test]
    async fn test_exchange_maps_oauth_error() {
        let server = mock_provider().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "code expired"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let result = client
            .exchange("stale-code", "http://cluster.local/oidc/callback")
            .await;
        match result {
            Err(OidcError::OAuth { code, description }) => {
                assert_eq!(code, "invalid_grant");
                assert_eq!(description, "code expired");
            }
            other => panic!("expected OAuth error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exchange_requires_id_token() {
        let server = mock_provider().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at",
                "token_type": "Bearer"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let result = client
            .exchange("auth-code", "http://cluster.local/oidc/callback")
            .await;
        assert!(matches!(result, Err(OidcError::ExchangeFailed(_))));
    }

    #[tokio::test]
    async fn test_verify_rejects_malformed_token() {
        let server = mock_provider().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "keys": [] })),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let result = client.verify("not-a-jwt", "nonce").await;
        assert!(matches!(result, Err(OidcError::VerificationFailed(_))));
    }
}
