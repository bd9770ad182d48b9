//! Auth method configuration.
//!
//! This module provides the configuration types for OIDC auth methods.
//! An auth method describes one external identity provider trusted by the
//! ACL subsystem: where to find it, how to authenticate against it, and
//! which of its claims are exposed to binding rules.
//!
//! # Example
//!
//! ```ignore
//! use flotilla_oidc::config::AuthMethodConfig;
//! use url::Url;
//!
//! let config = AuthMethodConfig::new(
//!     "github",
//!     Url::parse("https://auth.example.com")?,
//!     "client-id",
//! )
//! .with_client_secret("client-secret")
//! .with_bound_audiences(vec!["client-id"])
//! .with_allowed_redirect_uris(vec!["https://cluster.example.com/oidc/callback"])
//! .with_claim_mapping("login", "github_login");
//!
//! config.validate()?;
//! ```

use std::collections::HashMap;

use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use url::Url;

/// Errors produced when validating an auth method configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The auth method name is empty.
    #[error("auth method name must not be empty")]
    EmptyName,

    /// The OAuth client ID is empty.
    #[error("OIDC client ID must not be empty")]
    EmptyClientId,

    /// No allowed redirect URIs are configured.
    #[error("at least one allowed redirect URI is required")]
    NoRedirectUris,

    /// A configured signing algorithm is not recognized.
    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The signing algorithm list is empty, which would reject every
    /// token.
    #[error("at least one signing algorithm is required")]
    EmptySigningAlgs,

    /// A configured CA certificate could not be parsed.
    #[error("invalid discovery CA certificate: {0}")]
    InvalidCaPem(String),

    /// The discovery URL uses a scheme that is not allowed.
    #[error("discovery URL must use HTTPS: {0}")]
    InsecureDiscoveryUrl(String),
}

/// Configuration for a single OIDC auth method.
///
/// Immutable for the lifetime of a flow. The auth-method store (an external
/// collaborator) owns creation and updates; this core only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthMethodConfig {
    /// Unique auth method name (e.g., "github", "corp-sso").
    pub name: String,

    /// The OIDC issuer / discovery base URL.
    pub discovery_url: Url,

    /// OAuth client ID registered with the provider.
    pub client_id: String,

    /// OAuth client secret (None for public clients).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Audiences the verified token must carry at least one of.
    #[serde(default)]
    pub bound_audiences: Vec<String>,

    /// Exact-match allow-list of redirect URIs. Flows presenting any other
    /// redirect URI fail before the provider is contacted.
    #[serde(default)]
    pub allowed_redirect_uris: Vec<String>,

    /// Additional PEM CA certificates trusted when talking to the provider.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discovery_ca_pem: Vec<String>,

    /// JWS algorithms accepted on the ID token (default: RS256).
    #[serde(default = "default_signing_algs")]
    pub signing_algs: Vec<String>,

    /// External claim name -> internal bind name, for scalar claims.
    #[serde(default)]
    pub claim_mappings: HashMap<String, String>,

    /// External claim name -> internal bind name, for multi-valued claims.
    #[serde(default)]
    pub list_claim_mappings: HashMap<String, String>,

    /// OAuth scopes requested in addition to the always-present `openid`.
    #[serde(default)]
    pub oidc_scopes: Vec<String>,

    /// Maximum TTL granted to tokens minted from this method. Carried for
    /// the external token minter; no behavior in this core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_token_ttl: Option<time::Duration>,

    /// Token locality ("local" or "global"). Carried for the external
    /// token minter; no behavior in this core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_locality: Option<String>,

    /// Whether to allow an HTTP (non-HTTPS) discovery URL.
    /// This should only be enabled for testing.
    #[serde(default)]
    pub allow_http: bool,
}

fn default_signing_algs() -> Vec<String> {
    vec!["RS256".to_string()]
}

impl AuthMethodConfig {
    /// Creates a new auth method configuration with required fields.
    #[must_use]
    pub fn new(name: impl Into<String>, discovery_url: Url, client_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            discovery_url,
            client_id: client_id.into(),
            client_secret: None,
            bound_audiences: Vec::new(),
            allowed_redirect_uris: Vec::new(),
            discovery_ca_pem: Vec::new(),
            signing_algs: default_signing_algs(),
            claim_mappings: HashMap::new(),
            list_claim_mappings: HashMap::new(),
            oidc_scopes: Vec::new(),
            max_token_ttl: None,
            token_locality: None,
            allow_http: false,
        }
    }

    /// Sets the client secret.
    #[must_use]
    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    /// Sets the bound audiences.
    #[must_use]
    pub fn with_bound_audiences(mut self, audiences: Vec<impl Into<String>>) -> Self {
        self.bound_audiences = audiences.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the allowed redirect URIs.
    #[must_use]
    pub fn with_allowed_redirect_uris(mut self, uris: Vec<impl Into<String>>) -> Self {
        self.allowed_redirect_uris = uris.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a PEM CA certificate to trust when talking to the provider.
    #[must_use]
    pub fn with_discovery_ca_pem(mut self, pem: impl Into<String>) -> Self {
        self.discovery_ca_pem.push(pem.into());
        self
    }

    /// Sets the accepted signing algorithms.
    #[must_use]
    pub fn with_signing_algs(mut self, algs: Vec<impl Into<String>>) -> Self {
        self.signing_algs = algs.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a scalar claim mapping (external claim name -> bind name).
    #[must_use]
    pub fn with_claim_mapping(
        mut self,
        claim: impl Into<String>,
        bind_name: impl Into<String>,
    ) -> Self {
        self.claim_mappings.insert(claim.into(), bind_name.into());
        self
    }

    /// Adds a list claim mapping (external claim name -> bind name).
    #[must_use]
    pub fn with_list_claim_mapping(
        mut self,
        claim: impl Into<String>,
        bind_name: impl Into<String>,
    ) -> Self {
        self.list_claim_mappings
            .insert(claim.into(), bind_name.into());
        self
    }

    /// Adds an OAuth scope requested in addition to `openid`.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.oidc_scopes.push(scope.into());
        self
    }

    /// Allows an HTTP discovery URL.
    ///
    /// # Warning
    ///
    /// This should only be used for testing. In production, OIDC discovery
    /// should always use HTTPS.
    #[must_use]
    pub fn with_allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }

    /// Returns `true` if the redirect URI is in the configured allow-list.
    #[must_use]
    pub fn redirect_uri_allowed(&self, redirect_uri: &str) -> bool {
        self.allowed_redirect_uris
            .iter()
            .any(|u| u == redirect_uri)
    }

    /// Returns the accepted signing algorithms as parsed values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnsupportedAlgorithm` for any entry that is
    /// not a recognized JWS algorithm.
    pub fn parsed_signing_algs(&self) -> Result<Vec<Algorithm>, ConfigError> {
        self.signing_algs
            .iter()
            .map(|a| parse_algorithm(a))
            .collect()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.client_id.is_empty() {
            return Err(ConfigError::EmptyClientId);
        }
        if self.allowed_redirect_uris.is_empty() {
            return Err(ConfigError::NoRedirectUris);
        }
        if self.signing_algs.is_empty() {
            return Err(ConfigError::EmptySigningAlgs);
        }
        if self.discovery_url.scheme() != "https" && !self.allow_http {
            return Err(ConfigError::InsecureDiscoveryUrl(
                self.discovery_url.to_string(),
            ));
        }
        self.parsed_signing_algs()?;
        for pem in &self.discovery_ca_pem {
            if !pem.contains("-----BEGIN CERTIFICATE-----") {
                return Err(ConfigError::InvalidCaPem(
                    "missing PEM certificate header".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Parses an algorithm name into a `jsonwebtoken::Algorithm`.
pub(crate) fn parse_algorithm(alg: &str) -> Result<Algorithm, ConfigError> {
    match alg {
        "RS256" => Ok(Algorithm::RS256),
        "RS384" => Ok(Algorithm::RS384),
        "RS512" => Ok(Algorithm::RS512),
        "ES256" => Ok(Algorithm::ES256),
        "ES384" => Ok(Algorithm::ES384),
        "PS256" => Ok(Algorithm::PS256),
        "PS384" => Ok(Algorithm::PS384),
        "PS512" => Ok(Algorithm::PS512),
        "EdDSA" => Ok(Algorithm::EdDSA),
        _ => Err(ConfigError::UnsupportedAlgorithm(alg.to_string())),
    }
}
