//! # flotilla-oidc
//!
//! OIDC federated login core for the Flotilla cluster manager's ACL
//! subsystem.
//!
//! This crate implements the server side of the OIDC authorization-code
//! flow for ACL auth methods: issuing provider authorization URLs,
//! exchanging callback codes for ID tokens, verifying those tokens
//! against the provider's published keys, and projecting the verified
//! claims into identities for binding-rule evaluation.
//!
//! ## Overview
//!
//! A login is two round-trips through [`OidcAuthFlow`]:
//!
//! 1. `get_auth_url` mints a single-use state token and returns the URL
//!    the user logs in at;
//! 2. `complete_auth` consumes the callback's state, exchanges the code
//!    at the provider's token endpoint, verifies the ID token, and
//!    returns the mapped claims.
//!
//! Transport, auth-method storage, token minting, and binding-rule
//! evaluation live in other parts of the server; this crate starts at a
//! decoded auth request and ends at verified claims.
//!
//! ## Modules
//!
//! - [`config`] - Auth method configuration and validation
//! - [`claims`] - Token claims and the mapped-claims model
//! - [`state`] - Single-use state tokens with expiry sweep
//! - [`discovery`] - Provider metadata fetching and caching
//! - [`jwks`] - Provider signing-key fetching and caching
//! - [`provider`] - Per-method client: auth URL, exchange, verify
//! - [`flow`] - Flow orchestration across registered methods
//! - [`identity`] - Projection of claims for binding rules
//! - [`error`] - Error taxonomy and caller-safe messages
//!
//! ## Example
//!
//! ```ignore
//! use flotilla_oidc::{AuthMethodConfig, OidcAuthFlow};
//! use url::Url;
//!
//! let flow = OidcAuthFlow::new();
//! flow.register_method(
//!     AuthMethodConfig::new(
//!         "corp-sso",
//!         Url::parse("https://auth.example.com")?,
//!         "flotilla",
//!     )
//!     .with_client_secret("...")
//!     .with_bound_audiences(vec!["flotilla"])
//!     .with_allowed_redirect_uris(vec!["https://cluster.example.com/oidc/callback"])
//!     .with_claim_mapping("login", "alias"),
//! )
//! .await?;
//!
//! let auth_url = flow
//!     .get_auth_url("corp-sso", "https://cluster.example.com/oidc/callback", "nonce")
//!     .await?;
//! // Redirect the user to auth_url; later, on callback:
//! let identity = flow
//!     .complete_auth_identity(
//!         "corp-sso",
//!         "https://cluster.example.com/oidc/callback",
//!         "nonce",
//!         "<code>",
//!         "<state>",
//!     )
//!     .await?;
//! ```

pub mod claims;
pub mod config;
pub mod discovery;
pub mod error;
pub mod flow;
pub mod identity;
pub mod jwks;
pub mod provider;
pub mod state;

pub use claims::{Audience, AuthClaims, IdTokenClaims};
pub use config::{AuthMethodConfig, ConfigError};
pub use discovery::{DiscoveryCache, DiscoveryCacheConfig, DiscoveryDocument, DiscoveryError};
pub use error::OidcError;
pub use flow::OidcAuthFlow;
pub use identity::{Identity, IdentityClaims, project};
pub use jwks::{JwksCache, JwksCacheConfig, JwksError};
pub use provider::{ProviderClient, TokenResponse};
pub use state::{StateError, StateStore, StateStoreConfig, spawn_sweep_task};

/// Type alias for OIDC flow results.
pub type OidcResult<T> = Result<T, OidcError>;
