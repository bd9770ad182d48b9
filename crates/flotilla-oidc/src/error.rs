//! Error types for OIDC login flows.
//!
//! Failures fall into three families, and the predicates on [`OidcError`]
//! classify them:
//!
//! - operator problems (`is_config_error`): a misconfigured auth method or
//!   an unreachable provider;
//! - attack indicators (`is_attack_indicator`): replayed or forged state,
//!   nonce and audience mismatches. Callers must show only the generic
//!   [`OidcError::surface_message`] for these, while the precise variant
//!   goes to the server-side audit log. A precise caller-facing message
//!   would give an attacker an oracle for probing the flow.
//! - token problems (`is_token_error`): the ID token itself failed
//!   verification.
//!
//! Nothing here is fatal to the process. A failed login leaves the user
//! restarting from a fresh auth URL.

use crate::config::ConfigError;
use crate::discovery::DiscoveryError;
use crate::jwks::JwksError;
use crate::state::StateError;

/// The caller-visible message for every attack-indicator failure.
const GENERIC_AUTH_FAILURE: &str = "authentication failed";

/// Errors produced by OIDC login operations.
#[derive(Debug, thiserror::Error)]
pub enum OidcError {
    /// No auth method with the given name is registered.
    #[error("auth method {0:?} not found")]
    AuthMethodNotFound(String),

    /// The redirect URI is not in the method's allow-list. Raised before
    /// any contact with the provider.
    #[error("redirect URI {0:?} is not allowed by the auth method")]
    RedirectNotAllowed(String),

    /// The auth method configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Provider metadata could not be obtained.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// Provider signing keys could not be obtained.
    #[error(transparent)]
    Jwks(#[from] JwksError),

    /// The state token is unknown, expired, or already used.
    #[error("unknown, expired, or already used login state")]
    InvalidState,

    /// The state token was minted for a different auth method.
    #[error("login state was issued for a different auth method")]
    AuthMethodMismatch,

    /// The nonce does not match the one the flow was started with.
    #[error("nonce mismatch")]
    NonceMismatch,

    /// The code-for-token exchange failed.
    #[error("token exchange failed: {0}")]
    ExchangeFailed(String),

    /// The provider returned a structured OAuth error.
    #[error("provider returned OAuth error {code}: {description}")]
    OAuth {
        /// The OAuth `error` code, e.g. `invalid_grant`.
        code: String,
        /// The provider's `error_description`, empty when absent.
        description: String,
    },

    /// The ID token header names no signing key.
    #[error("ID token header has no key id")]
    MissingKeyId,

    /// The ID token signature is invalid or uses a disallowed algorithm.
    #[error("ID token signature verification failed")]
    SignatureInvalid,

    /// No bound audience appears in the token's `aud` claim.
    #[error("ID token audience does not match any bound audience")]
    AudienceMismatch,

    /// The ID token has expired.
    #[error("ID token has expired")]
    TokenExpired,

    /// The ID token is not yet valid.
    #[error("ID token is not yet valid")]
    TokenNotYetValid,

    /// The ID token failed verification for another reason.
    #[error("ID token verification failed: {0}")]
    VerificationFailed(String),

    /// A network error outside discovery and JWKS fetching.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// A URL from provider metadata could not be parsed.
    #[error("invalid URL in provider metadata: {0}")]
    Url(#[from] url::ParseError),
}

impl OidcError {
    /// Returns `true` for failures that suggest a forged or replayed
    /// request rather than a misconfiguration.
    #[must_use]
    pub fn is_attack_indicator(&self) -> bool {
        matches!(
            self,
            OidcError::InvalidState
                | OidcError::AuthMethodMismatch
                | OidcError::NonceMismatch
                | OidcError::AudienceMismatch
                | OidcError::SignatureInvalid
        )
    }

    /// Returns `true` for failures an operator fixes by correcting the
    /// auth method or the provider deployment.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            OidcError::AuthMethodNotFound(_)
                | OidcError::Config(_)
                | OidcError::Discovery(_)
                | OidcError::Jwks(_)
                | OidcError::Url(_)
        )
    }

    /// Returns `true` for failures of the ID token itself.
    #[must_use]
    pub fn is_token_error(&self) -> bool {
        matches!(
            self,
            OidcError::SignatureInvalid
                | OidcError::AudienceMismatch
                | OidcError::TokenExpired
                | OidcError::TokenNotYetValid
                | OidcError::MissingKeyId
                | OidcError::VerificationFailed(_)
        )
    }

    /// Returns the message safe to show the remote caller.
    ///
    /// Attack indicators all collapse to the same generic message; other
    /// failures keep their descriptive one.
    #[must_use]
    pub fn surface_message(&self) -> String {
        if self.is_attack_indicator() {
            GENERIC_AUTH_FAILURE.to_string()
        } else {
            self.to_string()
        }
    }
}

impl From<StateError> for OidcError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::UnknownState => OidcError::InvalidState,
            StateError::AuthMethodMismatch => OidcError::AuthMethodMismatch,
        }
    }
}
