//! Identity projection for binding-rule evaluation.
//!
//! A completed login yields verified [`AuthClaims`]; binding rules
//! downstream consume a flat string map. [`project`] bridges the two: it
//! seeds an empty-string entry for every bind name the method could
//! populate, then overlays the claims that were actually present. Rules
//! can therefore rely on every mapped key existing, with absence
//! represented as `""` rather than a missing key.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::claims::AuthClaims;
use crate::config::AuthMethodConfig;

/// Prefix under which scalar claim values are exposed to binding rules.
const VALUE_PREFIX: &str = "value.";

/// Claims attached to an identity, tagged by where they came from.
///
/// Today OIDC is the only source; the enum keeps room for others (JWT
/// auth methods, workload identities) without changing consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", content = "claims", rename_all = "snake_case")]
pub enum IdentityClaims {
    /// Claims extracted from a verified OIDC ID token.
    Oidc(AuthClaims),
}

/// An authenticated identity ready for binding-rule evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// The verified claims the identity was built from.
    pub claims: IdentityClaims,

    /// Flat selector map consumed by binding rules.
    ///
    /// Every bind name from the method's mapping tables is present under
    /// `value.`, defaulting to `""`; claims present in the token overlay
    /// their value under `value.` plus the external claim name.
    pub claim_mappings: HashMap<String, String>,
}

/// Projects verified claims into an [`Identity`].
///
/// Pure and infallible: the same config and claims always produce the
/// same identity.
#[must_use]
pub fn project(config: &AuthMethodConfig, claims: AuthClaims) -> Identity {
    let mut claim_mappings = HashMap::new();

    // Seed every bind name with "" so rules can rely on the key existing.
    for bind_name in config.claim_mappings.values() {
        claim_mappings.insert(format!("{VALUE_PREFIX}{bind_name}"), String::new());
    }
    for bind_name in config.list_claim_mappings.values() {
        claim_mappings.insert(format!("{VALUE_PREFIX}{bind_name}"), String::new());
    }

    // Overlay the claims actually present, keyed by external claim name.
    for (claim, value) in &claims.value {
        claim_mappings.insert(format!("{VALUE_PREFIX}{claim}"), value.clone());
    }

    Identity {
        claims: IdentityClaims::Oidc(claims),
        claim_mappings,
    }
}
