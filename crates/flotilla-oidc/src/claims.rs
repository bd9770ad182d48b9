//! Verified token claims.
//!
//! `IdTokenClaims` is the raw deserialized payload of an ID token.
//! `AuthClaims` is the distilled, immutable view handed to callers: only
//! the claims named in the auth method's mapping tables are carried, and
//! every value is coerced to a string. Claims not named in a mapping are
//! dropped, so downstream binding rules can only ever see what the method
//! explicitly exposed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::config::AuthMethodConfig;

/// The `aud` claim: a single string or an array of strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    /// Single audience value.
    Single(String),
    /// Multiple audience values.
    Multiple(Vec<String>),
}

impl Audience {
    /// Returns `true` if the audience contains the given value.
    #[must_use]
    pub fn contains(&self, value: &str) -> bool {
        match self {
            Audience::Single(aud) => aud == value,
            Audience::Multiple(auds) => auds.iter().any(|a| a == value),
        }
    }

    /// Returns the audiences as a vector of strings.
    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Audience::Single(aud) => vec![aud.clone()],
            Audience::Multiple(auds) => auds.clone(),
        }
    }
}

/// Raw ID token payload.
#[derive(Debug, Clone, Deserialize)]
pub struct IdTokenClaims {
    /// Issuer identifier.
    pub iss: String,

    /// Subject identifier.
    pub sub: String,

    /// Intended audience(s).
    pub aud: Audience,

    /// Expiration time (seconds since epoch).
    pub exp: i64,

    /// Issued-at time (seconds since epoch).
    #[serde(default)]
    pub iat: Option<i64>,

    /// Replay-protection nonce echoed back by the provider.
    #[serde(default)]
    pub nonce: Option<String>,

    /// All remaining claims, available to the mapping tables.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Immutable claims extracted from a verified ID token.
///
/// `value` holds scalar claims selected by the method's `claim_mappings`,
/// `list` holds multi-valued claims selected by `list_claim_mappings`.
/// Both are keyed by the external claim name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthClaims {
    /// Scalar claims, keyed by external claim name.
    pub value: HashMap<String, String>,

    /// List claims, keyed by external claim name.
    pub list: HashMap<String, Vec<String>>,

    /// Issuer of the verified token.
    pub issuer: String,

    /// Audiences the token was issued for.
    pub audiences: Vec<String>,

    /// Token expiry, for caller reference.
    pub expires_at: OffsetDateTime,
}

impl AuthClaims {
    /// Extracts the mapped claims from a verified token payload.
    ///
    /// Only claims named in the method's mapping tables are carried over.
    /// Scalar values are stringified; a scalar found where a list mapping
    /// points becomes a one-element list. Claims absent from the token are
    /// simply absent from the result.
    #[must_use]
    pub fn from_token(config: &AuthMethodConfig, token: &IdTokenClaims) -> Self {
        let mut value = HashMap::new();
        let mut list = HashMap::new();

        for claim in config.claim_mappings.keys() {
            if let Some(v) = token_claim(token, claim)
                && let Some(s) = stringify_claim(&v)
            {
                value.insert(claim.clone(), s);
            }
        }

        for claim in config.list_claim_mappings.keys() {
            if let Some(v) = token_claim(token, claim) {
                match v {
                    Value::Array(items) => {
                        let items = items.iter().filter_map(stringify_claim).collect();
                        list.insert(claim.clone(), items);
                    }
                    other => {
                        if let Some(s) = stringify_claim(&other) {
                            list.insert(claim.clone(), vec![s]);
                        }
                    }
                }
            }
        }

        let expires_at = OffsetDateTime::from_unix_timestamp(token.exp)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);

        Self {
            value,
            list,
            issuer: token.iss.clone(),
            audiences: token.aud.to_vec(),
            expires_at,
        }
    }
}

/// Looks up a claim by name. Registered claims land in dedicated struct
/// fields during deserialization, so they need an explicit lookup here to
/// stay mappable.
fn token_claim(token: &IdTokenClaims, name: &str) -> Option<Value> {
    match name {
        "iss" => Some(Value::String(token.iss.clone())),
        "sub" => Some(Value::String(token.sub.clone())),
        _ => token.extra.get(name).cloned(),
    }
}

/// Converts a scalar claim value to a string.
///
/// Strings pass through, numbers and booleans use their JSON rendering.
/// Objects, arrays, and null have no scalar rendering and are skipped.
fn stringify_claim(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn config() -> AuthMethodConfig {
        AuthMethodConfig::new(
            "test",
            Url::parse("https://auth.example.com").unwrap(),
            "client",
        )
        .with_allowed_redirect_uris(vec!["https://cb"])
        .with_claim_mapping("login", "alias")
        .with_claim_mapping("employee_id", "id")
        .with_list_claim_mapping("groups", "roles")
    }

    fn token(extra: serde_json::Value) -> IdTokenClaims {
        let mut payload = serde_json::json!({
            "iss": "https://auth.example.com",
            "sub": "user-1",
            "aud": "client",
            "exp": 4102444800i64
        });
        payload
            .as_object_mut()
            .unwrap()
            .extend(extra.as_object().unwrap().clone());
        serde_json::from_value(payload).unwrap()
    }

    #[test]
    fn test_audience_single_and_multiple() {
        let single: Audience = serde_json::from_str(r#""client""#).unwrap();
        assert!(single.contains("client"));
        assert!(!single.contains("other"));

        let multi: Audience = serde_json::from_str(r#"["a", "b"]"#).unwrap();
        assert!(multi.contains("b"));
        assert_eq!(multi.to_vec(), vec!["a", "b"]);
    }

    #[test]
    fn test_from_token_extracts_only_mapped_claims() {
        let token = token(serde_json::json!({
            "login": "jrasell",
            "email": "secret@example.com",
            "groups": ["engineering", "oncall"]
        }));
        let claims = AuthClaims::from_token(&config(), &token);

        assert_eq!(claims.value.get("login").map(String::as_str), Some("jrasell"));
        assert!(!claims.value.contains_key("email"));
        assert_eq!(
            claims.list.get("groups"),
            Some(&vec!["engineering".to_string(), "oncall".to_string()])
        );
    }

    #[test]
    fn test_from_token_missing_claims_absent() {
        let token = token(serde_json::json!({}));
        let claims = AuthClaims::from_token(&config(), &token);
        assert!(claims.value.is_empty());
        assert!(claims.list.is_empty());
    }

    #[test]
    fn test_from_token_coerces_scalars() {
        let token = token(serde_json::json!({
            "employee_id": 42,
            "login": true
        }));
        let claims = AuthClaims::from_token(&config(), &token);
        assert_eq!(claims.value.get("employee_id").map(String::as_str), Some("42"));
        assert_eq!(claims.value.get("login").map(String::as_str), Some("true"));
    }

    #[test]
    fn test_from_token_scalar_in_list_mapping() {
        let token = token(serde_json::json!({ "groups": "engineering" }));
        let claims = AuthClaims::from_token(&config(), &token);
        assert_eq!(
            claims.list.get("groups"),
            Some(&vec!["engineering".to_string()])
        );
    }

    #[test]
    fn test_from_token_maps_registered_claims() {
        let config = config().with_claim_mapping("sub", "subject");
        let token = token(serde_json::json!({}));
        let claims = AuthClaims::from_token(&config, &token);
        assert_eq!(claims.value.get("sub").map(String::as_str), Some("user-1"));
    }

    #[test]
    fn test_from_token_carries_issuer_audiences_expiry() {
        let token = token(serde_json::json!({}));
        let claims = AuthClaims::from_token(&config(), &token);
        assert_eq!(claims.issuer, "https://auth.example.com");
        assert_eq!(claims.audiences, vec!["client"]);
        assert_eq!(claims.expires_at.unix_timestamp(), 4102444800);
    }
}
