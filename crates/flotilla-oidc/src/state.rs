//! Single-use state tokens for login flows.
//!
//! Every auth URL issued carries an opaque state token minted here. The
//! token binds the later callback to the flow that started it: it is
//! single-use, expires after a short TTL, and remembers which auth method
//! and client nonce it was minted for.
//!
//! # Security
//!
//! - Tokens carry 32 bytes (256 bits) of OS randomness, base64url-encoded.
//! - `consume` looks up and removes under one lock guard, so two racing
//!   callbacks with the same token cannot both succeed.
//! - A presented token is removed on every path, including failures. A
//!   replayed token always fails, whatever the first presentation did.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Prefix carried by every state token.
const STATE_TOKEN_PREFIX: &str = "st_";

/// Errors produced when consuming a state token.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    /// The token is unknown: never issued, already consumed, or expired.
    #[error("unknown, expired, or already used state token")]
    UnknownState,

    /// The token exists but was minted for a different auth method.
    #[error("state token was issued for a different auth method")]
    AuthMethodMismatch,
}

/// A pending login flow awaiting its callback.
#[derive(Debug, Clone)]
struct StateRecord {
    auth_method_name: String,
    client_nonce: String,
    expires_at: OffsetDateTime,
}

impl StateRecord {
    fn is_expired(&self) -> bool {
        OffsetDateTime::now_utc() >= self.expires_at
    }
}

/// Configuration for the state store.
#[derive(Debug, Clone)]
pub struct StateStoreConfig {
    /// How long an issued state token stays valid.
    pub ttl: Duration,

    /// How often the background sweep removes expired records.
    pub sweep_interval: Duration,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl StateStoreConfig {
    /// Sets the state token TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the background sweep interval.
    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// In-memory store of pending login flows, keyed by state token.
///
/// Deliberately not persisted: a restart drops pending flows and users
/// simply restart their login.
#[derive(Debug)]
pub struct StateStore {
    config: StateStoreConfig,
    records: Mutex<HashMap<String, StateRecord>>,
}

impl StateStore {
    /// Creates a state store with default TTL and sweep interval.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StateStoreConfig::default())
    }

    /// Creates a state store with the given configuration.
    #[must_use]
    pub fn with_config(config: StateStoreConfig) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Mints a new state token bound to the auth method and client nonce.
    pub async fn create(&self, auth_method_name: &str, client_nonce: &str) -> String {
        let token = generate_state_token();
        let record = StateRecord {
            auth_method_name: auth_method_name.to_string(),
            client_nonce: client_nonce.to_string(),
            expires_at: OffsetDateTime::now_utc() + self.config.ttl,
        };

        let mut records = self.records.lock().await;
        records.insert(token.clone(), record);
        token
    }

    /// Consumes a state token, returning the client nonce it was minted
    /// with.
    ///
    /// The token is removed whether or not the call succeeds; a second
    /// presentation of the same token always returns
    /// [`StateError::UnknownState`].
    ///
    /// # Errors
    ///
    /// - `UnknownState` if the token was never issued, already used, or
    ///   expired.
    /// - `AuthMethodMismatch` if it was minted for a different auth method.
    pub async fn consume(
        &self,
        state_token: &str,
        auth_method_name: &str,
    ) -> Result<String, StateError> {
        let mut records = self.records.lock().await;

        // Remove first so every presented token is burned, then judge.
        let record = records
            .remove(state_token)
            .ok_or(StateError::UnknownState)?;

        if record.is_expired() {
            return Err(StateError::UnknownState);
        }
        if record.auth_method_name != auth_method_name {
            return Err(StateError::AuthMethodMismatch);
        }

        Ok(record.client_nonce)
    }

    /// Removes expired records, returning how many were removed.
    pub async fn sweep(&self) -> usize {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| !record.is_expired());
        before - records.len()
    }

    /// Returns the number of pending flows.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Returns `true` if no flows are pending.
    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns a background task that periodically sweeps expired records.
///
/// The task runs until the returned handle is aborted or the runtime
/// shuts down.
pub fn spawn_sweep_task(store: Arc<StateStore>) -> JoinHandle<()> {
    let interval = store.config.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = store.sweep().await;
            if removed > 0 {
                tracing::debug!(removed, "swept expired login states");
            }
        }
    })
}

/// Generates a state token: `st_` plus 32 random bytes, base64url encoded
/// without padding.
fn generate_state_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{STATE_TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
}
