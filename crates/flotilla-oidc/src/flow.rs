//! Login flow orchestration.
//!
//! [`OidcAuthFlow`] ties the pieces together for the RPC layer: a
//! registry of [`ProviderClient`]s keyed by auth method name, and the
//! shared [`StateStore`] binding auth URLs to their callbacks.
//!
//! A login is two calls. [`OidcAuthFlow::get_auth_url`] mints a state
//! token and returns the provider URL to send the user to.
//! [`OidcAuthFlow::complete_auth`] takes the callback's code and state,
//! consumes the state, exchanges the code, verifies the ID token, and
//! returns the claims. There are no retries in either direction; a
//! failed flow is restarted from `get_auth_url`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use url::Url;

use crate::claims::AuthClaims;
use crate::config::AuthMethodConfig;
use crate::error::OidcError;
use crate::identity::{self, Identity};
use crate::provider::ProviderClient;
use crate::state::StateStore;

/// Orchestrates OIDC login flows across registered auth methods.
pub struct OidcAuthFlow {
    state_store: Arc<StateStore>,
    providers: Arc<RwLock<HashMap<String, Arc<ProviderClient>>>>,
}

impl OidcAuthFlow {
    /// Creates a flow service with a fresh state store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_state_store(Arc::new(StateStore::new()))
    }

    /// Creates a flow service sharing an existing state store.
    #[must_use]
    pub fn with_state_store(state_store: Arc<StateStore>) -> Self {
        Self {
            state_store,
            providers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns the state store, e.g. for spawning the expiry sweep task.
    #[must_use]
    pub fn state_store(&self) -> Arc<StateStore> {
        Arc::clone(&self.state_store)
    }

    /// Registers an auth method, replacing any previous registration
    /// under the same name.
    ///
    /// # Errors
    ///
    /// Returns `OidcError::Config` if the configuration is invalid.
    pub async fn register_method(&self, config: AuthMethodConfig) -> Result<(), OidcError> {
        let name = config.name.clone();
        let client = Arc::new(ProviderClient::new(config)?);

        let mut providers = self.providers.write().await;
        providers.insert(name.clone(), client);
        tracing::debug!(method = %name, "registered OIDC auth method");
        Ok(())
    }

    /// Removes an auth method, returning `true` if it was registered.
    ///
    /// Pending flows started against the method fail at completion with
    /// [`OidcError::AuthMethodNotFound`].
    pub async fn deregister_method(&self, name: &str) -> bool {
        let mut providers = self.providers.write().await;
        let removed = providers.remove(name).is_some();
        if removed {
            tracing::debug!(method = %name, "deregistered OIDC auth method");
        }
        removed
    }

    /// Returns the provider client for an auth method.
    pub async fn get_method(&self, name: &str) -> Option<Arc<ProviderClient>> {
        self.providers.read().await.get(name).cloned()
    }

    /// Starts a login flow, returning the provider authorization URL.
    ///
    /// Mints a single-use state token bound to the method and the
    /// caller's nonce; the same nonce must be presented again at
    /// completion.
    ///
    /// # Errors
    ///
    /// Returns `AuthMethodNotFound` for an unregistered method,
    /// `RedirectNotAllowed` for a redirect URI outside the allow-list,
    /// or a discovery error.
    pub async fn get_auth_url(
        &self,
        auth_method_name: &str,
        redirect_uri: &str,
        client_nonce: &str,
    ) -> Result<Url, OidcError> {
        let provider = self.lookup(auth_method_name).await?;

        let state = self.state_store.create(auth_method_name, client_nonce).await;
        provider
            .build_auth_url(redirect_uri, &state, client_nonce)
            .await
    }

    /// Completes a login flow, returning the verified claims.
    ///
    /// The presented state token is consumed whatever the outcome; after
    /// any failure the user restarts from [`OidcAuthFlow::get_auth_url`].
    ///
    /// # Errors
    ///
    /// State failures surface as `InvalidState` or `AuthMethodMismatch`
    /// and a stale nonce as `NonceMismatch`; all three are attack
    /// indicators whose precise cause is logged server-side only.
    /// Exchange and verification failures surface as described on
    /// [`ProviderClient`].
    pub async fn complete_auth(
        &self,
        auth_method_name: &str,
        redirect_uri: &str,
        client_nonce: &str,
        code: &str,
        state: &str,
    ) -> Result<AuthClaims, OidcError> {
        let provider = self.lookup(auth_method_name).await?;
        self.complete_auth_with(
            &provider,
            auth_method_name,
            redirect_uri,
            client_nonce,
            code,
            state,
        )
        .await
    }

    /// Completes a login flow and projects the claims into an
    /// [`Identity`] ready for binding-rule evaluation.
    ///
    /// The provider is resolved once, up front; a deregistration racing
    /// the completion does not lose a flow whose authorization code was
    /// already spent.
    ///
    /// # Errors
    ///
    /// Same as [`OidcAuthFlow::complete_auth`]; the projection itself is
    /// infallible.
    pub async fn complete_auth_identity(
        &self,
        auth_method_name: &str,
        redirect_uri: &str,
        client_nonce: &str,
        code: &str,
        state: &str,
    ) -> Result<Identity, OidcError> {
        let provider = self.lookup(auth_method_name).await?;
        let claims = self
            .complete_auth_with(
                &provider,
                auth_method_name,
                redirect_uri,
                client_nonce,
                code,
                state,
            )
            .await?;

        Ok(identity::project(provider.config(), claims))
    }

    async fn complete_auth_with(
        &self,
        provider: &ProviderClient,
        auth_method_name: &str,
        redirect_uri: &str,
        client_nonce: &str,
        code: &str,
        state: &str,
    ) -> Result<AuthClaims, OidcError> {
        let stored_nonce = self
            .state_store
            .consume(state, auth_method_name)
            .await
            .map_err(|e| {
                tracing::warn!(
                    method = %auth_method_name,
                    error = %e,
                    "login callback presented unusable state token"
                );
                OidcError::from(e)
            })?;

        if stored_nonce != client_nonce {
            tracing::warn!(
                method = %auth_method_name,
                "login callback presented a different nonce than the flow was started with"
            );
            return Err(OidcError::NonceMismatch);
        }

        let tokens = provider.exchange(code, redirect_uri).await?;
        let raw_id_token = tokens
            .id_token
            .as_deref()
            .ok_or_else(|| OidcError::ExchangeFailed("token response carried no ID token".to_string()))?;

        let claims = provider.verify(raw_id_token, client_nonce).await?;

        tracing::debug!(
            method = %auth_method_name,
            issuer = %claims.issuer,
            "completed OIDC authentication"
        );
        Ok(claims)
    }

    async fn lookup(&self, auth_method_name: &str) -> Result<Arc<ProviderClient>, OidcError> {
        self.get_method(auth_method_name)
            .await
            .ok_or_else(|| OidcError::AuthMethodNotFound(auth_method_name.to_string()))
    }
}

impl Default for OidcAuthFlow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(name: &str) -> AuthMethodConfig {
        AuthMethodConfig::new(
            name,
            Url::parse("https://auth.example.com").unwrap(),
            "client",
        )
        .with_allowed_redirect_uris(vec!["https://cluster.local/oidc/callback"])
    }

    #[tokio::test]
    async fn test_register_and_deregister() {
        let flow = OidcAuthFlow::new();
        flow.register_method(test_config("github")).await.unwrap();
        assert!(flow.get_method("github").await.is_some());

        assert!(flow.deregister_method("github").await);
        assert!(!flow.deregister_method("github").await);
        assert!(flow.get_method("github").await.is_none());
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_config() {
        let flow = OidcAuthFlow::new();
        let mut config = test_config("github");
        config.allowed_redirect_uris.clear();
        assert!(matches!(
            flow.register_method(config).await,
            Err(OidcError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let flow = OidcAuthFlow::new();
        let result = flow
            .get_auth_url("nope", "https://cluster.local/oidc/callback", "n")
            .await;
        assert!(matches!(result, Err(OidcError::AuthMethodNotFound(_))));

        let result = flow
            .complete_auth("nope", "https://cluster.local/oidc/callback", "n", "c", "st_x")
            .await;
        assert!(matches!(result, Err(OidcError::AuthMethodNotFound(_))));
    }

    #[tokio::test]
    async fn test_complete_auth_unknown_state() {
        let flow = OidcAuthFlow::new();
        flow.register_method(test_config("github")).await.unwrap();

        let result = flow
            .complete_auth(
                "github",
                "https://cluster.local/oidc/callback",
                "n",
                "code",
                "st_forged",
            )
            .await;
        assert!(matches!(result, Err(OidcError::InvalidState)));
    }

    #[tokio::test]
    async fn test_complete_auth_nonce_mismatch_burns_state() {
        let flow = OidcAuthFlow::new();
        flow.register_method(test_config("github")).await.unwrap();

        let state = flow.state_store.create("github", "original-nonce").await;
        let result = flow
            .complete_auth(
                "github",
                "https://cluster.local/oidc/callback",
                "other-nonce",
                "code",
                &state,
            )
            .await;
        assert!(matches!(result, Err(OidcError::NonceMismatch)));

        // The failed attempt consumed the state token.
        let result = flow
            .complete_auth(
                "github",
                "https://cluster.local/oidc/callback",
                "original-nonce",
                "code",
                &state,
            )
            .await;
        assert!(matches!(result, Err(OidcError::InvalidState)));
    }

    #[tokio::test]
    async fn test_state_minted_for_other_method() {
        let flow = OidcAuthFlow::new();
        flow.register_method(test_config("github")).await.unwrap();
        flow.register_method(test_config("gitlab")).await.unwrap();

        let state = flow.state_store.create("github", "n").await;
        let result = flow
            .complete_auth(
                "gitlab",
                "https://cluster.local/oidc/callback",
                "n",
                "code",
                &state,
            )
            .await;
        assert!(matches!(result, Err(OidcError::AuthMethodMismatch)));
    }
}
