//! Choosing, keeping, and re-deriving the credential the publisher acts with.
//!
//! Two strategies are tried in a fixed order:
//!
//! 1. A **service account**, from the inline key in the configuration or the key file. It is
//!    usable as soon as it parses.
//! 2. A **delegated** user token from `token.json`, refreshed (and re-persisted) if it has
//!    expired and carries a refresh token.
//!
//! If neither works, someone has to go through [`oauth::OAuthManager`] to authorize
//! interactively. The resulting [`CredentialHandle`] is shared by every pipeline in the process
//! and replaced wholesale (never mutated) when it stops working.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, MutexGuard, PoisonError, RwLock};
use tracing::instrument;

use crate::config::Config;
use crate::youtube_api::{ApiError, Channel, YouTubeClient};

pub mod oauth;
pub mod service_account;
pub mod token;

pub use oauth::{OAuthClientConfig, OAuthManager, looks_like_authorization_code};
pub use service_account::ServiceAccount;
pub use token::{CredentialsInfo, StoredToken};

/// Where Google's OAuth token endpoint lives unless a credential says otherwise.
pub const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Everything the publisher does needs to upload and to read the channel.
pub const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/youtube.upload",
    "https://www.googleapis.com/auth/youtube",
];

/// Which way of authenticating produced a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Service,
    Delegated,
    None,
}

impl Strategy {
    pub fn display_name(&self) -> &'static str {
        match self {
            Strategy::Service => "Service Account",
            Strategy::Delegated => "OAuth 2.0",
            Strategy::None => "None",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    /// Expired, but can be renewed without the user.
    ExpiredRefreshable,
    /// Expired for good; the user has to authorize again.
    Absent,
}

/// An authenticated context for talking to the platform.
#[derive(Debug)]
pub enum CredentialHandle {
    Service(ServiceAccount),
    Delegated(StoredToken),
}

impl CredentialHandle {
    pub fn strategy(&self) -> Strategy {
        match self {
            CredentialHandle::Service(_) => Strategy::Service,
            CredentialHandle::Delegated(_) => Strategy::Delegated,
        }
    }

    pub fn validity(&self) -> Validity {
        match self {
            // minted tokens are renewed on demand
            CredentialHandle::Service(_) => Validity::Valid,
            CredentialHandle::Delegated(token) if !token.is_expired() => Validity::Valid,
            CredentialHandle::Delegated(token) if token.has_refresh_token() => {
                Validity::ExpiredRefreshable
            }
            CredentialHandle::Delegated(_) => Validity::Absent,
        }
    }

    /// The bearer token to put in `Authorization` headers.
    pub async fn bearer(&self, http: &reqwest::Client) -> Result<String, ApiError> {
        match self {
            CredentialHandle::Service(account) => account
                .access_token(http)
                .await
                .map_err(|e| ApiError::Token(format!("{e:#}"))),
            CredentialHandle::Delegated(token) => Ok(token.token.clone()),
        }
    }
}

/// Where the resolver is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated(Strategy),
    Expired,
    /// Both strategies were tried and neither produced a credential.
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no usable credentials; interactive authorization is required")]
    AuthorizationRequired,
    #[error("delegated token file unusable: {0:#}")]
    TokenFile(eyre::Report),
    #[error("token refresh failed: {0:#}")]
    Refresh(eyre::Report),
}

/// Where credential material is looked for.
#[derive(Clone)]
pub struct CredentialSources {
    pub service_account_json: Option<String>,
    pub service_account_file: PathBuf,
    pub token_file: PathBuf,
}

impl fmt::Debug for CredentialSources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSources")
            .field(
                "service_account_json",
                &self.service_account_json.as_ref().map(|_| "<redacted>"),
            )
            .field("service_account_file", &self.service_account_file)
            .field("token_file", &self.token_file)
            .finish()
    }
}

impl CredentialSources {
    pub fn from_config(config: &Config) -> Self {
        Self {
            service_account_json: config.service_account_json.clone(),
            service_account_file: config.service_account_file(),
            token_file: config.token_file(),
        }
    }
}

/// Holds the process-wide [`CredentialHandle`] and knows how to (re-)derive it.
pub struct CredentialResolver {
    sources: CredentialSources,
    oauth_client: Option<OAuthClientConfig>,
    token_http: reqwest::Client,
    api: YouTubeClient,
    active: RwLock<Option<Arc<CredentialHandle>>>,
    /// Serializes resolutions so concurrent pipelines don't refresh the same token twice.
    resolving: tokio::sync::Mutex<()>,
    state: std::sync::Mutex<AuthState>,
}

impl fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialResolver")
            .field("sources", &self.sources)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CredentialResolver {
    /// `oauth_client` is only used to refresh tokens whose file lacks client credentials.
    pub fn new(
        sources: CredentialSources,
        oauth_client: Option<OAuthClientConfig>,
        api: YouTubeClient,
    ) -> eyre::Result<Self> {
        Ok(Self {
            sources,
            oauth_client,
            token_http: oauth::oauth_http_client()?,
            api,
            active: RwLock::new(None),
            resolving: tokio::sync::Mutex::new(()),
            state: std::sync::Mutex::new(AuthState::Unauthenticated),
        })
    }

    pub fn api(&self) -> &YouTubeClient {
        &self.api
    }

    pub fn state(&self) -> AuthState {
        *self.state_mut()
    }

    fn state_mut(&self) -> MutexGuard<'_, AuthState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: AuthState) {
        *self.state_mut() = state;
    }

    /// The currently active handle, if any.
    pub fn current(&self) -> Option<Arc<CredentialHandle>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(&self, handle: Option<Arc<CredentialHandle>>) {
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = handle;
    }

    /// The strategy behind the active handle.
    pub fn auth_method(&self) -> Strategy {
        self.current()
            .map(|handle| handle.strategy())
            .unwrap_or(Strategy::None)
    }

    /// Drops `stale` as the active handle, unless it has already been replaced.
    pub fn invalidate(&self, stale: &Arc<CredentialHandle>) {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        if active.as_ref().is_some_and(|h| Arc::ptr_eq(h, stale)) {
            *active = None;
            drop(active);
            tracing::debug!(strategy = %stale.strategy(), "invalidated credential");
            self.set_state(AuthState::Expired);
        }
    }

    /// Runs resolution unconditionally, replacing whatever handle is active.
    pub async fn resolve(&self) -> Result<Arc<CredentialHandle>, AuthError> {
        let _resolving = self.resolving.lock().await;
        self.resolve_locked().await
    }

    /// Returns the active handle if it is still valid, resolving a new one otherwise.
    pub async fn ensure(&self) -> Result<Arc<CredentialHandle>, AuthError> {
        if let Some(handle) = self.usable_current() {
            return Ok(handle);
        }
        let _resolving = self.resolving.lock().await;
        // another pipeline may have resolved while we waited
        if let Some(handle) = self.usable_current() {
            return Ok(handle);
        }
        self.resolve_locked().await
    }

    fn usable_current(&self) -> Option<Arc<CredentialHandle>> {
        let handle = self.current()?;
        if handle.validity() == Validity::Valid {
            return Some(handle);
        }
        self.set_state(AuthState::Expired);
        None
    }

    #[instrument(skip(self))]
    async fn resolve_locked(&self) -> Result<Arc<CredentialHandle>, AuthError> {
        self.set_state(AuthState::Authenticating);
        match self.resolve_fresh().await {
            Ok(handle) => {
                let handle = Arc::new(handle);
                let strategy = handle.strategy();
                self.replace(Some(Arc::clone(&handle)));
                self.set_state(AuthState::Authenticated(strategy));
                tracing::info!(method = %strategy, "authenticated");
                Ok(handle)
            }
            Err(e) => {
                self.replace(None);
                self.set_state(AuthState::Failed);
                tracing::warn!("authentication failed: {e}");
                Err(e)
            }
        }
    }

    async fn resolve_fresh(&self) -> Result<CredentialHandle, AuthError> {
        if let Some(account) = self.load_service_account().await {
            return Ok(CredentialHandle::Service(account));
        }
        self.load_delegated().await.map(CredentialHandle::Delegated)
    }

    async fn load_service_account(&self) -> Option<ServiceAccount> {
        let loaded = if let Some(json) = &self.sources.service_account_json {
            ServiceAccount::from_json(json)
        } else if tokio::fs::try_exists(&self.sources.service_account_file)
            .await
            .unwrap_or(false)
        {
            ServiceAccount::from_file(&self.sources.service_account_file).await
        } else {
            return None;
        };

        match loaded {
            Ok(account) => {
                tracing::info!(client_email = account.client_email(), "using service account");
                Some(account)
            }
            Err(e) => {
                tracing::warn!("service account unusable, trying delegated token: {e:#}");
                None
            }
        }
    }

    async fn load_delegated(&self) -> Result<StoredToken, AuthError> {
        let path = &self.sources.token_file;
        let token = StoredToken::load(path)
            .await
            .map_err(AuthError::TokenFile)?
            .ok_or(AuthError::AuthorizationRequired)?;

        if !token.is_expired() {
            return Ok(token);
        }
        if !token.has_refresh_token() {
            tracing::warn!("delegated token expired and cannot be refreshed");
            return Err(AuthError::AuthorizationRequired);
        }

        tracing::info!("delegated token expired, refreshing");
        let response =
            oauth::refresh_stored_token(&self.token_http, &token, self.oauth_client.as_ref())
                .await
                .map_err(AuthError::Refresh)?
                .ok_or(AuthError::AuthorizationRequired)?;
        let refreshed = token.refreshed(&response);
        refreshed
            .persist(path)
            .await
            .map_err(AuthError::TokenFile)?;
        tracing::info!("delegated token refreshed");
        Ok(refreshed)
    }

    /// Whether the publisher can currently act on the platform.
    ///
    /// Without a cached credential this only resolves one. With one, a cheap read-only call is
    /// made; an authorization failure there triggers one re-resolution, any other failure is
    /// reported without discarding the credential.
    #[instrument(skip(self), ret)]
    pub async fn check_authentication(&self) -> bool {
        let handle = match self.current() {
            None => return self.ensure().await.is_ok(),
            Some(handle) if handle.validity() != Validity::Valid => {
                self.invalidate(&handle);
                return self.ensure().await.is_ok();
            }
            Some(handle) => handle,
        };

        match self.api.probe(&handle).await {
            Ok(()) => true,
            Err(e) if e.is_unauthorized() => {
                tracing::warn!("authentication expired, re-resolving credentials");
                self.invalidate(&handle);
                self.ensure().await.is_ok()
            }
            Err(e) => {
                tracing::error!("API error during authentication check: {e}");
                false
            }
        }
    }

    /// The authenticated principal's channel, for diagnostics.
    pub async fn channel_info(&self) -> Option<Channel> {
        let handle = self.ensure().await.ok()?;
        match self.api.channel_info(&handle).await {
            Ok(channel) => {
                if channel.is_none() {
                    tracing::warn!("no channel found for authenticated principal");
                }
                channel
            }
            Err(e) => {
                if e.is_unauthorized() {
                    self.invalidate(&handle);
                }
                tracing::error!("failed to get channel info: {e}");
                None
            }
        }
    }

    /// What the token file says about the delegated credential.
    pub async fn credentials_info(&self) -> CredentialsInfo {
        CredentialsInfo::inspect(&self.sources.token_file).await
    }

    pub fn sources(&self) -> &CredentialSources {
        &self.sources
    }
}
