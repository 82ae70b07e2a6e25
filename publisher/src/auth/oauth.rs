//! Interactive OAuth 2.0 authorization and token refresh for the delegated strategy.
//!
//! Two ways of obtaining a user token are supported. Front ends that can only relay text use
//! [`OAuthManager::authorization_url`] followed by [`OAuthManager::exchange_code_for_token`] once
//! the user pastes the code back. The CLI uses [`OAuthManager::authenticate_in_browser`], which
//! runs a loopback redirect server and needs no copy-pasting.

use eyre::{Context, eyre};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response, body};
use oauth2::basic::{BasicClient, BasicErrorResponseType, BasicTokenResponse};
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RefreshToken, RequestTokenError, Scope,
    TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::instrument;

use super::token::StoredToken;
use super::{GOOGLE_TOKEN_URI, SCOPES};
use crate::config::Config;

const GOOGLE_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
/// Redirect target for the copy-the-code-by-hand flow.
pub const MANUAL_REDIRECT_URI: &str = "urn:ietf:wg:oauth:2.0:oob";

const OAUTH_DONE_HTML: &str = "<!doctype html><html><body>\
<h1>Authorization complete</h1><p>You can close this window and return to the terminal.</p>\
</body></html>";

type ConfiguredClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

fn default_auth_uri() -> String {
    GOOGLE_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URI.to_string()
}

/// An OAuth client registration, in the layout of Google's `client_secret.json`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

impl fmt::Debug for OAuthClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthClientConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("auth_uri", &self.auth_uri)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ClientSecretFile {
    Installed(OAuthClientConfig),
    Web(OAuthClientConfig),
}

impl OAuthClientConfig {
    /// Parses a `client_secret.json` document (either the `installed` or `web` flavor).
    pub fn from_json(json: &str) -> eyre::Result<Self> {
        let file: ClientSecretFile =
            serde_json::from_str(json).context("parse OAuth client secret JSON")?;
        Ok(match file {
            ClientSecretFile::Installed(c) | ClientSecretFile::Web(c) => c,
        })
    }

    pub fn from_parts(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            auth_uri: default_auth_uri(),
            token_uri: default_token_uri(),
            redirect_uris: vec![MANUAL_REDIRECT_URI.to_string(), "http://localhost".to_string()],
        }
    }

    /// Finds the OAuth client from, in order: the inline JSON, the id/secret pair, or an
    /// existing `client_secret.json`.
    pub async fn from_config(config: &Config) -> eyre::Result<Option<Self>> {
        if let Some(json) = &config.client_secret_json {
            return Self::from_json(json).map(Some);
        }
        if let (Some(id), Some(secret)) = (&config.client_id, &config.client_secret) {
            return Ok(Some(Self::from_parts(id, secret)));
        }
        let path = config.client_secret_file();
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => Self::from_json(&json).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    /// Writes this client out as an `installed` application `client_secret.json`, unless the
    /// file already exists.
    pub async fn write_client_secret_file(&self, path: &Path) -> eyre::Result<bool> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(false);
        }
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .context("create credentials directory")?;
        }
        let json = serde_json::to_vec_pretty(&ClientSecretFile::Installed(self.clone()))
            .context("serialize client secret")?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("write {}", path.display()))?;
        tracing::info!(path = %path.display(), "wrote OAuth client secret file");
        Ok(true)
    }

    fn client(&self) -> eyre::Result<ConfiguredClient> {
        Ok(BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_client_secret(ClientSecret::new(self.client_secret.clone()))
            .set_auth_uri(AuthUrl::new(self.auth_uri.clone()).context("parse authorization URL")?)
            .set_token_uri(TokenUrl::new(self.token_uri.clone()).context("parse token URL")?))
    }
}

/// HTTP client for talking to OAuth endpoints.
pub(crate) fn oauth_http_client() -> eyre::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        // SSRF no thank you.
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("build OAuth HTTP client")
}

/// Exchanges the refresh token in `token` for a new access token.
///
/// Returns `Ok(None)` if the token server no longer honors the refresh token, meaning the user
/// has to authorize again.
#[instrument(skip_all)]
pub async fn refresh_stored_token(
    http: &reqwest::Client,
    token: &StoredToken,
    fallback: Option<&OAuthClientConfig>,
) -> eyre::Result<Option<BasicTokenResponse>> {
    let Some(refresh_token) = token.refresh_token.clone().filter(|t| !t.is_empty()) else {
        tracing::warn!("no refresh token available, cannot refresh");
        return Ok(None);
    };

    let client_id = token
        .client_id
        .clone()
        .or_else(|| fallback.map(|c| c.client_id.clone()))
        .ok_or_else(|| eyre!("token file has no client id and no OAuth client is configured"))?;
    let client_secret = token
        .client_secret
        .clone()
        .or_else(|| fallback.map(|c| c.client_secret.clone()));

    let mut client = BasicClient::new(ClientId::new(client_id))
        .set_token_uri(TokenUrl::new(token.token_uri.clone()).context("parse token URL")?);
    if let Some(secret) = client_secret {
        client = client.set_client_secret(ClientSecret::new(secret));
    }

    tracing::debug!("attempting to refresh OAuth token");
    match client
        .exchange_refresh_token(&RefreshToken::new(refresh_token))
        .request_async(http)
        .await
    {
        Ok(new_token) => {
            tracing::debug!("successfully refreshed OAuth token");
            Ok(Some(new_token))
        }
        Err(ref e @ RequestTokenError::ServerResponse(ref sr))
            if matches!(sr.error(), BasicErrorResponseType::InvalidGrant) =>
        {
            tracing::warn!("OAuth refresh token considered invalid grant: {}", e);
            Ok(None)
        }
        Err(e) => Err(e).context("exchange refresh token"),
    }
}

struct PendingAuthorization {
    verifier: String,
    redirect: RedirectUrl,
}

/// Drives the user-facing authorization flows and persists the resulting token.
pub struct OAuthManager {
    client: OAuthClientConfig,
    token_file: PathBuf,
    http: reqwest::Client,
    pending: Mutex<Option<PendingAuthorization>>,
}

impl fmt::Debug for OAuthManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthManager")
            .field("client", &self.client)
            .field("token_file", &self.token_file)
            .finish_non_exhaustive()
    }
}

impl OAuthManager {
    pub fn new(client: OAuthClientConfig, token_file: impl Into<PathBuf>) -> eyre::Result<Self> {
        Ok(Self {
            client,
            token_file: token_file.into(),
            http: oauth_http_client()?,
            pending: Mutex::new(None),
        })
    }

    pub fn client_config(&self) -> &OAuthClientConfig {
        &self.client
    }

    fn build_authorization_url(
        &self,
        redirect: RedirectUrl,
        csrf: CsrfToken,
    ) -> eyre::Result<(url::Url, PkceCodeVerifier)> {
        let client = self.client()?.set_redirect_uri(redirect);
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let (auth_url, _csrf) = client
            .authorize_url(move || csrf.clone())
            .add_scopes(SCOPES.iter().map(|s| Scope::new(s.to_string())))
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .add_extra_param("include_granted_scopes", "true")
            .set_pkce_challenge(pkce_challenge)
            .url();
        Ok((auth_url, pkce_verifier))
    }

    fn client(&self) -> eyre::Result<ConfiguredClient> {
        self.client.client()
    }

    /// Builds a consent URL for the manual flow and remembers what is needed to redeem the code.
    ///
    /// Calling this again abandons any earlier pending authorization.
    #[instrument(skip(self))]
    pub fn authorization_url(&self) -> eyre::Result<String> {
        let redirect =
            RedirectUrl::new(MANUAL_REDIRECT_URI.to_string()).context("parse redirect URL")?;
        let (url, verifier) =
            self.build_authorization_url(redirect.clone(), CsrfToken::new_random())?;
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(PendingAuthorization {
            verifier: verifier.secret().clone(),
            redirect,
        });
        tracing::info!("authorization URL generated");
        Ok(url.to_string())
    }

    /// Redeems a code the user obtained through [`Self::authorization_url`] and persists the
    /// token. Failures are logged and reported as `false`.
    #[instrument(skip_all)]
    pub async fn exchange_code_for_token(&self, code: &str) -> bool {
        match self.try_exchange_code(code.trim()).await {
            Ok(()) => {
                tracing::info!("OAuth credentials saved");
                true
            }
            Err(e) => {
                tracing::error!("token exchange failed: {e:#}");
                false
            }
        }
    }

    async fn try_exchange_code(&self, code: &str) -> eyre::Result<()> {
        let (verifier, redirect) = {
            let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let pending = pending
                .as_ref()
                .ok_or_else(|| eyre!("no authorization in progress; generate an auth URL first"))?;
            (pending.verifier.clone(), pending.redirect.clone())
        };

        let token = self
            .client()?
            .set_redirect_uri(redirect)
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(PkceCodeVerifier::new(verifier))
            .request_async(&self.http)
            .await
            .context("exchange authorization code with access token")?;

        self.store(&token).await?;
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }

    async fn store(&self, token: &BasicTokenResponse) -> eyre::Result<StoredToken> {
        let stored = StoredToken::from_response(
            token,
            &self.client.token_uri,
            &self.client.client_id,
            &self.client.client_secret,
        );
        stored
            .persist(&self.token_file)
            .await
            .context("persist delegated token")?;
        Ok(stored)
    }

    /// Performs a complete authorization in the user's browser and persists the token.
    ///
    /// A local HTTP server on a random port receives the redirect carrying the code.
    pub async fn authenticate_in_browser(&self) -> eyre::Result<StoredToken> {
        let csrf = CsrfToken::new_random();
        let (redirect_url, eventually_authorization_code) = setup_redirect(csrf.clone())
            .await
            .context("set up redirect endpoint")?;

        let (auth_url, pkce_verifier) = self.build_authorization_url(redirect_url.clone(), csrf)?;

        tracing::info!(url = %auth_url, "asking user to follow OAuth flow");
        webbrowser::open(auth_url.as_ref()).context("open user's browser")?;
        let authorization_code = eventually_authorization_code
            .await
            .context("await user authorization code")?;

        let token = self
            .client()?
            .set_redirect_uri(redirect_url)
            .exchange_code(authorization_code)
            .set_pkce_verifier(pkce_verifier)
            .request_async(&self.http)
            .await
            .context("exchange authorization code with access token")?;

        self.store(&token).await
    }
}

/// Sets up a one-shot local HTTP server that receives the authorization redirect.
///
/// Returns the redirect URL to register with the flow and a future resolving to the code once the
/// browser has been redirected with a matching `state`.
async fn setup_redirect(
    csrf: CsrfToken,
) -> eyre::Result<(
    RedirectUrl,
    impl Future<Output = eyre::Result<AuthorizationCode>>,
)> {
    let socket = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind to localhost")?;
    let addr = socket.local_addr().context("get local address")?;
    let url = RedirectUrl::new(format!("http://{}:{}", addr.ip(), addr.port()))
        .context("construct redirect url")?;
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let r = async move {
            let (conn, _) = socket.accept().await.context("accept")?;
            let conn = hyper_util::rt::TokioIo::new(conn);
            let (got, mut gotten) = tokio::sync::mpsc::channel(1);
            let service = service_fn(move |req: Request<body::Incoming>| {
                let csrf = csrf.clone();
                let got = got.clone();
                async move {
                    let mut presented_state = None;
                    let mut presented_code = None;
                    for (k, v) in form_urlencoded::parse(req.uri().query().unwrap_or("").as_bytes())
                    {
                        match &*k {
                            "state" => presented_state = Some(v),
                            "code" => presented_code = Some(v),
                            _ => {}
                        }
                    }
                    if presented_state.as_deref() != Some(csrf.secret().as_str()) {
                        return Err("invalid csrf token");
                    }
                    let Some(code) = presented_code else {
                        return Err("no authorization code found");
                    };
                    let code = AuthorizationCode::new(code.into_owned());
                    if got.send(code).await.is_err() {
                        return Err("redirect listener went away");
                    }
                    Ok(Response::new(Full::<Bytes>::from(OAUTH_DONE_HTML)))
                }
            });
            let mut serve = std::pin::pin!(
                hyper::server::conn::http1::Builder::new().serve_connection(conn, service)
            );

            tokio::select! {
                exit = &mut serve => {
                    if let Err(e) = exit {
                        Err(e).context("redirect server got bad request")
                    } else {
                        eyre::bail!("redirect server exit prematurely");
                    }
                }
                code = gotten.recv() => {
                    serve.as_mut().graceful_shutdown();
                    code.ok_or_else(|| eyre!("redirect server dropped the authorization code"))
                }
            }
        };
        let _ = tx.send(r.await);
    });
    Ok((url, async move {
        rx.await.context("redirect future dropped prematurely")?
    }))
}

/// Best-effort guess at whether a chat message is a pasted authorization code.
///
/// Google codes are long, contain no whitespace, and apart from their `4/` prefix no slashes.
/// This is a heuristic for routing free text and should not be relied on for anything else.
pub fn looks_like_authorization_code(text: &str) -> bool {
    let text = text.trim();
    let body = text.strip_prefix("4/").unwrap_or(text);
    text.len() > 20
        && !body.contains('/')
        && !text.to_ascii_lowercase().contains("http")
        && !text.chars().any(char::is_whitespace)
}
