//! Service account credentials (server-to-server OAuth with a signed JWT assertion).

use eyre::{Context, eyre};
use jiff::{SignedDuration, Timestamp};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::instrument;

use super::{GOOGLE_TOKEN_URI, SCOPES};

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
/// Google caps assertion lifetimes at one hour.
const ASSERTION_LIFETIME: SignedDuration = SignedDuration::from_hours(1);
const EXPIRY_MARGIN: SignedDuration = SignedDuration::from_mins(5);

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URI.to_string()
}

/// The JSON key file downloaded from the cloud console.
#[derive(Deserialize)]
struct KeyFile {
    #[serde(rename = "type")]
    kind: Option<String>,
    client_email: String,
    private_key: String,
    private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: String,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

struct MintedToken {
    access_token: String,
    /// Already includes the safety margin.
    refresh_after: Timestamp,
}

/// A loaded service account.
///
/// Usable as soon as it has been parsed; the first access token is minted on first use and then
/// reused until shortly before it expires.
pub struct ServiceAccount {
    client_email: String,
    token_uri: String,
    key_id: Option<String>,
    key: EncodingKey,
    minted: Mutex<Option<MintedToken>>,
}

impl fmt::Debug for ServiceAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccount")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl ServiceAccount {
    pub fn from_json(json: &str) -> eyre::Result<Self> {
        let key: KeyFile = serde_json::from_str(json).context("parse service account key")?;
        if let Some(kind) = key.kind.as_deref()
            && kind != "service_account"
        {
            eyre::bail!("key is of type '{kind}', not a service account");
        }
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .context("load service account private key")?;
        Ok(Self {
            client_email: key.client_email,
            token_uri: key.token_uri,
            key_id: key.private_key_id,
            key: encoding_key,
            minted: Mutex::new(None),
        })
    }

    pub async fn from_file(path: &Path) -> eyre::Result<Self> {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read service account file {}", path.display()))?;
        Self::from_json(&json)
    }

    pub fn client_email(&self) -> &str {
        &self.client_email
    }

    fn assertion(&self, now: Timestamp) -> eyre::Result<String> {
        let issued = now.as_second();
        let claims = Claims {
            iss: &self.client_email,
            scope: SCOPES.join(" "),
            aud: &self.token_uri,
            iat: issued,
            exp: issued + ASSERTION_LIFETIME.as_secs(),
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key_id.clone();
        jsonwebtoken::encode(&header, &claims, &self.key).context("sign JWT assertion")
    }

    /// Returns a current access token, minting a new one if needed.
    #[instrument(skip(self, http), fields(client_email = %self.client_email))]
    pub async fn access_token(&self, http: &reqwest::Client) -> eyre::Result<String> {
        let mut minted = self.minted.lock().await;
        let now = Timestamp::now();
        if let Some(token) = minted.as_ref()
            && now < token.refresh_after
        {
            return Ok(token.access_token.clone());
        }

        tracing::debug!("minting service account access token");
        let assertion = self.assertion(now)?;
        let response = http
            .post(&self.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .context("send JWT bearer grant to token endpoint")?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(eyre!(
                "token endpoint rejected service account assertion with status {status}: {body}"
            ));
        }

        let token: TokenEndpointResponse = response
            .json()
            .await
            .context("parse token endpoint response as JSON")?;
        let lifetime = SignedDuration::from_secs(token.expires_in.unwrap_or(3600));
        let refresh_after = now
            .checked_add(lifetime)
            .and_then(|t| t.checked_sub(EXPIRY_MARGIN))
            .unwrap_or(now);

        let access_token = token.access_token.clone();
        *minted = Some(MintedToken {
            access_token: token.access_token,
            refresh_after,
        });
        Ok(access_token)
    }
}
