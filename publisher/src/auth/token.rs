//! The persisted user-delegated token (`token.json`).

use eyre::Context;
use jiff::{SignedDuration, Timestamp};
use oauth2::TokenResponse;
use oauth2::basic::BasicTokenResponse;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use super::GOOGLE_TOKEN_URI;

/// Tokens this close to expiry are treated as already expired.
const EXPIRY_MARGIN: SignedDuration = SignedDuration::from_mins(5);

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URI.to_string()
}

/// An OAuth token issued to a user, in Google's "authorized user" file layout.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredToken {
    /// The access token.
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// When the access token stops working. A token without one never expires locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<Timestamp>,
}

impl fmt::Debug for StoredToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredToken")
            .field("token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("token_uri", &self.token_uri)
            .field("client_id", &self.client_id)
            .field("scopes", &self.scopes)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

fn expiry_from(response: &BasicTokenResponse) -> Option<Timestamp> {
    let lifetime = SignedDuration::try_from(response.expires_in()?).ok()?;
    Timestamp::now().checked_add(lifetime).ok()
}

impl StoredToken {
    /// Builds a token from a fresh authorization-code exchange.
    pub fn from_response(
        response: &BasicTokenResponse,
        token_uri: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Self {
        Self {
            token: response.access_token().secret().clone(),
            refresh_token: response.refresh_token().map(|t| t.secret().clone()),
            token_uri: token_uri.to_string(),
            client_id: Some(client_id.to_string()),
            client_secret: Some(client_secret.to_string()),
            scopes: response
                .scopes()
                .map(|scopes| scopes.iter().map(|s| s.to_string()).collect())
                .unwrap_or_default(),
            expiry: expiry_from(response),
        }
    }

    /// The token that results from a refresh.
    ///
    /// Google usually omits the refresh token from refresh responses, in which case the one we
    /// already have stays in place.
    pub fn refreshed(&self, response: &BasicTokenResponse) -> Self {
        let refresh_token = match response.refresh_token() {
            Some(new) => Some(new.secret().clone()),
            None => {
                tracing::trace!("refresh response lacks refresh token, preserving original");
                self.refresh_token.clone()
            }
        };
        Self {
            token: response.access_token().secret().clone(),
            refresh_token,
            expiry: expiry_from(response),
            scopes: response
                .scopes()
                .map(|scopes| scopes.iter().map(|s| s.to_string()).collect())
                .unwrap_or_else(|| self.scopes.clone()),
            ..self.clone()
        }
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Timestamp::now())
    }

    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.expiry.is_some_and(|expiry| {
            now.checked_add(EXPIRY_MARGIN)
                .map_or(true, |deadline| deadline >= expiry)
        })
    }

    /// Reads the token file, returning `None` if there isn't one.
    pub async fn load(path: &Path) -> eyre::Result<Option<Self>> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("read token file {}", path.display()));
            }
        };
        let token = serde_json::from_slice(&raw)
            .with_context(|| format!("parse delegated token file {}", path.display()))?;
        Ok(Some(token))
    }

    /// Writes the token file, replacing any previous one atomically.
    pub async fn persist(&self, path: &Path) -> eyre::Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .context("create credentials directory")?;
        }
        let json = serde_json::to_vec_pretty(self).context("serialize delegated token")?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("move token file into place at {}", path.display()))?;
        tracing::debug!(path = %path.display(), "persisted delegated token");
        Ok(())
    }
}

/// What is known about the token file, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CredentialsInfo {
    pub exists: bool,
    pub valid: bool,
    pub expired: bool,
    pub has_refresh_token: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CredentialsInfo {
    pub async fn inspect(path: &Path) -> Self {
        match StoredToken::load(path).await {
            Ok(None) => Self::default(),
            Ok(Some(token)) => {
                let expired = token.is_expired();
                Self {
                    exists: true,
                    valid: !expired,
                    expired,
                    has_refresh_token: token.has_refresh_token(),
                    error: None,
                }
            }
            Err(e) => Self {
                error: Some(format!("{e:#}")),
                ..Self::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn token_response(json: serde_json::Value) -> BasicTokenResponse {
        serde_json::from_value(json).unwrap()
    }

    fn stored() -> StoredToken {
        StoredToken {
            token: "old-access".into(),
            refresh_token: Some("refresh-me".into()),
            token_uri: GOOGLE_TOKEN_URI.into(),
            client_id: Some("client".into()),
            client_secret: Some("secret".into()),
            scopes: vec!["https://www.googleapis.com/auth/youtube".into()],
            expiry: None,
        }
    }

    #[test]
    fn parses_authorized_user_file() {
        let token: StoredToken = serde_json::from_str(
            r#"{
                "token": "ya29.a0",
                "refresh_token": "1//0g",
                "token_uri": "https://oauth2.googleapis.com/token",
                "client_id": "123.apps.googleusercontent.com",
                "client_secret": "shh",
                "scopes": ["https://www.googleapis.com/auth/youtube.upload"],
                "universe_domain": "googleapis.com",
                "account": "",
                "expiry": "2024-05-01T12:00:00.123456Z"
            }"#,
        )
        .unwrap();
        assert!(token.has_refresh_token());
        assert_eq!(
            token.expiry,
            Some("2024-05-01T12:00:00.123456Z".parse().unwrap())
        );
        assert!(token.is_expired());
    }

    #[test]
    fn expiry_has_safety_margin() {
        let now: Timestamp = "2024-05-01T12:00:00Z".parse().unwrap();
        let mut token = stored();
        assert!(!token.is_expired_at(now), "no expiry means not expired");

        token.expiry = Some("2024-05-01T12:04:00Z".parse().unwrap());
        assert!(token.is_expired_at(now));

        token.expiry = Some("2024-05-01T12:06:00Z".parse().unwrap());
        assert!(!token.is_expired_at(now));
    }

    #[test]
    fn refresh_keeps_refresh_token() {
        let old = stored();
        let new = old.refreshed(&token_response(serde_json::json!({
            "access_token": "new-access",
            "token_type": "Bearer",
            "expires_in": 3599,
        })));
        assert_eq!(new.token, "new-access");
        assert_eq!(new.refresh_token.as_deref(), Some("refresh-me"));
        assert_eq!(new.client_id, old.client_id);
        assert_eq!(new.scopes, old.scopes);
        assert!(!new.is_expired());

        let rotated = old.refreshed(&token_response(serde_json::json!({
            "access_token": "newer",
            "token_type": "Bearer",
            "refresh_token": "rotated",
        })));
        assert_eq!(rotated.refresh_token.as_deref(), Some("rotated"));
        assert_eq!(rotated.expiry, None);
    }

    #[tokio::test]
    async fn persist_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("token.json");
        assert_eq!(StoredToken::load(&path).await.unwrap(), None);

        let token = stored();
        token.persist(&path).await.unwrap();
        assert_eq!(StoredToken::load(&path).await.unwrap(), Some(token));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn credentials_info() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        assert_eq!(CredentialsInfo::inspect(&path).await, CredentialsInfo::default());

        let mut token = stored();
        token.expiry = Some("2001-01-01T00:00:00Z".parse().unwrap());
        token.persist(&path).await.unwrap();
        let info = CredentialsInfo::inspect(&path).await;
        assert!(info.exists && info.expired && info.has_refresh_token && !info.valid);

        tokio::fs::write(&path, b"not json").await.unwrap();
        let info = CredentialsInfo::inspect(&path).await;
        assert!(!info.exists);
        assert!(info.error.is_some());
    }

    #[test]
    fn debug_is_redacted() {
        let rendered = format!("{:?}", stored());
        assert!(!rendered.contains("old-access"));
        assert!(!rendered.contains("refresh-me"));
    }
}
