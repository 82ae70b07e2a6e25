//! Runtime configuration, read from the process environment (and an optional `.env` file).

use eyre::{Context, eyre};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Base URL of the YouTube Data API v3.
pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/youtube/v3";
/// Base URL of the YouTube Data API v3 media upload endpoints.
pub const DEFAULT_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/youtube/v3";
/// Base URL that public watch links are derived from.
pub const DEFAULT_WATCH_BASE: &str = "https://www.youtube.com";

/// The resumable upload protocol requires chunks to be a multiple of 256 KiB.
pub const CHUNK_GRANULARITY: usize = 256 * 1024;

const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;
const DEFAULT_MAX_DURATION: u64 = 2 * 60 * 60;
const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Visibility of a published video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrivacyStatus {
    Public,
    #[default]
    Unlisted,
    Private,
}

impl PrivacyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrivacyStatus::Public => "public",
            PrivacyStatus::Unlisted => "unlisted",
            PrivacyStatus::Private => "private",
        }
    }
}

impl fmt::Display for PrivacyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrivacyStatus {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(PrivacyStatus::Public),
            "unlisted" => Ok(PrivacyStatus::Unlisted),
            "private" => Ok(PrivacyStatus::Private),
            other => Err(eyre!(
                "unknown privacy status '{other}' (expected public, unlisted or private)"
            )),
        }
    }
}

/// Everything the pipeline needs to know about its environment.
///
/// Credential material is held verbatim; the pipeline only ever inspects it through
/// [`crate::auth`].
#[derive(Clone)]
pub struct Config {
    /// Largest accepted video, in bytes.
    pub max_file_size: u64,
    /// Longest accepted video, in seconds.
    pub max_duration: u64,
    /// Visibility applied to uploads that don't ask for one explicitly.
    pub privacy_status: PrivacyStatus,
    /// Inline service account key (JSON), takes precedence over the key file.
    pub service_account_json: Option<String>,
    /// Inline OAuth client secret (JSON, `installed` or `web` layout).
    pub client_secret_json: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Where `service_account.json`, `token.json` and `client_secret.json` live.
    pub credentials_dir: PathBuf,
    /// Root for per-invocation download directories.
    pub temp_dir: PathBuf,
    pub api_base: String,
    pub upload_base: String,
    pub watch_base: String,
    /// The `yt-dlp` executable used to probe and fetch remote videos.
    pub ytdlp_path: PathBuf,
    /// Bytes sent per resumable upload request.
    pub upload_chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_duration: DEFAULT_MAX_DURATION,
            privacy_status: PrivacyStatus::default(),
            service_account_json: None,
            client_secret_json: None,
            client_id: None,
            client_secret: None,
            credentials_dir: PathBuf::from("credentials"),
            temp_dir: PathBuf::from("temp"),
            api_base: DEFAULT_API_BASE.to_string(),
            upload_base: DEFAULT_UPLOAD_BASE.to_string(),
            watch_base: DEFAULT_WATCH_BASE.to_string(),
            ytdlp_path: PathBuf::from("yt-dlp"),
            upload_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("Config")
            .field("max_file_size", &self.max_file_size)
            .field("max_duration", &self.max_duration)
            .field("privacy_status", &self.privacy_status)
            .field("service_account_json", &redact(&self.service_account_json))
            .field("client_secret_json", &redact(&self.client_secret_json))
            .field("client_id", &self.client_id)
            .field("client_secret", &redact(&self.client_secret))
            .field("credentials_dir", &self.credentials_dir)
            .field("temp_dir", &self.temp_dir)
            .field("api_base", &self.api_base)
            .field("upload_base", &self.upload_base)
            .field("watch_base", &self.watch_base)
            .field("ytdlp_path", &self.ytdlp_path)
            .field("upload_chunk_size", &self.upload_chunk_size)
            .finish()
    }
}

impl Config {
    /// Loads `.env` (if there is one) and then reads configuration from the environment.
    pub fn from_env() -> eyre::Result<Self> {
        if let Err(e) = dotenvy::dotenv()
            && !e.not_found()
        {
            return Err(e).context("load .env file");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup.
    ///
    /// Unset and empty values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> eyre::Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let max_file_size = match get("MAX_FILE_SIZE") {
            Some(v) => v.trim().parse().context("parse MAX_FILE_SIZE")?,
            None => defaults.max_file_size,
        };
        let max_duration = match get("MAX_VIDEO_DURATION") {
            Some(v) => v.trim().parse().context("parse MAX_VIDEO_DURATION")?,
            None => defaults.max_duration,
        };
        let privacy_status = match get("YOUTUBE_PRIVACY_STATUS") {
            Some(v) => v.parse().context("parse YOUTUBE_PRIVACY_STATUS")?,
            None => defaults.privacy_status,
        };
        let upload_chunk_size = match get("UPLOAD_CHUNK_SIZE") {
            Some(v) => v
                .trim()
                .parse::<usize>()
                .context("parse UPLOAD_CHUNK_SIZE")?,
            None => defaults.upload_chunk_size,
        };

        Ok(Self {
            max_file_size,
            max_duration,
            privacy_status,
            service_account_json: get("GOOGLE_SERVICE_ACCOUNT_JSON"),
            client_secret_json: get("GOOGLE_CLIENT_SECRET_JSON"),
            client_id: get("GOOGLE_CLIENT_ID"),
            client_secret: get("GOOGLE_CLIENT_SECRET"),
            credentials_dir: get("CREDENTIALS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.credentials_dir),
            temp_dir: get("TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.temp_dir),
            api_base: get("YOUTUBE_API_BASE").unwrap_or(defaults.api_base),
            upload_base: get("YOUTUBE_UPLOAD_BASE").unwrap_or(defaults.upload_base),
            watch_base: defaults.watch_base,
            ytdlp_path: get("YTDLP_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.ytdlp_path),
            upload_chunk_size: round_chunk_size(upload_chunk_size),
        })
    }

    pub fn service_account_file(&self) -> PathBuf {
        self.credentials_dir.join("service_account.json")
    }

    pub fn token_file(&self) -> PathBuf {
        self.credentials_dir.join("token.json")
    }

    pub fn client_secret_file(&self) -> PathBuf {
        self.credentials_dir.join("client_secret.json")
    }

    /// Whether any way of authenticating has been configured at all.
    pub fn has_credential_material(&self) -> bool {
        self.service_account_json.is_some()
            || self.client_secret_json.is_some()
            || (self.client_id.is_some() && self.client_secret.is_some())
            || self.service_account_file().exists()
            || self.token_file().exists()
    }

    /// Creates the credentials and temp directories if they don't exist yet.
    pub async fn ensure_directories(&self) -> eyre::Result<()> {
        for dir in [&self.credentials_dir, &self.temp_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Temp root for downloads, which [`Self::ensure_directories`] creates.
    pub fn temp_root(&self) -> &Path {
        &self.temp_dir
    }
}

/// Rounds down to the upload protocol's chunk granularity, never going below one unit.
fn round_chunk_size(requested: usize) -> usize {
    (requested / CHUNK_GRANULARITY).max(1) * CHUNK_GRANULARITY
}
