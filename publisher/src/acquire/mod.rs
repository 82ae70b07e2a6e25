//! Turning a staged file or a remote URL into a validated local [`MediaAsset`].
//!
//! Limits are enforced twice: against what the requester or the remote site *declares* before
//! any bytes are fetched, and against the actual file once it is on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::instrument;

use crate::config::Config;
use crate::metadata::{
    MAX_REMOTE_TAGS, MAX_SOURCE_TAGS, PublishMetadata, normalize_tags, platform_tag,
    sanitize_filename, truncate_chars,
};

mod fetcher;

pub use fetcher::{FetchError, MediaFetcher, RemoteInfo, RemoteSummary, YtDlp};

/// Anything smaller than this is not a real video.
pub const MIN_PLAUSIBLE_SIZE: u64 = 10 * 1024;

/// How recent a file must be to be picked up when the download's name isn't known.
const RECENT_FILE_WINDOW: Duration = Duration::from_secs(5 * 60);

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "webm", "flv"];

/// Content type sent with uploads when nothing more specific is known.
pub const FALLBACK_MIME: &str = "video/*";

/// Coarse classification of an [`AcquireError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// A policy limit was exceeded or the input was malformed.
    Rejection,
    /// The content exists but may not be fetched.
    Unavailable,
    /// What arrived on disk is missing or unusable.
    Integrity,
    /// Anything else.
    Failed,
}

/// Why the remote site refused to hand over a video.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DownloadFailure {
    #[error("Video is unavailable or has been removed")]
    Removed,
    #[error("Video is private and cannot be downloaded")]
    Private,
    #[error("Video is age-restricted and cannot be downloaded")]
    AgeRestricted,
    #[error("Video is blocked due to copyright restrictions")]
    Copyright,
    #[error("Video is blocked in your region")]
    GeoBlocked,
    #[error("{0}")]
    Other(String),
}

impl DownloadFailure {
    /// Maps the fetch tool's error output onto a user-facing reason.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if message.contains("Video unavailable") {
            DownloadFailure::Removed
        } else if message.contains("Private video") {
            DownloadFailure::Private
        } else if lower.contains("age-restricted") || lower.contains("confirm your age") {
            DownloadFailure::AgeRestricted
        } else if lower.contains("copyright") {
            DownloadFailure::Copyright
        } else if lower.contains("geoblocked") || lower.contains("in your country") {
            DownloadFailure::GeoBlocked
        } else {
            let message = message.trim();
            let message = message.strip_prefix("ERROR:").unwrap_or(message).trim();
            DownloadFailure::Other(message.to_string())
        }
    }
}

fn mib(bytes: &u64) -> f64 {
    *bytes as f64 / (1024.0 * 1024.0)
}

fn minutes(seconds: &u64) -> u64 {
    seconds / 60
}

/// Why acquisition did not produce an asset. The messages are meant for end users.
#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("Invalid URL format")]
    InvalidUrl,
    #[error("Live streams are not supported")]
    LiveStream,
    #[error("Video too long: {} minutes (max: {} minutes)", minutes(.duration), minutes(.max))]
    TooLong { duration: u64, max: u64 },
    #[error("File too large: {:.1} MB (max: {:.1} MB)", mib(.size), mib(.max))]
    TooLarge { size: u64, max: u64 },
    #[error("Video is {availability} and cannot be downloaded")]
    Restricted { availability: String },
    #[error("Unable to extract video information")]
    NoInfo,
    #[error("Download failed: {0}")]
    Download(DownloadFailure),
    #[error("Downloaded file not found")]
    NotFound,
    #[error("Downloaded file is too small or corrupted")]
    Corrupted,
    #[error("File not found: {}", .0.display())]
    MissingFile(PathBuf),
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl AcquireError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            AcquireError::InvalidUrl
            | AcquireError::LiveStream
            | AcquireError::TooLong { .. }
            | AcquireError::TooLarge { .. } => ErrorCategory::Rejection,
            AcquireError::Restricted { .. } => ErrorCategory::Unavailable,
            AcquireError::Download(DownloadFailure::Other(_)) => ErrorCategory::Failed,
            AcquireError::Download(_) => ErrorCategory::Unavailable,
            AcquireError::NotFound | AcquireError::Corrupted | AcquireError::MissingFile(_) => {
                ErrorCategory::Integrity
            }
            AcquireError::NoInfo | AcquireError::Unexpected(_) => ErrorCategory::Failed,
        }
    }
}

impl From<FetchError> for AcquireError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::Tool(message) => {
                AcquireError::Download(DownloadFailure::classify(&message))
            }
            FetchError::Parse(_) => AcquireError::NoInfo,
            e @ FetchError::Spawn { .. } => AcquireError::Unexpected(e.to_string()),
        }
    }
}

/// A video file on local storage that has passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaAsset {
    path: PathBuf,
    size: u64,
    duration: Option<u64>,
    mime: Option<String>,
}

impl MediaAsset {
    pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            duration: None,
            mime: None,
        }
    }

    pub fn with_duration(mut self, seconds: Option<u64>) -> Self {
        self.duration = seconds;
        self
    }

    pub fn with_mime(mut self, mime: Option<String>) -> Self {
        self.mime = mime;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn duration(&self) -> Option<u64> {
        self.duration
    }

    /// The declared or inferred content type, if there is one.
    pub fn mime(&self) -> Option<&str> {
        self.mime.as_deref()
    }

    /// Deletes the file. A file that is already gone is not an error.
    pub async fn remove(&self) -> std::io::Result<()> {
        remove_if_exists(&self.path).await
    }
}

pub(crate) async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// A file a requester has handed over, along with what they claim about it.
#[derive(Debug, Clone)]
pub struct LocalUpload {
    pub path: PathBuf,
    /// The name the file had on the requester's side.
    pub declared_name: String,
    pub declared_size: u64,
    pub declared_duration: Option<u64>,
    pub mime: Option<String>,
    /// Title to publish under instead of the one derived from the file name.
    pub title: Option<String>,
    /// Shown in the description as the person who submitted the video.
    pub uploader: Option<String>,
}

impl LocalUpload {
    pub fn new(path: impl Into<PathBuf>, declared_name: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            declared_name: declared_name.into(),
            declared_size: size,
            declared_duration: None,
            mime: None,
            title: None,
            uploader: None,
        }
    }

    /// Copies `source` to a fresh file under `temp_root` and describes the copy.
    ///
    /// Publishing deletes the file it is handed, so callers holding a file they want to keep
    /// stage it through here first.
    pub async fn stage_copy(source: &Path, temp_root: &Path) -> std::io::Result<Self> {
        let declared_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string());
        let suffix = source
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let staged = tempfile::Builder::new()
            .prefix("incoming-")
            .suffix(&suffix)
            .tempfile_in(temp_root)?
            .into_temp_path()
            .keep()?;
        let size = match tokio::fs::copy(source, &staged).await {
            Ok(size) => size,
            Err(e) => {
                let _ = tokio::fs::remove_file(&staged).await;
                return Err(e);
            }
        };
        Ok(Self::new(staged, declared_name, size))
    }

    pub fn with_duration(mut self, seconds: u64) -> Self {
        self.declared_duration = Some(seconds);
        self
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_uploader(mut self, uploader: impl Into<String>) -> Self {
        self.uploader = Some(uploader.into());
        self
    }
}

/// An asset together with the metadata it should be published with.
#[derive(Debug, Clone)]
pub struct Acquired {
    pub asset: MediaAsset,
    pub metadata: PublishMetadata,
}

/// Validates and materializes videos, within the configured size and duration limits.
#[derive(Clone)]
pub struct AssetAcquirer {
    max_file_size: u64,
    max_duration: u64,
    fetcher: Arc<dyn MediaFetcher>,
}

impl std::fmt::Debug for AssetAcquirer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetAcquirer")
            .field("max_file_size", &self.max_file_size)
            .field("max_duration", &self.max_duration)
            .finish_non_exhaustive()
    }
}

impl AssetAcquirer {
    pub fn new(max_file_size: u64, max_duration: u64, fetcher: Arc<dyn MediaFetcher>) -> Self {
        Self {
            max_file_size,
            max_duration,
            fetcher,
        }
    }

    /// An acquirer that fetches remote videos with the configured `yt-dlp`.
    pub fn from_config(config: &Config) -> Self {
        let fetcher = YtDlp::new(config.ytdlp_path.clone(), config.max_file_size);
        Self::new(config.max_file_size, config.max_duration, Arc::new(fetcher))
    }

    fn check_size(&self, size: u64) -> Result<(), AcquireError> {
        if size > self.max_file_size {
            return Err(AcquireError::TooLarge {
                size,
                max: self.max_file_size,
            });
        }
        Ok(())
    }

    fn check_duration(&self, seconds: f64) -> Result<(), AcquireError> {
        if seconds > self.max_duration as f64 {
            return Err(AcquireError::TooLong {
                duration: seconds as u64,
                max: self.max_duration,
            });
        }
        Ok(())
    }

    /// Accepts a staged local file based on what was declared about it.
    ///
    /// Does no I/O; the file itself is checked by [`Self::validate_local`].
    #[instrument(skip(self), fields(path = %upload.path.display()))]
    pub fn from_local_file(&self, upload: &LocalUpload) -> Result<Acquired, AcquireError> {
        self.check_size(upload.declared_size)?;
        if let Some(duration) = upload.declared_duration {
            self.check_duration(duration as f64)?;
        }

        let mime = upload
            .mime
            .clone()
            .or_else(|| mime_for_extension(Path::new(&upload.declared_name)));
        let asset = MediaAsset::new(&upload.path, upload.declared_size)
            .with_duration(upload.declared_duration)
            .with_mime(mime);
        Ok(Acquired {
            asset,
            metadata: local_metadata(upload),
        })
    }

    /// Checks the staged file against the limits using its actual size on disk.
    pub async fn validate_local(&self, asset: MediaAsset) -> Result<MediaAsset, AcquireError> {
        let size = match tokio::fs::metadata(asset.path()).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return Err(AcquireError::MissingFile(asset.path().to_path_buf())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AcquireError::MissingFile(asset.path().to_path_buf()));
            }
            Err(e) => return Err(AcquireError::Unexpected(e.to_string())),
        };
        self.check_size(size)?;
        Ok(MediaAsset { size, ..asset })
    }

    /// Looks up what the remote site says about a video, without applying any limits.
    #[instrument(skip(self))]
    pub async fn probe_remote(&self, url: &str) -> Result<RemoteInfo, AcquireError> {
        let url = url.trim();
        if !is_valid_url(url) {
            return Err(AcquireError::InvalidUrl);
        }
        Ok(self.fetcher.probe(url).await?)
    }

    /// Applies the limits to a probe, before anything is downloaded.
    pub fn check_remote(&self, info: &RemoteInfo) -> Result<(), AcquireError> {
        if info.is_live() {
            return Err(AcquireError::LiveStream);
        }
        if let Some(duration) = info.duration {
            self.check_duration(duration)?;
        }
        if let Some(size) = info.expected_size() {
            self.check_size(size)?;
        }
        match info.availability.as_deref() {
            Some(availability @ ("private" | "subscriber_only" | "needs_auth")) => {
                Err(AcquireError::Restricted {
                    availability: availability.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Downloads a probed video into `workdir` and finds the file it produced.
    ///
    /// The result has not been size-checked yet; see [`Self::validate_download`].
    #[instrument(skip(self, info, workdir))]
    pub async fn fetch_remote(
        &self,
        url: &str,
        info: &RemoteInfo,
        workdir: &Path,
    ) -> Result<Acquired, AcquireError> {
        let url = url.trim();
        let stem = sanitize_filename(info.title.as_deref().unwrap_or("video"));
        tracing::info!(
            title = info.title.as_deref().unwrap_or("Unknown"),
            "starting download"
        );

        let reported = self.fetcher.fetch(url, workdir, &stem).await?;
        let path = locate_download(workdir, reported, &stem, info)
            .await
            .ok_or(AcquireError::NotFound)?;
        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|_| AcquireError::NotFound)?
            .len();

        let mime = mime_for_extension(&path);
        let asset = MediaAsset::new(path, size)
            .with_duration(info.duration.map(|d| d as u64))
            .with_mime(mime);
        Ok(Acquired {
            asset,
            metadata: remote_metadata(url, info),
        })
    }

    /// Re-checks a downloaded file's real size, deleting it if it is rejected.
    pub async fn validate_download(&self, asset: MediaAsset) -> Result<MediaAsset, AcquireError> {
        let size = tokio::fs::metadata(asset.path())
            .await
            .map_err(|_| AcquireError::NotFound)?
            .len();

        let verdict = if size > self.max_file_size {
            Err(AcquireError::TooLarge {
                size,
                max: self.max_file_size,
            })
        } else if size < MIN_PLAUSIBLE_SIZE {
            Err(AcquireError::Corrupted)
        } else {
            Ok(())
        };

        if let Err(e) = verdict {
            if let Err(rm) = asset.remove().await {
                tracing::warn!(
                    path = %asset.path().display(),
                    error = %rm,
                    "could not delete rejected download"
                );
            }
            return Err(e);
        }

        tracing::info!(
            file = %asset.path().display(),
            size_mb = %format!("{:.1}", mib(&size)),
            "download complete"
        );
        Ok(MediaAsset { size, ..asset })
    }

    /// Probe, limit-check, download and validate in one go.
    pub async fn from_remote_url(
        &self,
        url: &str,
        workdir: &Path,
    ) -> Result<Acquired, AcquireError> {
        let info = self.probe_remote(url).await?;
        self.check_remote(&info)?;
        let Acquired { asset, metadata } = self.fetch_remote(url, &info, workdir).await?;
        let asset = self.validate_download(asset).await?;
        Ok(Acquired { asset, metadata })
    }
}

/// Whether `url` is an absolute http(s) URL with a plausible host.
pub fn is_valid_url(url: &str) -> bool {
    if url.is_empty() || url.chars().any(char::is_whitespace) {
        return false;
    }
    let Ok(parsed) = url::Url::parse(url) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }
    match parsed.host() {
        Some(url::Host::Domain(domain)) => {
            domain == "localhost"
                || domain
                    .trim_end_matches('.')
                    .rsplit_once('.')
                    .is_some_and(|(_, tld)| {
                        (2..=63).contains(&tld.len())
                            && tld.chars().all(|c| c.is_ascii_alphabetic())
                    })
        }
        Some(url::Host::Ipv4(_)) => true,
        _ => false,
    }
}

/// Sites front ends should treat as video links when scanning free text.
const VIDEO_SITE_PATTERNS: &[&str] = &[
    "youtube.com/watch",
    "youtu.be/",
    "vimeo.com/",
    "dailymotion.com/",
    "twitch.tv/",
    "facebook.com/",
    "instagram.com/",
    "tiktok.com/",
    "twitter.com/",
    "reddit.com/",
    "streamable.com/",
];

/// Whether some text looks like a link to a video on a site we know how to download from.
///
/// This is a routing hint for front ends, not a guarantee that the download will work.
pub fn is_supported_video_url(text: &str) -> bool {
    let text = text.trim();
    if !is_valid_url(text) {
        return false;
    }
    let lower = text.to_ascii_lowercase();
    VIDEO_SITE_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}

fn mime_for_extension(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "flv" => "video/x-flv",
        _ => return None,
    };
    Some(mime.to_string())
}

/// Finds the file a fetch produced.
///
/// Trusts the fetcher's report if it has one, then tries the names the output template would
/// produce, and finally falls back to the newest video file written in the last few minutes.
async fn locate_download(
    dir: &Path,
    reported: Option<PathBuf>,
    stem: &str,
    info: &RemoteInfo,
) -> Option<PathBuf> {
    if let Some(path) = reported
        && tokio::fs::try_exists(&path).await.unwrap_or(false)
    {
        return Some(path);
    }

    let mut extensions = vec![info.ext.as_deref().unwrap_or("mp4")];
    if !extensions.contains(&"mp4") {
        extensions.push("mp4");
    }
    let stems = [
        stem,
        truncate_chars(stem, 50),
        truncate_chars(stem, 100),
        info.id.as_deref().unwrap_or("video"),
    ];
    for ext in &extensions {
        for stem in stems {
            let candidate = dir.join(format!("{stem}.{ext}"));
            if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                return Some(candidate);
            }
        }
    }

    tracing::debug!(dir = %dir.display(), "download not at expected name, scanning directory");
    newest_recent_video(dir).await
}

async fn newest_recent_video(dir: &Path) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let now = SystemTime::now();
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_video = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| VIDEO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if !is_video {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        let Ok(modified) = meta.modified() else {
            continue;
        };
        if !meta.is_file()
            || now
                .duration_since(modified)
                .is_ok_and(|age| age >= RECENT_FILE_WINDOW)
        {
            continue;
        }
        if newest.as_ref().is_none_or(|(t, _)| modified > *t) {
            newest = Some((modified, path));
        }
    }
    newest.map(|(_, path)| path)
}

fn now_label() -> String {
    jiff::Zoned::now().strftime("%Y-%m-%d %H:%M:%S").to_string()
}

fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Tags describing a remote video: uploader, category, some of its own tags and the platform.
pub fn remote_tags(url: &str, info: &RemoteInfo) -> Vec<String> {
    let own = info.tags.iter().flatten().take(MAX_SOURCE_TAGS).map(String::as_str);
    let tags = info
        .uploader
        .as_deref()
        .into_iter()
        .chain(info.category())
        .chain(own)
        .chain(platform_tag(url));
    normalize_tags(tags, MAX_REMOTE_TAGS)
}

fn remote_metadata(url: &str, info: &RemoteInfo) -> PublishMetadata {
    let description = format!(
        "Downloaded from: {url}\n\nOriginal uploader: {}\nOriginal views: {}\nRepublished on {}\n\n{}",
        info.uploader.as_deref().unwrap_or("Unknown"),
        group_thousands(info.view_count.unwrap_or(0)),
        now_label(),
        truncate_chars(info.description.as_deref().unwrap_or_default(), 4000),
    );
    let mut tags = remote_tags(url, info);
    tags.push("download".to_string());
    PublishMetadata::new(
        info.title.as_deref().unwrap_or("Downloaded Video"),
        description,
        tags,
    )
}

fn local_metadata(upload: &LocalUpload) -> PublishMetadata {
    let title = match &upload.title {
        Some(title) => title.clone(),
        None => Path::new(&upload.declared_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "Uploaded Video".to_string()),
    };
    let description = format!(
        "Uploaded on {}\n\nOriginal filename: {}\nFile size: {:.1} MB\nUploaded by: {}",
        now_label(),
        upload.declared_name,
        mib(&upload.declared_size),
        upload.uploader.as_deref().unwrap_or("unknown"),
    );
    PublishMetadata::new(title, description, ["upload", "video"])
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MAX_SIZE: u64 = 1024 * 1024;
    const MAX_DURATION: u64 = 7200;

    /// Answers probes from a fixed script and "downloads" by writing a file of a given size.
    #[derive(Default)]
    struct ScriptedFetcher {
        info: RemoteInfo,
        probe_error: Option<String>,
        writes: Option<(String, usize)>,
        reports_path: bool,
        probes: AtomicUsize,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl MediaFetcher for ScriptedFetcher {
        async fn probe(&self, _url: &str) -> Result<RemoteInfo, FetchError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            match &self.probe_error {
                Some(e) => Err(FetchError::Tool(e.clone())),
                None => Ok(self.info.clone()),
            }
        }

        async fn fetch(
            &self,
            _url: &str,
            dir: &Path,
            stem: &str,
        ) -> Result<Option<PathBuf>, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let Some((name, len)) = &self.writes else {
                return Ok(None);
            };
            let name = name.replace("{stem}", stem);
            let path = dir.join(name);
            tokio::fs::write(&path, vec![0u8; *len]).await.unwrap();
            Ok(self.reports_path.then_some(path))
        }
    }

    fn acquirer(fetcher: ScriptedFetcher) -> (AssetAcquirer, Arc<ScriptedFetcher>) {
        let fetcher = Arc::new(fetcher);
        let acquirer = AssetAcquirer::new(MAX_SIZE, MAX_DURATION, fetcher.clone());
        (acquirer, fetcher)
    }

    fn info(title: &str) -> RemoteInfo {
        RemoteInfo {
            id: Some("abc123".into()),
            title: Some(title.into()),
            duration: Some(90.0),
            ext: Some("mp4".into()),
            uploader: Some("Someone".into()),
            view_count: Some(1234567),
            ..RemoteInfo::default()
        }
    }

    #[test]
    fn declared_size_rejected_without_touching_disk() {
        let (acquirer, _) = acquirer(ScriptedFetcher::default());
        let upload = LocalUpload::new("/definitely/not/here.mp4", "here.mp4", MAX_SIZE + 1);
        let err = acquirer.from_local_file(&upload).unwrap_err();
        assert!(matches!(err, AcquireError::TooLarge { .. }));
        assert_eq!(err.category(), ErrorCategory::Rejection);
        assert_eq!(err.to_string(), "File too large: 1.0 MB (max: 1.0 MB)");
    }

    #[test]
    fn declared_duration_rejected() {
        let (acquirer, _) = acquirer(ScriptedFetcher::default());
        let upload = LocalUpload::new("/x.mp4", "x.mp4", 100).with_duration(MAX_DURATION + 60);
        let err = acquirer.from_local_file(&upload).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Video too long: 121 minutes (max: 120 minutes)"
        );
    }

    #[test]
    fn local_metadata_comes_from_file_name() {
        let (acquirer, _) = acquirer(ScriptedFetcher::default());
        let upload =
            LocalUpload::new("/staged/123", "Holiday clip.MOV", 2048).with_uploader("@ann");
        let acquired = acquirer.from_local_file(&upload).unwrap();
        assert_eq!(acquired.metadata.title(), "Holiday clip");
        assert_eq!(acquired.metadata.tags(), ["upload", "video"]);
        assert!(acquired.metadata.description().contains("Original filename: Holiday clip.MOV"));
        assert!(acquired.metadata.description().contains("Uploaded by: @ann"));
        assert_eq!(acquired.asset.mime(), Some("video/quicktime"));
        assert_eq!(acquired.asset.path(), Path::new("/staged/123"));
    }

    #[tokio::test]
    async fn staging_copies_into_the_temp_root() {
        let dir = tempfile::tempdir().unwrap();
        let temp_root = dir.path().join("temp");
        std::fs::create_dir_all(&temp_root).unwrap();
        let source = dir.path().join("holiday.MOV");
        std::fs::write(&source, b"not really a video").unwrap();

        let upload = LocalUpload::stage_copy(&source, &temp_root).await.unwrap();
        assert_eq!(upload.declared_name, "holiday.MOV");
        assert_eq!(upload.declared_size, 18);
        assert_eq!(upload.path.parent(), Some(temp_root.as_path()));
        assert_eq!(upload.path.extension().unwrap(), "MOV");
        assert_eq!(std::fs::read(&upload.path).unwrap(), b"not really a video");

        std::fs::remove_file(&upload.path).unwrap();
        assert!(source.exists());

        let err = LocalUpload::stage_copy(&dir.path().join("gone.mp4"), &temp_root)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
        assert_eq!(std::fs::read_dir(&temp_root).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn local_validation_uses_actual_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.mp4");
        tokio::fs::write(&path, vec![0u8; MAX_SIZE as usize + 1]).await.unwrap();

        let (acquirer, _) = acquirer(ScriptedFetcher::default());
        // the requester lied about the size
        let acquired = acquirer
            .from_local_file(&LocalUpload::new(&path, "big.mp4", 10))
            .unwrap();
        let err = acquirer.validate_local(acquired.asset).await.unwrap_err();
        assert!(matches!(err, AcquireError::TooLarge { .. }));

        let missing = MediaAsset::new(dir.path().join("gone.mp4"), 1);
        let err = acquirer.validate_local(missing).await.unwrap_err();
        assert!(matches!(err, AcquireError::MissingFile(_)));
    }

    #[tokio::test]
    async fn malformed_url_is_never_probed() {
        let (acquirer, fetcher) = acquirer(ScriptedFetcher::default());
        for url in ["not a url", "ftp://example.com/v", "https://nodot/v", ""] {
            let err = acquirer.probe_remote(url).await.unwrap_err();
            assert!(matches!(err, AcquireError::InvalidUrl), "{url}: {err:?}");
        }
        assert_eq!(fetcher.probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn live_stream_rejected_before_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let (acquirer, fetcher) = acquirer(ScriptedFetcher {
            info: RemoteInfo {
                is_live: Some(true),
                ..info("live")
            },
            writes: Some(("{stem}.mp4".into(), 20_000)),
            ..ScriptedFetcher::default()
        });
        let err = acquirer
            .from_remote_url("https://www.youtube.com/watch?v=live", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::LiveStream));
        assert_eq!(err.to_string(), "Live streams are not supported");
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn probe_limits() {
        let (acquirer, _) = acquirer(ScriptedFetcher::default());
        let long = RemoteInfo {
            duration: Some(7260.0),
            ..info("long")
        };
        assert!(matches!(
            acquirer.check_remote(&long),
            Err(AcquireError::TooLong { duration: 7260, .. })
        ));

        let big = RemoteInfo {
            filesize_approx: Some((MAX_SIZE * 2) as f64),
            ..info("big")
        };
        assert!(matches!(
            acquirer.check_remote(&big),
            Err(AcquireError::TooLarge { .. })
        ));

        let private = RemoteInfo {
            availability: Some("needs_auth".into()),
            ..info("p")
        };
        let err = acquirer.check_remote(&private).unwrap_err();
        assert_eq!(err.to_string(), "Video is needs_auth and cannot be downloaded");
        assert_eq!(err.category(), ErrorCategory::Unavailable);

        assert!(acquirer.check_remote(&info("fine")).is_ok());
    }

    #[tokio::test]
    async fn probe_failures_map_to_user_reasons() {
        let (acquirer, _) = acquirer(ScriptedFetcher {
            probe_error: Some("ERROR: [youtube] abc: Private video. Sign in".into()),
            ..ScriptedFetcher::default()
        });
        let err = acquirer
            .probe_remote("https://youtu.be/abc")
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Download failed: Video is private and cannot be downloaded"
        );

        assert_eq!(
            DownloadFailure::classify("ERROR: Video unavailable"),
            DownloadFailure::Removed
        );
        assert_eq!(
            DownloadFailure::classify("This video is not available in your country"),
            DownloadFailure::GeoBlocked
        );
        assert_eq!(
            DownloadFailure::classify("ERROR: HTTP Error 500"),
            DownloadFailure::Other("HTTP Error 500".into())
        );
    }

    #[tokio::test]
    async fn download_found_under_expected_name() {
        let dir = tempfile::tempdir().unwrap();
        let (acquirer, _) = acquirer(ScriptedFetcher {
            info: info("My Great Video"),
            writes: Some(("{stem}.mp4".into(), 20_000)),
            ..ScriptedFetcher::default()
        });
        let acquired = acquirer
            .from_remote_url("https://vimeo.com/42", dir.path())
            .await
            .unwrap();
        assert_eq!(acquired.asset.path(), dir.path().join("My-Great-Video.mp4"));
        assert_eq!(acquired.asset.size(), 20_000);
        assert_eq!(acquired.asset.duration(), Some(90));
        assert_eq!(acquired.metadata.title(), "My Great Video");
        assert_eq!(acquired.metadata.tags(), ["Someone", "Vimeo", "download"]);
        let expected_header = concat!(
            "Downloaded from: https://vimeo.com/42\n\n",
            "Original uploader: Someone\n",
            "Original views: 1,234,567\n",
        );
        assert!(acquired.metadata.description().starts_with(expected_header));
    }

    #[tokio::test]
    async fn download_found_by_directory_scan() {
        let dir = tempfile::tempdir().unwrap();
        let (acquirer, _) = acquirer(ScriptedFetcher {
            info: info("whatever"),
            writes: Some(("renamed-by-site.webm".into(), 20_000)),
            ..ScriptedFetcher::default()
        });
        let acquired = acquirer
            .from_remote_url("https://example.com/v/1", dir.path())
            .await
            .unwrap();
        assert_eq!(acquired.asset.path(), dir.path().join("renamed-by-site.webm"));
        assert_eq!(acquired.asset.mime(), Some("video/webm"));
    }

    #[tokio::test]
    async fn reported_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let (acquirer, _) = acquirer(ScriptedFetcher {
            info: info("x"),
            writes: Some(("odd.name.mkv".into(), 20_000)),
            reports_path: true,
            ..ScriptedFetcher::default()
        });
        let acquired = acquirer
            .from_remote_url("https://example.com/v", dir.path())
            .await
            .unwrap();
        assert_eq!(acquired.asset.path(), dir.path().join("odd.name.mkv"));
    }

    #[tokio::test]
    async fn tiny_download_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let (acquirer, _) = acquirer(ScriptedFetcher {
            info: info("tiny"),
            writes: Some(("{stem}.mp4".into(), 100)),
            ..ScriptedFetcher::default()
        });
        let err = acquirer
            .from_remote_url("https://example.com/v", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::Corrupted));
        assert!(!dir.path().join("tiny.mp4").exists());
    }

    #[tokio::test]
    async fn oversized_download_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let (acquirer, _) = acquirer(ScriptedFetcher {
            // nothing declared, so the probe can't catch it
            info: info("huge"),
            writes: Some(("{stem}.mp4".into(), MAX_SIZE as usize + 1)),
            ..ScriptedFetcher::default()
        });
        let err = acquirer
            .from_remote_url("https://example.com/v", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::TooLarge { .. }));
        assert!(!dir.path().join("huge.mp4").exists());
    }

    #[tokio::test]
    async fn missing_download() {
        let dir = tempfile::tempdir().unwrap();
        let (acquirer, _) = acquirer(ScriptedFetcher {
            info: info("ghost"),
            ..ScriptedFetcher::default()
        });
        let err = acquirer
            .from_remote_url("https://example.com/v", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::NotFound));
        assert_eq!(err.category(), ErrorCategory::Integrity);
    }

    #[test]
    fn remote_tag_sources() {
        let info = RemoteInfo {
            uploader: Some("Chan".into()),
            categories: Some(vec!["Music".into()]),
            tags: Some((0..15).map(|i| format!("t{i}")).chain(["Chan".into()]).collect()),
            ..RemoteInfo::default()
        };
        let tags = remote_tags("https://youtu.be/x", &info);
        assert_eq!(tags.len(), 13);
        assert_eq!(&tags[..3], ["Chan", "Music", "t0"]);
        assert_eq!(tags.last().map(String::as_str), Some("YouTube"));
    }

    #[test]
    fn url_validation() {
        assert!(is_valid_url("https://www.youtube.com/watch?v=abc"));
        assert!(is_valid_url("http://localhost:8080/x"));
        assert!(is_valid_url("http://127.0.0.1/x"));
        assert!(!is_valid_url("https://exa mple.com"));
        assert!(!is_valid_url("youtube.com/watch"));
    }

    #[test]
    fn supported_sites() {
        assert!(is_supported_video_url("https://www.youtube.com/watch?v=abc"));
        assert!(is_supported_video_url(" https://youtu.be/abc "));
        assert!(is_supported_video_url("https://VIMEO.com/12345"));
        assert!(!is_supported_video_url("https://example.com/video.mp4"));
        assert!(!is_supported_video_url("check out youtube.com/watch?v=abc"));
        assert!(!is_supported_video_url("https://www.youtube.com/channel/UC123"));
    }

    #[test]
    fn thousands() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
        assert_eq!(group_thousands(1234567), "1,234,567");
    }
}
