//! Probing and fetching remote videos.
//!
//! The heavy lifting (site extraction, format selection, muxing) is delegated to `yt-dlp`, which
//! is driven as a child process. [`MediaFetcher`] is the seam the acquirer talks to, so tests
//! can substitute a scripted fetcher.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::instrument;

use crate::metadata::truncate_chars;

/// What `yt-dlp --dump-single-json` reports about a video, reduced to what we use.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RemoteInfo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub categories: Option<Vec<String>>,
    pub category: Option<String>,
    /// Seconds; may be fractional.
    pub duration: Option<f64>,
    pub filesize: Option<f64>,
    pub filesize_approx: Option<f64>,
    pub is_live: Option<bool>,
    pub availability: Option<String>,
    pub uploader: Option<String>,
    /// `YYYYMMDD`.
    pub upload_date: Option<String>,
    pub view_count: Option<u64>,
    pub like_count: Option<u64>,
    pub webpage_url: Option<String>,
    pub thumbnail: Option<String>,
    pub ext: Option<String>,
}

impl RemoteInfo {
    /// Exact size if known, otherwise the estimate.
    pub fn expected_size(&self) -> Option<u64> {
        self.filesize
            .or(self.filesize_approx)
            .filter(|size| *size > 0.0)
            .map(|size| size as u64)
    }

    pub fn is_live(&self) -> bool {
        self.is_live.unwrap_or(false)
    }

    /// The first declared category, preferring the singular field.
    pub fn category(&self) -> Option<&str> {
        self.category
            .as_deref()
            .or_else(|| self.categories.as_ref()?.first().map(String::as_str))
    }
}

/// A display-friendly digest of a probe, for front ends that show what was found before the
/// download starts.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSummary {
    pub title: String,
    pub duration: Option<u64>,
    pub uploader: Option<String>,
    pub view_count: u64,
    pub like_count: u64,
    /// Shortened to a few hundred characters.
    pub description: String,
    pub webpage_url: Option<String>,
    pub upload_date: Option<String>,
    pub availability: String,
    pub filesize: Option<u64>,
}

impl From<&RemoteInfo> for RemoteSummary {
    fn from(info: &RemoteInfo) -> Self {
        let description = match info.description.as_deref() {
            Some(d) if !d.is_empty() => format!("{}...", truncate_chars(d, 500)),
            _ => String::new(),
        };
        Self {
            title: info.title.clone().unwrap_or_else(|| "Unknown".to_string()),
            duration: info.duration.map(|d| d as u64),
            uploader: info.uploader.clone(),
            view_count: info.view_count.unwrap_or(0),
            like_count: info.like_count.unwrap_or(0),
            description,
            webpage_url: info.webpage_url.clone(),
            upload_date: info.upload_date.clone(),
            availability: info
                .availability
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            filesize: info.expected_size(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The tool ran but reported failure; carries its error output.
    #[error("{0}")]
    Tool(String),
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse video information: {0}")]
    Parse(#[from] serde_json::Error),
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Extracts metadata without downloading anything.
    async fn probe(&self, url: &str) -> Result<RemoteInfo, FetchError>;

    /// Downloads `url` into `dir`, naming the result `<stem>.<ext>`.
    ///
    /// Returns the produced path if the fetcher knows it; the caller falls back to looking for
    /// the file otherwise.
    async fn fetch(&self, url: &str, dir: &Path, stem: &str)
    -> Result<Option<PathBuf>, FetchError>;
}

/// [`MediaFetcher`] backed by the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
    max_file_size: u64,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>, max_file_size: u64) -> Self {
        Self {
            program: program.into(),
            max_file_size,
        }
    }

    /// Prefers 1080p or below, and never anything that is known to exceed the size limit.
    fn format_selector(&self) -> String {
        let max = self.max_file_size;
        format!("best[height<=1080][filesize<{max}]/best[filesize<{max}]/best")
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(["--no-playlist", "--no-warnings"])
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    async fn run(&self, mut command: Command) -> Result<Vec<u8>, FetchError> {
        let output = command
            .output()
            .await
            .map_err(|source| FetchError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FetchError::Tool(tool_error_line(&stderr)));
        }
        Ok(output.stdout)
    }
}

/// The most informative line of yt-dlp's error output.
fn tool_error_line(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .find(|line| line.starts_with("ERROR:"))
        .or_else(|| stderr.lines().rev().find(|line| !line.trim().is_empty()))
        .map(|line| line.trim().to_string())
        .unwrap_or_else(|| "yt-dlp exited unsuccessfully".to_string())
}

#[async_trait]
impl MediaFetcher for YtDlp {
    #[instrument(skip(self))]
    async fn probe(&self, url: &str) -> Result<RemoteInfo, FetchError> {
        let mut command = self.command();
        command.args(["--dump-single-json", "--", url]);
        let stdout = self.run(command).await?;
        let info: RemoteInfo = serde_json::from_slice(&stdout)?;
        tracing::debug!(
            title = info.title.as_deref().unwrap_or_default(),
            duration = ?info.duration,
            "probed remote video"
        );
        Ok(info)
    }

    #[instrument(skip(self))]
    async fn fetch(
        &self,
        url: &str,
        dir: &Path,
        stem: &str,
    ) -> Result<Option<PathBuf>, FetchError> {
        let template = dir.join(format!("{stem}.%(ext)s"));
        let format = self.format_selector();
        let mut command = self.command();
        command
            .args(["--no-simulate", "--format", format.as_str()])
            .args(["--merge-output-format", "mp4"])
            .arg("--output")
            .arg(&template)
            .args(["--print", "after_move:filepath", "--", url]);
        let stdout = self.run(command).await?;

        let printed = String::from_utf8_lossy(&stdout);
        Ok(printed
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(PathBuf::from))
    }
}
