//! The end-to-end publish flow for one requester.
//!
//! Each invocation walks through [`Stage`]s in order:
//! guard → authenticate → acquire → validate → upload → clean up. Any stage may end the
//! invocation early, but clean-up and the guard release always run.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::instrument;

use crate::acquire::{AcquireError, Acquired, AssetAcquirer, LocalUpload, RemoteSummary};
use crate::auth::{
    CredentialResolver, CredentialSources, CredentialsInfo, OAuthClientConfig, OAuthManager,
    Strategy,
};
use crate::config::Config;
use crate::guard::{RequestGuard, RequesterId};
use crate::upload::{UploadEngine, UploadError};
use crate::youtube_api::{Channel, YouTubeClient};

/// Where an invocation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Guarding,
    Authenticating,
    Acquiring,
    Validating,
    Uploading,
    Cleanup,
    Done,
}

impl Stage {
    /// A line suitable for showing to the requester.
    pub fn status_text(&self) -> &'static str {
        match self {
            Stage::Idle => "Waiting.",
            Stage::Guarding => "Checking for uploads already in progress...",
            Stage::Authenticating => "Checking YouTube authentication...",
            Stage::Acquiring => "Fetching video...",
            Stage::Validating => "Validating video...",
            Stage::Uploading => "Uploading to YouTube...",
            Stage::Cleanup => "Cleaning up...",
            Stage::Done => "Done.",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status_text())
    }
}

/// Something a front end may want to show while an invocation runs.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Stage(Stage),
    /// Upload progress, in steps of ten percent.
    UploadProgress(u8),
    /// What a remote probe found, before the download starts.
    Found(RemoteSummary),
}

pub type EventSink = mpsc::UnboundedSender<PipelineEvent>;

/// How an invocation ended.
#[derive(Debug)]
pub enum PipelineOutcome {
    Published {
        url: String,
        title: String,
        auth_method: Strategy,
    },
    /// The requester already has an invocation running.
    Busy,
    AuthRequired,
    Rejected(AcquireError),
    /// The upload failed; the reason has been logged.
    UploadFailed,
}

impl PipelineOutcome {
    pub fn url(&self) -> Option<&str> {
        match self {
            PipelineOutcome::Published { url, .. } => Some(url),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.url().is_some()
    }
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineOutcome::Published {
                url,
                title,
                auth_method,
            } => write!(f, "Uploaded \"{title}\" to {url} (via {auth_method})"),
            PipelineOutcome::Busy => f.write_str(
                "You already have a video being processed. Please wait for it to complete.",
            ),
            PipelineOutcome::AuthRequired => f.write_str(
                "YouTube authentication required. Ask the administrator to set up credentials.",
            ),
            PipelineOutcome::Rejected(e) => write!(f, "{e}"),
            PipelineOutcome::UploadFailed => f.write_str("Upload failed. Check logs for details."),
        }
    }
}

fn emit(events: &EventSink, event: PipelineEvent) {
    if let PipelineEvent::Stage(stage) = &event {
        tracing::debug!(?stage, "{stage}");
    }
    // a front end that stopped listening doesn't stop the pipeline
    let _ = events.send(event);
}

/// The video an invocation publishes.
enum Source<'a> {
    File(LocalUpload),
    Url(&'a str),
}

/// Everything an invocation puts on disk.
///
/// [`Scratch::clear`] removes it; dropping removes whatever is left, so a panic or a dropped
/// future leaves nothing behind either.
#[derive(Debug, Default)]
struct Scratch {
    files: Vec<PathBuf>,
    workdir: Option<tempfile::TempDir>,
}

impl Scratch {
    fn track(&mut self, path: &Path) {
        if !self.files.iter().any(|p| p == path) {
            self.files.push(path.to_path_buf());
        }
    }

    /// A directory unique to this invocation, created on first use.
    async fn workdir(&mut self, root: &Path) -> std::io::Result<&Path> {
        let dir = match self.workdir.take() {
            Some(dir) => dir,
            None => {
                tokio::fs::create_dir_all(root).await?;
                tempfile::Builder::new().prefix("publish-").tempdir_in(root)?
            }
        };
        Ok(self.workdir.insert(dir).path())
    }

    async fn clear(&mut self) {
        for path in self.files.drain(..) {
            match crate::acquire::remove_if_exists(&path).await {
                Ok(()) => tracing::debug!(path = %path.display(), "removed"),
                Err(e) => tracing::warn!(path = %path.display(), "could not remove file: {e}"),
            }
        }
        if let Some(dir) = self.workdir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                tracing::warn!(path = %path.display(), "could not remove work directory: {e}");
            }
        }
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        for path in &self.files {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Publishes videos on behalf of requesters, one at a time per requester.
pub struct Publisher {
    guard: Arc<RequestGuard>,
    resolver: Arc<CredentialResolver>,
    acquirer: AssetAcquirer,
    engine: UploadEngine,
    oauth: Option<OAuthManager>,
    temp_root: PathBuf,
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("active_requesters", &self.guard.active_count())
            .field("resolver", &self.resolver)
            .field("acquirer", &self.acquirer)
            .field("engine", &self.engine)
            .field("temp_root", &self.temp_root)
            .finish_non_exhaustive()
    }
}

impl Publisher {
    pub fn new(
        guard: Arc<RequestGuard>,
        resolver: Arc<CredentialResolver>,
        acquirer: AssetAcquirer,
        engine: UploadEngine,
        temp_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            guard,
            resolver,
            acquirer,
            engine,
            oauth: None,
            temp_root: temp_root.into(),
        }
    }

    /// Enables the interactive authorization helpers.
    pub fn with_oauth(mut self, oauth: OAuthManager) -> Self {
        self.oauth = Some(oauth);
        self
    }

    /// Wires everything up from configuration, creating the working directories.
    pub async fn from_config(config: &Config) -> eyre::Result<Self> {
        config.ensure_directories().await?;

        let oauth_client = match OAuthClientConfig::from_config(config).await {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!("ignoring unusable OAuth client configuration: {e:#}");
                None
            }
        };
        if let Some(client) = &oauth_client
            && let Err(e) = client
                .write_client_secret_file(&config.client_secret_file())
                .await
        {
            tracing::warn!("could not write client secret file: {e:#}");
        }

        let resolver = CredentialResolver::new(
            CredentialSources::from_config(config),
            oauth_client.clone(),
            YouTubeClient::from_config(config)?,
        )?;
        let publisher = Self::new(
            Arc::new(RequestGuard::new()),
            Arc::new(resolver),
            AssetAcquirer::from_config(config),
            UploadEngine::from_config(config)?,
            config.temp_root(),
        );
        Ok(match oauth_client {
            Some(client) => publisher.with_oauth(OAuthManager::new(client, config.token_file())?),
            None => publisher,
        })
    }

    pub fn guard(&self) -> &Arc<RequestGuard> {
        &self.guard
    }

    pub fn resolver(&self) -> &Arc<CredentialResolver> {
        &self.resolver
    }

    pub fn acquirer(&self) -> &AssetAcquirer {
        &self.acquirer
    }

    pub fn oauth(&self) -> Option<&OAuthManager> {
        self.oauth.as_ref()
    }

    pub async fn check_authentication(&self) -> bool {
        self.resolver.check_authentication().await
    }

    /// `"Service Account"`, `"OAuth 2.0"` or `"None"`.
    pub fn auth_method(&self) -> Strategy {
        self.resolver.auth_method()
    }

    pub async fn channel_info(&self) -> Option<Channel> {
        self.resolver.channel_info().await
    }

    pub async fn credentials_info(&self) -> CredentialsInfo {
        self.resolver.credentials_info().await
    }

    /// Starts the manual authorization flow, returning the URL to visit.
    pub fn authorization_url(&self) -> eyre::Result<String> {
        self.oauth
            .as_ref()
            .ok_or_else(|| eyre::eyre!("no OAuth client is configured"))?
            .authorization_url()
    }

    /// Completes the manual authorization flow and switches to the new credential.
    pub async fn exchange_code_for_token(&self, code: &str) -> bool {
        let Some(oauth) = &self.oauth else {
            tracing::error!("cannot exchange authorization code: no OAuth client is configured");
            return false;
        };
        if !oauth.exchange_code_for_token(code).await {
            return false;
        }
        self.resolver.resolve().await.is_ok()
    }

    /// Publishes a file the requester has already staged locally.
    ///
    /// Once the requester is admitted, the staged file belongs to the pipeline and is deleted
    /// when the invocation ends, whatever the outcome.
    pub async fn publish_from_file(
        &self,
        requester: RequesterId,
        upload: LocalUpload,
        events: &EventSink,
    ) -> PipelineOutcome {
        self.run(requester, Source::File(upload), events).await
    }

    /// Downloads a video from another site and publishes it.
    pub async fn publish_from_url(
        &self,
        requester: RequesterId,
        url: &str,
        events: &EventSink,
    ) -> PipelineOutcome {
        self.run(requester, Source::Url(url), events).await
    }

    #[instrument(skip(self, source, events), fields(requester = %requester))]
    async fn run(
        &self,
        requester: RequesterId,
        source: Source<'_>,
        events: &EventSink,
    ) -> PipelineOutcome {
        emit(events, PipelineEvent::Stage(Stage::Guarding));
        let Some(permit) = self.guard.acquire(requester) else {
            tracing::info!("rejecting request, requester is busy");
            return PipelineOutcome::Busy;
        };

        let mut scratch = Scratch::default();
        if let Source::File(upload) = &source {
            scratch.track(&upload.path);
        }

        let outcome = self.stages(&source, &mut scratch, events).await;

        emit(events, PipelineEvent::Stage(Stage::Cleanup));
        scratch.clear().await;
        permit.release();
        emit(events, PipelineEvent::Stage(Stage::Done));

        match &outcome {
            PipelineOutcome::Published { url, .. } => tracing::info!(%url, "published"),
            other => tracing::info!("pipeline ended: {other}"),
        }
        outcome
    }

    async fn stages(
        &self,
        source: &Source<'_>,
        scratch: &mut Scratch,
        events: &EventSink,
    ) -> PipelineOutcome {
        emit(events, PipelineEvent::Stage(Stage::Authenticating));
        if !self.resolver.check_authentication().await {
            return PipelineOutcome::AuthRequired;
        }

        emit(events, PipelineEvent::Stage(Stage::Acquiring));
        let acquired = match source {
            Source::File(upload) => self.acquirer.from_local_file(upload),
            Source::Url(url) => self.acquire_remote(url, scratch, events).await,
        };
        let Acquired { asset, metadata } = match acquired {
            Ok(acquired) => acquired,
            Err(e) => {
                tracing::warn!(category = ?e.category(), "acquisition rejected: {e}");
                return PipelineOutcome::Rejected(e);
            }
        };
        scratch.track(asset.path());

        emit(events, PipelineEvent::Stage(Stage::Validating));
        let validated = match source {
            Source::File(_) => self.acquirer.validate_local(asset).await,
            Source::Url(_) => self.acquirer.validate_download(asset).await,
        };
        let asset = match validated {
            Ok(asset) => asset,
            Err(e) => {
                tracing::warn!(category = ?e.category(), "validation rejected: {e}");
                return PipelineOutcome::Rejected(e);
            }
        };

        emit(events, PipelineEvent::Stage(Stage::Uploading));
        let Ok(credential) = self.resolver.ensure().await else {
            return PipelineOutcome::AuthRequired;
        };
        let progress = |percent| emit(events, PipelineEvent::UploadProgress(percent));
        match self
            .engine
            .try_publish(&asset, &metadata, &credential, &progress)
            .await
        {
            Ok(published) => PipelineOutcome::Published {
                url: published.url,
                title: metadata.title().to_string(),
                auth_method: credential.strategy(),
            },
            Err(UploadError::AuthExpired) => {
                // the next invocation re-resolves instead of reusing a rejected credential
                self.resolver.invalidate(&credential);
                PipelineOutcome::UploadFailed
            }
            Err(_) => PipelineOutcome::UploadFailed,
        }
    }

    async fn acquire_remote(
        &self,
        url: &str,
        scratch: &mut Scratch,
        events: &EventSink,
    ) -> Result<Acquired, AcquireError> {
        let info = self.acquirer.probe_remote(url).await?;
        self.acquirer.check_remote(&info)?;
        emit(events, PipelineEvent::Found(RemoteSummary::from(&info)));

        let workdir = scratch
            .workdir(&self.temp_root)
            .await
            .map_err(|e| AcquireError::Unexpected(format!("create work directory: {e}")))?;
        self.acquirer.fetch_remote(url, &info, workdir).await
    }
}
