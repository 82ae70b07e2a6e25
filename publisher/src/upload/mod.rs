//! Publishing a validated asset with retries and backoff.
//!
//! An upload is made of up to [`RetryPolicy::max_attempts`] *outer attempts*, each of which opens
//! a fresh resumable session and sends the file from byte zero. Within an attempt, a chunk that
//! fails with a transient server error is re-sent after an exponentially growing delay, for as
//! long as the attempt's wall-time budget allows. Authorization and permission failures end the
//! upload at once.

use bytes::Bytes;
use reqwest::StatusCode;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::Instant;
use tracing::instrument;

use crate::acquire::{FALLBACK_MIME, MediaAsset};
use crate::auth::CredentialHandle;
use crate::config::{Config, PrivacyStatus};
use crate::metadata::PublishMetadata;
use crate::youtube_api::VideoInsert;

mod transport;

pub use transport::{ChunkOutcome, ResumableTransport, TransferError, UploadTransport};

/// How hard the engine tries before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Full restarts of the transfer, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; every further retry doubles it.
    pub base_delay: Duration,
    /// Wall time one outer attempt may spend without the transfer moving forward.
    ///
    /// The clock restarts whenever a chunk is accepted, so a slow but healthy
    /// transfer is never cut short.
    pub attempt_budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            attempt_budget: Duration::from_secs(60 * 60),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, index: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(index.min(31)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("video file not found: {}", .0.display())]
    MissingFile(std::path::PathBuf),
    #[error("Authentication expired. Please re-authenticate.")]
    AuthExpired,
    #[error("Upload forbidden. Check YouTube API quotas and permissions.")]
    Forbidden,
    #[error("upload endpoint is temporarily unavailable ({0})")]
    Retryable(StatusCode),
    #[error("upload rejected with status {status}: {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("Upload completed but no video ID returned")]
    MissingVideoId,
    #[error("read video file")]
    Io(#[from] std::io::Error),
    #[error("upload request failed")]
    Transport(#[source] reqwest::Error),
    #[error("obtain access token: {0}")]
    Credential(String),
    #[error("upload endpoint violated the resumable protocol: {0}")]
    Protocol(String),
    #[error("upload attempt ran out of time after {0:?}")]
    AttemptBudgetExhausted(Duration),
}

impl UploadError {
    /// Whether restarting the transfer cannot help.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadError::MissingFile(_)
                | UploadError::AuthExpired
                | UploadError::Forbidden
                | UploadError::MissingVideoId
        )
    }

    fn from_status(status: StatusCode, body: String) -> Self {
        match status {
            StatusCode::UNAUTHORIZED => UploadError::AuthExpired,
            StatusCode::FORBIDDEN => UploadError::Forbidden,
            StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => UploadError::Retryable(status),
            _ => UploadError::Rejected { status, body },
        }
    }
}

impl From<TransferError> for UploadError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Status { status, body } => UploadError::from_status(status, body),
            TransferError::Transport(e) => UploadError::Transport(e),
            TransferError::Token(msg) => UploadError::Credential(msg),
            TransferError::Protocol(header) => UploadError::Protocol(format!("missing {header}")),
        }
    }
}

/// A successfully published video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub video_id: String,
    pub url: String,
}

/// Receives upload progress as a percentage.
pub type ProgressFn<'a> = &'a (dyn Fn(u8) + Send + Sync);

/// Reports progress in whole steps of ten percent, never going backwards.
struct ProgressTracker<'a> {
    report: ProgressFn<'a>,
    last: Option<u8>,
}

impl<'a> ProgressTracker<'a> {
    fn new(report: ProgressFn<'a>) -> Self {
        Self { report, last: None }
    }

    fn update(&mut self, sent: u64, total: u64) {
        let percent = if total == 0 {
            100
        } else {
            (sent.min(total) * 100 / total) as u8
        };
        let step = percent / 10 * 10;
        if self.last.is_some_and(|last| last >= step) {
            return;
        }
        self.last = Some(step);
        tracing::info!(percent = step, "upload progress");
        (self.report)(step);
    }
}

/// What the engine knows about one `publish` call.
#[derive(Debug)]
struct UploadSession<'a> {
    asset: &'a MediaAsset,
    insert: VideoInsert,
    total: u64,
    attempt: u32,
    bytes_sent: u64,
    last_status: Option<StatusCode>,
}

/// Where an outer attempt is in the resumable protocol.
enum Phase {
    Opening,
    Sending { session: String, offset: u64 },
}

/// Turns a [`MediaAsset`] and its [`PublishMetadata`] into a published video.
pub struct UploadEngine {
    transport: Arc<dyn UploadTransport>,
    policy: RetryPolicy,
    chunk_size: usize,
    default_privacy: PrivacyStatus,
    watch_base: String,
}

impl std::fmt::Debug for UploadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadEngine")
            .field("policy", &self.policy)
            .field("chunk_size", &self.chunk_size)
            .field("default_privacy", &self.default_privacy)
            .field("watch_base", &self.watch_base)
            .finish_non_exhaustive()
    }
}

impl UploadEngine {
    pub fn new(
        transport: Arc<dyn UploadTransport>,
        policy: RetryPolicy,
        chunk_size: usize,
        default_privacy: PrivacyStatus,
        watch_base: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            policy,
            chunk_size: chunk_size.max(1),
            default_privacy,
            watch_base: watch_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &Config) -> eyre::Result<Self> {
        Ok(Self::new(
            Arc::new(ResumableTransport::from_config(config)?),
            RetryPolicy::default(),
            config.upload_chunk_size,
            config.privacy_status,
            &config.watch_base,
        ))
    }

    /// The public URL of a video.
    pub fn watch_url(&self, video_id: &str) -> String {
        format!("{}/watch?v={video_id}", self.watch_base)
    }

    /// Publishes the asset, returning its public URL, or `None` if the upload failed.
    ///
    /// The reason for a failure has already been logged when this returns.
    pub async fn publish(
        &self,
        asset: &MediaAsset,
        metadata: &PublishMetadata,
        credential: &CredentialHandle,
        progress: ProgressFn<'_>,
    ) -> Option<String> {
        self.try_publish(asset, metadata, credential, progress)
            .await
            .ok()
            .map(|published| published.url)
    }

    /// Like [`UploadEngine::publish`], but says why the upload failed.
    #[instrument(skip_all, fields(path = %asset.path().display(), title = metadata.title()))]
    pub async fn try_publish(
        &self,
        asset: &MediaAsset,
        metadata: &PublishMetadata,
        credential: &CredentialHandle,
        progress: ProgressFn<'_>,
    ) -> Result<Published, UploadError> {
        let total = match tokio::fs::metadata(asset.path()).await {
            Ok(m) if m.is_file() => m.len(),
            _ => {
                let e = UploadError::MissingFile(asset.path().to_path_buf());
                tracing::error!("{e}");
                return Err(e);
            }
        };

        let mut session = UploadSession {
            asset,
            insert: VideoInsert::from_metadata(metadata, self.default_privacy),
            total,
            attempt: 0,
            bytes_sent: 0,
            last_status: None,
        };
        let mut progress = ProgressTracker::new(progress);
        tracing::info!(
            bytes = total,
            privacy = %session.insert.status.privacy_status,
            "starting upload"
        );

        loop {
            let error = match self.attempt(&mut session, credential, &mut progress).await {
                Ok(video_id) => {
                    let url = self.watch_url(&video_id);
                    tracing::info!(%video_id, %url, "upload complete");
                    return Ok(Published { video_id, url });
                }
                Err(e) => e,
            };

            if error.is_terminal() {
                tracing::error!(attempt = session.attempt + 1, "upload failed: {error}");
                return Err(error);
            }
            if session.attempt + 1 >= self.policy.max_attempts {
                tracing::error!(
                    attempts = self.policy.max_attempts,
                    last_status = ?session.last_status,
                    "upload failed after all attempts: {error}"
                );
                return Err(error);
            }

            let delay = self.policy.backoff(session.attempt);
            tracing::warn!(
                attempt = session.attempt + 1,
                ?delay,
                "upload attempt failed, restarting transfer: {error}"
            );
            tokio::time::sleep(delay).await;
            session.attempt += 1;
        }
    }

    /// One outer attempt: a fresh session, sent from byte zero.
    async fn attempt(
        &self,
        session: &mut UploadSession<'_>,
        credential: &CredentialHandle,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<String, UploadError> {
        let mut stalled_since = Instant::now();
        let mut file = tokio::fs::File::open(session.asset.path()).await?;
        let content_type = session.asset.mime().unwrap_or(FALLBACK_MIME);
        let mut retry_index = 0;
        let mut phase = Phase::Opening;
        session.bytes_sent = 0;

        loop {
            if stalled_since.elapsed() > self.policy.attempt_budget {
                return Err(UploadError::AttemptBudgetExhausted(stalled_since.elapsed()));
            }

            let result = match &phase {
                Phase::Opening => self
                    .transport
                    .open_session(credential, &session.insert, session.total, content_type)
                    .await
                    .map(|uri| Phase::Sending {
                        session: uri,
                        offset: 0,
                    }),
                Phase::Sending {
                    session: uri,
                    offset,
                } => {
                    let chunk = self.read_chunk(&mut file, *offset, session.total).await?;
                    match self
                        .transport
                        .send_chunk(credential, uri, *offset, chunk, session.total)
                        .await
                    {
                        Ok(ChunkOutcome::Complete(video)) => {
                            session.bytes_sent = session.total;
                            progress.update(session.total, session.total);
                            return video.id.ok_or(UploadError::MissingVideoId);
                        }
                        Ok(ChunkOutcome::Incomplete { next_offset }) => {
                            if next_offset > *offset {
                                stalled_since = Instant::now();
                                retry_index = 0;
                            }
                            session.bytes_sent = next_offset;
                            progress.update(next_offset, session.total);
                            Ok(Phase::Sending {
                                session: uri.clone(),
                                offset: next_offset,
                            })
                        }
                        Err(e) => Err(e),
                    }
                }
            };

            let error = match result {
                Ok(next) => {
                    phase = next;
                    continue;
                }
                Err(TransferError::Status { status, body }) => {
                    session.last_status = Some(status);
                    UploadError::from_status(status, body)
                }
                Err(e) => return Err(e.into()),
            };

            let UploadError::Retryable(status) = error else {
                return Err(error);
            };
            if matches!(phase, Phase::Opening) {
                return Err(error);
            }
            let delay = self.policy.backoff(retry_index);
            if stalled_since.elapsed() + delay > self.policy.attempt_budget {
                return Err(UploadError::AttemptBudgetExhausted(stalled_since.elapsed()));
            }
            tracing::warn!(
                %status,
                retry = retry_index + 1,
                ?delay,
                "retriable error while sending chunk, retrying"
            );
            tokio::time::sleep(delay).await;
            retry_index += 1;
        }
    }

    async fn read_chunk(
        &self,
        file: &mut tokio::fs::File,
        offset: u64,
        total: u64,
    ) -> Result<Bytes, UploadError> {
        let remaining = total.saturating_sub(offset);
        let len = remaining.min(self.chunk_size as u64) as usize;
        let mut buf = vec![0; len];
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StoredToken;
    use crate::youtube_api::Video;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Reply = Result<ChunkOutcome, TransferError>;

    /// Plays back canned replies and records what was sent.
    #[derive(Default)]
    struct ScriptedTransport {
        sessions: Mutex<VecDeque<Result<String, TransferError>>>,
        replies: Mutex<VecDeque<Reply>>,
        opened: Mutex<u32>,
        chunks: Mutex<Vec<(u64, Vec<u8>)>>,
        latency: Duration,
    }

    impl ScriptedTransport {
        fn new(replies: impl IntoIterator<Item = Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().collect()),
                ..Default::default()
            })
        }

        /// Like `new`, but every chunk takes `latency` to go through.
        fn slow(replies: impl IntoIterator<Item = Reply>, latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().collect()),
                latency,
                ..Default::default()
            })
        }

        fn opened(&self) -> u32 {
            *self.opened.lock().unwrap()
        }

        fn offsets(&self) -> Vec<u64> {
            self.chunks.lock().unwrap().iter().map(|(o, _)| *o).collect()
        }
    }

    #[async_trait]
    impl UploadTransport for ScriptedTransport {
        async fn open_session(
            &self,
            _credential: &CredentialHandle,
            _insert: &VideoInsert,
            _total: u64,
            _content_type: &str,
        ) -> Result<String, TransferError> {
            *self.opened.lock().unwrap() += 1;
            self.sessions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("https://upload.example/session".into()))
        }

        async fn send_chunk(
            &self,
            _credential: &CredentialHandle,
            _session: &str,
            offset: u64,
            chunk: Bytes,
            _total: u64,
        ) -> Result<ChunkOutcome, TransferError> {
            self.chunks.lock().unwrap().push((offset, chunk.to_vec()));
            tokio::time::sleep(self.latency).await;
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .expect("transport called more often than scripted")
        }
    }

    fn status(code: u16) -> Reply {
        Err(TransferError::Status {
            status: StatusCode::from_u16(code).unwrap(),
            body: String::new(),
        })
    }

    fn done(id: Option<&str>) -> Reply {
        Ok(ChunkOutcome::Complete(Video {
            id: id.map(Into::into),
        }))
    }

    fn credential() -> CredentialHandle {
        CredentialHandle::Delegated(StoredToken {
            token: "t".into(),
            refresh_token: None,
            token_uri: crate::auth::GOOGLE_TOKEN_URI.into(),
            client_id: None,
            client_secret: None,
            scopes: Vec::new(),
            expiry: None,
        })
    }

    fn engine(transport: Arc<ScriptedTransport>, chunk_size: usize) -> UploadEngine {
        UploadEngine::new(
            transport,
            RetryPolicy::default(),
            chunk_size,
            PrivacyStatus::Unlisted,
            "https://www.youtube.com/",
        )
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        asset: MediaAsset,
        metadata: PublishMetadata,
    }

    fn fixture(contents: &[u8]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, contents).unwrap();
        Fixture {
            asset: MediaAsset::new(&path, contents.len() as u64),
            metadata: PublishMetadata::new("Clip", "", ["test"]),
            _dir: dir,
        }
    }

    fn no_progress(_: u8) {}

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_the_same_chunk() {
        let f = fixture(b"0123456789");
        let transport = ScriptedTransport::new([status(503), status(503), done(Some("abc"))]);
        let engine = engine(transport.clone(), 1024);

        let start = Instant::now();
        let url = engine
            .publish(&f.asset, &f.metadata, &credential(), &no_progress)
            .await;
        assert_eq!(url.as_deref(), Some("https://www.youtube.com/watch?v=abc"));
        assert_eq!(transport.opened(), 1);
        assert_eq!(transport.offsets(), vec![0, 0, 0]);
        // 1s then 2s of backoff
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_is_immediately_fatal() {
        let f = fixture(b"0123456789");
        let transport = ScriptedTransport::new([status(401)]);
        let engine = engine(transport.clone(), 1024);

        let start = Instant::now();
        let err = engine
            .try_publish(&f.asset, &f.metadata, &credential(), &no_progress)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::AuthExpired));
        assert_eq!(
            err.to_string(),
            "Authentication expired. Please re-authenticate."
        );
        assert_eq!(transport.opened(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn forbidden_is_never_retried() {
        let f = fixture(b"0123456789");
        let transport = ScriptedTransport::new([status(403)]);
        let engine = engine(transport.clone(), 1024);
        let err = engine
            .try_publish(&f.asset, &f.metadata, &credential(), &no_progress)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Forbidden));
        assert_eq!(transport.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_video_id_is_fatal() {
        let f = fixture(b"0123456789");
        let transport = ScriptedTransport::new([done(None)]);
        let engine = engine(transport.clone(), 1024);
        let err = engine
            .try_publish(&f.asset, &f.metadata, &credential(), &no_progress)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::MissingVideoId));
        assert_eq!(transport.opened(), 1);
    }

    #[tokio::test]
    async fn missing_file_is_fatal() {
        let transport = ScriptedTransport::new([]);
        let engine = engine(transport.clone(), 1024);
        let asset = MediaAsset::new("/nonexistent/clip.mp4", 10);
        let metadata = PublishMetadata::new("Clip", "", ["test"]);
        let url = engine
            .publish(&asset, &metadata, &credential(), &no_progress)
            .await;
        assert_eq!(url, None);
        assert_eq!(transport.opened(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn other_failures_restart_the_transfer() {
        let f = fixture(b"0123456789");
        let transport = ScriptedTransport::new([
            Ok(ChunkOutcome::Incomplete { next_offset: 4 }),
            status(400),
            done(Some("second-try")),
        ]);
        let engine = engine(transport.clone(), 4);

        let start = Instant::now();
        let url = engine
            .publish(&f.asset, &f.metadata, &credential(), &no_progress)
            .await;
        assert_eq!(
            url.as_deref(),
            Some("https://www.youtube.com/watch?v=second-try")
        );
        assert_eq!(transport.opened(), 2);
        assert_eq!(transport.offsets(), vec![0, 4, 0]);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_three_attempts() {
        let f = fixture(b"0123456789");
        let transport = ScriptedTransport::new([status(400), status(400), status(400)]);
        let engine = engine(transport.clone(), 1024);

        let start = Instant::now();
        let err = engine
            .try_publish(&f.asset, &f.metadata, &credential(), &no_progress)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Rejected { .. }));
        assert_eq!(transport.opened(), 3);
        // 2^0 + 2^1 between the three attempts
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn chunk_backoff_is_bounded_by_attempt_budget() {
        let f = fixture(b"0123456789");
        let transport =
            ScriptedTransport::new(std::iter::repeat_with(|| status(503)).take(64));
        let engine = UploadEngine::new(
            transport.clone(),
            RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::from_secs(1),
                attempt_budget: Duration::from_secs(10),
            },
            1024,
            PrivacyStatus::Unlisted,
            "https://www.youtube.com",
        );
        let err = engine
            .try_publish(&f.asset, &f.metadata, &credential(), &no_progress)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::AttemptBudgetExhausted(_)));
        // waited 1 + 2 + 4; the next 8s wait would exceed the budget
        assert_eq!(transport.offsets().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_is_coarse_and_monotonic() {
        let f = fixture(&[7u8; 100]);
        let transport = ScriptedTransport::new([
            Ok(ChunkOutcome::Incomplete { next_offset: 25 }),
            Ok(ChunkOutcome::Incomplete { next_offset: 50 }),
            status(400),
            Ok(ChunkOutcome::Incomplete { next_offset: 25 }),
            Ok(ChunkOutcome::Incomplete { next_offset: 50 }),
            Ok(ChunkOutcome::Incomplete { next_offset: 75 }),
            done(Some("v")),
        ]);
        let engine = engine(transport.clone(), 25);

        let seen = Mutex::new(Vec::new());
        let record = |p: u8| seen.lock().unwrap().push(p);
        engine
            .try_publish(&f.asset, &f.metadata, &credential(), &record)
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![20, 50, 70, 100]);

        let chunks = transport.chunks.lock().unwrap();
        assert!(chunks.iter().all(|(_, bytes)| bytes.len() == 25));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_transfer_outlives_attempt_budget() {
        let f = fixture(&[1u8; 80]);
        let replies = (1..8)
            .map(|i| Ok(ChunkOutcome::Incomplete { next_offset: i * 10 }))
            .chain([done(Some("slow"))]);
        let transport = ScriptedTransport::slow(replies, Duration::from_secs(600));
        let engine = engine(transport.clone(), 10);

        let start = Instant::now();
        let url = engine
            .publish(&f.asset, &f.metadata, &credential(), &no_progress)
            .await;
        assert_eq!(url.as_deref(), Some("https://www.youtube.com/watch?v=slow"));
        assert_eq!(transport.opened(), 1);
        assert_eq!(transport.offsets(), vec![0, 10, 20, 30, 40, 50, 60, 70]);
        assert_eq!(start.elapsed(), Duration::from_secs(80 * 60));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_resets_chunk_backoff() {
        let f = fixture(b"0123456789");
        let transport = ScriptedTransport::new([
            status(503),
            status(503),
            Ok(ChunkOutcome::Incomplete { next_offset: 4 }),
            status(503),
            Ok(ChunkOutcome::Incomplete { next_offset: 8 }),
            done(Some("abc")),
        ]);
        let engine = engine(transport.clone(), 4);

        let start = Instant::now();
        let url = engine
            .publish(&f.asset, &f.metadata, &credential(), &no_progress)
            .await;
        assert_eq!(url.as_deref(), Some("https://www.youtube.com/watch?v=abc"));
        assert_eq!(transport.offsets(), vec![0, 0, 0, 4, 4, 8]);
        // 1s + 2s before the first chunk lands, then back to 1s
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }
}
