//! The resumable upload protocol, one HTTP exchange at a time.
//!
//! See: <https://developers.google.com/youtube/v3/guides/using_resumable_upload_protocol>

use async_trait::async_trait;
use bytes::Bytes;
use eyre::Context;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, LOCATION, RANGE};

use crate::auth::CredentialHandle;
use crate::config::Config;
use crate::youtube_api::{ApiError, Video, VideoInsert};

/// "Resume Incomplete".
const RESUME_INCOMPLETE: StatusCode = StatusCode::PERMANENT_REDIRECT;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("upload endpoint returned status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("upload request failed")]
    Transport(#[from] reqwest::Error),
    #[error("obtain access token: {0}")]
    Token(String),
    #[error("upload endpoint response is missing the {0} header")]
    Protocol(&'static str),
}

impl From<ApiError> for TransferError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Transport(e) => TransferError::Transport(e),
            ApiError::Status { status, body } => TransferError::Status { status, body },
            ApiError::Unauthorized(body) => TransferError::Status {
                status: StatusCode::UNAUTHORIZED,
                body,
            },
            ApiError::Token(msg) => TransferError::Token(msg),
        }
    }
}

/// What the server said after receiving a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// More bytes are expected, starting at `next_offset`.
    Incomplete { next_offset: u64 },
    Complete(Video),
}

/// The two requests that make up a resumable upload.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// Opens an upload session for `total` bytes and returns the session URI.
    async fn open_session(
        &self,
        credential: &CredentialHandle,
        insert: &VideoInsert,
        total: u64,
        content_type: &str,
    ) -> Result<String, TransferError>;

    /// Sends the bytes starting at `offset` of a `total`-byte upload.
    async fn send_chunk(
        &self,
        credential: &CredentialHandle,
        session: &str,
        offset: u64,
        chunk: Bytes,
        total: u64,
    ) -> Result<ChunkOutcome, TransferError>;
}

/// [`UploadTransport`] against the real `videos.insert` endpoint.
#[derive(Debug, Clone)]
pub struct ResumableTransport {
    http: reqwest::Client,
    upload_base: String,
}

impl ResumableTransport {
    pub fn new(upload_base: impl Into<String>) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            // 308 means "resume incomplete" here, not a redirect
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build upload HTTP client")?;
        Ok(Self {
            http,
            upload_base: upload_base.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &Config) -> eyre::Result<Self> {
        Self::new(&config.upload_base)
    }
}

async fn status_error(response: reqwest::Response) -> TransferError {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());
    TransferError::Status { status, body }
}

/// Parses `Range: bytes=0-1234` into the offset of the next byte to send.
fn next_offset(range: Option<&str>) -> Option<u64> {
    let (_, last) = range?.trim().strip_prefix("bytes=")?.split_once('-')?;
    last.trim().parse::<u64>().ok()?.checked_add(1)
}

fn content_range(offset: u64, len: usize, total: u64) -> String {
    if len == 0 {
        format!("bytes */{total}")
    } else {
        format!("bytes {offset}-{}/{total}", offset + len as u64 - 1)
    }
}

#[async_trait]
impl UploadTransport for ResumableTransport {
    #[tracing::instrument(skip(self, credential, insert))]
    async fn open_session(
        &self,
        credential: &CredentialHandle,
        insert: &VideoInsert,
        total: u64,
        content_type: &str,
    ) -> Result<String, TransferError> {
        let bearer = credential.bearer(&self.http).await?;
        let response = self
            .http
            .post(format!("{}/videos", self.upload_base))
            .query(&[("uploadType", "resumable"), ("part", "snippet,status")])
            .bearer_auth(bearer)
            .header("X-Upload-Content-Type", content_type)
            .header("X-Upload-Content-Length", total)
            .json(insert)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let session = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(TransferError::Protocol("Location"))?
            .to_string();
        tracing::debug!("opened resumable upload session");
        Ok(session)
    }

    #[tracing::instrument(skip(self, credential, session, chunk), fields(len = chunk.len()))]
    async fn send_chunk(
        &self,
        credential: &CredentialHandle,
        session: &str,
        offset: u64,
        chunk: Bytes,
        total: u64,
    ) -> Result<ChunkOutcome, TransferError> {
        let bearer = credential.bearer(&self.http).await?;
        let response = self
            .http
            .put(session)
            .bearer_auth(bearer)
            .header(CONTENT_LENGTH, chunk.len())
            .header(CONTENT_RANGE, content_range(offset, chunk.len(), total))
            .body(chunk)
            .send()
            .await?;

        let status = response.status();
        if status == RESUME_INCOMPLETE {
            let range = response.headers().get(RANGE).and_then(|v| v.to_str().ok());
            // no Range header means nothing has been persisted yet
            let next_offset = next_offset(range).unwrap_or(0);
            return Ok(ChunkOutcome::Incomplete { next_offset });
        }
        if !status.is_success() {
            return Err(status_error(response).await);
        }
        let video: Video = response.json().await?;
        Ok(ChunkOutcome::Complete(video))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StoredToken;
    use crate::config::PrivacyStatus;
    use crate::metadata::PublishMetadata;
    use mockito::Matcher;
    use pretty_assertions::assert_eq;

    fn credential() -> CredentialHandle {
        CredentialHandle::Delegated(StoredToken {
            token: "upload-token".into(),
            refresh_token: None,
            token_uri: crate::auth::GOOGLE_TOKEN_URI.into(),
            client_id: None,
            client_secret: None,
            scopes: Vec::new(),
            expiry: None,
        })
    }

    #[test]
    fn range_parsing() {
        assert_eq!(next_offset(Some("bytes=0-4")), Some(5));
        assert_eq!(next_offset(Some("bytes=0-262143")), Some(262_144));
        assert_eq!(next_offset(Some("0-4")), None);
        assert_eq!(next_offset(None), None);
        assert_eq!(content_range(5, 5, 10), "bytes 5-9/10");
        assert_eq!(content_range(0, 0, 0), "bytes */0");
    }

    #[tokio::test]
    async fn session_then_two_chunks() {
        let mut server = mockito::Server::new_async().await;
        let session_url = format!("{}/session/abc", server.url());
        let open = server
            .mock("POST", "/videos")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("uploadType".into(), "resumable".into()),
                Matcher::UrlEncoded("part".into(), "snippet,status".into()),
            ]))
            .match_header("authorization", "Bearer upload-token")
            .match_header("x-upload-content-type", "video/mp4")
            .match_header("x-upload-content-length", "10")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "snippet": {"title": "Clip"},
                "status": {"privacyStatus": "unlisted"},
            })))
            .with_status(200)
            .with_header("location", &session_url)
            .create_async()
            .await;
        let first = server
            .mock("PUT", "/session/abc")
            .match_header("content-range", "bytes 0-4/10")
            .with_status(308)
            .with_header("range", "bytes=0-4")
            .create_async()
            .await;
        let second = server
            .mock("PUT", "/session/abc")
            .match_header("content-range", "bytes 5-9/10")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"kind":"youtube#video","id":"dQw4w9WgXcQ"}"#)
            .create_async()
            .await;

        let transport = ResumableTransport::new(server.url()).unwrap();
        let insert = VideoInsert::from_metadata(
            &PublishMetadata::new("Clip", "", Vec::<String>::new()),
            PrivacyStatus::Unlisted,
        );
        let credential = credential();

        let session = transport
            .open_session(&credential, &insert, 10, "video/mp4")
            .await
            .unwrap();
        assert_eq!(session, session_url);

        let outcome = transport
            .send_chunk(&credential, &session, 0, Bytes::from_static(b"01234"), 10)
            .await
            .unwrap();
        assert_eq!(outcome, ChunkOutcome::Incomplete { next_offset: 5 });

        let outcome = transport
            .send_chunk(&credential, &session, 5, Bytes::from_static(b"56789"), 10)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ChunkOutcome::Complete(Video {
                id: Some("dQw4w9WgXcQ".into())
            })
        );

        open.assert_async().await;
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn errors_keep_status_and_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/videos")
            .match_query(Matcher::Any)
            .with_status(403)
            .with_body("quotaExceeded")
            .create_async()
            .await;
        let transport = ResumableTransport::new(server.url()).unwrap();
        let insert = VideoInsert::from_metadata(
            &PublishMetadata::new("Clip", "", Vec::<String>::new()),
            PrivacyStatus::Private,
        );
        let err = transport
            .open_session(&credential(), &insert, 10, "video/*")
            .await
            .unwrap_err();
        match err {
            TransferError::Status { status, body } => {
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert_eq!(body, "quotaExceeded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_location_is_a_protocol_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/videos")
            .match_query(Matcher::Any)
            .with_status(200)
            .create_async()
            .await;
        let transport = ResumableTransport::new(server.url()).unwrap();
        let insert = VideoInsert::from_metadata(
            &PublishMetadata::new("Clip", "", Vec::<String>::new()),
            PrivacyStatus::Private,
        );
        let err = transport
            .open_session(&credential(), &insert, 10, "video/*")
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Protocol("Location")));
    }
}
