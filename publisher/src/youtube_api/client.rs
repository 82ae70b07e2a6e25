//! Authenticated calls to the YouTube Data API.

use crate::auth::CredentialHandle;
use crate::config::Config;
use crate::youtube_api::channels::{Channel, ChannelListResponse};
use eyre::Context;
use http::Method;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::instrument;

/// Why an API call didn't succeed.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The credential was rejected (HTTP 401).
    #[error("YouTube API rejected the credential: {0}")]
    Unauthorized(String),
    #[error("YouTube API request failed with status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("send request to YouTube API")]
    Transport(#[from] reqwest::Error),
    /// No access token could be obtained for the credential.
    #[error("obtain access token: {0}")]
    Token(String),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_))
    }

    /// Turns a non-success response into an error, keeping the body for diagnostics.
    pub(crate) async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        if status == StatusCode::UNAUTHORIZED {
            ApiError::Unauthorized(body)
        } else {
            ApiError::Status { status, body }
        }
    }
}

/// Client for the parts of the YouTube Data API v3 the publisher reads.
///
/// The client holds no credential of its own; every call takes the [`CredentialHandle`] to act
/// with, so that a handle replaced after a 401 is picked up by the next call.
#[derive(Debug, Clone)]
pub struct YouTubeClient {
    http: reqwest::Client,
    api_base: String,
}

impl YouTubeClient {
    pub fn new(http: reqwest::Client, api_base: impl Into<String>) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &Config) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build YouTube API HTTP client")?;
        Ok(Self::new(http, &config.api_base))
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    /// Makes an authenticated request against the API with common error handling.
    ///
    /// `path` is relative to the API base (e.g. `/channels`). Non-success statuses are turned
    /// into [`ApiError`]s, with 401 singled out as [`ApiError::Unauthorized`].
    #[instrument(skip(self, credential, json_body), level = tracing::Level::TRACE)]
    pub(crate) async fn make_authenticated_request(
        &self,
        credential: &CredentialHandle,
        method: Method,
        path: &str,
        query_params: Option<&[(&str, &str)]>,
        json_body: Option<&impl Serialize>,
    ) -> Result<reqwest::Response, ApiError> {
        let access_token = credential.bearer(&self.http).await?;
        let url = format!("{}{path}", self.api_base);

        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(access_token);
        if let Some(params) = query_params {
            request = request.query(params);
        }
        if let Some(body) = json_body {
            request = request.json(body);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ApiError::from_response(response).await);
        }
        Ok(response)
    }

    async fn list_my_channels(
        &self,
        credential: &CredentialHandle,
        part: &str,
    ) -> Result<ChannelListResponse, ApiError> {
        let query_params = [("part", part), ("mine", "true"), ("maxResults", "1")];
        let response = self
            .make_authenticated_request(
                credential,
                Method::GET,
                "/channels",
                Some(&query_params),
                None::<&()>,
            )
            .await?;
        let channels: ChannelListResponse = response.json().await?;
        tracing::debug!(
            total_results = channels.page_info.total_results,
            returned_items = channels.items.len(),
            "fetched channels"
        );
        Ok(channels)
    }

    /// Makes the cheapest authenticated call available to check that `credential` works.
    ///
    /// A successful response counts even if it lists no channel, which is what service accounts
    /// get back.
    #[instrument(skip_all)]
    pub async fn probe(&self, credential: &CredentialHandle) -> Result<(), ApiError> {
        self.list_my_channels(credential, "snippet").await?;
        tracing::debug!("YouTube API credential probe successful");
        Ok(())
    }

    /// The channel owned by the authenticated principal, if it has one.
    ///
    /// See: <https://developers.google.com/youtube/v3/docs/channels/list>
    #[instrument(skip_all)]
    pub async fn channel_info(
        &self,
        credential: &CredentialHandle,
    ) -> Result<Option<Channel>, ApiError> {
        let channels = self
            .list_my_channels(credential, "snippet,statistics")
            .await?;
        Ok(channels.items.into_iter().next())
    }
}
