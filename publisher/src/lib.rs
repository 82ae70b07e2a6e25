//! Publishing pipeline that takes a video file or a remote video URL and uploads it to YouTube.
//!
//! The pipeline is composed of four pieces that are wired together by [`pipeline::Publisher`]:
//!
//! - [`guard::RequestGuard`] makes sure at most one pipeline runs per requester.
//! - [`acquire::AssetAcquirer`] turns a staged file or a URL into a validated local
//!   [`acquire::MediaAsset`] plus [`metadata::PublishMetadata`].
//! - [`auth::CredentialResolver`] picks between a service account and a user-delegated OAuth
//!   token, refreshing the latter as needed.
//! - [`upload::UploadEngine`] performs the resumable, chunked upload with retry and backoff.
//!
//! Everything that talks to a human (chat front ends, the CLI in `src/bin`) sits outside these
//! modules and only consumes [`pipeline::PipelineEvent`]s and [`pipeline::PipelineOutcome`]s.

pub mod acquire;
pub mod auth;
pub mod config;
pub mod guard;
pub mod metadata;
pub mod pipeline;
pub mod upload;
pub mod youtube_api;

pub use config::{Config, PrivacyStatus};
pub use guard::{RequestGuard, RequesterId};
pub use pipeline::{PipelineEvent, PipelineOutcome, Publisher, Stage};
