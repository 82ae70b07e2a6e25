//! Thin client for the parts of the YouTube Data API v3 the publisher needs.
//!
//! Only two resource families are touched:
//!
//! - [`channels`] for the cheap authenticated probe and for channel diagnostics.
//! - [`videos`] for the metadata envelope sent when opening a resumable upload, and the
//!   resource returned once the upload completes.
//!
//! The upload transfer itself lives in [`crate::upload`] since it speaks the resumable upload
//! protocol rather than plain JSON requests.

pub mod channels;
pub mod client;
pub mod videos;

pub use channels::{Channel, ChannelSnippet, ChannelStatistics};
pub use client::{ApiError, YouTubeClient};
pub use videos::{Video, VideoInsert, VideoInsertSnippet, VideoInsertStatus};
