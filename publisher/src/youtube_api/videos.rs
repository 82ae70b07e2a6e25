//! YouTube Videos API types used by `videos.insert`.

use crate::config::PrivacyStatus;
use crate::metadata::PublishMetadata;
use serde::{Deserialize, Serialize};

/// The JSON envelope sent when opening a resumable `videos.insert` session.
///
/// See: <https://developers.google.com/youtube/v3/docs/videos/insert>
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VideoInsert {
    pub snippet: VideoInsertSnippet,
    pub status: VideoInsertStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInsertSnippet {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub category_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInsertStatus {
    pub privacy_status: PrivacyStatus,
    pub self_declared_made_for_kids: bool,
}

impl VideoInsert {
    /// Builds the envelope, using `default_privacy` unless the metadata overrides it.
    pub fn from_metadata(metadata: &PublishMetadata, default_privacy: PrivacyStatus) -> Self {
        Self {
            snippet: VideoInsertSnippet {
                title: metadata.title().to_string(),
                description: metadata.description().to_string(),
                tags: metadata.tags().to_vec(),
                category_id: metadata.category_id().to_string(),
            },
            status: VideoInsertStatus {
                privacy_status: metadata.privacy().unwrap_or(default_privacy),
                self_declared_made_for_kids: false,
            },
        }
    }
}

/// A `video` resource as returned by a completed upload.
///
/// Everything but the id is ignored; an upload response without an id is treated as a failure
/// by the upload engine.
///
/// See: <https://developers.google.com/youtube/v3/docs/videos#resource>
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Video {
    /// The ID that YouTube uses to uniquely identify the video.
    pub id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn envelope_shape() {
        let metadata = PublishMetadata::new("Title", "Body", ["one", "two"]);
        let insert = VideoInsert::from_metadata(&metadata, PrivacyStatus::Unlisted);
        assert_eq!(
            serde_json::to_value(&insert).unwrap(),
            serde_json::json!({
                "snippet": {
                    "title": "Title",
                    "description": "Body",
                    "tags": ["one", "two"],
                    "categoryId": "22",
                },
                "status": {
                    "privacyStatus": "unlisted",
                    "selfDeclaredMadeForKids": false,
                },
            })
        );
    }

    #[test]
    fn metadata_privacy_overrides_default() {
        let metadata = PublishMetadata::new("t", "d", Vec::<String>::new())
            .with_privacy(PrivacyStatus::Private);
        let insert = VideoInsert::from_metadata(&metadata, PrivacyStatus::Public);
        assert_eq!(insert.status.privacy_status, PrivacyStatus::Private);
    }

    #[test]
    fn upload_response_without_id() {
        let video: Video = serde_json::from_str(r#"{"kind":"youtube#video"}"#).unwrap();
        assert_eq!(video.id, None);
    }
}
