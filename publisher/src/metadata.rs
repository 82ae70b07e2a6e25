//! Publish metadata and the normalization rules applied to it.

use crate::config::PrivacyStatus;
use std::collections::HashSet;

/// YouTube rejects titles longer than this (in characters).
pub const MAX_TITLE_CHARS: usize = 100;
/// YouTube rejects descriptions longer than this (in characters).
pub const MAX_DESCRIPTION_CHARS: usize = 5000;
/// Upper bound on the number of tags sent with an upload.
pub const MAX_TAGS: usize = 500;
/// Upper bound on the number of tags derived from a remote source.
pub const MAX_REMOTE_TAGS: usize = 20;
/// How many of the source's own tags are carried over.
pub const MAX_SOURCE_TAGS: usize = 10;
/// "People & Blogs".
pub const DEFAULT_CATEGORY_ID: &str = "22";

/// Title, description, tags and visibility of a video about to be published.
///
/// Limits are enforced on construction, so a value of this type is always acceptable to the
/// platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishMetadata {
    title: String,
    description: String,
    tags: Vec<String>,
    category_id: String,
    privacy: Option<PrivacyStatus>,
}

impl PublishMetadata {
    pub fn new<T>(
        title: impl AsRef<str>,
        description: impl AsRef<str>,
        tags: impl IntoIterator<Item = T>,
    ) -> Self
    where
        T: AsRef<str>,
    {
        Self {
            title: truncate_chars(title.as_ref(), MAX_TITLE_CHARS).to_string(),
            description: truncate_chars(description.as_ref(), MAX_DESCRIPTION_CHARS).to_string(),
            tags: normalize_tags(tags, MAX_TAGS),
            category_id: DEFAULT_CATEGORY_ID.to_string(),
            privacy: None,
        }
    }

    pub fn with_category(mut self, category_id: impl Into<String>) -> Self {
        self.category_id = category_id.into();
        self
    }

    /// Overrides the configured default visibility for this video only.
    pub fn with_privacy(mut self, privacy: PrivacyStatus) -> Self {
        self.privacy = Some(privacy);
        self
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn category_id(&self) -> &str {
        &self.category_id
    }

    pub fn privacy(&self) -> Option<PrivacyStatus> {
        self.privacy
    }
}

/// Returns at most the first `max` characters of `s`, never splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Trims tags, drops empty ones and removes exact duplicates, keeping first-seen order.
///
/// Deduplication is case-sensitive: `"a"` and `"A"` are distinct tags.
pub fn normalize_tags<T>(tags: impl IntoIterator<Item = T>, cap: usize) -> Vec<String>
where
    T: AsRef<str>,
{
    let mut seen = HashSet::new();
    tags.into_iter()
        .filter_map(|tag| {
            let tag = tag.as_ref().trim();
            (!tag.is_empty() && seen.insert(tag.to_string())).then(|| tag.to_string())
        })
        .take(cap)
        .collect()
}

/// Names the hosting platform of a source URL, if it is a well-known one.
pub fn platform_tag(source: &str) -> Option<&'static str> {
    const PLATFORMS: &[(&[&str], &str)] = &[
        (&["youtube.com", "youtu.be"], "YouTube"),
        (&["vimeo.com"], "Vimeo"),
        (&["tiktok.com"], "TikTok"),
        (&["instagram.com"], "Instagram"),
        (&["facebook.com", "fb.watch"], "Facebook"),
        (&["twitter.com", "x.com"], "Twitter"),
    ];

    let host = url::Url::parse(source)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase));
    let matches = |needle: &str| match &host {
        Some(host) => host == needle || host.ends_with(&format!(".{needle}")),
        None => source.to_ascii_lowercase().contains(needle),
    };

    PLATFORMS
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| matches(n)))
        .map(|(_, tag)| *tag)
}

/// Turns an arbitrary title into something safe to use as a file name stem.
///
/// Filesystem-unsafe characters are replaced, anything that is not a word character,
/// whitespace or `-` is dropped, and runs of whitespace and dashes collapse into a single `-`.
pub fn sanitize_filename(title: &str) -> String {
    const MAX_STEM_CHARS: usize = 100;

    let replaced = title.chars().map(|c| match c {
        '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
        c => c,
    });

    let mut out = String::with_capacity(title.len());
    let mut pending_dash = false;
    for c in replaced {
        if c.is_whitespace() || c == '-' {
            pending_dash = true;
        } else if c.is_alphanumeric() || c == '_' {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        }
    }

    let stem = truncate_chars(&out, MAX_STEM_CHARS).trim_matches(|c| c == '-' || c == '_');
    if stem.is_empty() {
        "video".to_string()
    } else {
        stem.to_string()
    }
}
