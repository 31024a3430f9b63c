use serde::{Deserialize, Serialize};

pub type TrackId = String;

/// One record on the shelf, as delivered by the content layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: TrackId,
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub cover_image: Option<String>,
}

impl Track {
    pub fn new(id: impl Into<String>, title: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            artist: artist.into(),
            cover_image: None,
        }
    }
}

/// Catalog lookup response body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewLookupResponse {
    #[serde(default)]
    pub preview_url: Option<String>,
}

impl PreviewLookupResponse {
    /// The playable URL, treating an empty string as no match.
    pub fn into_url(self) -> Option<String> {
        self.preview_url.filter(|url| !url.trim().is_empty())
    }
}

/// Per-session resolution result. Never persisted; URLs expire upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResolution {
    pub url: Option<String>,
    pub attempt: u32,
}
