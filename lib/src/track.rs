use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The origin service of a track.
///
/// `Vk` is reserved: it exists on the wire and in storage, but every
/// download/search path rejects it as unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackService {
    #[default]
    Youtube,
    Vk,
}

impl TrackService {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Youtube => "youtube",
            Self::Vk => "vk",
        }
    }
}

impl fmt::Display for TrackService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical track key, `<service>_<externalID>`.
///
/// The flattened form is what storage documents, the download cache and the
/// wire all key on, so it must survive every round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(String);

impl TrackId {
    #[must_use]
    pub fn new(service: TrackService, external_id: &str) -> Self {
        Self(format!("{}_{}", service.as_str(), external_id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The external id part of the key (everything after the service tag).
    #[must_use]
    pub fn external_id(&self) -> &str {
        self.0
            .split_once('_')
            .map_or(self.0.as_str(), |(_, id)| id)
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TrackId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Canonical metadata for a playable item.
///
/// Created by the searcher, owned by the playlist while queued and
/// referenced by the engine while playing. `file_path` is transient: it is
/// assigned once the downloader has materialized the media and never stored.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub last_play: DateTime<Utc>,
    #[serde(default)]
    pub playbacks: i64,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub service: TrackService,
    #[serde(default, rename = "artist_name")]
    pub artist: String,
    #[serde(default)]
    pub artist_url: String,
    #[serde(default)]
    pub artwork_url: String,
    #[serde(default)]
    pub thumbnail_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn track_key_is_service_underscore_id() {
        let id = TrackId::new(TrackService::Youtube, "dQw4w9WgXcQ");
        assert_eq!(id.as_str(), "youtube_dQw4w9WgXcQ");
        assert_eq!(id.external_id(), "dQw4w9WgXcQ");
    }

    #[test]
    fn track_key_survives_serde_round_trip() {
        let track = Track {
            id: TrackId::new(TrackService::Youtube, "abc"),
            title: "A Song".into(),
            playbacks: 4,
            url: "https://youtube.com/watch?v=abc".into(),
            artist: "A Channel".into(),
            ..Track::default()
        };

        let json = serde_json::to_string(&track).unwrap();
        let back: Track = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, track.id);
        assert_eq!(back, track);
    }

    #[test]
    fn wire_field_names_match_the_store_schema() {
        let track = Track {
            id: TrackId::new(TrackService::Youtube, "abc"),
            artist: "someone".into(),
            ..Track::default()
        };
        let value = serde_json::to_value(&track).unwrap();
        assert_eq!(value["id"], "youtube_abc");
        assert_eq!(value["artist_name"], "someone");
        assert_eq!(value["service"], "youtube");
        assert!(value.get("file_path").is_none());
    }
}
