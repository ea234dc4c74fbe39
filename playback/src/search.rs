//! Resolution of free-text queries and URLs into canonical tracks.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use cadenzalib::ids::UserId;
use cadenzalib::track::{Track, TrackId, TrackService};

use crate::error::{Error, Result};
use crate::store::TrackStore;

const VIDEO_PREFIX: &str = "https://youtube.com/watch?v=";
const CHANNEL_PREFIX: &str = "https://youtube.com/channel/";
const VIDEO_KIND: &str = "youtube#video";
const MAX_RESULTS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub text: String,
    pub user: UserId,
    pub service: TrackService,
}

/// One result row from the external video-search API.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VideoItem {
    pub kind: String,
    pub video_id: String,
    pub title: String,
    pub channel_title: String,
    pub channel_id: String,
    pub thumbnails: ThumbnailSet,
}

/// Thumbnail variants by resolution, any of which may be missing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ThumbnailSet {
    pub maxres: Option<String>,
    pub high: Option<String>,
    pub medium: Option<String>,
    pub standard: Option<String>,
    pub default: Option<String>,
}

impl ThumbnailSet {
    /// Largest available variant, for the artwork slot.
    fn artwork(&self) -> String {
        [
            &self.maxres,
            &self.high,
            &self.medium,
            &self.standard,
            &self.default,
        ]
        .into_iter()
        .find_map(|v| v.clone())
        .unwrap_or_default()
    }

    fn thumbnail(&self) -> String {
        [&self.standard, &self.default]
            .into_iter()
            .find_map(|v| v.clone())
            .unwrap_or_default()
    }
}

/// Contract of the external video-search API.
#[async_trait]
pub trait VideoSearch: Send + Sync {
    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<VideoItem>>;
}

pub struct Searcher {
    api: Arc<dyn VideoSearch>,
    store: Arc<TrackStore>,
}

impl Searcher {
    #[must_use]
    pub fn new(api: Arc<dyn VideoSearch>, store: Arc<TrackStore>) -> Self {
        Self { api, store }
    }

    /// Resolve `request` into a canonical track, store-first.
    pub async fn search(&self, request: &SearchRequest) -> Result<Track> {
        match request.service {
            TrackService::Youtube => self.search_youtube(request).await,
            TrackService::Vk => Err(Error::ServiceUnknown),
        }
    }

    async fn search_youtube(&self, request: &SearchRequest) -> Result<Track> {
        let extracted = extract_youtube_id(&request.text);
        if !extracted.is_empty() {
            let id = TrackId::new(TrackService::Youtube, &extracted);
            match self.store.get(&id).await {
                Ok(mut track) => {
                    track.playbacks += 1;
                    track.last_play = Utc::now();
                    self.store.set(request.user, &track).await?;
                    return Ok(track);
                }
                Err(Error::NotFound) => {} // fall through to the API
                Err(err) => return Err(err),
            }
        }

        let items = self.api.search(&request.text, MAX_RESULTS).await?;
        let item = items
            .iter()
            .find(|item| item.kind == VIDEO_KIND)
            .ok_or(Error::SongNotFound)?;

        let mut track = Track {
            id: TrackId::new(TrackService::Youtube, &item.video_id),
            title: item.title.clone(),
            last_play: Utc::now(),
            playbacks: 1,
            url: format!("{VIDEO_PREFIX}{}", item.video_id),
            service: TrackService::Youtube,
            artist: item.channel_title.clone(),
            artist_url: format!("{CHANNEL_PREFIX}{}", item.channel_id),
            artwork_url: item.thumbnails.artwork(),
            thumbnail_url: item.thumbnails.thumbnail(),
            file_path: None,
        };

        // carry the play count over from any prior row for the same key
        if let Ok(previous) = self.store.get(&track.id).await {
            track.playbacks = previous.playbacks + 1;
        }

        self.store.set(request.user, &track).await?;
        Ok(track)
    }

    /// A random well-played track from the store, for radio mode.
    pub fn radio(&self, min_playbacks: i64) -> Result<Track> {
        self.store.get_any(min_playbacks).ok_or(Error::SongNotFound)
    }
}

/// Extract a YouTube video id from a URL-ish string.
///
/// Strips the known URL prefixes in order, cuts at the first separator and
/// accepts the rest only if it looks like a video id. Returns an empty
/// string otherwise.
#[must_use]
pub fn extract_youtube_id(url: &str) -> String {
    const PREFIXES: &[&str] = &[
        "https:",
        "http:",
        "//",
        "www.",
        "m.",
        "music.",
        "youtu.be/",
        "youtube.com/",
        "youtube-nocookie.com/",
        "embed/",
        "shorts/",
        "v/",
        "live/",
        "watch?",
        "v=",
        "e/",
        "feature=player_embedded&v=",
        "app=desktop&v=",
        "attribution_link?a=",
    ];

    let mut rest = url;
    for prefix in PREFIXES {
        rest = rest.strip_prefix(prefix).unwrap_or(rest);
    }

    let rest = rest
        .split(['?', '&', '#', '\n'])
        .next()
        .unwrap_or_default();

    let valid = !rest.is_empty()
        && rest
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid {
        rest.to_owned()
    } else {
        String::new()
    }
}
