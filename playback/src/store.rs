//! Cache-through track store.
//!
//! The persistent side lives behind [`TrackStorage`] (the external content
//! store; Firestore in the original deployment). Reads go through an
//! in-memory cache which is also the sampling pool for radio mode, so radio
//! never waits on the network.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;

use cadenzalib::ids::UserId;
use cadenzalib::track::{Track, TrackId};

use crate::error::{Error, Result};
use crate::playlist::RadioSource;

/// Contract of the external content store.
///
/// `get` must fail with [`Error::NotFound`] on a missing key.
#[async_trait]
pub trait TrackStorage: Send + Sync {
    async fn get(&self, id: &TrackId) -> Result<Track>;
    async fn set(&self, user: UserId, track: &Track) -> Result<()>;
    async fn all(&self) -> Result<Vec<Track>>;
}

#[derive(Default)]
struct TrackCache {
    tracks: RwLock<HashMap<TrackId, Track>>,
}

impl TrackCache {
    fn get(&self, id: &TrackId) -> Option<Track> {
        self.tracks.read().get(id).cloned()
    }

    fn set(&self, track: &Track) {
        self.tracks
            .write()
            .insert(track.id.clone(), track.clone());
    }

    /// A uniformly random cached track with at least `min_playbacks` plays.
    fn get_any(&self, min_playbacks: i64) -> Option<Track> {
        let tracks = self.tracks.read();
        let eligible: Vec<&Track> = tracks
            .values()
            .filter(|track| track.playbacks >= min_playbacks)
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let index = rand::thread_rng().gen_range(0..eligible.len());
        Some(eligible[index].clone())
    }
}

pub struct TrackStore {
    storage: Arc<dyn TrackStorage>,
    cache: TrackCache,
}

impl TrackStore {
    #[must_use]
    pub fn new(storage: Arc<dyn TrackStorage>) -> Self {
        Self {
            storage,
            cache: TrackCache::default(),
        }
    }

    /// Cache hit, or storage fetch that backfills the cache.
    pub async fn get(&self, id: &TrackId) -> Result<Track> {
        if let Some(track) = self.cache.get(id) {
            return Ok(track);
        }

        let track = self.storage.get(id).await?;
        self.cache.set(&track);
        Ok(track)
    }

    /// Upsert into storage first, then the cache.
    pub async fn set(&self, user: UserId, track: &Track) -> Result<()> {
        self.storage.set(user, track).await?;
        self.cache.set(track);
        Ok(())
    }

    #[must_use]
    pub fn get_any(&self, min_playbacks: i64) -> Option<Track> {
        self.cache.get_any(min_playbacks)
    }

    /// Warm the cache with everything the storage holds.
    pub async fn fill_cache(&self) -> Result<()> {
        for track in self.storage.all().await? {
            self.cache.set(&track);
        }
        Ok(())
    }
}

impl RadioSource for TrackStore {
    fn random_track(&self, min_playbacks: i64) -> Option<Track> {
        self.get_any(min_playbacks)
    }
}

/// Storage kept entirely in memory.
///
/// The default backing for deployments without a configured content store;
/// also what the tests run against.
#[derive(Default)]
pub struct MemoryStorage {
    tracks: RwLock<HashMap<TrackId, Track>>,
}

#[async_trait]
impl TrackStorage for MemoryStorage {
    async fn get(&self, id: &TrackId) -> Result<Track> {
        self.tracks.read().get(id).cloned().ok_or(Error::NotFound)
    }

    async fn set(&self, _user: UserId, track: &Track) -> Result<()> {
        self.tracks
            .write()
            .insert(track.id.clone(), track.clone());
        Ok(())
    }

    async fn all(&self) -> Result<Vec<Track>> {
        Ok(self.tracks.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use cadenzalib::track::TrackService;

    use super::*;

    fn track(id: &str, playbacks: i64) -> Track {
        Track {
            id: TrackId::new(TrackService::Youtube, id),
            title: id.to_owned(),
            playbacks,
            ..Track::default()
        }
    }

    #[tokio::test]
    async fn get_backfills_the_cache_from_storage() {
        let storage = Arc::new(MemoryStorage::default());
        storage
            .set(UserId::ANONYMOUS, &track("abc", 5))
            .await
            .unwrap();
        let store = TrackStore::new(storage);

        let fetched = store
            .get(&TrackId::new(TrackService::Youtube, "abc"))
            .await
            .unwrap();
        assert_eq!(fetched.playbacks, 5);

        // now sampled from the cache without touching storage again
        assert!(store.get_any(3).is_some());
    }

    #[tokio::test]
    async fn miss_is_not_found() {
        let store = TrackStore::new(Arc::new(MemoryStorage::default()));
        let err = store
            .get(&TrackId::new(TrackService::Youtube, "nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[tokio::test]
    async fn get_any_honors_the_playback_floor() {
        let store = TrackStore::new(Arc::new(MemoryStorage::default()));
        store
            .set(UserId(1), &track("cold", 1))
            .await
            .unwrap();
        store
            .set(UserId(1), &track("popular", 7))
            .await
            .unwrap();

        for _ in 0..16 {
            let sampled = store.get_any(3).unwrap();
            assert_eq!(sampled.title, "popular");
        }
        assert_eq!(store.get_any(100), None);
    }

    #[tokio::test]
    async fn fill_cache_makes_storage_rows_sampleable() {
        let storage = Arc::new(MemoryStorage::default());
        storage
            .set(UserId::ANONYMOUS, &track("warm", 9))
            .await
            .unwrap();

        let store = TrackStore::new(storage);
        assert_eq!(store.get_any(1), None);
        store.fill_cache().await.unwrap();
        assert_eq!(store.get_any(1).unwrap().title, "warm");
    }
}
