//! The pending-track queue and its playback modes.

use std::sync::Arc;

use parking_lot::RwLock;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};

use cadenzalib::track::Track;

/// Radio only samples tracks that have been played at least this often.
pub const MIN_RADIO_PLAYBACKS: i64 = 3;

/// Where radio mode gets its fallback tracks from when the queue is empty.
pub trait RadioSource: Send + Sync {
    fn random_track(&self, min_playbacks: i64) -> Option<Track>;
}

/// Explicit on/off plus flip, for the mode commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    On,
    Off,
    Flip,
}

impl Toggle {
    #[must_use]
    pub fn apply(self, current: bool) -> bool {
        match self {
            Self::On => true,
            Self::Off => false,
            Self::Flip => !current,
        }
    }
}

/// Snapshot of the three independent mode booleans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Modes {
    #[serde(rename = "loop")]
    pub looped: bool,
    pub radio: bool,
    pub shuffle: bool,
}

pub type SharedPlaylist = Arc<RwLock<Playlist>>;

/// The ordered queue of pending tracks.
///
/// Head selection applies exactly one mode policy per call: loop wins on a
/// non-empty queue, then shuffle, and radio only refills an empty queue.
pub struct Playlist {
    tracks: Vec<Track>,
    looped: bool,
    radio: bool,
    shuffle: bool,
    radio_source: Option<Arc<dyn RadioSource>>,
}

impl Playlist {
    #[must_use]
    pub fn new(radio_source: Option<Arc<dyn RadioSource>>) -> Self {
        Self {
            tracks: Vec::with_capacity(25),
            looped: false,
            radio: false,
            shuffle: false,
            radio_source,
        }
    }

    #[must_use]
    pub fn new_shared(radio_source: Option<Arc<dyn RadioSource>>) -> SharedPlaylist {
        Arc::new(RwLock::new(Self::new(radio_source)))
    }

    /// Append to the tail.
    pub fn add(&mut self, track: Track) {
        self.tracks.push(track);
    }

    /// Choose and return the track at the head, without removing it.
    ///
    /// Under shuffle this promotes a uniformly-random element to the front,
    /// preserving the relative order of the rest. With an empty queue and
    /// radio on, a fallback track is pulled from the radio source and
    /// appended first.
    pub fn head(&mut self) -> Option<Track> {
        if !self.tracks.is_empty() {
            if self.looped {
                return self.tracks.first().cloned();
            }
            if self.shuffle && self.tracks.len() > 1 {
                let index = thread_rng().gen_range(0..self.tracks.len());
                let track = self.tracks.remove(index);
                self.tracks.insert(0, track);
            }
            return self.tracks.first().cloned();
        }

        if self.radio {
            if let Some(track) = self
                .radio_source
                .as_ref()
                .and_then(|source| source.random_track(MIN_RADIO_PLAYBACKS))
            {
                self.tracks.push(track);
                return self.tracks.first().cloned();
            }
        }

        None
    }

    /// Pop the head. Without `force` this is a no-op while loop is on.
    pub fn remove(&mut self, force: bool) {
        if !force && self.looped {
            return;
        }
        if !self.tracks.is_empty() {
            self.tracks.remove(0);
        }
    }

    #[must_use]
    pub fn current(&self) -> Option<&Track> {
        self.tracks.first()
    }

    /// Record the local file the head track was materialized into.
    pub fn assign_head_file(&mut self, path: std::path::PathBuf) {
        if let Some(track) = self.tracks.first_mut() {
            track.file_path = Some(path);
        }
    }

    /// Snapshot of the whole queue.
    #[must_use]
    pub fn queue(&self) -> Vec<Track> {
        self.tracks.clone()
    }

    #[must_use]
    pub fn modes(&self) -> Modes {
        Modes {
            looped: self.looped,
            radio: self.radio,
            shuffle: self.shuffle,
        }
    }

    pub fn set_loop(&mut self, toggle: Toggle) -> bool {
        self.looped = toggle.apply(self.looped);
        self.looped
    }

    pub fn set_radio(&mut self, toggle: Toggle) -> bool {
        self.radio = toggle.apply(self.radio);
        self.radio
    }

    pub fn set_shuffle(&mut self, toggle: Toggle) -> bool {
        self.shuffle = toggle.apply(self.shuffle);
        self.shuffle
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use cadenzalib::track::{TrackId, TrackService};

    use super::*;

    fn track(id: &str) -> Track {
        Track {
            id: TrackId::new(TrackService::Youtube, id),
            title: id.to_owned(),
            ..Track::default()
        }
    }

    fn playlist_with(ids: &[&str]) -> Playlist {
        let mut playlist = Playlist::new(None);
        for id in ids {
            playlist.add(track(id));
        }
        playlist
    }

    #[test]
    fn add_appends_and_head_does_not_remove() {
        let mut playlist = playlist_with(&["a", "b"]);
        assert_eq!(playlist.head().unwrap().title, "a");
        assert_eq!(playlist.head().unwrap().title, "a");
        assert_eq!(playlist.len(), 2);

        playlist.add(track("c"));
        let titles: Vec<String> = playlist.queue().into_iter().map(|t| t.title).collect();
        assert_eq!(titles, ["a", "b", "c"]);
    }

    #[test]
    fn loop_makes_head_idempotent_and_remove_a_noop() {
        let mut playlist = playlist_with(&["a", "b"]);
        playlist.set_loop(Toggle::On);

        for _ in 0..3 {
            assert_eq!(playlist.head().unwrap().title, "a");
            playlist.remove(false);
        }
        assert_eq!(playlist.len(), 2);

        // force still removes under loop
        playlist.remove(true);
        assert_eq!(playlist.head().unwrap().title, "b");
    }

    #[test]
    fn remove_pops_the_head_without_loop() {
        let mut playlist = playlist_with(&["a", "b"]);
        playlist.remove(false);
        assert_eq!(playlist.head().unwrap().title, "b");
        playlist.remove(false);
        assert_eq!(playlist.head(), None);
        // removing from an empty queue is fine
        playlist.remove(false);
    }

    #[test]
    fn shuffle_of_a_single_track_is_the_identity() {
        let mut playlist = playlist_with(&["only"]);
        playlist.set_shuffle(Toggle::On);
        for _ in 0..8 {
            assert_eq!(playlist.head().unwrap().title, "only");
        }
        assert_eq!(playlist.len(), 1);
    }

    #[test]
    fn shuffle_promotes_one_element_and_keeps_relative_order() {
        let mut playlist = playlist_with(&["a", "b", "c", "d"]);
        playlist.set_shuffle(Toggle::On);

        let head = playlist.head().unwrap();
        let titles: Vec<String> = playlist.queue().into_iter().map(|t| t.title).collect();
        assert_eq!(titles[0], head.title);
        assert_eq!(titles.len(), 4);

        // the other three stay in their original relative order
        let rest = titles[1..].to_vec();
        let expected: Vec<String> = ["a", "b", "c", "d"]
            .iter()
            .map(|s| (*s).to_owned())
            .filter(|s| *s != head.title)
            .collect();
        assert_eq!(rest, expected);
    }

    #[test]
    fn loop_wins_over_shuffle_on_a_nonempty_queue() {
        let mut playlist = playlist_with(&["a", "b", "c"]);
        playlist.set_loop(Toggle::On);
        playlist.set_shuffle(Toggle::On);

        for _ in 0..8 {
            assert_eq!(playlist.head().unwrap().title, "a");
        }
        let titles: Vec<String> = playlist.queue().into_iter().map(|t| t.title).collect();
        assert_eq!(titles, ["a", "b", "c"]);
    }

    struct OneSong;

    impl RadioSource for OneSong {
        fn random_track(&self, min_playbacks: i64) -> Option<Track> {
            assert_eq!(min_playbacks, MIN_RADIO_PLAYBACKS);
            Some(track("radio-pick"))
        }
    }

    #[test]
    fn radio_refills_an_empty_queue_from_the_source() {
        let mut playlist = Playlist::new(Some(Arc::new(OneSong)));
        assert_eq!(playlist.head(), None);

        playlist.set_radio(Toggle::On);
        let head = playlist.head().unwrap();
        assert_eq!(head.title, "radio-pick");
        // the fallback was appended, not just returned
        assert_eq!(playlist.len(), 1);
    }

    #[test]
    fn radio_does_not_shadow_a_nonempty_queue() {
        let mut playlist = Playlist::new(Some(Arc::new(OneSong)));
        playlist.add(track("queued"));
        playlist.set_radio(Toggle::On);
        assert_eq!(playlist.head().unwrap().title, "queued");
    }

    #[test]
    fn toggles_flip_and_force() {
        let mut playlist = playlist_with(&[]);
        assert!(playlist.set_radio(Toggle::Flip));
        assert!(!playlist.set_radio(Toggle::Flip));
        assert!(playlist.set_radio(Toggle::On));
        assert!(playlist.set_radio(Toggle::On));
        assert!(!playlist.set_radio(Toggle::Off));
        assert_eq!(
            playlist.modes(),
            Modes {
                looped: false,
                radio: false,
                shuffle: false
            }
        );
    }

    #[test]
    fn modes_serialize_with_the_loop_wire_name() {
        let modes = Modes {
            looped: true,
            radio: false,
            shuffle: true,
        };
        let value = serde_json::to_value(modes).unwrap();
        assert_eq!(value["loop"], true);
        assert_eq!(value["shuffle"], true);
    }
}
