#![warn(clippy::all, clippy::correctness)]
#![warn(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::must_use_candidate)]

pub mod audio;
pub mod download;
pub mod error;
pub mod playlist;
pub mod pubsub;
pub mod search;
pub mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use cadenzalib::config::SharedServerSettings;
use cadenzalib::ids::{ChannelId, TraceId};
use cadenzalib::track::Track;

use crate::audio::{AudioService, AudioSession, SessionEvents, SongPosition, VoiceProvider};
use crate::download::{Download, DownloadRequest};
use crate::pubsub::Publisher;

pub use error::Error;
pub use playlist::{Modes, Playlist, SharedPlaylist, Toggle};

#[macro_use]
extern crate log;

/// How long the voice session may sit idle before it is torn down.
pub const AUTO_LEAVE_DURATION: Duration = Duration::from_secs(3 * 60);

pub type PlayerCmdReciever = UnboundedReceiver<PlayerCmd>;
pub type PlayerCmdSender = UnboundedSender<PlayerCmd>;

/// The closed set of commands the engine consumes, strictly one at a time.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCmd {
    Play {
        voice_channel: Option<ChannelId>,
        trace: TraceId,
    },
    Skip {
        voice_channel: Option<ChannelId>,
        trace: TraceId,
    },
    Disconnect {
        voice_channel: Option<ChannelId>,
        trace: TraceId,
    },
    DeleteSong {
        path: PathBuf,
    },
    SendState,
    DisconnectIdle,
    Loop(Toggle),
    Radio(Toggle),
    Shuffle(Toggle),
    Quit,
}

/// Consistent snapshot published on every state tick.
#[derive(Debug, Clone, PartialEq)]
pub struct StateEvent {
    /// Queue head at snapshot time, if any.
    pub current: Option<Track>,
    pub position: Duration,
    pub length: Duration,
    pub modes: Modes,
    pub queue: Vec<Track>,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub message: String,
    pub trace: TraceId,
}

/// The engine's two event topics.
#[derive(Default)]
pub struct Events {
    pub states: Publisher<StateEvent>,
    pub errors: Publisher<ErrorEvent>,
}

/// Creates an audio session bound to a voice channel.
///
/// The engine only ever talks to this seam; the production implementation
/// is [`AudioConnector`], tests substitute their own.
#[async_trait]
pub trait VoiceConnector: Send + Sync {
    async fn connect(
        &self,
        channel: ChannelId,
    ) -> anyhow::Result<(Arc<dyn AudioService>, SessionEvents)>;
}

/// Production connector: joins through a [`VoiceProvider`] and runs a real
/// [`AudioSession`] over the connection.
pub struct AudioConnector {
    provider: Arc<dyn VoiceProvider>,
}

impl AudioConnector {
    #[must_use]
    pub fn new(provider: Arc<dyn VoiceProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl VoiceConnector for AudioConnector {
    async fn connect(
        &self,
        channel: ChannelId,
    ) -> anyhow::Result<(Arc<dyn AudioService>, SessionEvents)> {
        let (session, events) = AudioSession::connect(&*self.provider, channel).await?;
        Ok((session as Arc<dyn AudioService>, events))
    }
}

/// Resets the auto-leave deadline; fires `DisconnectIdle` when it elapses.
struct AutoLeave {
    reset_tx: UnboundedSender<()>,
}

impl AutoLeave {
    fn spawn(cmd_tx: PlayerCmdSender) -> Self {
        let (reset_tx, mut reset_rx) = mpsc::unbounded_channel::<()>();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(AUTO_LEAVE_DURATION) => {
                        if cmd_tx.send(PlayerCmd::DisconnectIdle).is_err() {
                            break;
                        }
                    }
                    reset = reset_rx.recv() => {
                        if reset.is_none() {
                            break;
                        }
                        // deadline restarts on the next loop iteration
                    }
                }
            }
        });

        Self { reset_tx }
    }

    fn reset(&self) {
        let _ = self.reset_tx.send(());
    }
}

/// The command engine.
///
/// Single-writer: every mutation of the session handle, the current voice
/// channel and the playlist happens on the thread driving the command loop.
/// Other tasks communicate by injecting commands through a
/// [`PlayerCmdSender`].
pub struct Player {
    pub playlist: SharedPlaylist,
    pub config: SharedServerSettings,
    downloader: Arc<dyn Download>,
    voice: Arc<dyn VoiceConnector>,
    audio: Option<Arc<dyn AudioService>>,
    voice_channel: Option<ChannelId>,
    /// Written by the tick listener, read by `send_state`.
    song_position: Arc<Mutex<SongPosition>>,
    auto_leave: AutoLeave,
    events: Arc<Events>,
    cmd_tx: PlayerCmdSender,
}

impl Player {
    /// Requires a running tokio runtime (spawns the auto-leave task).
    #[must_use]
    pub fn new(
        config: SharedServerSettings,
        cmd_tx: PlayerCmdSender,
        playlist: SharedPlaylist,
        downloader: Arc<dyn Download>,
        voice: Arc<dyn VoiceConnector>,
    ) -> Self {
        let auto_leave = AutoLeave::spawn(cmd_tx.clone());

        Self {
            playlist,
            config,
            downloader,
            voice,
            audio: None,
            voice_channel: None,
            song_position: Arc::new(Mutex::new(SongPosition::default())),
            auto_leave,
            events: Arc::new(Events::default()),
            cmd_tx,
        }
    }

    #[must_use]
    pub fn events(&self) -> Arc<Events> {
        Arc::clone(&self.events)
    }

    #[must_use]
    pub fn has_session(&self) -> bool {
        self.audio.is_some()
    }

    /// Advance playback: ensure a session exists, pick the head, materialize
    /// it and hand it to the session.
    ///
    /// Fails with [`Error::NullVoiceChannel`] when there is neither a session
    /// nor a voice target; any other failure is retryable by re-enqueueing
    /// the same command.
    pub async fn play(&mut self, voice_channel: Option<ChannelId>, trace: &TraceId) -> error::Result<()> {
        let session = match &self.audio {
            Some(session) => Arc::clone(session),
            None => {
                let Some(channel) = voice_channel.filter(|channel| !channel.is_null()) else {
                    return Err(Error::NullVoiceChannel);
                };
                let (session, events) = self
                    .voice
                    .connect(channel)
                    .await
                    .map_err(Error::Other)?;
                self.spawn_session_listener(events);
                self.audio = Some(Arc::clone(&session));
                self.voice_channel = Some(channel);
                info!("[{trace}] voice session created in channel {channel}");
                session
            }
        };

        if !session.is_idle() {
            // playback already in progress, the command is absorbed
            return Ok(());
        }

        let Some(track) = self.playlist.write().head() else {
            return Ok(());
        };

        let request = DownloadRequest::from(&track);
        let source = match self.downloader.download(&request).await {
            Ok(source) => source,
            Err(err) => {
                // dead link: force-remove the head, no retry for this track
                self.playlist.write().remove(true);
                return Err(err);
            }
        };
        self.playlist.write().assign_head_file(source.clone());

        if session.play(source, Duration::ZERO).await {
            debug!("[{trace}] started {}", track.id);
        }

        Ok(())
    }

    /// Stop the active track. Advancing happens through the finished event;
    /// loop mode stays untouched, so a looped head simply restarts.
    pub fn skip(&self, trace: &TraceId) {
        info!("[{trace}] skip");
        if let Some(session) = &self.audio {
            session.stop();
        }
    }

    /// Tear the session down no matter what it is doing.
    pub async fn disconnect(&mut self, trace: &TraceId) {
        info!("[{trace}] disconnect");
        if let Some(session) = self.audio.take() {
            session.destroy().await;
        }
        self.voice_channel = None;
        *self.song_position.lock() = SongPosition::default();
    }

    /// Release the voice session iff nothing is playing.
    pub async fn disconnect_idle(&mut self) {
        let Some(session) = &self.audio else {
            return;
        };
        if session.destroy_idle().await {
            info!("idle too long, left voice channel");
            self.audio = None;
            self.voice_channel = None;
            *self.song_position.lock() = SongPosition::default();
        }
    }

    /// Publish a consistent snapshot of position, modes and queue.
    pub fn send_state(&self) {
        let (position, length) = {
            let position = self.song_position.lock();
            (position.elapsed, position.length)
        };
        let (queue, modes) = {
            let playlist = self.playlist.read();
            (playlist.queue(), playlist.modes())
        };

        self.events.states.publish(StateEvent {
            current: queue.first().cloned(),
            position,
            length,
            modes,
            queue,
        });
    }

    /// Drop one consumer reference of a downloaded file.
    pub fn delete_song(&self, path: &Path) {
        if let Err(err) = self.downloader.delete(path) {
            error!("delete song {}: {err}", path.display());
        }
    }

    pub fn set_loop(&self, toggle: Toggle) {
        let on = self.playlist.write().set_loop(toggle);
        info!("loop mode: {on}");
    }

    /// Radio coming on can conjure a head out of an empty queue.
    pub fn set_radio(&self, toggle: Toggle) {
        let on = self.playlist.write().set_radio(toggle);
        info!("radio mode: {on}");
        if on {
            self.inject_play();
        }
    }

    /// Shuffle coming on while idle with a non-empty queue starts playback.
    pub fn set_shuffle(&self, toggle: Toggle) {
        let (on, empty) = {
            let mut playlist = self.playlist.write();
            (playlist.set_shuffle(toggle), playlist.is_empty())
        };
        info!("shuffle mode: {on}");
        if on && !empty {
            self.inject_play();
        }
    }

    pub fn publish_error(&self, err: &Error, trace: &TraceId) {
        error!("[{trace}] {err}");
        self.events.errors.publish(ErrorEvent {
            message: err.to_string(),
            trace: trace.clone(),
        });
    }

    /// Re-enqueue a failed play; `NullVoiceChannel` is never retried.
    pub fn requeue_play(&self, voice_channel: Option<ChannelId>, trace: TraceId) {
        let _ = self.cmd_tx.send(PlayerCmd::Play {
            voice_channel,
            trace,
        });
    }

    fn inject_play(&self) {
        let _ = self.cmd_tx.send(PlayerCmd::Play {
            voice_channel: self.voice_channel,
            trace: TraceId::new(),
        });
    }

    /// Listen to the session's tick/finished channels and feed the engine.
    ///
    /// On finished: reset auto-leave, pop the head (loop honored), advance
    /// with a fresh `Play`, release the file and clear the position.
    fn spawn_session_listener(&self, mut events: SessionEvents) {
        let playlist = Arc::clone(&self.playlist);
        let cmd_tx = self.cmd_tx.clone();
        let song_position = Arc::clone(&self.song_position);
        let auto_leave_reset = self.auto_leave.reset_tx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    tick = events.ticks.recv() => match tick {
                        Some(position) => *song_position.lock() = position,
                        None => break,
                    },
                    finished = events.finished.recv() => match finished {
                        Some(path) => {
                            debug!("finished {}", path.display());
                            let _ = auto_leave_reset.send(());
                            playlist.write().remove(false);
                            let _ = cmd_tx.send(PlayerCmd::Play {
                                voice_channel: None,
                                trace: TraceId::new(),
                            });
                            let _ = cmd_tx.send(PlayerCmd::DeleteSong { path });
                            *song_position.lock() = SongPosition::default();
                        }
                        None => break,
                    },
                }
            }
        });
    }

    /// Graceful shutdown on `Quit`.
    pub async fn shutdown(&mut self) {
        self.auto_leave.reset();
        self.disconnect(&TraceId::new()).await;
    }
}
