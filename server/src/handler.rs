//! Thin adapter between client commands and the player engine.
//!
//! Inbound socket JSON, bot messages and slash commands all funnel through
//! here and come out as the same engine commands. Anonymous socket input is
//! silently dropped; failures before a command reaches the engine are
//! replied to the originating socket as an error payload.

use std::sync::Arc;

use tokio::sync::mpsc;

use cadenzalib::ids::{ChannelId, TraceId};
use cadenzalib::protocol::{duration_to_nanos, CommandKind, CommandMessage, StateMessage};
use cadenzalib::track::{Track, TrackService};
use cadenzaplayback::search::{SearchRequest, Searcher};
use cadenzaplayback::{Events, PlayerCmd, PlayerCmdSender, SharedPlaylist, StateEvent, Toggle};

use crate::socket::{SocketData, SocketManager};

pub struct CommandHandler {
    playlist: SharedPlaylist,
    cmd_tx: PlayerCmdSender,
    searcher: Arc<Searcher>,
    manager: Arc<SocketManager>,
}

impl CommandHandler {
    #[must_use]
    pub fn new(
        playlist: SharedPlaylist,
        cmd_tx: PlayerCmdSender,
        searcher: Arc<Searcher>,
        manager: Arc<SocketManager>,
    ) -> Self {
        Self {
            playlist,
            cmd_tx,
            searcher,
            manager,
        }
    }

    /// Wire the engine's event topics into the socket fan-out: states go to
    /// everyone, errors to authenticated controllers only.
    pub fn subscribe_events(events: &Events, manager: &Arc<SocketManager>) {
        let fan = Arc::clone(manager);
        events.states.subscribe(move |state| {
            match serde_json::to_string(&state_to_message(&state)) {
                Ok(json) => {
                    let fan = Arc::clone(&fan);
                    tokio::spawn(async move { fan.write_all(&json).await });
                }
                Err(err) => error!("encode state: {err}"),
            }
        });

        let fan = Arc::clone(manager);
        events.errors.subscribe(move |event| {
            match serde_json::to_string(&StateMessage::from_error(&event.message)) {
                Ok(json) => {
                    let fan = Arc::clone(&fan);
                    tokio::spawn(async move { fan.write_authenticated(&json).await });
                }
                Err(err) => error!("encode error event: {err}"),
            }
        });
    }

    /// Consume the inbound socket stream until the manager shuts down.
    pub async fn run(self, mut inbound: mpsc::UnboundedReceiver<SocketData>) {
        while let Some(data) = inbound.recv().await {
            // status-only viewers cannot command
            if data.user.is_anonymous() {
                continue;
            }

            let message: CommandMessage = match serde_json::from_str(&data.text) {
                Ok(message) => message,
                Err(err) => {
                    debug!("undecodable message from user {}: {err}", data.user);
                    continue;
                }
            };
            let trace = message
                .trace_id
                .clone()
                .map_or_else(TraceId::new, TraceId::from);

            if let Err(err) = self.dispatch(message, &data, &trace).await {
                warn!("[{trace}] command from user {} failed: {err:#}", data.user);
                if let Ok(json) = serde_json::to_string(&StateMessage::from_error(&err.to_string()))
                {
                    if let Err(err) = self.manager.write(&json, data.user, data.socket).await {
                        debug!("error reply to user {}: {err}", data.user);
                    }
                }
            }
        }
    }

    async fn dispatch(
        &self,
        message: CommandMessage,
        data: &SocketData,
        trace: &TraceId,
    ) -> anyhow::Result<()> {
        match message.kind {
            CommandKind::Play => {
                let query = message.query.unwrap_or_default();
                if query.is_empty() {
                    anyhow::bail!("play needs a query");
                }
                let request = SearchRequest {
                    text: query,
                    user: data.user,
                    service: message.service.unwrap_or(TrackService::Youtube),
                };
                let track = self.searcher.search(&request).await?;
                // socket clients carry no voice state; the session must
                // already exist (or the engine reports NullVoiceChannel)
                self.play(track, None, trace.clone())?;
            }
            CommandKind::Skip => self.skip(None, trace.clone())?,
            CommandKind::Disconnect => self.disconnect(None, trace.clone())?,
            CommandKind::Loop => self.set_loop(Toggle::On)?,
            CommandKind::LoopOff => self.set_loop(Toggle::Off)?,
            CommandKind::Radio => self.set_radio(Toggle::On)?,
            CommandKind::RadioOff => self.set_radio(Toggle::Off)?,
            CommandKind::Shuffle => self.set_shuffle(Toggle::On)?,
            CommandKind::ShuffleOff => self.set_shuffle(Toggle::Off)?,
        }
        Ok(())
    }

    // The same surface a bot adapter uses directly, voice channel included.

    pub fn play(
        &self,
        track: Track,
        voice_channel: Option<ChannelId>,
        trace: TraceId,
    ) -> anyhow::Result<()> {
        self.playlist.write().add(track);
        self.send(PlayerCmd::Play {
            voice_channel,
            trace,
        })
    }

    pub fn skip(&self, voice_channel: Option<ChannelId>, trace: TraceId) -> anyhow::Result<()> {
        self.send(PlayerCmd::Skip {
            voice_channel,
            trace,
        })
    }

    pub fn disconnect(
        &self,
        voice_channel: Option<ChannelId>,
        trace: TraceId,
    ) -> anyhow::Result<()> {
        self.send(PlayerCmd::Disconnect {
            voice_channel,
            trace,
        })
    }

    pub fn set_loop(&self, toggle: Toggle) -> anyhow::Result<()> {
        self.send(PlayerCmd::Loop(toggle))
    }

    pub fn set_radio(&self, toggle: Toggle) -> anyhow::Result<()> {
        self.send(PlayerCmd::Radio(toggle))
    }

    pub fn set_shuffle(&self, toggle: Toggle) -> anyhow::Result<()> {
        self.send(PlayerCmd::Shuffle(toggle))
    }

    fn send(&self, cmd: PlayerCmd) -> anyhow::Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|err| anyhow::anyhow!("player engine gone: {err}"))
    }
}

/// Map an engine snapshot onto the wire shape. A missing current track
/// becomes the zero-value track, matching what controllers expect.
#[must_use]
pub fn state_to_message(state: &StateEvent) -> StateMessage {
    StateMessage {
        is_error: false,
        error_message: String::new(),
        current: state.current.clone().unwrap_or_default(),
        position: duration_to_nanos(state.position),
        length: duration_to_nanos(state.length),
        looped: state.modes.looped,
        radio: state.modes.radio,
        shuffle: state.modes.shuffle,
        queue: state.queue.clone(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use cadenzalib::ids::UserId;
    use cadenzalib::track::{TrackId, TrackService};
    use cadenzaplayback::error::Result as PlaybackResult;
    use cadenzaplayback::search::{VideoItem, VideoSearch};
    use cadenzaplayback::store::{MemoryStorage, TrackStore};
    use cadenzaplayback::{Modes, Playlist, PlayerCmdReciever};

    use super::*;

    struct NoApi;

    #[async_trait::async_trait]
    impl VideoSearch for NoApi {
        async fn search(&self, _query: &str, _max_results: u32) -> PlaybackResult<Vec<VideoItem>> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        handler: CommandHandler,
        cmd_rx: PlayerCmdReciever,
        store: Arc<TrackStore>,
    }

    fn fixture() -> Fixture {
        let (cmd_tx, cmd_rx) = tokio::sync::mpsc::unbounded_channel();
        let store = Arc::new(TrackStore::new(Arc::new(MemoryStorage::default())));
        let searcher = Arc::new(Searcher::new(Arc::new(NoApi), Arc::clone(&store)));
        let (manager, _inbound) = SocketManager::new();
        let handler = CommandHandler::new(
            Playlist::new_shared(None),
            cmd_tx,
            searcher,
            manager,
        );
        Fixture {
            handler,
            cmd_rx,
            store,
        }
    }

    fn inbound(user: UserId, json: &str) -> SocketData {
        SocketData {
            text: json.to_owned(),
            user,
            socket: uuid::Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn socket_skip_equals_the_adapter_call() {
        let mut f = fixture();
        let trace = TraceId::from("t-1".to_owned());

        let message: CommandMessage =
            serde_json::from_str(r#"{"type":"skip","trace_id":"t-1"}"#).unwrap();
        let data = inbound(UserId(7), "");
        f.handler.dispatch(message, &data, &trace).await.unwrap();
        let from_socket = f.cmd_rx.recv().await.unwrap();

        f.handler.skip(None, trace).unwrap();
        let from_adapter = f.cmd_rx.recv().await.unwrap();

        assert_eq!(from_socket, from_adapter);
    }

    #[tokio::test]
    async fn mode_verbs_map_to_explicit_toggles() {
        let mut f = fixture();
        let trace = TraceId::new();
        let data = inbound(UserId(7), "");

        for (json, expected) in [
            (r#"{"type":"loop"}"#, PlayerCmd::Loop(Toggle::On)),
            (r#"{"type":"loop_off"}"#, PlayerCmd::Loop(Toggle::Off)),
            (r#"{"type":"radio"}"#, PlayerCmd::Radio(Toggle::On)),
            (r#"{"type":"radio_off"}"#, PlayerCmd::Radio(Toggle::Off)),
            (r#"{"type":"shuffle"}"#, PlayerCmd::Shuffle(Toggle::On)),
            (r#"{"type":"shuffle_off"}"#, PlayerCmd::Shuffle(Toggle::Off)),
        ] {
            let message: CommandMessage = serde_json::from_str(json).unwrap();
            f.handler.dispatch(message, &data, &trace).await.unwrap();
            assert_eq!(f.cmd_rx.recv().await.unwrap(), expected, "json: {json}");
        }
    }

    #[tokio::test]
    async fn play_resolves_the_query_then_enqueues() {
        let mut f = fixture();
        let known = Track {
            id: TrackId::new(TrackService::Youtube, "dQw4w9WgXcQ"),
            title: "from the store".to_owned(),
            playbacks: 2,
            ..Track::default()
        };
        f.store.set(UserId(7), &known).await.unwrap();

        let message: CommandMessage = serde_json::from_str(
            r#"{"type":"play","query":"https://youtu.be/dQw4w9WgXcQ","trace_id":"t-2"}"#,
        )
        .unwrap();
        let data = inbound(UserId(7), "");
        let trace = TraceId::from("t-2".to_owned());
        f.handler.dispatch(message, &data, &trace).await.unwrap();

        assert_eq!(
            f.handler.playlist.read().current().unwrap().title,
            "from the store"
        );
        let cmd = f.cmd_rx.recv().await.unwrap();
        assert_eq!(
            cmd,
            PlayerCmd::Play {
                voice_channel: None,
                trace
            }
        );
    }

    #[tokio::test]
    async fn play_without_a_query_fails_without_reaching_the_engine() {
        let mut f = fixture();
        let message: CommandMessage = serde_json::from_str(r#"{"type":"play"}"#).unwrap();
        let data = inbound(UserId(7), "");
        let err = f
            .handler
            .dispatch(message, &data, &TraceId::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("query"));
        assert!(f.cmd_rx.try_recv().is_err());
    }

    #[test]
    fn state_mapping_uses_the_zero_track_for_an_empty_queue() {
        let state = StateEvent {
            current: None,
            position: Duration::from_secs(1),
            length: Duration::from_secs(2),
            modes: Modes {
                looped: true,
                radio: false,
                shuffle: false,
            },
            queue: Vec::new(),
        };
        let message = state_to_message(&state);
        assert_eq!(message.current, Track::default());
        assert_eq!(message.position, 1_000_000_000);
        assert_eq!(message.length, 2_000_000_000);
        assert!(message.looped);
        assert!(!message.is_error);
    }
}
