//! One voice connection, one encoder pipeline, at most one playing track.

mod encoder;
mod ogg;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use cadenzalib::ids::ChannelId;

pub use encoder::{FRAME_DURATION, TIME_INCREMENT};

/// Progress tick emitted while a track plays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SongPosition {
    pub elapsed: Duration,
    pub length: Duration,
}

/// One established voice connection. The Discord gateway itself is an
/// external collaborator; this is its contract.
#[async_trait]
pub trait VoiceConnection: Send + Sync {
    /// Mark the bot as speaking before audio flows.
    async fn speaking(&self) -> anyhow::Result<()>;
    /// Ship one Opus packet (one 60 ms frame).
    async fn send(&self, packet: Bytes) -> anyhow::Result<()>;
    /// Leave the voice channel.
    async fn leave(&self) -> anyhow::Result<()>;
}

/// Establishes voice connections to channels.
#[async_trait]
pub trait VoiceProvider: Send + Sync {
    async fn open(&self, channel: ChannelId) -> anyhow::Result<Arc<dyn VoiceConnection>>;
}

/// Engine-facing surface of an audio session.
#[async_trait]
pub trait AudioService: Send + Sync {
    /// Returns `true` when this call acquired the single play-slot; `false`
    /// means playback is already in progress and the call was absorbed.
    async fn play(&self, source: PathBuf, position: Duration) -> bool;
    /// Cancel the active encode; the finished event will fire.
    fn stop(&self);
    /// Force-stop, wait for the play-slot and leave the channel.
    async fn destroy(&self);
    /// Leave iff idle; non-blocking, `true` on success.
    async fn destroy_idle(&self) -> bool;
    fn is_idle(&self) -> bool;
}

/// Receiving ends of a session's event channels; both close when the
/// session is destroyed or dropped.
pub struct SessionEvents {
    pub finished: mpsc::UnboundedReceiver<PathBuf>,
    pub ticks: mpsc::UnboundedReceiver<SongPosition>,
}

pub struct AudioSession {
    conn: Arc<dyn VoiceConnection>,
    channel: ChannelId,
    /// The single-capacity play-slot.
    slot: Arc<Semaphore>,
    /// Cancel handle of the active play, if any.
    cancel: parking_lot::Mutex<Option<CancellationToken>>,
    /// Cancelled once on destroy; parents every play token.
    root: CancellationToken,
    finished_tx: mpsc::UnboundedSender<PathBuf>,
    tick_tx: mpsc::UnboundedSender<SongPosition>,
}

impl AudioSession {
    #[must_use]
    pub fn new(conn: Arc<dyn VoiceConnection>, channel: ChannelId) -> (Arc<Self>, SessionEvents) {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();

        let session = Arc::new(Self {
            conn,
            channel,
            slot: Arc::new(Semaphore::new(1)),
            cancel: parking_lot::Mutex::new(None),
            root: CancellationToken::new(),
            finished_tx,
            tick_tx,
        });
        let events = SessionEvents {
            finished: finished_rx,
            ticks: tick_rx,
        };

        (session, events)
    }

    /// Join `channel` through `provider` and wrap the connection.
    pub async fn connect(
        provider: &dyn VoiceProvider,
        channel: ChannelId,
    ) -> anyhow::Result<(Arc<Self>, SessionEvents)> {
        let conn = provider
            .open(channel)
            .await
            .context("connect to voice channel")?;
        Ok(Self::new(conn, channel))
    }

    #[must_use]
    pub fn channel(&self) -> ChannelId {
        self.channel
    }
}

#[async_trait]
impl AudioService for AudioSession {
    async fn play(&self, source: PathBuf, position: Duration) -> bool {
        let permit = match Arc::clone(&self.slot).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return false,
        };

        let token = self.root.child_token();
        *self.cancel.lock() = Some(token.clone());

        let conn = Arc::clone(&self.conn);
        let finished_tx = self.finished_tx.clone();
        let tick_tx = self.tick_tx.clone();
        tokio::spawn(async move {
            let permit = permit;
            if let Err(err) = stream_track(&*conn, &source, position, &token, &tick_tx).await {
                error!("audio pipeline for {}: {err:#}", source.display());
            }
            // finished goes out before the slot frees up
            let _ = finished_tx.send(source);
            drop(permit);
        });

        true
    }

    fn stop(&self) {
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
    }

    async fn destroy(&self) {
        self.root.cancel();
        // wait until the active play task has wound down
        let _permit = match self.slot.acquire().await {
            Ok(permit) => permit,
            Err(_) => return, // already destroyed
        };
        if let Err(err) = self.conn.leave().await {
            warn!("leave voice channel {}: {err:#}", self.channel);
        }
        self.slot.close();
    }

    async fn destroy_idle(&self) -> bool {
        let Ok(_permit) = self.slot.try_acquire() else {
            return false;
        };
        if let Err(err) = self.conn.leave().await {
            warn!("leave voice channel {}: {err:#}", self.channel);
        }
        self.slot.close();
        true
    }

    fn is_idle(&self) -> bool {
        self.slot.available_permits() > 0
    }
}

/// Probe, encode and pace one track into the voice connection.
async fn stream_track(
    conn: &dyn VoiceConnection,
    source: &Path,
    position: Duration,
    cancel: &CancellationToken,
    tick_tx: &mpsc::UnboundedSender<SongPosition>,
) -> anyhow::Result<()> {
    let length = encoder::probe_duration(source)
        .await
        .context("probe media length")?;

    let mut child = encoder::spawn_encoder(source, position).context("start encoder")?;
    let stdout = child.stdout.take().context("encoder stdout missing")?;
    let stderr = child.stderr.take().context("encoder stderr missing")?;

    conn.speaking().await.context("send speaking packet")?;

    // Scan the progress stream; anything that is not a progress key is an
    // encoder error message worth keeping for the exit report.
    let progress_tx = tick_tx.clone();
    let scanner = tokio::spawn(async move {
        let mut messages = String::new();
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(elapsed) = encoder::parse_out_time(&line) {
                let _ = progress_tx.send(SongPosition {
                    elapsed: position + elapsed,
                    length,
                });
            } else if !line.contains('=') {
                messages.push_str(&line);
                messages.push('\n');
            }
        }
        messages
    });

    let mut packets = ogg::PacketReader::new(stdout);
    let mut pace = tokio::time::interval(FRAME_DURATION);
    pace.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let pump = async {
        while let Some(batch) = packets.next_packets().await? {
            for packet in batch {
                if packet.starts_with(b"OpusHead") || packet.starts_with(b"OpusTags") {
                    continue;
                }
                pace.tick().await;
                conn.send(Bytes::from(packet))
                    .await
                    .context("send opus frame")?;
            }
        }
        Ok::<(), anyhow::Error>(())
    };
    tokio::pin!(pump);

    let pump_result = tokio::select! {
        res = &mut pump => res,
        () = cancel.cancelled() => {
            let _ = child.start_kill();
            Ok(())
        }
    };
    if pump_result.is_err() {
        // a dead transport must not leave a realtime encoder running
        let _ = child.start_kill();
    }

    let status = child.wait().await.context("wait for encoder")?;
    let messages = scanner.await.unwrap_or_default();

    if !cancel.is_cancelled() {
        pump_result?;
        if !status.success() && !messages.is_empty() {
            error!("encoder finished: {status}: {}", messages.trim_end());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct RecordingConnection {
        left: AtomicUsize,
    }

    #[async_trait]
    impl VoiceConnection for RecordingConnection {
        async fn speaking(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send(&self, _packet: Bytes) -> anyhow::Result<()> {
            Ok(())
        }

        async fn leave(&self) -> anyhow::Result<()> {
            self.left.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn destroy_idle_succeeds_only_while_the_slot_is_free() {
        let conn = Arc::new(RecordingConnection::default());
        let (session, _events) = AudioSession::new(conn.clone(), ChannelId(42));
        assert!(session.is_idle());

        // simulate an active play by holding the slot
        let permit = session.slot.try_acquire().unwrap();
        assert!(!session.is_idle());
        assert!(!session.destroy_idle().await);
        assert_eq!(conn.left.load(Ordering::SeqCst), 0);

        drop(permit);
        assert!(session.destroy_idle().await);
        assert_eq!(conn.left.load(Ordering::SeqCst), 1);

        // the session is closed now, a play can no longer start
        assert!(!session.play(PathBuf::from("x.m4a"), Duration::ZERO).await);
    }

    #[tokio::test]
    async fn play_is_absorbed_while_the_slot_is_held() {
        let (session, _events) =
            AudioSession::new(Arc::new(RecordingConnection::default()), ChannelId(1));
        let _permit = session.slot.try_acquire().unwrap();
        assert!(!session.play(PathBuf::from("x.m4a"), Duration::ZERO).await);
    }

    #[tokio::test]
    async fn finished_fires_even_when_the_pipeline_fails() {
        let conn = Arc::new(RecordingConnection::default());
        let (session, mut events) = AudioSession::new(conn, ChannelId(1));

        // nonexistent source: the pipeline fails, but the contract holds --
        // the call gets the slot and the finished event names the source
        let source = PathBuf::from("does-not-exist.m4a");
        assert!(session.play(source.clone(), Duration::ZERO).await);

        let finished = tokio::time::timeout(Duration::from_secs(10), events.finished.recv())
            .await
            .expect("finished should fire")
            .expect("channel open");
        assert_eq!(finished, source);
        assert!(session.is_idle());
    }

    #[tokio::test]
    async fn destroy_waits_and_leaves_once() {
        let conn = Arc::new(RecordingConnection::default());
        let (session, _events) = AudioSession::new(conn.clone(), ChannelId(7));

        session.destroy().await;
        assert_eq!(conn.left.load(Ordering::SeqCst), 1);
        // a second destroy is a no-op on a closed session
        session.destroy().await;
        assert_eq!(conn.left.load(Ordering::SeqCst), 1);
    }
}
