mod auth;
mod cli;
mod handler;
mod logger;
mod socket;
mod voice;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use tokio::runtime::Handle;
use tokio::select;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use cadenzalib::config::{self, new_shared_server_settings, ServerSettings, SharedServerSettings};
use cadenzaplayback::audio::VoiceProvider;
use cadenzaplayback::download::Downloader;
use cadenzaplayback::error::Result as PlaybackResult;
use cadenzaplayback::playlist::RadioSource;
use cadenzaplayback::search::{Searcher, VideoItem, VideoSearch};
use cadenzaplayback::store::{MemoryStorage, TrackStore};
use cadenzaplayback::{
    AudioConnector, Error, Player, PlayerCmd, PlayerCmdReciever, PlayerCmdSender, Playlist,
};

use auth::TokenVerifier;
use handler::CommandHandler;
use socket::{AppState, SocketManager};
use voice::GatewayVoice;

#[macro_use]
extern crate log;

fn main() -> Result<()> {
    // print error to the log and then throw it
    if let Err(err) = actual_main() {
        error!("Error: {:?}", err);
        return Err(err);
    }

    Ok(())
}

#[tokio::main]
async fn actual_main() -> Result<()> {
    let args = cli::Args::parse();
    let _logger = logger::setup(&args);
    let config = get_config(&args)?;

    info!("Server starting...");

    let config = new_shared_server_settings(config);
    let (cmd_tx, cmd_rx) = tokio::sync::mpsc::unbounded_channel();

    let cmd_tx_ctrlc = cmd_tx.clone();
    ctrlc::set_handler(move || {
        cmd_tx_ctrlc
            .send(PlayerCmd::Quit)
            .expect("Could not send signal on channel.");
    })
    .expect("Error setting Ctrl-C handler");

    // The content store behind its contract; a persistent backend plugs in
    // here, deployments without one run from memory.
    let store = Arc::new(TrackStore::new(Arc::new(MemoryStorage::default())));
    store.fill_cache().await.context("warm the track cache")?;

    let playlist = Playlist::new_shared(Some(Arc::clone(&store) as Arc<dyn RadioSource>));

    let output_dir = config.read().download.output_dir.clone();
    let downloader =
        Arc::new(Downloader::new(&output_dir).context("initialize the download cache")?);

    let gateway_url = config.read().gateway.url.clone();
    let connector = Arc::new(AudioConnector::new(
        Arc::new(GatewayVoice::new(gateway_url)) as Arc<dyn VoiceProvider>,
    ));

    let player = Player::new(
        config.clone(),
        cmd_tx.clone(),
        Arc::clone(&playlist),
        downloader,
        connector,
    );
    let events = player.events();

    let searcher = Arc::new(Searcher::new(
        Arc::new(UnconfiguredVideoSearch),
        Arc::clone(&store),
    ));

    let (socket_manager, inbound) = SocketManager::new();
    CommandHandler::subscribe_events(&events, &socket_manager);
    let command_handler = CommandHandler::new(
        Arc::clone(&playlist),
        cmd_tx.clone(),
        searcher,
        Arc::clone(&socket_manager),
    );
    tokio::spawn(command_handler.run(inbound));

    let verifier = Arc::new(TokenVerifier::new(&config.read().auth.jwt_secret));
    let service_cancel_token = CancellationToken::new();
    let join_handle = start_service(
        &config,
        AppState {
            manager: socket_manager,
            verifier,
        },
        service_cancel_token.clone(),
    )
    .await?;

    let tokio_handle = Handle::current();
    start_state_ticker(
        &tokio_handle,
        service_cancel_token.clone(),
        cmd_tx.clone(),
        &config,
    );

    let (player_handle_os_tx, player_handle_os_rx) = oneshot::channel();
    let player_handle = std::thread::Builder::new()
        .name("main player loop".into())
        .spawn(move || {
            let _guard = tokio_handle.enter();
            let res = player_loop(player, cmd_rx);
            let _ = player_handle_os_tx.send(res);
        })?;

    info!("Server ready");

    // await the oneshot completing in a async fashion
    player_handle_os_rx.await??;
    // do this *after* the oneshot, because this is a blocking operation
    // and by doing this after the oneshot we can be sure the thread is actually exited, or exiting
    let _ = player_handle.join();

    // ensure cleanup of the service tasks happens before main exits
    service_cancel_token.cancel();
    let _ = join_handle.await;

    info!("Bye");

    Ok(())
}

/// The main player loop where we handle all commands, strictly one at a time.
fn player_loop(mut player: Player, mut cmd_rx: PlayerCmdReciever) -> Result<()> {
    let handle = Handle::current();

    while let Some(cmd) = cmd_rx.blocking_recv() {
        match cmd {
            PlayerCmd::Play {
                voice_channel,
                trace,
            } => {
                if let Err(err) = handle.block_on(player.play(voice_channel, &trace)) {
                    player.publish_error(&err, &trace);
                    // NullVoiceChannel is terminal, everything else retries
                    if !matches!(err, Error::NullVoiceChannel) {
                        player.requeue_play(voice_channel, trace);
                    }
                }
            }
            PlayerCmd::Skip { trace, .. } => player.skip(&trace),
            PlayerCmd::Disconnect { trace, .. } => handle.block_on(player.disconnect(&trace)),
            PlayerCmd::DeleteSong { path } => player.delete_song(&path),
            PlayerCmd::SendState => player.send_state(),
            PlayerCmd::DisconnectIdle => handle.block_on(player.disconnect_idle()),
            PlayerCmd::Loop(toggle) => player.set_loop(toggle),
            PlayerCmd::Radio(toggle) => player.set_radio(toggle),
            PlayerCmd::Shuffle(toggle) => player.set_shuffle(toggle),
            PlayerCmd::Quit => {
                info!("PlayerCmd::Quit received");
                handle.block_on(player.shutdown());
                return Ok(());
            }
        }
    }

    Ok(())
}

/// Serve the WebSocket endpoints until the cancel token fires.
async fn start_service(
    config: &SharedServerSettings,
    state: AppState,
    cancel_token: CancellationToken,
) -> Result<JoinHandle<std::io::Result<()>>> {
    let addr = SocketAddr::from(&config.read().com);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Error binding address: {addr}"))?;
    let local_addr = listener.local_addr()?;
    info!("Server listening on {local_addr}");

    let app = socket::router(state);
    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(cancel_token.cancelled_owned())
            .await
    });

    Ok(handle)
}

/// Spawn the task that periodically injects [`PlayerCmd::SendState`].
fn start_state_ticker(
    handle: &Handle,
    cancel_token: CancellationToken,
    cmd_tx: PlayerCmdSender,
    config: &SharedServerSettings,
) {
    let tick = Duration::from_millis(config.read().player.state_tick_ms.get());
    handle.spawn(async move {
        let mut timer = tokio::time::interval_at(Instant::now() + tick, tick);
        loop {
            select! {
                _ = timer.tick() => {
                    if cmd_tx.send(PlayerCmd::SendState).is_err() {
                        break;
                    }
                }
                () = cancel_token.cancelled() => break,
            }
        }
    });
}

fn get_config(args: &cli::Args) -> Result<ServerSettings> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("config").join(config::FILE_NAME));

    ServerSettings::from_file(&path)
}

/// Stand-in for the external video-search API client.
///
/// Queries that are not resolvable from the content store fail with
/// `SongNotFound` until a real client is wired through the
/// [`VideoSearch`] contract.
struct UnconfiguredVideoSearch;

#[async_trait::async_trait]
impl VideoSearch for UnconfiguredVideoSearch {
    async fn search(&self, query: &str, _max_results: u32) -> PlaybackResult<Vec<VideoItem>> {
        warn!("video-search API not configured, cannot resolve {query:?}");
        Ok(Vec::new())
    }
}
