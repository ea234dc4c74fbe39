//! Client side of the gateway daemon's voice transport contract.
//!
//! The Discord gateway itself runs as a separate service; this module
//! fulfills the playback crate's [`VoiceProvider`]/[`VoiceConnection`] seam
//! over one WebSocket per voice connection: text frames carry the
//! `speaking`/`leave` ops, binary frames carry Opus packets.

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use cadenzalib::ids::ChannelId;
use cadenzaplayback::audio::{VoiceConnection, VoiceProvider};

const OP_SPEAKING: &str = r#"{"op":"speaking"}"#;
const OP_LEAVE: &str = r#"{"op":"leave"}"#;

pub struct GatewayVoice {
    base_url: String,
}

impl GatewayVoice {
    #[must_use]
    pub fn new(base_url: String) -> Self {
        Self { base_url }
    }
}

#[async_trait]
impl VoiceProvider for GatewayVoice {
    async fn open(&self, channel: ChannelId) -> anyhow::Result<Arc<dyn VoiceConnection>> {
        let url = format!("{}/voice/{channel}", self.base_url.trim_end_matches('/'));
        let (stream, _response) = connect_async(url.as_str())
            .await
            .with_context(|| format!("connect gateway voice socket {url}"))?;
        let (sink, mut read) = stream.split();

        // drain the read half so control pings keep flowing
        tokio::spawn(async move { while read.next().await.is_some() {} });

        Ok(Arc::new(GatewayConnection {
            sink: tokio::sync::Mutex::new(sink),
        }))
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

struct GatewayConnection {
    sink: tokio::sync::Mutex<WsSink>,
}

#[async_trait]
impl VoiceConnection for GatewayConnection {
    async fn speaking(&self) -> anyhow::Result<()> {
        self.sink
            .lock()
            .await
            .send(Message::text(OP_SPEAKING))
            .await
            .context("send speaking op")
    }

    async fn send(&self, packet: Bytes) -> anyhow::Result<()> {
        self.sink
            .lock()
            .await
            .send(Message::binary(packet))
            .await
            .context("send opus frame")
    }

    async fn leave(&self) -> anyhow::Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::text(OP_LEAVE))
            .await
            .context("send leave op")?;
        sink.close().await.context("close gateway voice socket")
    }
}
