//! Loopback broadcast over a local TCP signaling server
//!
//! Run with: cargo run --example loopback [VIEWERS]
//!
//! Starts a minimal newline-delimited JSON signaling server on 127.0.0.1,
//! connects a broadcaster backed by in-memory capture and transports, goes
//! live, lets the simulated viewers join and answer, then walks through a
//! screen share and shuts down.
//!
//! Set `RUST_LOG=castline=debug` for the full event trace.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

use castline::broadcaster::{Broadcaster, BroadcasterConfig, Collaborators, StreamObserver};
use castline::media::Composition;
use castline::session::SessionState;
use castline::signaling::{ChannelState, SessionDescription, SignalingMessage, TcpConnector};
use castline::testing::{FakeMedia, FakePeerFactory};
use castline::ViewerId;

struct Printer;

impl StreamObserver for Printer {
    fn on_channel_state(&self, state: &ChannelState) {
        println!("signaling: {:?}", state);
    }

    fn on_session_state(&self, viewer: &ViewerId, state: SessionState) {
        println!("viewer {}: {}", viewer, state);
    }

    fn on_transport_unavailable(&self) {
        println!("signaling unavailable");
    }

    fn on_composition(&self, composition: &Composition) {
        println!(
            "composition r{}: primary={:?} pip={} audio={:?}",
            composition.revision(),
            composition.primary().source(),
            composition.secondary().is_some(),
            composition.audio().map(|a| a.source()),
        );
    }
}

/// One server connection: answers every offer, and on `stream_start`
/// reports `viewers` as online
async fn serve(stream: TcpStream, viewers: Vec<ViewerId>) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let message = match SignalingMessage::from_json(&line) {
            Ok(message) => message,
            Err(e) => {
                eprintln!("server: bad message: {}", e);
                continue;
            }
        };

        let reply = match message {
            SignalingMessage::BroadcasterJoin { broadcaster_id, .. } => {
                println!("server: {} joined", broadcaster_id);
                None
            }
            SignalingMessage::StreamStart { request_viewers, .. } if request_viewers => {
                Some(SignalingMessage::OnlineViewers {
                    viewers: viewers.clone(),
                })
            }
            SignalingMessage::Offer {
                viewer_id, offer, ..
            } => {
                println!("server: offer for {} ({})", viewer_id, offer.sdp);
                Some(SignalingMessage::Answer {
                    broadcaster_id: None,
                    viewer_id,
                    answer: SessionDescription::answer("v=0 loopback"),
                })
            }
            other => {
                println!("server: {}", other.kind());
                None
            }
        };

        if let Some(reply) = reply {
            let mut text = reply
                .to_json()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
            text.push('\n');
            writer.write_all(text.as_bytes()).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("castline=info".parse()?),
        )
        .init();

    let count: usize = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(2);
    let viewers: Vec<ViewerId> = (1..=count)
        .map(|n| ViewerId::new(format!("viewer-{}", n)))
        .collect();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    println!("Signaling server on {}", addr);

    tokio::spawn(async move {
        while let Ok((stream, peer)) = listener.accept().await {
            println!("server: connection from {}", peer);
            let viewers = viewers.clone();
            tokio::spawn(async move {
                if let Err(e) = serve(stream, viewers).await {
                    eprintln!("server: connection error: {}", e);
                }
            });
        }
    });

    let media = FakeMedia::new();
    media.screen_audio(true);
    let peers = Arc::new(FakePeerFactory::auto_connect());

    let broadcaster = Broadcaster::new(
        BroadcasterConfig::new("loopback")
            .endpoint("127.0.0.1:1")
            .endpoint(addr.to_string())
            .user_info(serde_json::json!({ "name": "Loopback demo" })),
        Collaborators {
            media: media.sources(),
            connector: Arc::new(TcpConnector::default()),
            peers: peers.clone(),
            observer: Some(Arc::new(Printer)),
        },
    );

    broadcaster.start_preview().await?;
    broadcaster.connect().await?;
    broadcaster.start_broadcast(Some("Loopback".into())).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    broadcaster.start_screen_share().await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    media.end_screen_share();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = broadcaster.stats().await;
    println!(
        "{} connected of {}, {} messages sent",
        stats.count(SessionState::Connected),
        stats.sessions.len(),
        stats.channel.messages_sent
    );
    for session in &stats.sessions {
        println!(
            "  {} gen={} offers={} revision={:?}",
            session.viewer, session.generation, session.offers_sent, session.applied_revision
        );
    }

    broadcaster.shutdown().await;
    Ok(())
}
