//! Room gateway: the transport collaborator.
//!
//! A remote participant connects over WebSocket and sends JSON text
//! messages (chat) and binary image frames (their camera feed). The first
//! binary frame on a connection publishes a video track; the connection
//! closing ends it, and the session's frame reader goes back to waiting
//! for the next one. The gateway itself stays up across participant
//! reconnects.

use argus_core::SessionEvent;
use argus_core::transport::{FrameStream, TransportError, VideoSource};
use argus_core::vision::VideoFrame;
use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use serde::Deserialize;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};

const FRAME_CHANNEL_CAPACITY: usize = 4;

/// Messages a participant may send as WebSocket text frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Chat { text: String },
}

/// Shared state for WebSocket handlers.
#[derive(Clone)]
pub struct Gateway {
    events: mpsc::Sender<SessionEvent>,
    tracks: mpsc::Sender<mpsc::Receiver<VideoFrame>>,
}

/// [`VideoSource`] backed by the gateway's track handoff channel.
pub struct GatewayVideoSource {
    tracks: Mutex<mpsc::Receiver<mpsc::Receiver<VideoFrame>>>,
}

impl Gateway {
    pub fn new(events: mpsc::Sender<SessionEvent>) -> (Self, GatewayVideoSource) {
        let (tracks_tx, tracks_rx) = mpsc::channel(1);
        (
            Self {
                events,
                tracks: tracks_tx,
            },
            GatewayVideoSource {
                tracks: Mutex::new(tracks_rx),
            },
        )
    }

    pub fn router(self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        Router::new()
            .route("/ws", get(ws_handler))
            .layer(cors)
            .with_state(self)
    }
}

#[async_trait]
impl VideoSource for GatewayVideoSource {
    async fn subscribe(&self) -> Result<FrameStream, TransportError> {
        let mut tracks = self.tracks.lock().await;
        match tracks.recv().await {
            Some(track) => Ok(Box::pin(ReceiverStream::new(track)) as FrameStream),
            None => Err(TransportError::Closed),
        }
    }
}

async fn ws_handler(State(gateway): State<Gateway>, ws: WebSocketUpgrade) -> Response {
    tracing::info!("participant connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, gateway))
}

async fn handle_socket(mut socket: WebSocket, gateway: Gateway) {
    tracing::info!("participant connected");
    let mut track: Option<mpsc::Sender<VideoFrame>> = None;

    while let Some(message) = socket.recv().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::info!(error = %e, "participant connection errored");
                break;
            }
        };
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(ClientMessage::Chat { text }) => {
                    if gateway.events.send(SessionEvent::Chat(text)).await.is_err() {
                        tracing::warn!("session mailbox closed, dropping participant");
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "ignoring unrecognized text message");
                }
            },
            Message::Binary(data) => {
                if track.is_none() {
                    // First frame on this connection publishes the track.
                    let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
                    if gateway.tracks.send(rx).await.is_err() {
                        tracing::warn!("frame reader gone, ignoring video frames");
                    } else {
                        tracing::info!("participant published a video track");
                        track = Some(tx);
                    }
                }
                if let Some(track) = &track {
                    // Dropped frames are harmless: the cache only ever
                    // wants the latest one anyway.
                    let _ = track.try_send(VideoFrame::jpeg(data));
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Dropping the track sender ends the frame stream; the session's frame
    // reader re-enters its wait for the next published track.
    tracing::info!("participant disconnected");
}
