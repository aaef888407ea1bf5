use crate::vision::VideoFrame;
use async_trait::async_trait;
use futures::Stream;
#[cfg(test)]
use mockall::automock;
use std::pin::Pin;

/// An unbounded sequence of frames from one published video track. The
/// stream ends when the track does (participant left, track replaced).
pub type FrameStream = Pin<Box<dyn Stream<Item = VideoFrame> + Send>>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// No video track is currently published. Retried by waiting.
    #[error("no video track available")]
    Unavailable,
    /// The transport is gone for good; the frame reader stops.
    #[error("transport closed")]
    Closed,
}

/// The room-side video capability.
///
/// `subscribe` suspends until the remote participant publishes a video
/// track, then yields that track's frame stream. It is called again
/// whenever a track ends, so reconnects and track replacement are handled
/// by re-subscribing rather than by a one-shot future.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait VideoSource: Send + Sync {
    async fn subscribe(&self) -> Result<FrameStream, TransportError>;
}
