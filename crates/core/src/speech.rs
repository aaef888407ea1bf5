use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How a spoken utterance ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechOutcome {
    /// Every queued segment was spoken to the end.
    Completed,
    /// The stop signal fired; playback was silenced mid-utterance.
    Cancelled,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("speech synthesis failed: {0}")]
pub struct SpeechError(pub String);

/// The speech-synthesis capability.
///
/// `speak` consumes text segments until the channel closes, then resolves
/// with [`SpeechOutcome::Completed`]. The cancellation token is the
/// interruption signal: implementations must honour it promptly, stopping
/// audible output and resolving with [`SpeechOutcome::Cancelled`].
#[async_trait]
#[cfg_attr(test, automock)]
pub trait SpeechSynthesizer: Send + Sync {
    /// Whether this backend can only speak complete sentences. When true,
    /// the response pipeline buffers model fragments at sentence boundaries
    /// before handing them over.
    fn requires_full_sentences(&self) -> bool {
        false
    }

    async fn speak(
        &self,
        segments: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) -> Result<SpeechOutcome, SpeechError>;
}
