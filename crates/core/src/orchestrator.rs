use crate::SessionEvent;
use crate::conversation::ConversationState;
use crate::functions::FunctionCallBroker;
use crate::model::LanguageModel;
use crate::pipeline::{PipelineError, RespondOutcome, ResponsePipeline, Trigger};
use crate::speech::SpeechSynthesizer;
use crate::transport::{TransportError, VideoSource};
use crate::vision::VisionFrameCache;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

/// Session-level tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// The fixed system-prompt turn at index 0 of the history.
    pub system_prompt: String,
    /// Spoken once at session start, before the first trigger is accepted.
    pub greeting: String,
    /// Upper bound on a single wait for a video track to be published.
    pub track_wait: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are a voice and vision assistant. You can hear the user and, \
                            when asked, look at their camera feed. Keep replies short and \
                            speakable; avoid unpronounceable punctuation and emoji."
                .to_owned(),
            greeting: "Hey! How can I help you today?".to_owned(),
            track_wait: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Responding,
}

struct ActiveResponse {
    cancel: CancellationToken,
    handle: JoinHandle<Result<RespondOutcome, PipelineError>>,
}

enum Wake {
    Event(Option<SessionEvent>),
    Finished(Result<Result<RespondOutcome, PipelineError>, JoinError>),
}

/// Top-level session coordinator.
///
/// Owns the conversation history and frame cache, reacts to the typed event
/// mailbox (chat messages, function-call completions), and enforces the
/// single-active-pipeline rule: a new qualifying trigger cancels the
/// in-flight response and waits for its acknowledgement before the next one
/// starts. A separate frame-reader task keeps the frame cache current for
/// the lifetime of the session.
pub struct SessionOrchestrator {
    pipeline: Arc<ResponsePipeline>,
    conversation: Arc<Mutex<ConversationState>>,
    frames: Arc<VisionFrameCache>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    video: Arc<dyn VideoSource>,
    events: mpsc::Receiver<SessionEvent>,
    greeting: String,
    track_wait: Duration,
    state: SessionState,
    active: Option<ActiveResponse>,
    shutdown: CancellationToken,
}

impl SessionOrchestrator {
    pub fn new(
        config: SessionConfig,
        model: Arc<dyn LanguageModel>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        video: Arc<dyn VideoSource>,
        broker: FunctionCallBroker,
        events: mpsc::Receiver<SessionEvent>,
    ) -> Self {
        let conversation = Arc::new(Mutex::new(ConversationState::new(&config.system_prompt)));
        let frames = Arc::new(VisionFrameCache::new());
        let pipeline = Arc::new(ResponsePipeline::new(
            Arc::clone(&conversation),
            Arc::clone(&frames),
            Arc::new(broker),
            model,
            Arc::clone(&synthesizer),
        ));
        Self {
            pipeline,
            conversation,
            frames,
            synthesizer,
            video,
            events,
            greeting: config.greeting,
            track_wait: config.track_wait,
            state: SessionState::Idle,
            active: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Shared handle to the conversation history, mainly for inspection.
    pub fn conversation(&self) -> Arc<Mutex<ConversationState>> {
        Arc::clone(&self.conversation)
    }

    /// Shared handle to the frame cache.
    pub fn frames(&self) -> Arc<VisionFrameCache> {
        Arc::clone(&self.frames)
    }

    /// Runs the session until the mailbox closes or a `Closed` event
    /// arrives. Consumes the orchestrator.
    pub async fn run(mut self) {
        self.speak_greeting().await;
        let frame_reader = spawn_frame_reader(
            Arc::clone(&self.video),
            Arc::clone(&self.frames),
            self.shutdown.clone(),
            self.track_wait,
        );

        loop {
            let wake = if let Some(active) = self.active.as_mut() {
                tokio::select! {
                    joined = &mut active.handle => Wake::Finished(joined),
                    event = self.events.recv() => Wake::Event(event),
                }
            } else {
                Wake::Event(self.events.recv().await)
            };

            match wake {
                Wake::Finished(joined) => {
                    self.active = None;
                    self.state = SessionState::Idle;
                    log_respond_result(joined);
                    tracing::debug!(state = ?self.state, "response settled");
                }
                Wake::Event(None) | Wake::Event(Some(SessionEvent::Closed)) => {
                    tracing::info!("transport closed, ending session");
                    break;
                }
                Wake::Event(Some(event)) => self.handle_event(event).await,
            }
        }

        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            log_respond_result(active.handle.await);
        }
        self.shutdown.cancel();
        let _ = frame_reader.await;
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        let trigger = match event {
            SessionEvent::Chat(text) => {
                let text = text.trim().to_owned();
                if text.is_empty() {
                    tracing::debug!("ignoring empty chat message");
                    return;
                }
                tracing::info!(text = %text, "chat message accepted");
                Trigger::chat(text)
            }
            SessionEvent::FunctionCallCompleted { name, arguments } => {
                let Some(user_msg) = arguments
                    .get("user_msg")
                    .and_then(|value| value.as_str())
                    .map(str::trim)
                    .filter(|user_msg| !user_msg.is_empty())
                else {
                    tracing::warn!(
                        function = %name,
                        "function completion without a usable user_msg, dropping"
                    );
                    return;
                };
                tracing::info!(function = %name, user_msg, "function completion accepted");
                Trigger::vision(user_msg)
            }
            SessionEvent::Closed => unreachable!("handled by the run loop"),
        };

        self.interrupt_active().await;
        self.start_respond(trigger);
    }

    /// Cancels the in-flight response, if any, and waits for it to
    /// acknowledge (the synthesizer has stopped) before returning.
    async fn interrupt_active(&mut self) {
        if let Some(active) = self.active.take() {
            tracing::info!("interrupting in-flight response");
            active.cancel.cancel();
            log_respond_result(active.handle.await);
            self.state = SessionState::Idle;
        }
    }

    fn start_respond(&mut self, trigger: Trigger) {
        debug_assert!(self.active.is_none());
        let cancel = CancellationToken::new();
        let handle = {
            let pipeline = Arc::clone(&self.pipeline);
            let cancel = cancel.clone();
            tokio::spawn(async move { pipeline.respond(trigger, cancel).await })
        };
        self.active = Some(ActiveResponse { cancel, handle });
        self.state = SessionState::Responding;
        tracing::debug!(state = ?self.state, "response started");
    }

    /// Speaks the opening greeting. Events arriving meanwhile queue in the
    /// mailbox; the session enters `Idle` once the greeting is done.
    async fn speak_greeting(&self) {
        let (tx, rx) = mpsc::channel(1);
        if tx.send(self.greeting.clone()).await.is_err() {
            return;
        }
        drop(tx);
        match self
            .synthesizer
            .speak(rx, self.shutdown.child_token())
            .await
        {
            Ok(_) => tracing::debug!("greeting spoken"),
            Err(e) => tracing::warn!(error = %e, "failed to speak the greeting"),
        }
    }
}

fn log_respond_result(joined: Result<Result<RespondOutcome, PipelineError>, JoinError>) {
    match joined {
        Ok(Ok(RespondOutcome::Completed)) => tracing::debug!("response completed"),
        Ok(Ok(RespondOutcome::Interrupted)) => tracing::debug!("response interrupted"),
        Ok(Err(e)) => tracing::error!(error = %e, "response failed"),
        Err(e) => tracing::error!(error = %e, "response task aborted"),
    }
}

const TRACK_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Copies every frame of every published video track into the cache until
/// `stop` fires. Waits for tracks are bounded by `track_wait` and simply
/// re-entered, so a late-joining or reconnecting participant is picked up.
fn spawn_frame_reader(
    video: Arc<dyn VideoSource>,
    frames: Arc<VisionFrameCache>,
    stop: CancellationToken,
    track_wait: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let subscribed = tokio::select! {
                () = stop.cancelled() => return,
                subscribed = tokio::time::timeout(track_wait, video.subscribe()) => subscribed,
            };
            let mut track = match subscribed {
                Ok(Ok(track)) => track,
                Ok(Err(TransportError::Closed)) => {
                    tracing::info!("video transport closed, stopping frame reader");
                    return;
                }
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "video track not available, retrying");
                    tokio::time::sleep(TRACK_RETRY_DELAY).await;
                    continue;
                }
                Err(_) => {
                    tracing::debug!("timed out waiting for a video track, retrying");
                    continue;
                }
            };
            tracing::info!("video track acquired");

            loop {
                tokio::select! {
                    () = stop.cancelled() => return,
                    frame = track.next() => match frame {
                        Some(frame) => frames.set(frame),
                        None => {
                            tracing::info!("video track ended, waiting for a new one");
                            break;
                        }
                    },
                }
            }
        }
    })
}
