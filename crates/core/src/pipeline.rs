use crate::conversation::{ChatMessage, ContentPart, ConversationState, InvariantViolation};
use crate::functions::FunctionCallBroker;
use crate::model::{LanguageModel, ModelError, ReplyFragment};
use crate::sentence::SentenceBuffer;
use crate::speech::{SpeechError, SpeechOutcome, SpeechSynthesizer};
use crate::vision::VisionFrameCache;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// What caused a response: a user utterance, or a completed function call
/// that asked for the current frame to be attached.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub text: String,
    pub use_image: bool,
}

impl Trigger {
    pub fn chat(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            use_image: false,
        }
    }

    pub fn vision(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            use_image: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespondOutcome {
    /// The reply was generated and spoken to the end.
    Completed,
    /// A fresh trigger cancelled this run; no assistant turn was recorded.
    Interrupted,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Speech(#[from] SpeechError),
    #[error(transparent)]
    History(#[from] InvariantViolation),
}

const SEGMENT_CHANNEL_CAPACITY: usize = 32;

/// Turns a trigger into a model call, a streamed reply, and spoken output.
///
/// At most one `respond` runs at a time; the orchestrator's interruption
/// logic enforces this, so appends to the conversation are effectively
/// serialized.
pub struct ResponsePipeline {
    conversation: Arc<Mutex<ConversationState>>,
    frames: Arc<VisionFrameCache>,
    broker: Arc<FunctionCallBroker>,
    model: Arc<dyn LanguageModel>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
}

impl ResponsePipeline {
    pub fn new(
        conversation: Arc<Mutex<ConversationState>>,
        frames: Arc<VisionFrameCache>,
        broker: Arc<FunctionCallBroker>,
        model: Arc<dyn LanguageModel>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
    ) -> Self {
        Self {
            conversation,
            frames,
            broker,
            model,
            synthesizer,
        }
    }

    /// Produces and speaks a reply to `trigger`.
    ///
    /// Cancelling `cancel` stops fragment consumption and silences the
    /// synthesizer; the already-spoken prefix stands, but no assistant turn
    /// is appended for an interrupted run. A model failure aborts the
    /// trigger, leaving the history with just the appended user turn.
    pub async fn respond(
        &self,
        trigger: Trigger,
        cancel: CancellationToken,
    ) -> Result<RespondOutcome, PipelineError> {
        let mut content = vec![ContentPart::text(trigger.text.as_str())];
        if trigger.use_image {
            match self.frames.get() {
                Some(frame) => content.push(ContentPart::image(frame)),
                None => {
                    tracing::debug!("no frame cached yet, responding without visual context");
                }
            }
        }

        let history = {
            let mut conversation = self.conversation.lock().await;
            conversation.append(ChatMessage::user(content))?;
            conversation.snapshot()
        };

        let mut reply = self
            .model
            .stream_reply(history, self.broker.describe_all())
            .await?;

        // The synthesizer runs beside fragment consumption so speech starts
        // before the model finishes generating. It watches a child token:
        // an upstream cancel reaches it, and a stream failure lets us stop
        // playback without touching the caller's token.
        let (segment_tx, segment_rx) = mpsc::channel(SEGMENT_CHANNEL_CAPACITY);
        let speech_cancel = cancel.child_token();
        let speech = {
            let synthesizer = Arc::clone(&self.synthesizer);
            let speech_cancel = speech_cancel.clone();
            tokio::spawn(async move { synthesizer.speak(segment_rx, speech_cancel).await })
        };

        let buffered = self.synthesizer.requires_full_sentences();
        let mut sentences = SentenceBuffer::new();
        let mut transcript = String::new();
        let mut interrupted = false;
        let mut stream_error: Option<ModelError> = None;

        loop {
            let fragment = tokio::select! {
                () = cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                fragment = reply.next() => fragment,
            };
            match fragment {
                None => break,
                Some(Err(e)) => {
                    stream_error = Some(e);
                    break;
                }
                Some(Ok(ReplyFragment::Text(text))) => {
                    transcript.push_str(&text);
                    let segments = if buffered {
                        sentences.push(&text)
                    } else {
                        vec![text]
                    };
                    for segment in segments {
                        if segment_tx.send(segment).await.is_err() {
                            // Synthesizer bailed out; keep consuming so the
                            // transcript stays complete.
                            break;
                        }
                    }
                }
                Some(Ok(ReplyFragment::FunctionCall { name, arguments })) => {
                    if let Err(e) = self.broker.invoke(&name, arguments).await {
                        tracing::warn!(error = %e, "dropping malformed model function call");
                    }
                }
            }
        }

        if interrupted || stream_error.is_some() {
            speech_cancel.cancel();
        } else if buffered {
            if let Some(rest) = sentences.flush() {
                let _ = segment_tx.send(rest).await;
            }
        }
        drop(segment_tx);

        let speech_outcome = match speech.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                if interrupted {
                    SpeechOutcome::Cancelled
                } else {
                    return Err(e.into());
                }
            }
            Err(e) => {
                return Err(SpeechError(format!("synthesis task aborted: {e}")).into());
            }
        };

        if let Some(e) = stream_error {
            return Err(e.into());
        }
        if interrupted || cancel.is_cancelled() || speech_outcome == SpeechOutcome::Cancelled {
            return Ok(RespondOutcome::Interrupted);
        }

        if !transcript.is_empty() {
            self.conversation
                .lock()
                .await
                .append(ChatMessage::assistant(transcript))?;
        }
        Ok(RespondOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionEvent;
    use crate::conversation::Role;
    use crate::functions::vision_function_spec;
    use crate::functions::VisionRequestHandler;
    use crate::model::{MockLanguageModel, ReplyStream};
    use crate::speech::MockSpeechSynthesizer;
    use crate::vision::VideoFrame;
    use bytes::Bytes;
    use std::sync::Mutex as StdMutex;

    fn text_stream(fragments: Vec<&str>) -> ReplyStream {
        let items: Vec<Result<ReplyFragment, ModelError>> = fragments
            .into_iter()
            .map(|text| Ok(ReplyFragment::Text(text.to_owned())))
            .collect();
        Box::pin(futures::stream::iter(items))
    }

    /// A synthesizer mock that drains segments into `spoken` and honours
    /// cancellation the way a real backend would.
    fn draining_synthesizer(
        spoken: Arc<StdMutex<Vec<String>>>,
        full_sentences: bool,
    ) -> MockSpeechSynthesizer {
        let mut synthesizer = MockSpeechSynthesizer::new();
        synthesizer
            .expect_requires_full_sentences()
            .return_const(full_sentences);
        synthesizer.expect_speak().returning(move |mut rx, cancel| {
            let spoken = Arc::clone(&spoken);
            Box::pin(async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(SpeechOutcome::Cancelled),
                        segment = rx.recv() => match segment {
                            None => return Ok(SpeechOutcome::Completed),
                            Some(segment) => spoken
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .push(segment),
                        },
                    }
                }
            })
        });
        synthesizer
    }

    struct Fixture {
        pipeline: ResponsePipeline,
        conversation: Arc<Mutex<ConversationState>>,
        frames: Arc<VisionFrameCache>,
        completions: mpsc::Receiver<SessionEvent>,
    }

    fn fixture(model: MockLanguageModel, synthesizer: MockSpeechSynthesizer) -> Fixture {
        let conversation = Arc::new(Mutex::new(ConversationState::new("system prompt")));
        let frames = Arc::new(VisionFrameCache::new());
        let (tx, completions) = mpsc::channel(4);
        let mut broker = FunctionCallBroker::new(tx);
        broker.register(vision_function_spec(), Arc::new(VisionRequestHandler));

        let pipeline = ResponsePipeline::new(
            Arc::clone(&conversation),
            Arc::clone(&frames),
            Arc::new(broker),
            Arc::new(model),
            Arc::new(synthesizer),
        );
        Fixture {
            pipeline,
            conversation,
            frames,
            completions,
        }
    }

    #[tokio::test]
    async fn successful_reply_is_spoken_and_recorded() {
        let mut model = MockLanguageModel::new();
        model
            .expect_stream_reply()
            .times(1)
            .returning(|_, _| Box::pin(async { Ok(text_stream(vec!["Hi ", "there."])) }));
        let spoken = Arc::new(StdMutex::new(Vec::new()));
        let fixture = fixture(model, draining_synthesizer(Arc::clone(&spoken), false));

        let outcome = fixture
            .pipeline
            .respond(Trigger::chat("hello"), CancellationToken::new())
            .await
            .expect("respond succeeds");
        assert_eq!(outcome, RespondOutcome::Completed);

        let history = fixture.conversation.lock().await.snapshot();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].role(), Role::User);
        assert_eq!(history[1].text(), "hello");
        assert_eq!(history[2].role(), Role::Assistant);
        assert_eq!(history[2].text(), "Hi there.");

        let spoken = spoken.lock().expect("spoken segments").clone();
        assert_eq!(spoken, vec!["Hi ".to_owned(), "there.".to_owned()]);
    }

    #[tokio::test]
    async fn sentence_buffering_feeds_whole_sentences() {
        let mut model = MockLanguageModel::new();
        model.expect_stream_reply().times(1).returning(|_, _| {
            Box::pin(async { Ok(text_stream(vec!["Hel", "lo. Wor", "ld! And more"])) })
        });
        let spoken = Arc::new(StdMutex::new(Vec::new()));
        let fixture = fixture(model, draining_synthesizer(Arc::clone(&spoken), true));

        fixture
            .pipeline
            .respond(Trigger::chat("hi"), CancellationToken::new())
            .await
            .expect("respond succeeds");

        let spoken = spoken.lock().expect("spoken segments").clone();
        assert_eq!(
            spoken,
            vec![
                "Hello.".to_owned(),
                "World!".to_owned(),
                "And more".to_owned()
            ]
        );
    }

    #[tokio::test]
    async fn vision_trigger_attaches_the_cached_frame() {
        let mut model = MockLanguageModel::new();
        model
            .expect_stream_reply()
            .withf(|history, _| {
                let last = history.last().expect("history has the user turn");
                last.role() == Role::User && last.has_image() && last.text() == "what is this"
            })
            .times(1)
            .returning(|_, _| Box::pin(async { Ok(text_stream(vec!["A mug."])) }));
        let spoken = Arc::new(StdMutex::new(Vec::new()));
        let fixture = fixture(model, draining_synthesizer(spoken, false));

        fixture
            .frames
            .set(VideoFrame::jpeg(Bytes::from_static(b"\xff\xd8frame")));
        fixture
            .pipeline
            .respond(Trigger::vision("what is this"), CancellationToken::new())
            .await
            .expect("respond succeeds");
    }

    #[tokio::test]
    async fn vision_trigger_with_empty_cache_attaches_nothing() {
        let mut model = MockLanguageModel::new();
        model
            .expect_stream_reply()
            .withf(|history, _| {
                let last = history.last().expect("history has the user turn");
                !last.has_image()
            })
            .times(1)
            .returning(|_, _| Box::pin(async { Ok(text_stream(vec!["I cannot see yet."])) }));
        let spoken = Arc::new(StdMutex::new(Vec::new()));
        let fixture = fixture(model, draining_synthesizer(spoken, false));

        let outcome = fixture
            .pipeline
            .respond(
                Trigger::vision("describe what you see"),
                CancellationToken::new(),
            )
            .await
            .expect("an empty cache is not an error");
        assert_eq!(outcome, RespondOutcome::Completed);
    }

    #[tokio::test]
    async fn model_failure_leaves_only_the_user_turn() {
        let mut model = MockLanguageModel::new();
        model.expect_stream_reply().times(1).returning(|_, _| {
            Box::pin(async { Err(ModelError::RequestFailed("backend down".into())) })
        });
        let synthesizer = MockSpeechSynthesizer::new();
        let fixture = fixture(model, synthesizer);

        let err = fixture
            .pipeline
            .respond(Trigger::chat("hello"), CancellationToken::new())
            .await
            .expect_err("model failure aborts the trigger");
        assert!(matches!(err, PipelineError::Model(_)));

        let history = fixture.conversation.lock().await.snapshot();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role(), Role::User);
    }

    #[tokio::test]
    async fn cancellation_suppresses_the_assistant_turn() {
        let mut model = MockLanguageModel::new();
        model.expect_stream_reply().times(1).returning(|_, _| {
            Box::pin(async {
                // One fragment, then generation stalls until cancelled.
                let stream = futures::stream::iter(vec![Ok(ReplyFragment::Text(
                    "I was about to say".to_owned(),
                ))])
                .chain(futures::stream::pending());
                Ok(Box::pin(stream) as ReplyStream)
            })
        });
        let spoken = Arc::new(StdMutex::new(Vec::new()));
        let fixture = fixture(model, draining_synthesizer(Arc::clone(&spoken), false));

        let cancel = CancellationToken::new();
        let respond = {
            let cancel = cancel.clone();
            let pipeline = fixture.pipeline;
            tokio::spawn(async move { pipeline.respond(Trigger::chat("question"), cancel).await })
        };

        // Let the pipeline reach the stalled stream, then interrupt.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();
        let outcome = respond
            .await
            .expect("task joins")
            .expect("cancellation is not an error");
        assert_eq!(outcome, RespondOutcome::Interrupted);

        let history = fixture.conversation.lock().await.snapshot();
        assert_eq!(history.len(), 2, "no assistant turn for an interrupted run");
        assert_eq!(history[1].role(), Role::User);
    }

    #[tokio::test]
    async fn function_call_fragment_reaches_the_broker() {
        let mut model = MockLanguageModel::new();
        model.expect_stream_reply().times(1).returning(|_, _| {
            Box::pin(async {
                let stream = futures::stream::iter(vec![Ok(ReplyFragment::FunctionCall {
                    name: "image".to_owned(),
                    arguments: serde_json::json!({"user_msg": "what is this"}),
                })]);
                Ok(Box::pin(stream) as ReplyStream)
            })
        });
        let spoken = Arc::new(StdMutex::new(Vec::new()));
        let mut fixture = fixture(model, draining_synthesizer(spoken, false));

        let outcome = fixture
            .pipeline
            .respond(Trigger::chat("look at this"), CancellationToken::new())
            .await
            .expect("respond succeeds");
        // A call-only reply has no transcript, so no assistant turn.
        assert_eq!(outcome, RespondOutcome::Completed);
        assert_eq!(fixture.conversation.lock().await.len(), 2);

        match fixture
            .completions
            .try_recv()
            .expect("completion forwarded")
        {
            SessionEvent::FunctionCallCompleted { name, arguments } => {
                assert_eq!(name, "image");
                assert_eq!(arguments["user_msg"], "what is this");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_function_call_is_dropped_quietly() {
        let mut model = MockLanguageModel::new();
        model.expect_stream_reply().times(1).returning(|_, _| {
            Box::pin(async {
                let stream = futures::stream::iter(vec![Ok(ReplyFragment::FunctionCall {
                    name: "image".to_owned(),
                    arguments: serde_json::json!({}),
                })]);
                Ok(Box::pin(stream) as ReplyStream)
            })
        });
        let spoken = Arc::new(StdMutex::new(Vec::new()));
        let mut fixture = fixture(model, draining_synthesizer(spoken, false));

        fixture
            .pipeline
            .respond(Trigger::chat("look"), CancellationToken::new())
            .await
            .expect("a malformed call does not fail the response");
        assert!(fixture.completions.try_recv().is_err());
    }
}
