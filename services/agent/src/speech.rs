//! Speech-synthesis adapter: HTTP TTS plus local playback.
//!
//! Each sentence handed over by the response pipeline is synthesized
//! through the `/audio/speech` endpoint as raw PCM16, resampled to the
//! output device's rate, and queued on the shared ring buffer. The
//! cancellation token is checked at every stage so an interruption stops
//! both synthesis and playback promptly.

use crate::audio::{
    self, AudioOutputHandle, RESAMPLE_CHUNK_SIZE, SPEECH_PCM_SAMPLE_RATE,
};
use crate::config::Config;
use argus_core::speech::{SpeechError, SpeechOutcome, SpeechSynthesizer};
use async_trait::async_trait;
use rubato::Resampler;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct SpeakerSynthesizer {
    client: reqwest::Client,
    api_key: String,
    model: String,
    voice: String,
    api_base: String,
    output: Arc<AudioOutputHandle>,
}

impl SpeakerSynthesizer {
    pub fn new(client: reqwest::Client, config: &Config, output: Arc<AudioOutputHandle>) -> Self {
        Self {
            client,
            api_key: config.openai_api_key.clone(),
            model: config.speech_model.clone(),
            voice: config.speech_voice.clone(),
            api_base: config.api_base.clone(),
            output,
        }
    }

    fn cancelled(&self) -> Result<SpeechOutcome, SpeechError> {
        self.output.silence();
        Ok(SpeechOutcome::Cancelled)
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<f32>, SpeechError> {
        let body = serde_json::json!({
            "model": self.model,
            "voice": self.voice,
            "input": text,
            "response_format": "pcm",
        });
        let response = self
            .client
            .post(format!("{}/audio/speech", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SpeechError(format!("tts request failed: {e}")))?
            .error_for_status()
            .map_err(|e| SpeechError(format!("tts request rejected: {e}")))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SpeechError(format!("tts body read failed: {e}")))?;
        Ok(audio::pcm16_to_f32(&bytes))
    }

    async fn play(&self, pcm: &[f32], cancel: &CancellationToken) -> Result<bool, SpeechError> {
        let mut resampler = audio::create_resampler(
            SPEECH_PCM_SAMPLE_RATE,
            self.output.sample_rate(),
            RESAMPLE_CHUNK_SIZE,
        )
        .map_err(|e| SpeechError(format!("resampler init failed: {e}")))?;

        for chunk in audio::split_for_chunks(pcm, RESAMPLE_CHUNK_SIZE) {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            let resampled = resampler
                .process(&[chunk.as_slice()], None)
                .map_err(|e| SpeechError(format!("resampling failed: {e}")))?;
            if let Some(resampled) = resampled.first() {
                if !self.output.push(resampled, cancel).await {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl SpeechSynthesizer for SpeakerSynthesizer {
    // The HTTP endpoint synthesizes an utterance per request, so partial
    // text would come out as disjointed speech.
    fn requires_full_sentences(&self) -> bool {
        true
    }

    async fn speak(
        &self,
        mut segments: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) -> Result<SpeechOutcome, SpeechError> {
        loop {
            let segment = tokio::select! {
                () = cancel.cancelled() => return self.cancelled(),
                segment = segments.recv() => match segment {
                    None => break,
                    Some(segment) => segment,
                },
            };
            tracing::debug!(segment = %segment, "synthesizing segment");

            let pcm = tokio::select! {
                () = cancel.cancelled() => return self.cancelled(),
                pcm = self.synthesize(&segment) => pcm?,
            };
            if !self.play(&pcm, &cancel).await? {
                return self.cancelled();
            }
        }

        // All segments queued; wait for the device to finish them.
        if !self.output.drain(&cancel).await {
            return self.cancelled();
        }
        Ok(SpeechOutcome::Completed)
    }
}
