//! Audio output path for spoken replies.
//!
//! Synthesized PCM is resampled to the output device's rate and pushed
//! into a shared ring buffer; a cpal output stream drains it on the audio
//! thread. Cancellation works through [`AudioOutputHandle::silence`], which
//! makes the callback discard everything still queued.

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FrameCount, StreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapProd, HeapRb};
use rubato::{FastFixedIn, PolynomialDegree};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sample rate of the raw PCM16 audio the speech endpoint returns.
pub const SPEECH_PCM_SAMPLE_RATE: f64 = 24_000.0;
/// Fixed buffer size for the output stream.
pub const OUTPUT_CHUNK_SIZE: usize = 1024;
/// Input chunk size for the resampler.
pub const RESAMPLE_CHUNK_SIZE: usize = 1024;
/// How much audio the ring buffer holds.
pub const OUTPUT_LATENCY_MS: usize = 1000;

const BACKPRESSURE_POLL: Duration = Duration::from_millis(10);
const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> Result<FastFixedIn<f32>> {
    FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )
    .context("failed to create resampler")
}

/// Splits samples into fixed-size chunks, zero-padding the last one.
pub fn split_for_chunks(samples: &[f32], chunk_size: usize) -> Vec<Vec<f32>> {
    samples
        .chunks(chunk_size)
        .map(|chunk| {
            let mut chunk = chunk.to_vec();
            chunk.resize(chunk_size, 0.0);
            chunk
        })
        .collect()
}

/// Decodes little-endian PCM16 bytes into normalized f32 samples.
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| {
            let v = i16::from_le_bytes([chunk[0], chunk[1]]);
            (v as f32 / 32768.0).clamp(-1.0, 1.0)
        })
        .collect()
}

/// Producer side of the playback path, shared with the synthesizer.
pub struct AudioOutputHandle {
    producer: Mutex<HeapProd<f32>>,
    flush: Arc<AtomicBool>,
    sample_rate: f64,
}

impl AudioOutputHandle {
    /// The output device's sample rate, for resampler setup.
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Queues samples for playback, waiting for buffer space as needed.
    /// Returns false if `cancel` fired before everything was queued.
    pub async fn push(&self, samples: &[f32], cancel: &CancellationToken) -> bool {
        let mut offset = 0;
        while offset < samples.len() {
            if cancel.is_cancelled() {
                return false;
            }
            let wrote = {
                let mut producer = self.producer.lock().unwrap_or_else(|e| e.into_inner());
                producer.push_slice(&samples[offset..])
            };
            offset += wrote;
            if offset < samples.len() {
                tokio::time::sleep(BACKPRESSURE_POLL).await;
            }
        }
        true
    }

    /// Waits until everything queued has been played. Returns false if
    /// `cancel` fired first.
    pub async fn drain(&self, cancel: &CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let pending = self
                .producer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .occupied_len();
            if pending == 0 {
                return true;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    /// Tells the audio callback to discard everything still queued. This is
    /// what makes an interruption fall silent immediately rather than after
    /// the buffered tail.
    pub fn silence(&self) {
        self.flush.store(true, Ordering::Release);
    }
}

/// Opens the default output device and starts the playback stream.
///
/// The returned `cpal::Stream` must stay alive for playback to continue;
/// it is not `Send`, so the caller keeps it on the main task while the
/// handle travels into the synthesizer.
pub fn start_output(latency_ms: usize) -> Result<(Arc<AudioOutputHandle>, cpal::Stream)> {
    let device = cpal::default_host()
        .default_output_device()
        .context("no default audio output device")?;
    tracing::info!(name = ?device.name(), "using audio output device");

    let default_config = device
        .default_output_config()
        .context("failed to get default output config")?;
    let config = StreamConfig {
        channels: default_config.channels(),
        sample_rate: default_config.sample_rate(),
        buffer_size: cpal::BufferSize::Fixed(FrameCount::from(OUTPUT_CHUNK_SIZE as u32)),
    };
    let channel_count = config.channels as usize;
    let sample_rate = config.sample_rate.0 as f64;
    tracing::info!("output stream config: {:?}", &config);

    let buffer = HeapRb::<f32>::new(sample_rate as usize * latency_ms / 1000);
    let (producer, mut consumer) = buffer.split();
    let flush = Arc::new(AtomicBool::new(false));

    let flush_flag = Arc::clone(&flush);
    let output_data_fn = move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
        if flush_flag.swap(false, Ordering::AcqRel) {
            while consumer.try_pop().is_some() {}
        }
        for frame in data.chunks_mut(channel_count) {
            let sample = consumer.try_pop().unwrap_or(0.0);
            // Mono source: duplicate onto left/right, zero the rest.
            for (index, slot) in frame.iter_mut().enumerate() {
                *slot = if index < 2 { sample } else { 0.0 };
            }
        }
    };

    let stream = device
        .build_output_stream(
            &config,
            output_data_fn,
            move |err| tracing::error!("an error occurred on the output stream: {err}"),
            None,
        )
        .context("failed to build output stream")?;
    stream.play().context("failed to start output stream")?;

    let handle = Arc::new(AudioOutputHandle {
        producer: Mutex::new(producer),
        flush,
        sample_rate,
    });
    Ok((handle, stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm16_decodes_and_normalizes() {
        // 0, i16::MAX, i16::MIN as little-endian pairs.
        let bytes = [0x00, 0x00, 0xff, 0x7f, 0x00, 0x80];
        let samples = pcm16_to_f32(&bytes);
        assert_eq!(samples.len(), 3);
        assert!(samples[0].abs() < f32::EPSILON);
        assert!((samples[1] - (i16::MAX as f32 / 32768.0)).abs() < 1e-6);
        assert!((samples[2] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn pcm16_ignores_a_trailing_odd_byte() {
        let samples = pcm16_to_f32(&[0x00, 0x00, 0x01]);
        assert_eq!(samples.len(), 1);
    }

    #[test]
    fn chunks_are_padded_to_size() {
        let chunks = split_for_chunks(&[1.0; 5], 4);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], vec![1.0; 4]);
        assert_eq!(chunks[1], vec![1.0, 0.0, 0.0, 0.0]);
    }
}
