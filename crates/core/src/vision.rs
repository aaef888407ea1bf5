use bytes::Bytes;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// A single encoded video frame captured from the remote participant's feed.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    data: Bytes,
    mime: &'static str,
    captured_at: Instant,
}

impl VideoFrame {
    pub fn new(data: Bytes, mime: &'static str) -> Self {
        Self {
            data,
            mime,
            captured_at: Instant::now(),
        }
    }

    pub fn jpeg(data: Bytes) -> Self {
        Self::new(data, "image/jpeg")
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn mime(&self) -> &'static str {
        self.mime
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }
}

/// Single-slot holder for the most recent video frame.
///
/// The frame reader overwrites the slot on every decoded frame; the response
/// pipeline reads it on demand when attaching visual context. Last write
/// wins, no history is kept, and a reader always observes a complete frame.
#[derive(Debug, Default)]
pub struct VisionFrameCache {
    slot: RwLock<Option<Arc<VideoFrame>>>,
}

impl VisionFrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the held frame. Never blocks the writer on readers for
    /// longer than an Arc clone.
    pub fn set(&self, frame: VideoFrame) {
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::new(frame));
    }

    /// Returns the currently held frame, or `None` if no frame has ever
    /// been cached.
    pub fn get(&self) -> Option<Arc<VideoFrame>> {
        self.slot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_empty(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(byte: u8) -> VideoFrame {
        VideoFrame::jpeg(Bytes::from(vec![byte; 16]))
    }

    #[test]
    fn empty_until_first_set() {
        let cache = VisionFrameCache::new();
        assert!(cache.is_empty());
        assert!(cache.get().is_none());
    }

    #[test]
    fn get_returns_last_written_frame() {
        let cache = VisionFrameCache::new();
        cache.set(frame(1));
        cache.set(frame(2));

        let held = cache.get().expect("cache should hold a frame");
        assert_eq!(held.data()[0], 2);
        assert_eq!(held.mime(), "image/jpeg");
    }

    #[test]
    fn readers_keep_their_snapshot_across_overwrites() {
        let cache = VisionFrameCache::new();
        cache.set(frame(7));
        let snapshot = cache.get().expect("cache should hold a frame");

        cache.set(frame(8));
        // The old Arc is still intact even though the slot moved on.
        assert_eq!(snapshot.data()[0], 7);
        assert_eq!(cache.get().expect("frame").data()[0], 8);
    }

    #[test]
    fn concurrent_writer_and_readers() {
        let cache = Arc::new(VisionFrameCache::new());

        let writer = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for i in 0..1000u32 {
                    cache.set(frame((i % 256) as u8));
                }
            })
        };
        let reader = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    if let Some(frame) = cache.get() {
                        // Every observed frame is complete, never torn.
                        assert_eq!(frame.data().len(), 16);
                    }
                }
            })
        };

        writer.join().expect("writer thread");
        reader.join().expect("reader thread");
    }
}
