//! Gapless playback scheduling
//!
//! Agent audio arrives as independent PCM16 chunks of unknown total length.
//! Each chunk is scheduled to start where the previous one ends, unless the
//! output has already played past that point, in which case it starts now.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::codec;
use crate::error::Result;

/// Decoded audio ready to hand to an output context.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayableBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlayableBuffer {
    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }
}

/// An audio output with its own monotonic clock, in seconds.
pub trait OutputContext: Send {
    fn current_time(&self) -> f64;

    fn is_suspended(&self) -> bool;

    fn resume(&mut self) -> Result<()>;

    /// Queue `buffer` to start playing at `start` on this context's clock.
    fn schedule(&mut self, buffer: PlayableBuffer, start: f64) -> Result<()>;

    /// Release the device. Already scheduled audio may finish playing.
    fn close(&mut self) -> Result<()>;
}

/// Creates output contexts on first use.
pub trait OutputContextFactory: Send + Sync {
    fn create(&self, sample_rate: u32) -> Result<Box<dyn OutputContext>>;
}

/// Where a chunk landed on the output timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSpan {
    pub start: f64,
    pub end: f64,
}

pub struct PlaybackScheduler {
    factory: Arc<dyn OutputContextFactory>,
    context: Option<Box<dyn OutputContext>>,
    sample_rate: u32,
    /// End of already-scheduled audio on the context clock.
    cursor: f64,
}

impl PlaybackScheduler {
    pub fn new(factory: Arc<dyn OutputContextFactory>, sample_rate: u32) -> Self {
        Self {
            factory,
            context: None,
            sample_rate,
            cursor: 0.0,
        }
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn is_open(&self) -> bool {
        self.context.is_some()
    }

    /// Decode one PCM16 chunk and schedule it right after the audio already
    /// queued, or now if playback has starved.
    pub fn enqueue(&mut self, chunk: &[u8]) -> Result<Option<ScheduledSpan>> {
        let samples = codec::decode_chunk(chunk);
        if samples.is_empty() {
            debug!("Ignoring empty audio chunk");
            return Ok(None);
        }
        let buffer = PlayableBuffer { samples, sample_rate: self.sample_rate };

        let context = match self.context.take() {
            Some(context) => context,
            None => {
                info!("Opening audio output at {} Hz", self.sample_rate);
                self.factory.create(self.sample_rate)?
            }
        };
        let context = self.context.insert(context);
        if context.is_suspended() {
            debug!("Resuming suspended output context");
            context.resume()?;
        }

        let now = context.current_time();
        if self.cursor < now {
            debug!(behind = now - self.cursor, "Playback underrun, snapping cursor to now");
        }
        let start = self.cursor.max(now);
        let duration = buffer.duration();
        context.schedule(buffer, start)?;

        self.cursor = start + duration;
        Ok(Some(ScheduledSpan { start, end: self.cursor }))
    }

    /// Close the output context and rewind the cursor.
    pub fn close(&mut self) {
        if let Some(mut context) = self.context.take() {
            if let Err(e) = context.close() {
                warn!("Failed to close output context: {}", e);
            }
        }
        self.cursor = 0.0;
    }
}
