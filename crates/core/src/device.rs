//! Audio device seams.
//!
//! The engine never talks to hardware directly. Native clients implement
//! these traits over their audio stack; tests use in-memory fakes.

use tokio::sync::mpsc;

use crate::error::VoiceResult;

pub type UnitId = u64;

/// A block of decoded audio placed at an exact position on the output
/// device's timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackUnit {
    pub id: UnitId,
    /// Start time in seconds on the device clock.
    pub start_at: f64,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlaybackUnit {
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration()
    }
}

pub trait OutputDevice: Send {
    /// The device's own clock in seconds. Monotonic.
    fn current_time(&self) -> f64;
    fn schedule(&mut self, unit: PlaybackUnit) -> VoiceResult<()>;
    /// Ramps the unit's gain to zero over `ramp` seconds, then drops it.
    fn fade_out(&mut self, id: UnitId, ramp: f64);
    /// Drops a unit that has not started yet.
    fn cancel(&mut self, id: UnitId);
    /// Releases the device without blocking. Safe to call more than once.
    fn close(&mut self);
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// One fixed-size frame of mono samples at the requested rate.
    Frame(Vec<f32>),
    /// The device went away mid-stream.
    Lost(String),
}

pub trait InputStream: Send {
    /// Stops capturing without blocking; the device may be released shortly
    /// after. Safe to call more than once.
    fn close(&mut self);
}

/// Opens the platform's audio devices. Opening may block while the device
/// starts, so the engine only calls these on the blocking pool.
pub trait AudioBackend: Send + Sync {
    fn open_input(
        &self,
        sample_rate: u32,
        frame_samples: usize,
        sink: mpsc::Sender<CaptureEvent>,
    ) -> VoiceResult<Box<dyn InputStream>>;

    fn open_output(&self, sample_rate: u32) -> VoiceResult<Box<dyn OutputDevice>>;
}
