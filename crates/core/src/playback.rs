//! Gapless scheduling of AI speech.
//!
//! Chunks are queued in arrival order and placed back to back on the output
//! device's own clock, each starting exactly where the previous one ends. The
//! engine calls [`PlaybackScheduler::pump`] on every inbound chunk and on a
//! short tick while anything is pending or playing; the look-ahead bound
//! keeps the amount of audio committed to the device small so a barge-in can
//! cut it off quickly.

use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace};

use crate::audio_utils::pcm16_le_to_f32;
use crate::device::{OutputDevice, PlaybackUnit, UnitId};
use crate::error::VoiceResult;

#[derive(Debug, Clone, Copy)]
struct ScheduledUnit {
    id: UnitId,
    start: f64,
    end: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PumpReport {
    /// Units handed to the device by this call.
    pub scheduled: usize,
    /// Chunks are still queued or units are still playing.
    pub active: bool,
    /// Playback that was running has just finished.
    pub drained: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    pub was_playing: bool,
    pub dropped_chunks: usize,
    /// The generation that is current after the stop.
    pub generation: u64,
}

#[derive(Debug)]
pub struct PlaybackScheduler {
    queue: VecDeque<Bytes>,
    units: Vec<ScheduledUnit>,
    next_start: Option<f64>,
    generation: u64,
    next_unit_id: UnitId,
    sample_rate: u32,
    lookahead: f64,
    stop_fade: f64,
    interruption_fade: f64,
    in_burst: bool,
}

impl PlaybackScheduler {
    pub fn new(
        sample_rate: u32,
        lookahead: Duration,
        stop_fade: Duration,
        interruption_fade: Duration,
    ) -> Self {
        Self {
            queue: VecDeque::new(),
            units: Vec::new(),
            next_start: None,
            generation: 0,
            next_unit_id: 1,
            sample_rate,
            lookahead: lookahead.as_secs_f64(),
            stop_fade: stop_fade.as_secs_f64(),
            interruption_fade: interruption_fade.as_secs_f64(),
            in_burst: false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn enqueue(&mut self, chunk: Bytes) {
        if chunk.len() < 2 {
            return;
        }
        self.queue.push_back(chunk);
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_playing(&self, now: f64) -> bool {
        self.units.iter().any(|unit| unit.end > now)
    }

    pub fn is_active(&self, now: f64) -> bool {
        !self.queue.is_empty() || self.is_playing(now)
    }

    /// Schedules as many queued chunks as fit inside the look-ahead window.
    pub fn pump(&mut self, device: &mut dyn OutputDevice) -> VoiceResult<PumpReport> {
        let now = device.current_time();
        self.units.retain(|unit| unit.end > now);

        let mut scheduled = 0;
        while let Some(chunk) = self.queue.front() {
            // An underrun leaves next_start in the past; resume at the device clock.
            let start = self.next_start.map_or(now, |next| next.max(now));
            if start > now + self.lookahead {
                break;
            }
            let samples = pcm16_le_to_f32(chunk);
            self.queue.pop_front();

            let id = self.next_unit_id;
            self.next_unit_id += 1;
            let unit = PlaybackUnit {
                id,
                start_at: start,
                samples,
                sample_rate: self.sample_rate,
            };
            let end = unit.end_at();
            device.schedule(unit)?;
            trace!(unit = id, start, end, "scheduled playback unit");

            self.units.push(ScheduledUnit { id, start, end });
            self.next_start = Some(end);
            scheduled += 1;
        }

        if scheduled > 0 {
            self.in_burst = true;
        }
        let active = self.is_active(now);
        let drained = self.in_burst && !active;
        if drained {
            self.in_burst = false;
            self.next_start = None;
        }

        Ok(PumpReport {
            scheduled,
            active,
            drained,
        })
    }

    /// Stops all audio. Units already audible fade out, units not yet started
    /// are dropped, and the queue is emptied. A no-op on the device when
    /// nothing is scheduled.
    pub fn stop_all(&mut self, is_interruption: bool, device: &mut dyn OutputDevice) -> StopReport {
        self.generation += 1;
        let dropped_chunks = self.queue.len();
        self.queue.clear();

        let now = device.current_time();
        let ramp = if is_interruption {
            self.interruption_fade
        } else {
            self.stop_fade
        };
        let mut was_playing = false;
        for unit in self.units.drain(..) {
            if unit.end <= now {
                continue;
            }
            was_playing = true;
            if unit.start <= now {
                device.fade_out(unit.id, ramp);
            } else {
                device.cancel(unit.id);
            }
        }
        self.next_start = None;
        self.in_burst = false;

        debug!(
            generation = self.generation,
            dropped_chunks, was_playing, is_interruption, "playback stopped"
        );
        StopReport {
            was_playing,
            dropped_chunks,
            generation: self.generation,
        }
    }
}
