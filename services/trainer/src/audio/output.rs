use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use parking_lot::Mutex;
use rehearse_core::device::{OutputDevice, PlaybackUnit, UnitId};
use rehearse_core::error::{VoiceError, VoiceResult};
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Voice {
    id: UnitId,
    start: u64,
    samples: Vec<f32>,
    /// (first faded frame, ramp length in frames)
    fade: Option<(u64, u64)>,
}

impl Voice {
    fn gain_at(&self, frame: u64) -> f32 {
        match self.fade {
            Some((from, len)) if frame >= from => {
                (1.0 - (frame - from) as f32 / len as f32).max(0.0)
            }
            _ => 1.0,
        }
    }

    fn finished(&self, clock: u64) -> bool {
        clock >= self.start + self.samples.len() as u64
            || self.fade.is_some_and(|(from, len)| clock >= from + len)
    }
}

/// Sample-accurate mixer behind the output stream.
///
/// The clock counts rendered frames, so a unit scheduled at `t` seconds
/// starts exactly at frame `t * rate` and back-to-back units join without
/// a gap.
#[derive(Debug)]
pub struct Timeline {
    rate: u32,
    clock: u64,
    voices: Vec<Voice>,
}

impl Timeline {
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            clock: 0,
            voices: Vec::new(),
        }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn now(&self) -> f64 {
        self.clock as f64 / self.rate as f64
    }

    /// Places samples (already at the timeline rate) at `start_at` seconds.
    /// A start in the past plays immediately.
    pub fn add(&mut self, id: UnitId, start_at: f64, samples: Vec<f32>) {
        let start = ((start_at * self.rate as f64).round().max(0.0) as u64).max(self.clock);
        self.voices.push(Voice {
            id,
            start,
            samples,
            fade: None,
        });
    }

    pub fn fade_out(&mut self, id: UnitId, ramp: f64) {
        let len = ((ramp * self.rate as f64).round() as u64).max(1);
        let clock = self.clock;
        if let Some(voice) = self.voices.iter_mut().find(|voice| voice.id == id) {
            voice.fade = Some((clock.max(voice.start), len));
        }
    }

    pub fn cancel(&mut self, id: UnitId) {
        self.voices.retain(|voice| voice.id != id);
    }

    pub fn clear(&mut self) {
        self.voices.clear();
    }

    #[cfg(test)]
    fn is_idle(&self) -> bool {
        self.voices.is_empty()
    }

    /// Mixes the next `out.len() / channels` frames into `out` (interleaved)
    /// and advances the clock.
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = (out.len() / channels) as u64;
        out.fill(0.0);

        for voice in &self.voices {
            let first = voice.start.max(self.clock);
            let last = (voice.start + voice.samples.len() as u64).min(self.clock + frames);
            for frame in first..last {
                let gain = voice.gain_at(frame);
                if gain <= 0.0 {
                    break;
                }
                let sample = voice.samples[(frame - voice.start) as usize] * gain;
                let base = (frame - self.clock) as usize * channels;
                for slot in &mut out[base..base + channels] {
                    *slot += sample;
                }
            }
        }
        for slot in out.iter_mut() {
            *slot = slot.clamp(-1.0, 1.0);
        }

        self.clock += frames;
        let clock = self.clock;
        self.voices.retain(|voice| !voice.finished(clock));
    }
}

/// Default output device, fed from a shared [`Timeline`].
///
/// Like the microphone, closing signals the stream thread without waiting
/// for it.
pub struct CpalOutput {
    timeline: Arc<Mutex<Timeline>>,
    stop: Option<std_mpsc::Sender<()>>,
}

impl CpalOutput {
    pub fn open(sample_rate: u32) -> VoiceResult<Self> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("rehearse-playback".to_string())
            .spawn(move || {
                let stream = match build_stream(sample_rate) {
                    Ok((stream, timeline)) => {
                        let _ = ready_tx.send(Ok(timeline));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Runs until the handle drops or sends on `stop`.
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Speaker released");
            })
            .map_err(|e| VoiceError::DeviceUnavailable(format!("playback thread: {e}")))?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(timeline)) => Ok(Self {
                timeline,
                stop: Some(stop_tx),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(VoiceError::DeviceUnavailable(
                "speaker did not open in time".to_string(),
            )),
        }
    }
}

fn build_stream(sample_rate: u32) -> VoiceResult<(Stream, Arc<Mutex<Timeline>>)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| VoiceError::DeviceUnavailable("no output device available".to_string()))?;
    let default = device
        .default_output_config()
        .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))?;
    let supported = device
        .supported_output_configs()
        .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))?;
    let chosen = super::pick_config(supported, default, sample_rate);
    let config: StreamConfig = chosen.config();

    let timeline = Arc::new(Mutex::new(Timeline::new(config.sample_rate.0)));
    let stream = match chosen.sample_format() {
        SampleFormat::F32 => build_output::<f32>(&device, &config, timeline.clone()),
        SampleFormat::I16 => build_output::<i16>(&device, &config, timeline.clone()),
        SampleFormat::U16 => build_output::<u16>(&device, &config, timeline.clone()),
        other => {
            return Err(VoiceError::DeviceUnavailable(format!(
                "unsupported output sample format {other}"
            )));
        }
    }
    .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))?;
    stream
        .play()
        .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))?;

    info!(
        device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
        rate = config.sample_rate.0,
        channels = config.channels,
        "Speaker opened"
    );
    Ok((stream, timeline))
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    timeline: Arc<Mutex<Timeline>>,
) -> Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut mix: Vec<f32> = Vec::new();
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            mix.resize(data.len(), 0.0);
            timeline.lock().render(&mut mix, channels);
            for (dst, &src) in data.iter_mut().zip(mix.iter()) {
                *dst = T::from_sample(src);
            }
        },
        |err| warn!(error = %err, "Output stream error"),
        None,
    )
}

impl OutputDevice for CpalOutput {
    fn current_time(&self) -> f64 {
        self.timeline.lock().now()
    }

    fn schedule(&mut self, unit: PlaybackUnit) -> VoiceResult<()> {
        let rate = self.timeline.lock().rate();
        let samples = super::resample_block(&unit.samples, unit.sample_rate, rate)?;
        self.timeline.lock().add(unit.id, unit.start_at, samples);
        Ok(())
    }

    fn fade_out(&mut self, id: UnitId, ramp: f64) {
        self.timeline.lock().fade_out(id, ramp);
    }

    fn cancel(&mut self, id: UnitId) {
        self.timeline.lock().cancel(id);
    }

    fn close(&mut self) {
        self.timeline.lock().clear();
        if self.stop.take().is_some() {
            debug!("Speaker close requested");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}
