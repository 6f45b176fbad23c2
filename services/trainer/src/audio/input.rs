use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig, StreamError};
use rehearse_core::device::{CaptureEvent, InputStream};
use rehearse_core::error::{VoiceError, VoiceResult};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use rubato::{FastFixedIn, Resampler};
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// One second of audio at 48 kHz between the callback and the framer.
const RING_CAPACITY: usize = 48_000;
const RESAMPLER_CHUNK: usize = 480;

/// Cuts device audio into fixed frames at the engine's input rate.
pub(crate) struct Framer {
    resampler: Option<FastFixedIn<f32>>,
    pending_in: Vec<f32>,
    pending_out: Vec<f32>,
    frame_samples: usize,
}

impl Framer {
    pub(crate) fn new(device_rate: u32, target_rate: u32, frame_samples: usize) -> VoiceResult<Self> {
        let resampler = if device_rate == target_rate {
            None
        } else {
            Some(super::create_resampler(
                device_rate,
                target_rate,
                RESAMPLER_CHUNK,
            )?)
        };
        Ok(Self {
            resampler,
            pending_in: Vec::new(),
            pending_out: Vec::new(),
            frame_samples: frame_samples.max(1),
        })
    }

    /// Feeds mono device samples; returns every frame that became complete.
    pub(crate) fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        match &mut self.resampler {
            None => self.pending_out.extend_from_slice(samples),
            Some(resampler) => {
                self.pending_in.extend_from_slice(samples);
                loop {
                    let needed = resampler.input_frames_next();
                    if self.pending_in.len() < needed {
                        break;
                    }
                    let chunk: Vec<f32> = self.pending_in.drain(..needed).collect();
                    match resampler.process(&[chunk], None) {
                        Ok(mut out) => {
                            if let Some(channel) = out.pop() {
                                self.pending_out.extend(channel);
                            }
                        }
                        Err(e) => warn!(error = %e, "Dropping microphone chunk that failed to resample"),
                    }
                }
            }
        }

        let complete = self.pending_out.len() / self.frame_samples;
        self.pending_out
            .drain(..complete * self.frame_samples)
            .collect::<Vec<f32>>()
            .chunks(self.frame_samples)
            .map(<[f32]>::to_vec)
            .collect()
    }
}

/// Default microphone, streaming frames to the engine from its own thread.
///
/// Opening waits for the device; callers keep it off async threads.
/// Closing only signals the thread, which releases the device on its own.
pub struct CpalInput {
    stop: Option<std_mpsc::Sender<()>>,
}

impl CpalInput {
    pub fn open(
        sample_rate: u32,
        frame_samples: usize,
        sink: mpsc::Sender<CaptureEvent>,
    ) -> VoiceResult<Self> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<VoiceResult<()>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("rehearse-capture".to_string())
            .spawn(move || run_capture(sample_rate, frame_samples, sink, stop_rx, ready_tx))
            .map_err(|e| VoiceError::DeviceUnavailable(format!("capture thread: {e}")))?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => Ok(Self {
                stop: Some(stop_tx),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(VoiceError::DeviceUnavailable(
                "microphone did not open in time".to_string(),
            )),
        }
    }
}

impl InputStream for CpalInput {
    fn close(&mut self) {
        if self.stop.take().is_some() {
            debug!("Microphone close requested");
        }
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        self.close();
    }
}

struct OpenedCapture {
    stream: Stream,
    consumer: HeapCons<f32>,
    device_rate: u32,
    lost: std_mpsc::Receiver<String>,
}

fn run_capture(
    target_rate: u32,
    frame_samples: usize,
    sink: mpsc::Sender<CaptureEvent>,
    stop: std_mpsc::Receiver<()>,
    ready: std_mpsc::SyncSender<VoiceResult<()>>,
) {
    let opened = open_stream(target_rate).and_then(|opened| {
        let framer = Framer::new(opened.device_rate, target_rate, frame_samples)?;
        Ok((opened, framer))
    });
    let (mut opened, mut framer) = match opened {
        Ok(parts) => parts,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let mut scratch = vec![0.0f32; RING_CAPACITY];
    let mut frames: u64 = 0;
    let mut dropped: u64 = 0;
    loop {
        match stop.recv_timeout(POLL_INTERVAL) {
            Err(std_mpsc::RecvTimeoutError::Timeout) => {}
            _ => break,
        }
        if let Ok(reason) = opened.lost.try_recv() {
            warn!(%reason, "Microphone lost");
            let _ = sink.blocking_send(CaptureEvent::Lost(reason));
            break;
        }

        let read = opened.consumer.pop_slice(&mut scratch);
        for frame in framer.push(&scratch[..read]) {
            frames += 1;
            match sink.try_send(CaptureEvent::Frame(frame)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    if dropped % 50 == 1 {
                        debug!(dropped, frames, "Engine busy; dropping microphone frames");
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    drop(opened.stream);
                    return;
                }
            }
        }
    }
    drop(opened.stream);
    info!(frames, dropped, "Microphone closed");
}

fn open_stream(target_rate: u32) -> VoiceResult<OpenedCapture> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| VoiceError::DeviceUnavailable("no input device available".to_string()))?;
    let default = device
        .default_input_config()
        .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))?;
    let supported = device
        .supported_input_configs()
        .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))?;
    let chosen = super::pick_config(supported, default, target_rate);
    let config: StreamConfig = chosen.config();

    let (producer, consumer) = HeapRb::<f32>::new(RING_CAPACITY).split();
    let (lost_tx, lost) = std_mpsc::channel();
    let stream = match chosen.sample_format() {
        SampleFormat::F32 => build_input::<f32>(&device, &config, producer, lost_tx),
        SampleFormat::I16 => build_input::<i16>(&device, &config, producer, lost_tx),
        SampleFormat::U16 => build_input::<u16>(&device, &config, producer, lost_tx),
        other => {
            return Err(VoiceError::DeviceUnavailable(format!(
                "unsupported input sample format {other}"
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
        "Microphone opened"
    );
    Ok(OpenedCapture {
        stream,
        consumer,
        device_rate: config.sample_rate.0,
        lost,
    })
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: HeapProd<f32>,
    lost: std_mpsc::Sender<String>,
) -> Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = (config.channels as usize).max(1);
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            for frame in data.chunks(channels) {
                let sum: f32 = frame.iter().map(|&sample| f32::from_sample(sample)).sum();
                // A full ring means the framer thread stalled; newest audio is dropped.
                let _ = producer.try_push(sum / frame.len() as f32);
            }
        },
        move |err| match err {
            StreamError::DeviceNotAvailable => {
                let _ = lost.send(err.to_string());
            }
            other => warn!(error = %other, "Input stream error"),
        },
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framer_same_rate_cuts_fixed_frames() {
        let mut framer = Framer::new(16_000, 16_000, 4).unwrap();
        assert!(framer.push(&[0.1, 0.2, 0.3]).is_empty());

        let frames = framer.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);
        assert_eq!(
            frames,
            vec![vec![0.1, 0.2, 0.3, 0.4], vec![0.5, 0.6, 0.7, 0.8]]
        );
        // the leftover sample starts the next frame
        assert_eq!(framer.push(&[1.0, 1.0, 1.0]), vec![vec![0.9, 1.0, 1.0, 1.0]]);
    }

    #[test]
    fn test_framer_downsamples_device_rate() {
        let mut framer = Framer::new(48_000, 16_000, 512).unwrap();
        let second: Vec<f32> = (0..48_000).map(|i| (i as f32 * 0.01).sin() * 0.3).collect();

        let mut frames = Vec::new();
        for block in second.chunks(441) {
            frames.extend(framer.push(block));
        }

        assert!(frames.iter().all(|frame| frame.len() == 512));
        // one second at 16 kHz is 31.25 frames; the resampler holds a little back
        assert!((29..=31).contains(&frames.len()), "got {} frames", frames.len());
    }
}
