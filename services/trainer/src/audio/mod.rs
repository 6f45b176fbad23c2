//! Native audio devices over cpal.
//!
//! cpal streams are not `Send` on every platform, so each stream lives on a
//! dedicated thread for its whole life and the engine-facing handles only
//! hold a stop channel and shared state.

mod input;
mod output;

use cpal::{SampleFormat, SampleRate, SupportedStreamConfig, SupportedStreamConfigRange};
use rehearse_core::device::{AudioBackend, CaptureEvent, InputStream, OutputDevice};
use rehearse_core::error::{VoiceError, VoiceResult};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tokio::sync::mpsc;

/// Default host devices of this machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open_input(
        &self,
        sample_rate: u32,
        frame_samples: usize,
        sink: mpsc::Sender<CaptureEvent>,
    ) -> VoiceResult<Box<dyn InputStream>> {
        let stream = input::CpalInput::open(sample_rate, frame_samples, sink)?;
        Ok(Box::new(stream))
    }

    fn open_output(&self, sample_rate: u32) -> VoiceResult<Box<dyn OutputDevice>> {
        let device = output::CpalOutput::open(sample_rate)?;
        Ok(Box::new(device))
    }
}

/// Prefers a config that runs natively at `rate` so no conversion is
/// needed; otherwise keeps the device default.
fn pick_config(
    supported: impl Iterator<Item = SupportedStreamConfigRange>,
    default: SupportedStreamConfig,
    rate: u32,
) -> SupportedStreamConfig {
    supported
        .filter(|range| {
            range.min_sample_rate().0 <= rate
                && rate <= range.max_sample_rate().0
                && matches!(range.sample_format(), SampleFormat::F32 | SampleFormat::I16)
        })
        .min_by_key(|range| (range.channels(), range.sample_format() != SampleFormat::F32))
        .map(|range| range.with_sample_rate(SampleRate(rate)))
        .unwrap_or(default)
}

pub(crate) fn create_resampler(
    from: u32,
    to: u32,
    chunk_size: usize,
) -> VoiceResult<FastFixedIn<f32>> {
    FastFixedIn::<f32>::new(
        to as f64 / from as f64,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )
    .map_err(|e| VoiceError::DeviceUnavailable(format!("resampler setup failed: {e}")))
}

/// Converts one self-contained block to `to` Hz, yielding exactly the
/// number of samples its duration needs at the new rate.
pub(crate) fn resample_block(samples: &[f32], from: u32, to: u32) -> VoiceResult<Vec<f32>> {
    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    let expected = (samples.len() as u64 * to as u64 / from as u64) as usize;
    let mut resampler = create_resampler(from, to, samples.len())?;
    let delay = resampler.output_delay();
    let to_error = |e: rubato::ResampleError| {
        VoiceError::DeviceUnavailable(format!("resampling failed: {e}"))
    };

    let mut out = resampler
        .process(&[samples], None)
        .map_err(to_error)?
        .into_iter()
        .next()
        .unwrap_or_default();
    while out.len() < delay + expected {
        let tail = resampler
            .process_partial(None::<&[Vec<f32>]>, None)
            .map_err(to_error)?
            .into_iter()
            .next()
            .unwrap_or_default();
        if tail.is_empty() {
            break;
        }
        out.extend(tail);
    }
    out.drain(..delay.min(out.len()));
    out.resize(expected, 0.0);
    Ok(out)
}
