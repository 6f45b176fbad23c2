//! Microphone capture gating.
//!
//! The input device pushes fixed-size frames into the engine's capture
//! channel. Each frame is converted to PCM16 and forwarded immediately, but
//! only while the turn state leaves the mic open; everything else is dropped
//! at the source.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::audio_utils::f32_to_pcm16_le;
use crate::device::{AudioBackend, CaptureEvent, InputStream};
use crate::error::{VoiceError, VoiceResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureState {
    Stopped,
    Running,
    /// Temporarily disconnected while an answer is handed to the peer.
    Detached,
    /// A reattach is opening the device.
    Reopening,
    Lost(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureStats {
    pub forwarded: u64,
    pub dropped: u64,
}

pub struct CapturePipeline {
    backend: Arc<dyn AudioBackend>,
    sample_rate: u32,
    frame_samples: usize,
    sink: mpsc::Sender<CaptureEvent>,
    stream: Option<Box<dyn InputStream>>,
    state: CaptureState,
    stats: CaptureStats,
}

impl CapturePipeline {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        sample_rate: u32,
        frame_samples: usize,
        sink: mpsc::Sender<CaptureEvent>,
    ) -> Self {
        Self {
            backend,
            sample_rate,
            frame_samples,
            sink,
            stream: None,
            state: CaptureState::Stopped,
            stats: CaptureStats::default(),
        }
    }

    pub fn state(&self) -> &CaptureState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == CaptureState::Running
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    /// Opens the input device on the blocking pool. Returns
    /// `DeviceUnavailable` on failure.
    pub async fn open(&mut self) -> VoiceResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = tokio::task::spawn_blocking(self.opener())
            .await
            .map_err(|e| VoiceError::DeviceUnavailable(format!("microphone open task failed: {e}")))??;
        self.attach(stream);
        Ok(())
    }

    /// Releases the device until [`CapturePipeline::begin_reattach`].
    pub fn detach(&mut self) {
        if !matches!(self.state, CaptureState::Running | CaptureState::Reopening) {
            return;
        }
        self.release();
        self.state = CaptureState::Detached;
        debug!("microphone capture detached");
    }

    /// Starts re-opening the device after a detach. The returned job blocks
    /// and belongs on the blocking pool; hand its result to
    /// [`CapturePipeline::finish_reattach`]. `None` when capture is not
    /// detached (lost, closed, or already reopening).
    pub fn begin_reattach(
        &mut self,
    ) -> Option<impl FnOnce() -> VoiceResult<Box<dyn InputStream>> + Send + use<>> {
        if self.state != CaptureState::Detached {
            return None;
        }
        self.state = CaptureState::Reopening;
        Some(self.opener())
    }

    /// Completes a reattach. A stream that arrives after capture was
    /// detached again, lost or closed is released straight away.
    pub fn finish_reattach(
        &mut self,
        result: VoiceResult<Box<dyn InputStream>>,
    ) -> VoiceResult<()> {
        let mut stream = result?;
        if self.state != CaptureState::Reopening || self.stream.is_some() {
            debug!(state = ?self.state, "discarding reopened microphone");
            stream.close();
            return Ok(());
        }
        self.attach(stream);
        Ok(())
    }

    pub fn on_lost(&mut self, reason: String) {
        warn!(%reason, "microphone lost");
        self.release();
        self.state = CaptureState::Lost(reason);
    }

    pub fn close(&mut self) {
        self.release();
        self.state = CaptureState::Stopped;
    }

    /// Converts one frame for sending, or drops it when the mic is closed.
    pub fn process(&mut self, frame: &[f32], mic_open: bool) -> Option<Bytes> {
        if !mic_open || !self.is_running() {
            self.stats.dropped += 1;
            return None;
        }
        self.stats.forwarded += 1;
        Some(f32_to_pcm16_le(frame))
    }

    fn opener(&self) -> impl FnOnce() -> VoiceResult<Box<dyn InputStream>> + Send + use<> {
        let backend = self.backend.clone();
        let (sample_rate, frame_samples, sink) =
            (self.sample_rate, self.frame_samples, self.sink.clone());
        move || backend.open_input(sample_rate, frame_samples, sink)
    }

    fn attach(&mut self, stream: Box<dyn InputStream>) {
        self.stream = Some(stream);
        self.state = CaptureState::Running;
        info!(sample_rate = self.sample_rate, "microphone capture started");
    }

    fn release(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;

    fn pipeline(backend: Arc<FakeBackend>) -> CapturePipeline {
        let (tx, _rx) = mpsc::channel(8);
        CapturePipeline::new(backend, 16_000, 512, tx)
    }

    fn reattach(capture: &mut CapturePipeline) -> VoiceResult<()> {
        match capture.begin_reattach() {
            Some(open) => capture.finish_reattach(open()),
            None => Ok(()),
        }
    }

    #[tokio::test]
    async fn test_frames_dropped_unless_open_and_running() {
        let backend = Arc::new(FakeBackend::default());
        let mut capture = pipeline(backend.clone());
        let frame = vec![0.25f32; 512];

        // not opened yet
        assert!(capture.process(&frame, true).is_none());

        capture.open().await.unwrap();
        assert!(capture.is_running());
        let bytes = capture.process(&frame, true).unwrap();
        assert_eq!(bytes.len(), 1024);
        assert!(capture.process(&frame, false).is_none());

        let stats = capture.stats();
        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.dropped, 2);
    }

    #[tokio::test]
    async fn test_detach_and_reattach_release_device() {
        let backend = Arc::new(FakeBackend::default());
        let mut capture = pipeline(backend.clone());
        capture.open().await.unwrap();
        assert_eq!(backend.live_inputs(), 1);

        capture.detach();
        assert_eq!(*capture.state(), CaptureState::Detached);
        assert_eq!(backend.live_inputs(), 0);
        assert!(capture.process(&[0.1; 512], true).is_none());

        reattach(&mut capture).unwrap();
        assert!(capture.is_running());
        assert_eq!(backend.live_inputs(), 1);
        assert_eq!(backend.inputs_opened(), 2);
    }

    #[tokio::test]
    async fn test_stream_reopened_after_second_detach_is_released() {
        let backend = Arc::new(FakeBackend::default());
        let mut capture = pipeline(backend.clone());
        capture.open().await.unwrap();
        capture.detach();

        let open = capture.begin_reattach().unwrap();
        assert_eq!(*capture.state(), CaptureState::Reopening);
        assert!(capture.begin_reattach().is_none());

        // an assessment detaches capture again before the device is back
        capture.detach();
        capture.finish_reattach(open()).unwrap();
        assert_eq!(*capture.state(), CaptureState::Detached);
        assert_eq!(backend.live_inputs(), 0);
        assert_eq!(backend.inputs_opened(), 2);
    }

    #[tokio::test]
    async fn test_lost_device_is_not_reattached() {
        let backend = Arc::new(FakeBackend::default());
        let mut capture = pipeline(backend.clone());
        capture.open().await.unwrap();

        capture.on_lost("unplugged".to_string());
        assert_eq!(backend.live_inputs(), 0);
        assert!(capture.begin_reattach().is_none());
        assert_eq!(*capture.state(), CaptureState::Lost("unplugged".to_string()));
        assert_eq!(backend.inputs_opened(), 1);
    }

    #[tokio::test]
    async fn test_open_failure_is_device_unavailable() {
        let backend = Arc::new(FakeBackend::default());
        backend.fail_input("permission denied");
        let mut capture = pipeline(backend);
        let err = capture.open().await.unwrap_err();
        assert!(matches!(err, VoiceError::DeviceUnavailable(_)));
        assert_eq!(*capture.state(), CaptureState::Stopped);
    }

    #[tokio::test]
    async fn test_drop_releases_device() {
        let backend = Arc::new(FakeBackend::default());
        {
            let mut capture = pipeline(backend.clone());
            capture.open().await.unwrap();
        }
        assert_eq!(backend.live_inputs(), 0);
    }
}
