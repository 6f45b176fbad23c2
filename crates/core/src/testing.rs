//! In-memory devices and peer used by the unit tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::connection::{Connection, RealtimeConnector};
use crate::device::{AudioBackend, CaptureEvent, InputStream, OutputDevice, PlaybackUnit, UnitId};
use crate::error::{VoiceError, VoiceResult};
use crate::generic_types::{ClientEvent, ServerEvent, SessionSetup};

#[derive(Debug, Default)]
struct OutputLog {
    manual_clock: f64,
    scheduled: Vec<PlaybackUnit>,
    faded: Vec<(UnitId, f64)>,
    cancelled: Vec<UnitId>,
    /// Units accepted before `schedule` starts failing.
    accept_limit: Option<usize>,
    closed: bool,
}

#[derive(Debug, Clone, Copy)]
enum Clock {
    Manual,
    Tokio(Instant),
}

/// Output device that records what it was asked to play.
#[derive(Debug, Clone)]
pub struct FakeOutput {
    clock: Clock,
    log: Arc<Mutex<OutputLog>>,
    live: Option<Arc<LiveCounter>>,
}

impl FakeOutput {
    /// Clock only moves with [`FakeOutput::advance`].
    pub fn manual() -> Self {
        Self {
            clock: Clock::Manual,
            log: Arc::default(),
            live: None,
        }
    }

    /// Clock follows tokio time, so a paused runtime drives it.
    pub fn tokio_clock() -> Self {
        Self {
            clock: Clock::Tokio(Instant::now()),
            log: Arc::default(),
            live: None,
        }
    }

    pub fn advance(&self, secs: f64) {
        self.log.lock().unwrap().manual_clock += secs;
    }

    pub fn scheduled(&self) -> Vec<PlaybackUnit> {
        self.log.lock().unwrap().scheduled.clone()
    }

    pub fn faded(&self) -> Vec<(UnitId, f64)> {
        self.log.lock().unwrap().faded.clone()
    }

    pub fn cancelled(&self) -> Vec<UnitId> {
        self.log.lock().unwrap().cancelled.clone()
    }

    /// Makes every `schedule` after the first `accepted` ones fail.
    pub fn fail_schedule_after(&self, accepted: usize) {
        self.log.lock().unwrap().accept_limit = Some(accepted);
    }

    pub fn is_closed(&self) -> bool {
        self.log.lock().unwrap().closed
    }
}

impl OutputDevice for FakeOutput {
    fn current_time(&self) -> f64 {
        match self.clock {
            Clock::Manual => self.log.lock().unwrap().manual_clock,
            Clock::Tokio(origin) => origin.elapsed().as_secs_f64(),
        }
    }

    fn schedule(&mut self, unit: PlaybackUnit) -> VoiceResult<()> {
        let mut log = self.log.lock().unwrap();
        if log.accept_limit.is_some_and(|limit| log.scheduled.len() >= limit) {
            return Err(VoiceError::DeviceUnavailable("output stalled".to_string()));
        }
        log.scheduled.push(unit);
        Ok(())
    }

    fn fade_out(&mut self, id: UnitId, ramp: f64) {
        self.log.lock().unwrap().faded.push((id, ramp));
    }

    fn cancel(&mut self, id: UnitId) {
        self.log.lock().unwrap().cancelled.push(id);
    }

    fn close(&mut self) {
        let mut log = self.log.lock().unwrap();
        if !log.closed {
            log.closed = true;
            if let Some(live) = &self.live {
                live.release();
            }
        }
    }
}

/// Tracks how many instances of a resource are open at once.
#[derive(Debug, Default)]
pub struct LiveCounter {
    live: AtomicUsize,
    max_live: AtomicUsize,
    opened: AtomicUsize,
}

impl LiveCounter {
    fn acquire(&self) {
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(now, Ordering::SeqCst);
        self.opened.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

struct FakeInput {
    live: Arc<LiveCounter>,
    closed: bool,
}

impl InputStream for FakeInput {
    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.live.release();
        }
    }
}

impl Drop for FakeInput {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Default)]
pub struct FakeBackend {
    inputs: Arc<LiveCounter>,
    outputs: Arc<LiveCounter>,
    input_failure: Mutex<Option<String>>,
    output_failure: Mutex<Option<String>>,
    sinks: Mutex<Vec<mpsc::Sender<CaptureEvent>>>,
    opened_outputs: Mutex<Vec<FakeOutput>>,
}

impl FakeBackend {
    pub fn fail_input(&self, reason: &str) {
        *self.input_failure.lock().unwrap() = Some(reason.to_string());
    }

    pub fn fail_output(&self, reason: &str) {
        *self.output_failure.lock().unwrap() = Some(reason.to_string());
    }

    pub fn live_inputs(&self) -> usize {
        self.inputs.live()
    }

    pub fn max_live_inputs(&self) -> usize {
        self.inputs.max_live()
    }

    pub fn inputs_opened(&self) -> usize {
        self.inputs.opened()
    }

    pub fn live_outputs(&self) -> usize {
        self.outputs.live()
    }

    pub fn max_live_outputs(&self) -> usize {
        self.outputs.max_live()
    }

    /// Sender of the most recently opened input stream.
    pub fn microphone(&self) -> mpsc::Sender<CaptureEvent> {
        self.sinks
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no input stream was opened")
    }

    /// The most recently opened output device.
    pub fn speaker(&self) -> FakeOutput {
        self.opened_outputs
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no output device was opened")
    }
}

impl AudioBackend for FakeBackend {
    fn open_input(
        &self,
        _sample_rate: u32,
        _frame_samples: usize,
        sink: mpsc::Sender<CaptureEvent>,
    ) -> VoiceResult<Box<dyn InputStream>> {
        if let Some(reason) = self.input_failure.lock().unwrap().clone() {
            return Err(VoiceError::DeviceUnavailable(reason));
        }
        self.inputs.acquire();
        self.sinks.lock().unwrap().push(sink);
        Ok(Box::new(FakeInput {
            live: self.inputs.clone(),
            closed: false,
        }))
    }

    fn open_output(&self, _sample_rate: u32) -> VoiceResult<Box<dyn OutputDevice>> {
        if let Some(reason) = self.output_failure.lock().unwrap().clone() {
            return Err(VoiceError::DeviceUnavailable(reason));
        }
        self.outputs.acquire();
        let mut output = FakeOutput::tokio_clock();
        output.live = Some(self.outputs.clone());
        self.opened_outputs.lock().unwrap().push(output.clone());
        Ok(Box::new(output))
    }
}

/// The peer side of one fake connection.
#[derive(Clone)]
pub struct FakePeer {
    pub setup: SessionSetup,
    inbound: mpsc::Sender<ServerEvent>,
    sent: Arc<Mutex<Vec<ClientEvent>>>,
}

impl FakePeer {
    pub async fn emit(&self, event: ServerEvent) {
        let _ = self.inbound.send(event).await;
    }

    pub fn sent(&self) -> Vec<ClientEvent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn text_turns(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::TextTurn { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn function_responses(&self) -> Vec<serde_json::Value> {
        self.sent()
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::FunctionResponse { response, .. } => Some(response),
                _ => None,
            })
            .collect()
    }

    pub fn audio_frames(&self) -> Vec<bytes::Bytes> {
        self.sent()
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::Audio(bytes) => Some(bytes),
                _ => None,
            })
            .collect()
    }
}

struct LiveGuard(Arc<LiveCounter>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

#[derive(Default)]
pub struct FakeConnector {
    connections: Arc<LiveCounter>,
    peers: Mutex<Vec<FakePeer>>,
    failure: Mutex<Option<String>>,
    handshake_delay: Mutex<Duration>,
}

impl FakeConnector {
    pub fn fail_with(&self, reason: &str) {
        *self.failure.lock().unwrap() = Some(reason.to_string());
    }

    pub fn set_handshake_delay(&self, delay: Duration) {
        *self.handshake_delay.lock().unwrap() = delay;
    }

    pub fn live(&self) -> usize {
        self.connections.live()
    }

    pub fn max_live(&self) -> usize {
        self.connections.max_live()
    }

    pub fn opened(&self) -> usize {
        self.connections.opened()
    }

    pub fn peer(&self) -> FakePeer {
        self.peers
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no connection was opened")
    }
}

#[async_trait]
impl RealtimeConnector for FakeConnector {
    async fn open(&self, setup: SessionSetup) -> VoiceResult<Connection> {
        let delay = *self.handshake_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = self.failure.lock().unwrap().clone() {
            return Err(VoiceError::HandshakeFailed(reason));
        }

        let (out_tx, mut out_rx) = mpsc::channel::<ClientEvent>(256);
        let (in_tx, in_rx) = mpsc::channel::<ServerEvent>(256);
        let sent = Arc::new(Mutex::new(Vec::new()));

        self.connections.acquire();
        let guard = LiveGuard(self.connections.clone());
        let log = sent.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            while let Some(event) = out_rx.recv().await {
                log.lock().unwrap().push(event);
            }
        });

        self.peers.lock().unwrap().push(FakePeer {
            setup,
            inbound: in_tx,
            sent,
        });
        Ok(Connection::new(out_tx, in_rx, Some(task)))
    }
}
