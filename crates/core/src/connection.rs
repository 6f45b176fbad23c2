//! The live stream to the remote voice peer.
//!
//! A [`Connection`] is a pair of channels feeding a transport task owned by
//! the provider crate. The engine holds it exclusively; dropping it aborts
//! the transport.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{VoiceError, VoiceResult};
use crate::generic_types::{ClientEvent, ServerEvent, SessionSetup};

const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct Connection {
    outbound: Option<mpsc::Sender<ClientEvent>>,
    inbound: mpsc::Receiver<ServerEvent>,
    task: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn new(
        outbound: mpsc::Sender<ClientEvent>,
        inbound: mpsc::Receiver<ServerEvent>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound: Some(outbound),
            inbound,
            task,
        }
    }

    /// Queues one message without waiting. A full or closed transport drops
    /// the message and reports `TransientSendFailure`.
    pub fn send(&self, event: ClientEvent) -> VoiceResult<()> {
        let Some(outbound) = &self.outbound else {
            return Err(VoiceError::TransientSendFailure("connection closed".to_string()));
        };
        outbound
            .try_send(event)
            .map_err(|e| VoiceError::TransientSendFailure(e.to_string()))
    }

    /// Next event from the peer; `None` once the transport has stopped.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.inbound.recv().await
    }

    pub fn is_open(&self) -> bool {
        self.outbound.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Closes the outbound side and waits briefly for the transport to
    /// finish. Safe to call more than once.
    pub async fn close(&mut self) {
        self.outbound = None;
        self.inbound.close();
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(CLOSE_GRACE, &mut task).await {
                Ok(Ok(())) => debug!("voice transport closed"),
                Ok(Err(e)) => warn!(error = %e, "voice transport ended abnormally"),
                Err(_) => {
                    warn!("voice transport did not close in time; aborting");
                    task.abort();
                }
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Opens connections to a real-time voice provider.
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    /// Resolves once the peer has confirmed setup. Fails with
    /// `HandshakeFailed` otherwise, leaving nothing open.
    async fn open(&self, setup: SessionSetup) -> VoiceResult<Connection>;
}
