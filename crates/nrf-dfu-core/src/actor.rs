//! Session task - runs a [`DeviceSession`] on its own tokio task.
//!
//! The task owns the session. Callers talk to it through a
//! [`SessionHandle`], so at most one operation runs per device at a time.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::device::DeviceRegistry;
use crate::error::SessionError;
use crate::events::DfuObserver;
use crate::firmware::FirmwareImage;
use crate::session::{CancelHandle, DeviceSession, SessionConfig, WriteOutcome};
use crate::state::SessionState;
use crate::transport::DeviceProbe;
use crate::version::{Capability, VersionInfo};

const COMMAND_QUEUE_DEPTH: usize = 16;

/// Reply to a queued session command.
pub type Pending<T> = oneshot::Receiver<Result<T, SessionError>>;

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub version_info: Option<VersionInfo>,
    pub capability: Option<Capability>,
}

enum SessionCommand {
    Write {
        images: Vec<FirmwareImage>,
        reply: oneshot::Sender<Result<WriteOutcome, SessionError>>,
    },
    Recover {
        reply: oneshot::Sender<Result<Capability, SessionError>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Disconnect,
}

/// Handle to a running session task.
pub struct SessionHandle {
    device: String,
    commands: mpsc::Sender<SessionCommand>,
    cancel: CancelHandle,
    task: JoinHandle<()>,
}

/// Spawn a session for `probe` and start identifying the device.
pub fn spawn_session<O: DfuObserver + 'static>(
    config: SessionConfig,
    registry: Arc<DeviceRegistry>,
    observer: Arc<O>,
    probe: Box<dyn DeviceProbe>,
) -> SessionHandle {
    let device = probe.describe();
    let session = DeviceSession::with_registry(config, registry, observer);
    let cancel = session.cancel_handle();
    let (commands, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let task = tokio::spawn(run_session(session, probe, rx));
    SessionHandle {
        device,
        commands,
        cancel,
        task,
    }
}

async fn run_session<O: DfuObserver>(
    mut session: DeviceSession<O>,
    probe: Box<dyn DeviceProbe>,
    mut rx: mpsc::Receiver<SessionCommand>,
) {
    // Failures are already reported through the observer.
    if let Err(e) = session.connect(probe).await {
        debug!(error = %e, "Initial probe failed");
    }

    while let Some(command) = rx.recv().await {
        match command {
            SessionCommand::Write { images, reply } => {
                let _ = reply.send(session.write(&images).await);
            }
            SessionCommand::Recover { reply } => {
                let _ = reply.send(session.recover().await);
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(SessionSnapshot {
                    state: session.state().clone(),
                    version_info: session.version_info().cloned(),
                    capability: session.capability().cloned(),
                });
            }
            SessionCommand::Disconnect => break,
        }
    }

    session.disconnect().await;
}

impl SessionHandle {
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Cancel the operation the session is currently running.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn gone(&self, operation: &'static str) -> SessionError {
        SessionError::InvalidState {
            state: SessionState::Idle,
            operation,
        }
    }

    /// Queue a write. The receiver resolves once the write has finished.
    pub async fn start_write(
        &self,
        images: Vec<FirmwareImage>,
    ) -> Result<Pending<WriteOutcome>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Write { images, reply })
            .await
            .map_err(|_| self.gone("write"))?;
        Ok(rx)
    }

    pub async fn write(&self, images: Vec<FirmwareImage>) -> Result<WriteOutcome, SessionError> {
        let rx = self.start_write(images).await?;
        rx.await.map_err(|_| self.gone("write"))?
    }

    /// Queue a recovery. The receiver resolves once the device is identified
    /// again or recovery has failed.
    pub async fn start_recover(&self) -> Result<Pending<Capability>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Recover { reply })
            .await
            .map_err(|_| self.gone("recover"))?;
        Ok(rx)
    }

    pub async fn recover(&self) -> Result<Capability, SessionError> {
        let rx = self.start_recover().await?;
        rx.await.map_err(|_| self.gone("recover"))?
    }

    /// Current state; `None` once the task has stopped.
    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Snapshot { reply })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Abort the running and every queued operation, release the transport
    /// and stop the task.
    pub async fn disconnect(self) {
        self.cancel.close();
        let _ = self.commands.send(SessionCommand::Disconnect).await;
        if let Err(e) = self.task.await {
            warn!(device = %self.device, error = %e, "Session task ended abnormally");
        }
    }
}
