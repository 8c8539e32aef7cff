//! Dispatcher - maps UI actions onto the file store and the active session.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::actor::{SessionHandle, SessionSnapshot, spawn_session};
use crate::device::DeviceRegistry;
use crate::events::{DfuEvent, DfuObserver};
use crate::firmware::FileStore;
use crate::protocol::FwType;
use crate::session::SessionConfig;
use crate::transport::DeviceProbe;

/// Actions raised by a user interface.
pub enum UiAction {
    DeviceSelected(Box<dyn DeviceProbe>),
    DeviceDeselected,
    WriteRequested,
    RecoverRequested,
    RefreshRequested,
    OpenFile { path: PathBuf, fw_type: FwType },
}

impl UiAction {
    fn name(&self) -> &'static str {
        match self {
            UiAction::DeviceSelected(_) => "device-selected",
            UiAction::DeviceDeselected => "device-deselected",
            UiAction::WriteRequested => "write-requested",
            UiAction::RecoverRequested => "recover-requested",
            UiAction::RefreshRequested => "refresh-requested",
            UiAction::OpenFile { .. } => "open-file",
        }
    }
}

/// Owns the opened files and at most one device session.
pub struct Dispatcher<O: DfuObserver + 'static> {
    config: SessionConfig,
    registry: Arc<DeviceRegistry>,
    observer: Arc<O>,
    files: FileStore,
    active: Option<SessionHandle>,
}

impl<O: DfuObserver + 'static> Dispatcher<O> {
    pub fn new(config: SessionConfig, observer: Arc<O>) -> Self {
        Self::with_registry(config, DeviceRegistry::builtin(), observer)
    }

    pub fn with_registry(
        config: SessionConfig,
        registry: Arc<DeviceRegistry>,
        observer: Arc<O>,
    ) -> Self {
        Self {
            config,
            registry,
            observer,
            files: FileStore::new(),
            active: None,
        }
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }

    /// Description of the selected device, if any.
    pub fn active_device(&self) -> Option<&str> {
        self.active.as_ref().map(|h| h.device())
    }

    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        match &self.active {
            Some(handle) => handle.snapshot().await,
            None => None,
        }
    }

    fn error(&self, message: impl Into<String>) {
        self.observer.on_event(&DfuEvent::Error {
            device: self.active_device().map(str::to_string),
            step: None,
            message: message.into(),
        });
    }

    #[instrument(skip_all, fields(action = action.name()))]
    pub async fn dispatch(&mut self, action: UiAction) {
        match action {
            UiAction::DeviceSelected(probe) => {
                self.deselect().await;
                info!(device = %probe.describe(), "Selecting device");
                self.active = Some(spawn_session(
                    self.config.clone(),
                    self.registry.clone(),
                    self.observer.clone(),
                    probe,
                ));
            }
            UiAction::DeviceDeselected => self.deselect().await,
            UiAction::WriteRequested => {
                if self.files.is_empty() {
                    debug!("No files opened, nothing to write");
                    return;
                }
                let Some(handle) = &self.active else {
                    self.error("No device selected");
                    return;
                };
                // Only queued: a deselect must be able to cancel the write.
                // The session reports the outcome through the observer.
                if let Err(e) = handle.start_write(self.files.images().to_vec()).await {
                    self.error(e.to_string());
                }
            }
            UiAction::RecoverRequested => {
                let Some(handle) = &self.active else {
                    self.error("No device selected");
                    return;
                };
                if let Err(e) = handle.start_recover().await {
                    self.error(e.to_string());
                }
            }
            UiAction::RefreshRequested => {
                let failures = self.files.refresh_all_files();
                for failure in &failures {
                    self.error(format!("{}: {}", failure.path.display(), failure.error));
                }
                self.observer.on_event(&DfuEvent::FilesRefreshed {
                    count: self.files.images().len(),
                    failed: failures.len(),
                });
            }
            UiAction::OpenFile { path, fw_type } => {
                if let Err(e) = self.files.open_file(&path, fw_type) {
                    self.error(e.to_string());
                }
            }
        }
    }

    async fn deselect(&mut self) {
        if let Some(handle) = self.active.take() {
            handle.disconnect().await;
        }
    }

    /// Disconnect the active session, if any.
    pub async fn shutdown(mut self) {
        self.deselect().await;
    }
}
