//! Device Session - orchestrates probing and updating one device.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::device::DeviceRegistry;
use crate::digest::image_digest;
use crate::error::{SessionError, SessionStep};
use crate::events::{DfuEvent, DfuObserver, TracingObserver};
use crate::firmware::FirmwareImage;
use crate::packet::{InitPacketParams, encode_init_packet, encode_reset_packet};
use crate::protocol::constants::{DEFAULT_BAUD_RATE, DEFAULT_QUERY_TIMEOUT_MS, SD_REQ_ANY};
use crate::protocol::{FwType, HashType, OpCode};
use crate::state::{SessionState, StateMachine};
use crate::transport::{DeviceProbe, DfuTransport, SerialProbe, TransportConnector, TransportError};
use crate::version::{Capability, VersionInfo};

/// Configuration for a DFU session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound for every transport call.
    pub query_timeout_ms: u64,
    /// Timeout carried by the Reset command sent on recovery.
    pub reset_timeout: u32,
    /// Firmware version written to Init commands.
    pub fw_version: Option<u32>,
    /// Hardware version override; derived from the device family if unset.
    pub hw_version: Option<u32>,
    /// Accepted SoftDevice ids.
    pub sd_req: Vec<u32>,
    /// Digest attached to Init commands.
    pub hash_type: HashType,
    /// Mark Init commands as debug builds.
    pub debug: bool,
    /// Serial link speed.
    pub baud_rate: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
            reset_timeout: 0,
            fw_version: None,
            hw_version: None,
            sd_req: vec![SD_REQ_ANY],
            hash_type: HashType::Sha256,
            debug: false,
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Serial probe for `port` at the configured link speed.
    pub fn serial_probe(
        &self,
        port: impl Into<String>,
        connector: Arc<dyn TransportConnector>,
    ) -> SerialProbe {
        SerialProbe::new(port, connector).with_baud_rate(self.baud_rate)
    }
}

/// Result of a write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Nothing to write; no transport call was made.
    Skipped,
    Written { images: usize, bytes: u64 },
}

/// Cancellation state shared between a session and its handles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CancelSignal {
    /// Bumped once per cancel request.
    generation: u64,
    /// Set while the session is being torn down.
    closed: bool,
}

/// Cancels what the session is waiting on.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<watch::Sender<CancelSignal>>);

impl CancelHandle {
    /// Abort the operation in flight. Operations started afterwards run
    /// normally.
    pub fn cancel(&self) {
        self.0
            .send_modify(|s| s.generation = s.generation.wrapping_add(1));
    }

    /// Abort the operation in flight and every later one until the session
    /// has disconnected.
    pub fn close(&self) {
        self.0.send_modify(|s| s.closed = true);
    }

    pub fn is_closed(&self) -> bool {
        self.0.borrow().closed
    }
}

/// Bounds one transport call by the timeout and the cancel signal.
struct CallGuard<'a> {
    cancel: &'a watch::Sender<CancelSignal>,
    /// Cancel generation the current operation started under.
    operation: u64,
    timeout: Duration,
    device: &'a str,
}

impl CallGuard<'_> {
    async fn run<T>(
        &self,
        step: SessionStep,
        call: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, SessionError> {
        let mut signal = self.cancel.subscribe();
        let cancelled = signal.wait_for(|s| s.closed || s.generation != self.operation);
        tokio::select! {
            biased;
            _ = cancelled => Err(SessionError::Cancelled {
                device: self.device.to_string(),
                step,
            }),
            res = tokio::time::timeout(self.timeout, call) => {
                let source = match res {
                    Ok(Ok(value)) => return Ok(value),
                    Ok(Err(source)) => source,
                    Err(_) => TransportError::Timeout {
                        timeout_ms: self.timeout.as_millis() as u64,
                    },
                };
                Err(SessionError::Transport {
                    device: self.device.to_string(),
                    step,
                    source,
                })
            }
        }
    }
}

/// One encoded Init packet and the payload it describes.
struct PreparedImage<'a> {
    image: &'a FirmwareImage,
    init_packet: Vec<u8>,
    payload: Vec<u8>,
}

/// DFU session for one device, covering one connect to disconnect cycle.
pub struct DeviceSession<O: DfuObserver> {
    config: SessionConfig,
    registry: Arc<DeviceRegistry>,
    observer: Arc<O>,
    machine: StateMachine,
    probe: Option<Box<dyn DeviceProbe>>,
    transport: Option<Box<dyn DfuTransport>>,
    version_info: Option<VersionInfo>,
    capability: Option<Capability>,
    cancel: Arc<watch::Sender<CancelSignal>>,
    operation: u64,
}

impl DeviceSession<TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: DfuObserver> DeviceSession<O> {
    /// Create a new session with a custom observer and the built-in registry.
    pub fn with_observer(config: SessionConfig, observer: Arc<O>) -> Self {
        Self::with_registry(config, DeviceRegistry::builtin(), observer)
    }

    pub fn with_registry(
        config: SessionConfig,
        registry: Arc<DeviceRegistry>,
        observer: Arc<O>,
    ) -> Self {
        let (cancel, _) = watch::channel(CancelSignal::default());
        Self {
            config,
            registry,
            observer,
            machine: StateMachine::new(),
            probe: None,
            transport: None,
            version_info: None,
            capability: None,
            cancel: Arc::new(cancel),
            operation: 0,
        }
    }

    pub fn state(&self) -> &SessionState {
        self.machine.state()
    }

    pub fn version_info(&self) -> Option<&VersionInfo> {
        self.version_info.as_ref()
    }

    pub fn capability(&self) -> Option<&Capability> {
        self.capability.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether a transport handle is currently held.
    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    /// Earlier cancel requests do not apply to the operation starting now.
    fn begin_operation(&mut self) {
        self.operation = self.cancel.borrow().generation;
    }

    fn device_name(&self) -> String {
        self.probe
            .as_ref()
            .map_or_else(|| "<no device>".to_string(), |p| p.describe())
    }

    fn emit(&self, event: DfuEvent) {
        self.observer.on_event(&event);
    }

    fn transition(&mut self, to: SessionState) {
        let from = self.machine.goto_state(to.clone());
        if from != to {
            self.emit(DfuEvent::StateChanged { from, to });
        }
    }

    fn report(&self, error: &SessionError) {
        let device = self.probe.as_ref().map(|p| p.describe());
        self.emit(DfuEvent::Error {
            device,
            step: error.step(),
            message: error.to_string(),
        });
    }

    /// Enter `Failed` and report the error.
    fn fail(&mut self, error: SessionError) -> SessionError {
        warn!(error = %error, "Session operation failed");
        self.transition(SessionState::Failed(error.to_string()));
        self.report(&error);
        error
    }

    fn invalid_state(&self, operation: &'static str) -> SessionError {
        let error = SessionError::InvalidState {
            state: self.state().clone(),
            operation,
        };
        self.report(&error);
        error
    }

    /// Select a device and identify it.
    ///
    /// Runs the version probe; the transport it opens is closed again
    /// before this returns.
    #[instrument(skip(self, probe), fields(device = %probe.describe()))]
    pub async fn connect(&mut self, probe: Box<dyn DeviceProbe>) -> Result<Capability, SessionError> {
        if *self.state() != SessionState::Idle {
            return Err(self.invalid_state("connect"));
        }
        self.emit(DfuEvent::DeviceConnected {
            device: probe.describe(),
            kind: probe.kind(),
        });
        self.probe = Some(probe);
        self.begin_operation();
        self.identify().await
    }

    /// Probe versions and resolve the capability record.
    async fn identify(&mut self) -> Result<Capability, SessionError> {
        self.version_info = None;
        self.capability = None;
        self.transition(SessionState::Probing);

        let info = match self.probe_versions().await {
            Ok(info) => info,
            Err(e) => return Err(self.fail(e)),
        };
        let hardware = info.hardware_version;
        self.emit(DfuEvent::VersionKnown(info.clone()));
        self.version_info = Some(info);

        let Some(capability) = Capability::resolve(&self.registry, &hardware) else {
            let error = SessionError::DeviceUnsupported {
                device: self.device_name(),
                hardware_id: hardware.hardware_id(),
            };
            return Err(self.fail(error));
        };
        info!(
            hardware_id = %capability.hardware_id,
            rom_size = %format!("{:#X}", capability.rom_size),
            known = capability.definition.is_some(),
            "Device identified"
        );
        self.capability = Some(capability.clone());
        self.emit(DfuEvent::CapabilityKnown(capability.clone()));
        self.transition(SessionState::Identified);
        Ok(capability)
    }

    /// Open a transport, query protocol, hardware and firmware versions in
    /// that order, and close it exactly once.
    async fn probe_versions(&mut self) -> Result<VersionInfo, SessionError> {
        // A handle retained from an earlier write is stale once we re-probe.
        self.release_transport().await;

        let device = self.device_name();
        let guard = CallGuard {
            cancel: &self.cancel,
            operation: self.operation,
            timeout: self.config.query_timeout(),
            device: &device,
        };
        let probe = self
            .probe
            .as_ref()
            .ok_or_else(|| SessionError::InvalidState {
                state: self.machine.state().clone(),
                operation: "probe",
            })?;

        let mut transport = guard.run(SessionStep::Acquire, probe.acquire()).await?;
        let result = Self::query_versions(&guard, transport.as_mut()).await;
        close_transport(transport.as_mut(), guard.timeout).await;
        result
    }

    async fn query_versions(
        guard: &CallGuard<'_>,
        transport: &mut dyn DfuTransport,
    ) -> Result<VersionInfo, SessionError> {
        guard.run(SessionStep::Open, transport.open()).await?;
        let protocol_version = guard
            .run(SessionStep::ProtocolVersion, transport.protocol_version())
            .await?;
        let hardware_version = guard
            .run(SessionStep::HardwareVersion, transport.hardware_version())
            .await?;
        let firmware_versions = guard
            .run(SessionStep::FirmwareVersions, transport.firmware_versions())
            .await?;
        debug!(
            protocol_version,
            part = %format!("{:X}", hardware_version.part),
            images = firmware_versions.len(),
            "Versions read"
        );
        Ok(VersionInfo {
            protocol_version,
            hardware_version,
            firmware_versions,
        })
    }

    /// Acquire and open a transport unless one is already held.
    async fn ensure_transport(&mut self) -> Result<Box<dyn DfuTransport>, SessionError> {
        if let Some(transport) = self.transport.take() {
            return Ok(transport);
        }
        let device = self.device_name();
        let guard = CallGuard {
            cancel: &self.cancel,
            operation: self.operation,
            timeout: self.config.query_timeout(),
            device: &device,
        };
        let probe = self
            .probe
            .as_ref()
            .ok_or_else(|| SessionError::InvalidState {
                state: self.machine.state().clone(),
                operation: "open transport",
            })?;
        let mut transport = guard.run(SessionStep::Acquire, probe.acquire()).await?;
        if let Err(e) = guard.run(SessionStep::Open, transport.open()).await {
            close_transport(transport.as_mut(), guard.timeout).await;
            return Err(e);
        }
        Ok(transport)
    }

    async fn release_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            close_transport(transport.as_mut(), self.config.query_timeout()).await;
        }
    }

    /// Hardware version for Init commands.
    fn hw_version(&self, capability: &Capability) -> Option<u32> {
        self.config.hw_version.or_else(|| {
            capability
                .definition
                .as_ref()
                .and_then(|d| d.hw_generation())
        })
    }

    fn prepare<'a>(
        &self,
        image: &'a FirmwareImage,
        capability: &Capability,
    ) -> Result<PreparedImage<'a>, SessionError> {
        let map = &image.memory_map;
        let (Some(start), Some(end)) = (map.start_address(), map.end_address()) else {
            return Err(SessionError::InvalidArgument(format!(
                "{} contains no data",
                image.path.display()
            )));
        };
        if !capability.fits(start, end) {
            return Err(SessionError::ImageOutOfRange {
                path: image.path.clone(),
                start,
                end,
            });
        }

        let payload = image.payload();
        let len = payload.len() as u32;
        let (sd_size, bl_size, app_size) = match image.fw_type {
            FwType::Application => (0, 0, len),
            FwType::Softdevice => (len, 0, 0),
            FwType::Bootloader => (0, len, 0),
            FwType::SoftdeviceBootloader => {
                return Err(SessionError::InvalidArgument(
                    "combined SoftDevice and bootloader images need separate sizes".into(),
                ));
            }
        };

        let init_packet = encode_init_packet(InitPacketParams {
            fw_version: self.config.fw_version,
            hw_version: self.hw_version(capability),
            sd_req: Some(self.config.sd_req.clone()),
            fw_type: Some(image.fw_type),
            sd_size: Some(sd_size),
            bl_size: Some(bl_size),
            app_size: Some(app_size),
            hash_type: Some(self.config.hash_type),
            hash: Some(image_digest(self.config.hash_type, &payload)?),
            is_debug: Some(self.config.debug),
            signature_type: None,
            signature: None,
        })?;

        Ok(PreparedImage {
            image,
            init_packet,
            payload,
        })
    }

    /// Write firmware images to the identified device.
    ///
    /// An empty image set is a no-op. On failure the session enters
    /// `Failed` but keeps its transport so the caller may retry or recover.
    #[instrument(skip(self, images), fields(images = images.len()))]
    pub async fn write(&mut self, images: &[FirmwareImage]) -> Result<WriteOutcome, SessionError> {
        if images.is_empty() {
            debug!("No firmware images, write skipped");
            return Ok(WriteOutcome::Skipped);
        }
        let capability = match (self.state(), &self.capability) {
            (SessionState::Identified | SessionState::Failed(_), Some(cap)) => cap.clone(),
            _ => return Err(self.invalid_state("write")),
        };

        let prepared = match images
            .iter()
            .map(|image| self.prepare(image, &capability))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(prepared) => prepared,
            Err(e) => {
                self.report(&e);
                return Err(e);
            }
        };

        self.begin_operation();
        self.transition(SessionState::Writing);
        let mut transport = match self.ensure_transport().await {
            Ok(transport) => transport,
            Err(e) => return Err(self.fail(e)),
        };
        let result = self.transfer(transport.as_mut(), &prepared, capability.page_size).await;
        self.transport = Some(transport);

        match result {
            Ok(bytes) => {
                self.transition(SessionState::Identified);
                self.emit(DfuEvent::WriteComplete {
                    images: prepared.len(),
                });
                Ok(WriteOutcome::Written {
                    images: prepared.len(),
                    bytes,
                })
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn transfer(
        &self,
        transport: &mut dyn DfuTransport,
        prepared: &[PreparedImage<'_>],
        page_size: u32,
    ) -> Result<u64, SessionError> {
        let device = self.device_name();
        let guard = CallGuard {
            cancel: &self.cancel,
            operation: self.operation,
            timeout: self.config.query_timeout(),
            device: &device,
        };
        let chunk_size = page_size.max(1) as usize;
        let mut written = 0u64;

        for item in prepared {
            info!(
                path = %item.image.path.display(),
                fw_type = %item.image.fw_type,
                bytes = item.payload.len(),
                "Writing image"
            );
            guard
                .run(SessionStep::SendInitPacket, transport.send_packet(&item.init_packet))
                .await?;
            self.emit(DfuEvent::PacketSent {
                op_code: OpCode::Init,
                signed: false,
                length: item.init_packet.len(),
            });

            let total = item.payload.len() as u64;
            for (idx, chunk) in item.payload.chunks(chunk_size).enumerate() {
                let offset = (idx * chunk_size) as u32;
                guard
                    .run(SessionStep::SendData, transport.send_data(offset, chunk))
                    .await?;
                self.emit(DfuEvent::WriteProgress {
                    image: item.image.path.clone(),
                    current: offset as u64 + chunk.len() as u64,
                    total,
                });
            }
            written += total;
        }
        Ok(written)
    }

    /// Reset the target and identify it again.
    #[instrument(skip(self))]
    pub async fn recover(&mut self) -> Result<Capability, SessionError> {
        if self.probe.is_none() || self.state().is_busy() {
            return Err(self.invalid_state("recover"));
        }
        let packet = match encode_reset_packet(Some(self.config.reset_timeout), None, None) {
            Ok(packet) => packet,
            Err(e) => {
                let e = SessionError::from(e);
                self.report(&e);
                return Err(e);
            }
        };

        self.begin_operation();
        self.transition(SessionState::Recovering);
        let sent = self.send_reset(&packet).await;
        // The target reboots after a reset; the old handle is useless.
        self.release_transport().await;
        if let Err(e) = sent {
            return Err(self.fail(e));
        }
        self.emit(DfuEvent::PacketSent {
            op_code: OpCode::Reset,
            signed: false,
            length: packet.len(),
        });
        self.identify().await
    }

    async fn send_reset(&mut self, packet: &[u8]) -> Result<(), SessionError> {
        let mut transport = self.ensure_transport().await?;
        let device = self.device_name();
        let guard = CallGuard {
            cancel: &self.cancel,
            operation: self.operation,
            timeout: self.config.query_timeout(),
            device: &device,
        };
        let result = guard
            .run(SessionStep::SendResetPacket, transport.send_packet(packet))
            .await;
        self.transport = Some(transport);
        result
    }

    /// Release the transport and return to `Idle`.
    ///
    /// Runs from any state and cannot fail.
    #[instrument(skip(self))]
    pub async fn disconnect(&mut self) {
        self.release_transport().await;
        let device = self.device_name();
        self.probe = None;
        self.version_info = None;
        self.capability = None;
        self.transition(SessionState::Idle);
        self.cancel.send_modify(|s| s.closed = false);
        self.emit(DfuEvent::DeviceDisconnected { device });
    }
}

/// Close a transport, bounded by `timeout`. Failures are only logged.
async fn close_transport(transport: &mut dyn DfuTransport, timeout: Duration) {
    match tokio::time::timeout(timeout, transport.close()).await {
        Ok(Ok(())) => debug!("Transport closed"),
        Ok(Err(e)) => warn!(error = %e, "Failed to close transport"),
        Err(_) => warn!(timeout_ms = timeout.as_millis() as u64, "Timed out closing transport"),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::events::ChannelObserver;
    use crate::firmware::MemoryMap;
    use crate::transport::{LinkEndpoint, MockCall, MockConnector, MockTransport};
    use crate::version::{HardwareVersion, MemoryInfo};
    use tokio::sync::mpsc::UnboundedReceiver;

    type TestSession = DeviceSession<ChannelObserver>;

    fn session() -> (TestSession, UnboundedReceiver<DfuEvent>) {
        let (observer, rx) = ChannelObserver::new();
        let config = SessionConfig {
            query_timeout_ms: 200,
            ..Default::default()
        };
        (DeviceSession::with_observer(config, Arc::new(observer)), rx)
    }

    fn probe(mock: &MockTransport) -> Box<dyn DeviceProbe> {
        let connector = Arc::new(MockConnector::new(mock.clone()));
        Box::new(SerialProbe::new("/dev/ttyACM0", connector))
    }

    fn image(len: usize) -> FirmwareImage {
        let mut memory_map = MemoryMap::new();
        memory_map.insert(0x1000, &vec![0xA5; len]);
        FirmwareImage {
            path: PathBuf::from("app.hex"),
            fw_type: FwType::Application,
            memory_map,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<DfuEvent>) -> Vec<DfuEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_probe_sequence() {
        let mock = MockTransport::new();
        let (mut session, mut rx) = session();

        let cap = session.connect(probe(&mock)).await.unwrap();
        assert_eq!(cap.rom_size, 0x100000);
        assert_eq!(*session.state(), SessionState::Identified);
        assert!(!session.has_transport());

        assert_eq!(
            mock.calls(),
            vec![
                MockCall::Open,
                MockCall::ProtocolVersion,
                MockCall::HardwareVersion,
                MockCall::FirmwareVersions,
                MockCall::Close,
            ]
        );

        let states: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                DfuEvent::StateChanged { from, to } => Some((from, to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                (SessionState::Idle, SessionState::Probing),
                (SessionState::Probing, SessionState::Identified),
            ]
        );
    }

    #[tokio::test]
    async fn test_probe_events_order() {
        let mock = MockTransport::new();
        let (mut session, mut rx) = session();
        session.connect(probe(&mock)).await.unwrap();

        let events = drain(&mut rx);
        let version_idx = events
            .iter()
            .position(|e| matches!(e, DfuEvent::VersionKnown(_)))
            .unwrap();
        let cap_idx = events
            .iter()
            .position(|e| matches!(e, DfuEvent::CapabilityKnown(_)))
            .unwrap();
        assert!(version_idx < cap_idx);
    }

    #[tokio::test]
    async fn test_probe_failure_closes_once() {
        let mock = MockTransport::new();
        mock.fail_on(MockCall::HardwareVersion);
        let (mut session, mut rx) = session();

        let err = session.connect(probe(&mock)).await.unwrap_err();
        assert_eq!(err.step(), Some(SessionStep::HardwareVersion));
        assert!(session.state().is_failed());
        assert_eq!(mock.count(MockCall::Close), 1);
        assert_eq!(mock.count(MockCall::FirmwareVersions), 0);
        assert!(
            drain(&mut rx)
                .iter()
                .any(|e| matches!(e, DfuEvent::Error { step: Some(SessionStep::HardwareVersion), .. }))
        );
    }

    #[tokio::test]
    async fn test_open_failure_still_closes_once() {
        let mock = MockTransport::new();
        mock.fail_on(MockCall::Open);
        let (mut session, _rx) = session();

        assert!(session.connect(probe(&mock)).await.is_err());
        assert_eq!(mock.count(MockCall::Close), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout() {
        let mock = MockTransport::new();
        mock.hang_on(MockCall::ProtocolVersion);
        let (mut session, _rx) = session();

        let err = session.connect(probe(&mock)).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport {
                step: SessionStep::ProtocolVersion,
                source: TransportError::Timeout { timeout_ms: 200 },
                ..
            }
        ));
        assert_eq!(mock.count(MockCall::Close), 1);
    }

    #[tokio::test]
    async fn test_close_before_connect() {
        let mock = MockTransport::new();
        let (mut session, _rx) = session();
        session.cancel_handle().close();

        let err = session.connect(probe(&mock)).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(session.state().is_failed());

        session.disconnect().await;
        assert_eq!(*session.state(), SessionState::Idle);
        assert!(!session.cancel_handle().is_closed());
        session.connect(probe(&mock)).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_between_operations() {
        let mock = MockTransport::new();
        let (mut session, _rx) = session();
        session.connect(probe(&mock)).await.unwrap();

        session.cancel_handle().cancel();
        session.recover().await.unwrap();
        assert_eq!(*session.state(), SessionState::Identified);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_after_cancelled_write() {
        let mock = MockTransport::new();
        let (mut session, _rx) = session();
        session.connect(probe(&mock)).await.unwrap();

        mock.hang_on(MockCall::SendData);
        let cancel = session.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });
        let err = session.write(&[image(16)]).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.step(), Some(SessionStep::SendData));
        assert!(session.state().is_failed());

        mock.clear_hangs();
        session.recover().await.unwrap();
        assert_eq!(*session.state(), SessionState::Identified);
        assert!(session.write(&[image(16)]).await.is_ok());
    }

    #[tokio::test]
    async fn test_device_rom_size_wins() {
        let mock = MockTransport::new();
        mock.set_rom_size(Some(0x80000));
        let (mut session, _rx) = session();

        let cap = session.connect(probe(&mock)).await.unwrap();
        assert_eq!(cap.rom_size, 0x80000);
    }

    #[tokio::test]
    async fn test_unsupported_device() {
        let mock = MockTransport::new();
        mock.set_hardware_version(HardwareVersion {
            part: 0xFFFF,
            variant: 0,
            memory: MemoryInfo::default(),
        });
        let (mut session, _rx) = session();

        let err = session.connect(probe(&mock)).await.unwrap_err();
        assert!(matches!(err, SessionError::DeviceUnsupported { ref hardware_id, .. } if hardware_id == "ffff"));
        assert!(session.version_info().is_some());
        assert!(session.capability().is_none());
    }

    #[tokio::test]
    async fn test_connect_twice_rejected() {
        let mock = MockTransport::new();
        let (mut session, _rx) = session();
        session.connect(probe(&mock)).await.unwrap();
        assert!(matches!(
            session.connect(probe(&mock)).await,
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_write_is_noop() {
        let mock = MockTransport::new();
        let (mut session, mut rx) = session();
        session.connect(probe(&mock)).await.unwrap();
        mock.clear_calls();
        drain(&mut rx);

        assert_eq!(session.write(&[]).await.unwrap(), WriteOutcome::Skipped);
        assert!(mock.calls().is_empty());
        assert_eq!(*session.state(), SessionState::Identified);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_write_sends_init_and_pages() {
        let mock = MockTransport::new();
        let (mut session, mut rx) = session();
        session.connect(probe(&mock)).await.unwrap();

        let outcome = session.write(&[image(0x1800)]).await.unwrap();
        assert_eq!(
            outcome,
            WriteOutcome::Written {
                images: 1,
                bytes: 0x1800
            }
        );
        assert_eq!(*session.state(), SessionState::Identified);
        assert!(session.has_transport());

        let packets = mock.packets();
        assert_eq!(packets.len(), 1);
        // Packet.command -> Command.op_code = INIT
        assert_eq!(&packets[0][2..4], &[0x08, 0x01]);

        let data = mock.data();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].0, 0);
        assert_eq!(data[0].1.len(), 0x1000);
        assert_eq!(data[1].0, 0x1000);
        assert_eq!(data[1].1.len(), 0x800);

        let events = drain(&mut rx);
        let last_progress = events
            .iter()
            .filter_map(|e| match e {
                DfuEvent::WriteProgress { current, total, .. } => Some((*current, *total)),
                _ => None,
            })
            .last();
        assert_eq!(last_progress, Some((0x1800, 0x1800)));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, DfuEvent::WriteComplete { images: 1 }))
        );
    }

    #[tokio::test]
    async fn test_write_failure_keeps_transport() {
        let mock = MockTransport::new();
        let (mut session, _rx) = session();
        session.connect(probe(&mock)).await.unwrap();

        mock.fail_on(MockCall::SendData);
        let err = session.write(&[image(16)]).await.unwrap_err();
        assert_eq!(err.step(), Some(SessionStep::SendData));
        assert!(session.state().is_failed());
        assert!(session.has_transport());

        // Retry on the retained handle without reopening.
        mock.clear_failures();
        let opens = mock.count(MockCall::Open);
        session.write(&[image(16)]).await.unwrap();
        assert_eq!(mock.count(MockCall::Open), opens);
        assert_eq!(*session.state(), SessionState::Identified);

        session.disconnect().await;
        assert!(!session.has_transport());
        assert_eq!(*session.state(), SessionState::Idle);
        assert_eq!(mock.count(MockCall::Close), 2);
    }

    #[tokio::test]
    async fn test_write_rejects_oversized_image() {
        let mock = MockTransport::new();
        mock.set_rom_size(Some(0x1000));
        let (mut session, _rx) = session();
        session.connect(probe(&mock)).await.unwrap();
        mock.clear_calls();

        let err = session.write(&[image(16)]).await.unwrap_err();
        assert!(matches!(err, SessionError::ImageOutOfRange { .. }));
        assert_eq!(*session.state(), SessionState::Identified);
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_write_requires_identified() {
        let (mut session, _rx) = session();
        assert!(matches!(
            session.write(&[image(4)]).await,
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_recover_resets_and_reprobes() {
        let mock = MockTransport::new();
        let (mut session, _rx) = session();
        session.connect(probe(&mock)).await.unwrap();
        mock.fail_on(MockCall::SendData);
        session.write(&[image(4)]).await.unwrap_err();
        mock.clear_failures();
        mock.clear_calls();

        session.recover().await.unwrap();
        assert_eq!(*session.state(), SessionState::Identified);
        assert!(!session.has_transport());
        assert_eq!(
            mock.packets().last().cloned(),
            Some(encode_reset_packet(Some(0), None, None).unwrap())
        );
        assert_eq!(
            mock.calls(),
            vec![
                MockCall::SendPacket,
                MockCall::Close,
                MockCall::Open,
                MockCall::ProtocolVersion,
                MockCall::HardwareVersion,
                MockCall::FirmwareVersions,
                MockCall::Close,
            ]
        );
    }

    #[tokio::test]
    async fn test_recover_without_device() {
        let (mut session, _rx) = session();
        assert!(session.recover().await.is_err());
        assert_eq!(*session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_disconnect_from_idle() {
        let (mut session, mut rx) = session();
        session.disconnect().await;
        assert_eq!(*session.state(), SessionState::Idle);
        assert!(
            drain(&mut rx)
                .iter()
                .any(|e| matches!(e, DfuEvent::DeviceDisconnected { .. }))
        );
    }

    #[tokio::test]
    async fn test_serial_probe_uses_configured_baud_rate() {
        let connector = Arc::new(MockConnector::new(MockTransport::new()));
        let config = SessionConfig {
            baud_rate: 1_000_000,
            ..Default::default()
        };
        let probe = config.serial_probe("/dev/ttyACM1", connector.clone());
        probe.acquire().await.unwrap();
        assert_eq!(
            connector.endpoints(),
            vec![LinkEndpoint::Serial {
                port: "/dev/ttyACM1".into(),
                baud_rate: 1_000_000
            }]
        );
    }

    #[test]
    fn test_config_toml() {
        let config = SessionConfig {
            fw_version: Some(3),
            sd_req: vec![0x00B6, 0x00B7],
            ..Default::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: SessionConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);

        let partial: SessionConfig = toml::from_str("hash_type = \"crc\"\n").unwrap();
        assert_eq!(partial.hash_type, HashType::Crc);
        assert_eq!(partial.sd_req, vec![SD_REQ_ANY]);
    }

    #[test]
    fn test_config_file_roundtrip() {
        let path = std::env::temp_dir().join(format!("nrf-dfu-config-{}.toml", std::process::id()));
        let config = SessionConfig {
            debug: true,
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        assert_eq!(SessionConfig::load_from_file(&path).unwrap(), config);
        std::fs::remove_file(&path).unwrap();
    }
}
