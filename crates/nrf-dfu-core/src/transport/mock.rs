//! Mock DFU transport for testing.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::probe::{LinkEndpoint, TransportConnector};
use super::traits::{DfuTransport, TransportError};
use crate::version::{FirmwareImageType, FirmwareVersion, HardwareVersion, MemoryInfo};

/// Transport operations, as recorded by the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockCall {
    Open,
    Close,
    ProtocolVersion,
    HardwareVersion,
    FirmwareVersions,
    SendPacket,
    SendData,
}

#[derive(Debug)]
struct MockState {
    open: bool,
    calls: Vec<MockCall>,
    packets: Vec<Vec<u8>>,
    data: Vec<(u32, Vec<u8>)>,
    failing: HashSet<MockCall>,
    hanging: HashSet<MockCall>,
    protocol_version: u8,
    hardware_version: HardwareVersion,
    firmware_versions: Vec<FirmwareVersion>,
}

/// Mock transport for unit testing session logic.
///
/// Clones share state, so a test can keep one copy while the session owns
/// another.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// An nRF52840 bootloader that answers every query.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                open: false,
                calls: Vec::new(),
                packets: Vec::new(),
                data: Vec::new(),
                failing: HashSet::new(),
                hanging: HashSet::new(),
                protocol_version: 1,
                hardware_version: HardwareVersion {
                    part: 0x52840,
                    variant: 0x41414430,
                    memory: MemoryInfo::default(),
                },
                firmware_versions: vec![FirmwareVersion {
                    image_type: FirmwareImageType::Bootloader,
                    version: 1,
                    addr: 0xE0000,
                    length: 0x18000,
                }],
            })),
        }
    }

    pub fn set_hardware_version(&self, hardware_version: HardwareVersion) {
        self.state.lock().unwrap().hardware_version = hardware_version;
    }

    pub fn set_rom_size(&self, rom_size: Option<u32>) {
        self.state.lock().unwrap().hardware_version.memory.rom_size = rom_size;
    }

    /// Make `call` fail with `TransportError::Query`/`SendFailed`.
    pub fn fail_on(&self, call: MockCall) {
        self.state.lock().unwrap().failing.insert(call);
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failing.clear();
    }

    /// Make `call` never complete.
    pub fn hang_on(&self, call: MockCall) {
        self.state.lock().unwrap().hanging.insert(call);
    }

    /// Let calls marked with `hang_on` complete again.
    pub fn clear_hangs(&self) {
        self.state.lock().unwrap().hanging.clear();
    }

    /// All recorded calls, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call: MockCall) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|&&c| c == call)
            .count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Captured control packets.
    pub fn packets(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().packets.clone()
    }

    /// Captured payload chunks with their offsets.
    pub fn data(&self) -> Vec<(u32, Vec<u8>)> {
        self.state.lock().unwrap().data.clone()
    }

    /// Simulate the link dropping.
    pub fn disconnect(&self) {
        self.state.lock().unwrap().open = false;
    }

    async fn enter(&self, call: MockCall, needs_open: bool) -> Result<(), TransportError> {
        let (hang, fail) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call);
            if needs_open && !state.open {
                return Err(TransportError::NotOpen);
            }
            (state.hanging.contains(&call), state.failing.contains(&call))
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(match call {
                MockCall::Open => TransportError::OpenFailed("mock".into()),
                MockCall::SendPacket | MockCall::SendData => {
                    TransportError::SendFailed("mock".into())
                }
                _ => TransportError::Query(format!("{call:?} failed")),
            });
        }
        Ok(())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DfuTransport for MockTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        self.enter(MockCall::Open, false).await?;
        self.state.lock().unwrap().open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.state.lock().unwrap().open = false;
        self.enter(MockCall::Close, false).await
    }

    async fn protocol_version(&mut self) -> Result<u8, TransportError> {
        self.enter(MockCall::ProtocolVersion, true).await?;
        Ok(self.state.lock().unwrap().protocol_version)
    }

    async fn hardware_version(&mut self) -> Result<HardwareVersion, TransportError> {
        self.enter(MockCall::HardwareVersion, true).await?;
        Ok(self.state.lock().unwrap().hardware_version)
    }

    async fn firmware_versions(&mut self) -> Result<Vec<FirmwareVersion>, TransportError> {
        self.enter(MockCall::FirmwareVersions, true).await?;
        Ok(self.state.lock().unwrap().firmware_versions.clone())
    }

    async fn send_packet(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        self.enter(MockCall::SendPacket, true).await?;
        self.state.lock().unwrap().packets.push(packet.to_vec());
        Ok(())
    }

    async fn send_data(&mut self, offset: u32, data: &[u8]) -> Result<(), TransportError> {
        self.enter(MockCall::SendData, true).await?;
        self.state.lock().unwrap().data.push((offset, data.to_vec()));
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }
}

/// Connector handing out clones of one mock transport.
#[derive(Debug, Default)]
pub struct MockConnector {
    transport: MockTransport,
    endpoints: Mutex<Vec<LinkEndpoint>>,
}

impl MockConnector {
    pub fn new(transport: MockTransport) -> Self {
        Self {
            transport,
            endpoints: Mutex::new(Vec::new()),
        }
    }

    pub fn transport(&self) -> &MockTransport {
        &self.transport
    }

    /// Endpoints connected so far.
    pub fn endpoints(&self) -> Vec<LinkEndpoint> {
        self.endpoints.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn connect(
        &self,
        endpoint: &LinkEndpoint,
    ) -> Result<Box<dyn DfuTransport>, TransportError> {
        self.endpoints.lock().unwrap().push(endpoint.clone());
        Ok(Box::new(self.transport.clone()))
    }
}
