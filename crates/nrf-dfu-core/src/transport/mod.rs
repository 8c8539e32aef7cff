//! Transport layer module.

pub mod mock;
pub mod probe;
pub mod traits;
pub mod usb;

pub use mock::{MockCall, MockConnector, MockTransport};
pub use probe::{DeviceProbe, LinkEndpoint, ProbeKind, SerialProbe, TransportConnector, UsbProbe};
pub use traits::{DfuTransport, TransportError};
