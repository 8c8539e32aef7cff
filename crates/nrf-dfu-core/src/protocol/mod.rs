//! Protocol module - Nordic secure DFU wire definitions.

pub mod constants;
pub mod enums;
pub mod schema;
pub mod wire;

pub use constants::*;
pub use enums::{FwType, HashType, OpCode, SignatureType};
pub use schema::{DfuSchema, FieldKind, FieldSchema, MessageSchema};
pub use wire::MessageWriter;
