//! The `dfu` control-command schema.
//!
//! The schema is fixed data: message shapes, field names and numeric tags.
//! It is indexed once per process on first use and never reloaded.

use std::collections::HashMap;
use std::sync::LazyLock;

use super::constants::{SCHEMA_PACKAGE, SCHEMA_VERSION};

/// Protobuf wire type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Varint = 0,
    Len = 2,
}

/// Value kind of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Uint32,
    Enum,
    Bool,
    Bytes,
    PackedUint32,
    /// Nested message, by fully qualified name.
    Message(&'static str),
}

impl FieldKind {
    pub fn wire_type(&self) -> WireType {
        match self {
            FieldKind::Uint32 | FieldKind::Enum | FieldKind::Bool => WireType::Varint,
            FieldKind::Bytes | FieldKind::PackedUint32 | FieldKind::Message(_) => WireType::Len,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSchema {
    pub name: &'static str,
    pub tag: u32,
    pub kind: FieldKind,
}

impl FieldSchema {
    /// Encoded field key (`tag << 3 | wire_type`).
    pub fn key(&self) -> u32 {
        (self.tag << 3) | self.kind.wire_type() as u32
    }
}

#[derive(Debug)]
pub struct MessageSchema {
    pub name: &'static str,
    pub fields: &'static [FieldSchema],
}

impl MessageSchema {
    pub fn field(&self, name: &str) -> Option<&'static FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }
}

const fn field(name: &'static str, tag: u32, kind: FieldKind) -> FieldSchema {
    FieldSchema { name, tag, kind }
}

static HASH: MessageSchema = MessageSchema {
    name: "dfu.Hash",
    fields: &[
        field("hash_type", 1, FieldKind::Enum),
        field("hash", 2, FieldKind::Bytes),
    ],
};

static RESET_COMMAND: MessageSchema = MessageSchema {
    name: "dfu.ResetCommand",
    fields: &[field("timeout", 1, FieldKind::Uint32)],
};

static INIT_COMMAND: MessageSchema = MessageSchema {
    name: "dfu.InitCommand",
    fields: &[
        field("fw_version", 1, FieldKind::Uint32),
        field("hw_version", 2, FieldKind::Uint32),
        field("sd_req", 3, FieldKind::PackedUint32),
        field("type", 4, FieldKind::Enum),
        field("sd_size", 5, FieldKind::Uint32),
        field("bl_size", 6, FieldKind::Uint32),
        field("app_size", 7, FieldKind::Uint32),
        field("hash", 8, FieldKind::Message("dfu.Hash")),
        field("is_debug", 9, FieldKind::Bool),
    ],
};

static COMMAND: MessageSchema = MessageSchema {
    name: "dfu.Command",
    fields: &[
        field("op_code", 1, FieldKind::Enum),
        field("init", 2, FieldKind::Message("dfu.InitCommand")),
        field("reset", 3, FieldKind::Message("dfu.ResetCommand")),
    ],
};

static SIGNED_COMMAND: MessageSchema = MessageSchema {
    name: "dfu.SignedCommand",
    fields: &[
        field("command", 1, FieldKind::Message("dfu.Command")),
        field("signature_type", 2, FieldKind::Enum),
        field("signature", 3, FieldKind::Bytes),
    ],
};

static PACKET: MessageSchema = MessageSchema {
    name: "dfu.Packet",
    fields: &[
        field("command", 1, FieldKind::Message("dfu.Command")),
        field("signed_command", 2, FieldKind::Message("dfu.SignedCommand")),
    ],
};

static ALL_MESSAGES: [&MessageSchema; 6] = [
    &HASH,
    &RESET_COMMAND,
    &INIT_COMMAND,
    &COMMAND,
    &SIGNED_COMMAND,
    &PACKET,
];

static SCHEMA: LazyLock<DfuSchema> = LazyLock::new(DfuSchema::load);

/// Indexed view of the control-command schema.
#[derive(Debug)]
pub struct DfuSchema {
    version: &'static str,
    messages: HashMap<&'static str, &'static MessageSchema>,
}

impl DfuSchema {
    fn load() -> Self {
        let messages = ALL_MESSAGES.iter().map(|m| (m.name, *m)).collect();
        tracing::debug!(version = SCHEMA_VERSION, package = SCHEMA_PACKAGE, "DFU schema loaded");
        Self {
            version: SCHEMA_VERSION,
            messages,
        }
    }

    /// The process-wide schema.
    pub fn global() -> &'static DfuSchema {
        &SCHEMA
    }

    pub fn version(&self) -> &'static str {
        self.version
    }

    pub fn message(&self, name: &str) -> Option<&'static MessageSchema> {
        self.messages.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_is_shared() {
        let a = DfuSchema::global() as *const DfuSchema;
        let b = DfuSchema::global() as *const DfuSchema;
        assert_eq!(a, b);
        assert_eq!(DfuSchema::global().version(), "dfu-cc/1");
    }

    #[test]
    fn test_field_keys() {
        let init = DfuSchema::global().message("dfu.InitCommand").unwrap();
        assert_eq!(init.field("sd_req").unwrap().key(), 0x1A);
        assert_eq!(init.field("hash").unwrap().key(), 0x42);
        assert_eq!(init.field("is_debug").unwrap().key(), 0x48);
        assert!(init.field("timeout").is_none());
    }

    #[test]
    fn test_nested_messages_resolve() {
        let schema = DfuSchema::global();
        for message in ALL_MESSAGES {
            for f in message.fields {
                if let FieldKind::Message(name) = f.kind {
                    assert!(schema.message(name).is_some(), "{name} missing");
                }
            }
        }
    }

    #[test]
    fn test_tags_ascending() {
        for message in ALL_MESSAGES {
            assert!(message.fields.windows(2).all(|w| w[0].tag < w[1].tag));
        }
    }
}
