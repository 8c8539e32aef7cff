//! Protobuf wire writer driven by the `dfu` schema.
//!
//! Fields are looked up by name in the schema, so a writer can only emit
//! what the schema describes. Fields must be written in ascending tag
//! order, which keeps the output byte-stable for identical input.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use super::schema::{DfuSchema, FieldKind, FieldSchema, MessageSchema};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error("Unknown field {message}.{field}")]
    UnknownField { message: &'static str, field: String },

    #[error("Field {message}.{field} is not of kind {expected}")]
    KindMismatch {
        message: &'static str,
        field: &'static str,
        expected: &'static str,
    },

    #[error("Field {message}.{field} written out of tag order")]
    OutOfOrder {
        message: &'static str,
        field: &'static str,
    },
}

/// Writes one message of the schema.
#[derive(Debug)]
pub struct MessageWriter {
    schema: &'static MessageSchema,
    buf: BytesMut,
    last_tag: u32,
}

impl MessageWriter {
    pub fn new(message: &str) -> Result<Self, SchemaError> {
        let schema = DfuSchema::global()
            .message(message)
            .ok_or_else(|| SchemaError::UnknownMessage(message.to_string()))?;
        Ok(Self {
            schema,
            buf: BytesMut::new(),
            last_tag: 0,
        })
    }

    pub fn message_name(&self) -> &'static str {
        self.schema.name
    }

    fn begin(
        &mut self,
        name: &str,
        expected: &'static str,
        accept: impl Fn(FieldKind) -> bool,
    ) -> Result<&'static FieldSchema, SchemaError> {
        let field = self.schema.field(name).ok_or_else(|| SchemaError::UnknownField {
            message: self.schema.name,
            field: name.to_string(),
        })?;
        if !accept(field.kind) {
            return Err(SchemaError::KindMismatch {
                message: self.schema.name,
                field: field.name,
                expected,
            });
        }
        if field.tag <= self.last_tag {
            return Err(SchemaError::OutOfOrder {
                message: self.schema.name,
                field: field.name,
            });
        }
        self.last_tag = field.tag;
        put_varint(&mut self.buf, field.key() as u64);
        Ok(field)
    }

    pub fn uint32(&mut self, name: &str, value: u32) -> Result<&mut Self, SchemaError> {
        self.begin(name, "uint32", |k| k == FieldKind::Uint32)?;
        put_varint(&mut self.buf, value as u64);
        Ok(self)
    }

    pub fn enumeration(&mut self, name: &str, value: u32) -> Result<&mut Self, SchemaError> {
        self.begin(name, "enum", |k| k == FieldKind::Enum)?;
        put_varint(&mut self.buf, value as u64);
        Ok(self)
    }

    pub fn boolean(&mut self, name: &str, value: bool) -> Result<&mut Self, SchemaError> {
        self.begin(name, "bool", |k| k == FieldKind::Bool)?;
        self.buf.put_u8(value as u8);
        Ok(self)
    }

    pub fn bytes(&mut self, name: &str, value: &[u8]) -> Result<&mut Self, SchemaError> {
        self.begin(name, "bytes", |k| k == FieldKind::Bytes)?;
        put_varint(&mut self.buf, value.len() as u64);
        self.buf.put_slice(value);
        Ok(self)
    }

    pub fn packed_uint32(&mut self, name: &str, values: &[u32]) -> Result<&mut Self, SchemaError> {
        // An empty packed field is omitted entirely.
        if values.is_empty() {
            return Ok(self);
        }
        self.begin(name, "packed uint32", |k| k == FieldKind::PackedUint32)?;
        let mut payload = BytesMut::new();
        for &v in values {
            put_varint(&mut payload, v as u64);
        }
        put_varint(&mut self.buf, payload.len() as u64);
        self.buf.put_slice(&payload);
        Ok(self)
    }

    pub fn message(&mut self, name: &str, nested: MessageWriter) -> Result<&mut Self, SchemaError> {
        let nested_name = nested.schema.name;
        self.begin(name, nested_name, |k| k == FieldKind::Message(nested_name))?;
        put_varint(&mut self.buf, nested.buf.len() as u64);
        self.buf.put_slice(&nested.buf);
        Ok(self)
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Base-128 varint, least significant group first.
pub fn put_varint(buf: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 0);
        put_varint(&mut buf, 300);
        put_varint(&mut buf, 0xFFFE);
        assert_eq!(&buf[..], &[0x00, 0xAC, 0x02, 0xFE, 0xFF, 0x03]);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut w = MessageWriter::new("dfu.ResetCommand").unwrap();
        let err = w.uint32("delay", 1).unwrap_err();
        assert!(matches!(err, SchemaError::UnknownField { .. }));
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let mut w = MessageWriter::new("dfu.Hash").unwrap();
        assert!(matches!(
            w.uint32("hash_type", 3),
            Err(SchemaError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_out_of_order_rejected() {
        let mut w = MessageWriter::new("dfu.Hash").unwrap();
        w.bytes("hash", &[1]).unwrap();
        assert!(matches!(
            w.enumeration("hash_type", 0),
            Err(SchemaError::OutOfOrder { .. })
        ));
    }

    #[test]
    fn test_nested_message_type_checked() {
        let hash = MessageWriter::new("dfu.Hash").unwrap();
        let mut cmd = MessageWriter::new("dfu.Command").unwrap();
        assert!(matches!(
            cmd.message("init", hash),
            Err(SchemaError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_message() {
        assert!(MessageWriter::new("dfu.Nope").is_err());
    }
}
