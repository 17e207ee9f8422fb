//! Remote records and field values.

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::RecordId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field name to value mapping of a record or local object.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// A single field value.
///
/// Values are compared by structural equality only: two dates, numbers or
/// byte strings are "changed" iff they are not `==`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// Floating point number.
    Double(f64),
    /// UTF-8 text.
    Text(String),
    /// Opaque bytes (assets, blobs).
    Bytes(Vec<u8>),
    /// Milliseconds since the Unix epoch.
    Date(i64),
    /// Reference to another record in the same zone, by record name.
    Reference(String),
    /// Ordered list of values.
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Returns true if this is an explicit null.
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Returns the referenced record name if this is a reference.
    pub fn as_reference(&self) -> Option<&str> {
        match self {
            FieldValue::Reference(target) => Some(target),
            _ => None,
        }
    }

    /// Returns the integer value if this is an integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the text value if this is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

/// A record as stored by the remote service.
///
/// `change_tag` is assigned by the server on every successful save; a push
/// carrying a stale tag is reported back as a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Record identifier.
    pub id: RecordId,
    /// Schema discriminator.
    pub record_type: String,
    /// Field values.
    pub fields: FieldMap,
    /// Server-assigned change tag, `None` for never-saved records.
    pub change_tag: Option<String>,
}

impl RemoteRecord {
    /// Creates an empty record that has never been saved.
    pub fn new(id: RecordId, record_type: impl Into<String>) -> Self {
        Self {
            id,
            record_type: record_type.into(),
            fields: FieldMap::new(),
            change_tag: None,
        }
    }

    /// Sets a field, builder style.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Returns a field value.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Sets a field value.
    pub fn set_field(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    /// Removes a field, returning its previous value.
    pub fn remove_field(&mut self, name: &str) -> Option<FieldValue> {
        self.fields.remove(name)
    }

    /// Returns a copy carrying only identity and change tag, no fields.
    pub fn system_fields(&self) -> Self {
        Self {
            id: self.id.clone(),
            record_type: self.record_type.clone(),
            fields: FieldMap::new(),
            change_tag: self.change_tag.clone(),
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| ProtocolError::encoding(e.to_string()))?;
        Ok(bytes)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        if bytes.is_empty() {
            return Err(ProtocolError::invalid_structure("empty record bytes"));
        }
        ciborium::from_reader(bytes).map_err(|e| ProtocolError::decoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ZoneId;

    fn record() -> RemoteRecord {
        RemoteRecord::new(RecordId::new(ZoneId::new("notes"), "Note.1"), "Note")
            .with_field("title", "groceries")
            .with_field("pinned", true)
            .with_field("attachment", FieldValue::Bytes(vec![0xCA, 0xFE]))
            .with_field("folder", FieldValue::Reference("Folder.7".into()))
    }

    #[test]
    fn encoded_record_preserves_fields_and_tag() {
        let mut original = record();
        original.change_tag = Some("tag-3".into());

        let decoded = RemoteRecord::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn decode_rejects_empty_and_garbage() {
        assert!(RemoteRecord::decode(&[]).is_err());
        assert!(RemoteRecord::decode(&[0xFF, 0x00, 0x13]).is_err());
    }

    #[test]
    fn system_fields_drop_values() {
        let mut original = record();
        original.change_tag = Some("tag-1".into());
        let system = original.system_fields();
        assert!(system.fields.is_empty());
        assert_eq!(system.change_tag.as_deref(), Some("tag-1"));
        assert_eq!(system.id, original.id);
    }

    #[test]
    fn reference_accessor() {
        let r = record();
        assert_eq!(r.field("folder").and_then(|v| v.as_reference()), Some("Folder.7"));
        assert_eq!(r.field("title").and_then(|v| v.as_reference()), None);
    }
}
