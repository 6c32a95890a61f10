// ABOUTME: Pluggable conversion between LogRecords and their persisted JSON text.
// ABOUTME: Decoding dispatches on a type tag through a registry of LogFactory implementations.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::log::{COMMON_SCHEMA_TYPE, LogRecord};

/// A record could not be turned into storable text.
#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no factory registered for log type '{0}'")]
    UnregisteredType(String),
}

/// Stored text could not be turned back into a record.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("log body has no type tag")]
    MissingType,

    #[error("unknown log type '{0}'")]
    UnknownType(String),

    #[error("invalid {log_type} log: {reason}")]
    Invalid { log_type: String, reason: String },
}

/// Converts records to and from the text stored in the queue.
pub trait LogSerializer: Send + Sync {
    fn serialize(&self, record: &LogRecord) -> Result<String, SerializeError>;

    /// Decode stored text. `type_tag` comes from the row's data-type column
    /// and is `None` for rows written before that column existed.
    fn deserialize(&self, text: &str, type_tag: Option<&str>) -> Result<LogRecord, FormatError>;
}

/// Builds a typed record from its parsed JSON value.
pub trait LogFactory: Send + Sync {
    fn create(&self, value: serde_json::Value) -> Result<LogRecord, FormatError>;
}

/// Factory for plain property-bag records.
#[derive(Debug, Default)]
pub struct PlainLogFactory;

impl LogFactory for PlainLogFactory {
    fn create(&self, value: serde_json::Value) -> Result<LogRecord, FormatError> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Factory for common-schema records, which must carry their envelope.
#[derive(Debug, Default)]
pub struct CommonSchemaLogFactory;

impl LogFactory for CommonSchemaLogFactory {
    fn create(&self, value: serde_json::Value) -> Result<LogRecord, FormatError> {
        let record: LogRecord = serde_json::from_value(value)?;
        match &record.common_schema {
            Some(envelope) if !envelope.name.is_empty() => Ok(record),
            Some(_) => Err(FormatError::Invalid {
                log_type: record.log_type,
                reason: "envelope has an empty name".to_string(),
            }),
            None => Err(FormatError::Invalid {
                log_type: record.log_type,
                reason: "missing common schema envelope".to_string(),
            }),
        }
    }
}

/// The default JSON serializer. Types must be registered before records of
/// that type can be written or read back.
#[derive(Clone, Default)]
pub struct JsonLogSerializer {
    factories: HashMap<String, Arc<dyn LogFactory>>,
    /// Used for types with no registered factory, when set.
    fallback: Option<Arc<dyn LogFactory>>,
}

impl JsonLogSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A serializer with the common-schema factory pre-registered.
    pub fn with_common_schema() -> Self {
        let mut serializer = Self::new();
        serializer.add_factory(COMMON_SCHEMA_TYPE, CommonSchemaLogFactory);
        serializer
    }

    pub fn add_factory(&mut self, log_type: impl Into<String>, factory: impl LogFactory + 'static) {
        self.factories.insert(log_type.into(), Arc::new(factory));
    }

    /// Accept every unregistered type through `factory`.
    pub fn with_fallback(mut self, factory: impl LogFactory + 'static) -> Self {
        self.fallback = Some(Arc::new(factory));
        self
    }

    pub fn has_factory(&self, log_type: &str) -> bool {
        self.factories.contains_key(log_type) || self.fallback.is_some()
    }

    fn factory(&self, log_type: &str) -> Option<&Arc<dyn LogFactory>> {
        self.factories.get(log_type).or(self.fallback.as_ref())
    }
}

impl std::fmt::Debug for JsonLogSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.factories.keys().collect();
        types.sort();
        f.debug_struct("JsonLogSerializer")
            .field("types", &types)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl LogSerializer for JsonLogSerializer {
    fn serialize(&self, record: &LogRecord) -> Result<String, SerializeError> {
        if !self.has_factory(&record.log_type) {
            return Err(SerializeError::UnregisteredType(record.log_type.clone()));
        }
        Ok(serde_json::to_string(record)?)
    }

    fn deserialize(&self, text: &str, type_tag: Option<&str>) -> Result<LogRecord, FormatError> {
        let value: serde_json::Value = serde_json::from_str(text)?;

        let log_type = match type_tag {
            Some(tag) => tag.to_string(),
            None => value
                .get("type")
                .and_then(|t| t.as_str())
                .ok_or(FormatError::MissingType)?
                .to_string(),
        };

        let factory = self
            .factory(&log_type)
            .ok_or_else(|| FormatError::UnknownType(log_type.clone()))?;

        factory.create(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::CommonSchemaEnvelope;

    fn serializer() -> JsonLogSerializer {
        let mut s = JsonLogSerializer::with_common_schema();
        s.add_factory("event", PlainLogFactory);
        s
    }

    #[test]
    fn serialize_rejects_unregistered_type() {
        let s = serializer();
        let err = s.serialize(&LogRecord::new("mystery")).unwrap_err();
        assert!(matches!(err, SerializeError::UnregisteredType(t) if t == "mystery"));
    }

    #[test]
    fn deserialize_uses_tag_or_embedded_type() {
        let s = serializer();
        let record = LogRecord::new("event").with_property("k", "v");
        let text = s.serialize(&record).unwrap();

        assert_eq!(s.deserialize(&text, Some("event")).unwrap(), record);
        assert_eq!(s.deserialize(&text, None).unwrap(), record);
    }

    #[test]
    fn deserialize_reports_malformed_and_unknown() {
        let s = serializer();

        assert!(matches!(
            s.deserialize("{not json", None),
            Err(FormatError::Json(_))
        ));
        assert!(matches!(
            s.deserialize(r#"{"timestamp":"2024-01-01T00:00:00Z"}"#, None),
            Err(FormatError::MissingType)
        ));
        assert!(matches!(
            s.deserialize(r#"{"type":"other","timestamp":"2024-01-01T00:00:00Z"}"#, None),
            Err(FormatError::UnknownType(t)) if t == "other"
        ));
    }

    #[test]
    fn fallback_accepts_any_type() {
        let s = JsonLogSerializer::with_common_schema().with_fallback(PlainLogFactory);
        let record = LogRecord::new("anything").with_property("k", "v");

        let text = s.serialize(&record).unwrap();
        assert_eq!(s.deserialize(&text, None).unwrap(), record);

        // Registered types still use their own factory.
        let text = format!(
            r#"{{"type":"{}","timestamp":"2024-01-01T00:00:00Z"}}"#,
            COMMON_SCHEMA_TYPE
        );
        assert!(s.deserialize(&text, None).is_err());
    }

    #[test]
    fn common_schema_factory_requires_envelope() {
        let s = serializer();
        let text = format!(
            r#"{{"type":"{}","timestamp":"2024-01-01T00:00:00Z"}}"#,
            COMMON_SCHEMA_TYPE
        );
        assert!(matches!(
            s.deserialize(&text, Some(COMMON_SCHEMA_TYPE)),
            Err(FormatError::Invalid { .. })
        ));

        let record = LogRecord::common_schema(CommonSchemaEnvelope::new("click"), "token");
        let text = s.serialize(&record).unwrap();
        let back = s.deserialize(&text, Some(COMMON_SCHEMA_TYPE)).unwrap();
        assert_eq!(back.common_schema, record.common_schema);
        assert!(back.target_token.is_none());
    }
}
