// ABOUTME: Defines the LogRecord produced by instrumentation and its optional common-schema envelope.
// ABOUTME: Records are immutable once queued; the target token travels beside the body, never inside it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Type tag for records that carry a common-schema envelope.
pub const COMMON_SCHEMA_TYPE: &str = "commonSchemaEvent";

/// A structured telemetry record. Records have no identity of their own;
/// the queue assigns row ids when they are stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(rename = "type")]
    pub log_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<Ulid>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_schema: Option<CommonSchemaEnvelope>,

    /// Delivery-target token. Never serialized: it is persisted separately,
    /// encrypted at rest, and restored onto the record when drained.
    #[serde(skip)]
    pub target_token: Option<String>,
}

impl LogRecord {
    /// Create a record of the given type stamped with the current time.
    pub fn new(log_type: impl Into<String>) -> Self {
        Self {
            log_type: log_type.into(),
            timestamp: Utc::now(),
            sid: None,
            properties: BTreeMap::new(),
            common_schema: None,
            target_token: None,
        }
    }

    /// Create a common-schema record bound to a delivery-target token.
    pub fn common_schema(envelope: CommonSchemaEnvelope, target_token: impl Into<String>) -> Self {
        let mut record = Self::new(COMMON_SCHEMA_TYPE);
        record.common_schema = Some(envelope);
        record.target_token = Some(target_token.into());
        record
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn is_common_schema(&self) -> bool {
        self.common_schema.is_some()
    }
}

/// Common-schema metadata carried by records routed to a one-collector target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommonSchemaEnvelope {
    pub ver: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i_key: Option<String>,
    #[serde(default, skip_serializing_if = "AppExtension::is_empty")]
    pub app: AppExtension,
}

impl CommonSchemaEnvelope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            ver: "3.0".to_string(),
            name: name.into(),
            i_key: None,
            app: AppExtension::default(),
        }
    }

    /// Read an app-level property by its enumerated name.
    pub fn get(&self, property: AppProperty) -> Option<&str> {
        match property {
            AppProperty::Name => self.app.name.as_deref(),
            AppProperty::Version => self.app.ver.as_deref(),
            AppProperty::Locale => self.app.locale.as_deref(),
        }
    }

    /// Overwrite an app-level property. Empty strings clear the value.
    pub fn set(&mut self, property: AppProperty, value: Option<String>) {
        let value = value.filter(|v| !v.is_empty());
        match property {
            AppProperty::Name => self.app.name = value,
            AppProperty::Version => self.app.ver = value,
            AppProperty::Locale => self.app.locale = value,
        }
    }
}

/// The `app` extension of a common-schema envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppExtension {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

impl AppExtension {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.ver.is_none() && self.locale.is_none()
    }
}

/// Enumerated accessors for the configurable app properties of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppProperty {
    Name,
    Version,
    Locale,
}

impl AppProperty {
    pub const ALL: [AppProperty; 3] = [AppProperty::Name, AppProperty::Version, AppProperty::Locale];

    pub fn as_str(self) -> &'static str {
        match self {
            AppProperty::Name => "app_name",
            AppProperty::Version => "app_version",
            AppProperty::Locale => "app_locale",
        }
    }
}
