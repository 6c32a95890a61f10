// ABOUTME: Core library for logspool, containing the log record model and serializer contract.
// ABOUTME: This crate defines the shared types the store and its callers exchange.

pub mod log;
pub mod serializer;

pub use log::{AppExtension, AppProperty, COMMON_SCHEMA_TYPE, CommonSchemaEnvelope, LogRecord};
pub use serializer::{
    CommonSchemaLogFactory, FormatError, JsonLogSerializer, LogFactory, LogSerializer,
    PlainLogFactory, SerializeError,
};
