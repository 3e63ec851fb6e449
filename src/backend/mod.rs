//! Hosted backend boundary
//!
//! The record store, query engine and realtime channel live on a hosted
//! backend. The client only sees them through [`Backend`]:
//! - Record CRUD and filtered/sorted/expanded full-list queries
//! - Realtime create/update/delete events per collection

pub mod filter;
pub mod http;
pub mod memory;
pub mod realtime;

pub use http::HttpBackend;
pub use memory::MemoryBackend;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::conversion::{ConversionError, Fields};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Cannot reach backend at {0}")]
    Connection(String),

    #[error("Backend rejected request ({status}): {message}")]
    Rejected {
        status: u16,
        message: String,
        /// Field name to validation message.
        fields: BTreeMap<String, String>,
    },

    #[error("Record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("Failed to decode backend response: {0}")]
    Decode(String),

    #[error("Realtime channel error: {0}")]
    Realtime(String),
}

impl BackendError {
    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Rejected { status, .. } => Some(*status),
            BackendError::NotFound { .. } => Some(404),
            _ => None,
        }
    }

    pub fn field_errors(&self) -> BTreeMap<String, String> {
        match self {
            BackendError::Rejected { fields, .. } => fields.clone(),
            _ => BTreeMap::new(),
        }
    }

    /// Build a rejection from the backend's `{code, message, data}` body.
    pub fn from_error_body(status: u16, body: &str) -> Self {
        #[derive(Deserialize)]
        struct ErrorBody {
            #[serde(default)]
            message: String,
            #[serde(default)]
            data: BTreeMap<String, FieldError>,
        }

        #[derive(Deserialize)]
        struct FieldError {
            #[serde(default)]
            message: String,
        }

        match serde_json::from_str::<ErrorBody>(body) {
            Ok(parsed) => BackendError::Rejected {
                status,
                message: parsed.message,
                fields: parsed
                    .data
                    .into_iter()
                    .map(|(field, error)| (field, error.message))
                    .collect(),
            },
            Err(_) => BackendError::Rejected {
                status,
                message: body.to_string(),
                fields: BTreeMap::new(),
            },
        }
    }
}

impl From<ConversionError> for BackendError {
    fn from(error: ConversionError) -> Self {
        BackendError::Decode(error.to_string())
    }
}

/// Options for a full-list query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListQuery {
    pub filter: Option<String>,
    pub sort: Option<String>,
    pub expand: Option<String>,
}

impl ListQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn sort(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    pub fn expand(mut self, expand: impl Into<String>) -> Self {
        self.expand = Some(expand.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    Create,
    Update,
    Delete,
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventAction::Create => write!(f, "create"),
            EventAction::Update => write!(f, "update"),
            EventAction::Delete => write!(f, "delete"),
        }
    }
}

/// One realtime push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEvent {
    pub action: EventAction,
    pub record: Value,
}

/// Live feed of events for one collection. Ends when the backend closes the
/// channel or the collection is unsubscribed.
pub struct Subscription {
    collection: String,
    events: BoxStream<'static, RecordEvent>,
}

impl Subscription {
    pub fn new(collection: impl Into<String>, events: BoxStream<'static, RecordEvent>) -> Self {
        Self { collection: collection.into(), events }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub async fn next(&mut self) -> Option<RecordEvent> {
        self.events.next().await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("collection", &self.collection).finish()
    }
}

/// Client API of the hosted backend.
///
/// Writes are single-document and carry no concurrency control. Access rules
/// are enforced server side; rejections come back as [`BackendError`].
#[async_trait]
pub trait Backend: Send + Sync {
    async fn create(&self, collection: &str, fields: Fields) -> Result<Value, BackendError>;

    async fn update(&self, collection: &str, id: &str, fields: Fields) -> Result<Value, BackendError>;

    async fn get_one(&self, collection: &str, id: &str, expand: Option<&str>) -> Result<Value, BackendError>;

    /// Every record matching `query`, following pagination to the end.
    async fn get_full_list(&self, collection: &str, query: &ListQuery) -> Result<Vec<Value>, BackendError>;

    /// Hard delete. Admin-only on the backend; the list store never calls it.
    async fn delete(&self, collection: &str, id: &str) -> Result<(), BackendError>;

    /// Subscribe to `pattern` (`*` or a record id) on `collection`.
    async fn subscribe(
        &self,
        collection: &str,
        pattern: &str,
        expand: Option<&str>,
    ) -> Result<Subscription, BackendError>;

    async fn unsubscribe(&self, collection: &str) -> Result<(), BackendError>;
}

/// Read the `id` field of a backend record.
pub fn record_id(record: &Value) -> Option<&str> {
    record.get("id").and_then(Value::as_str)
}
