//! In-memory backend.
//!
//! Behaves like the hosted backend for the subset the client uses: generated
//! ids, equality filters, single-level expand and realtime events. Faults can
//! be queued per operation so tests can fail any step of a multi-write flow.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{Mutex, RwLock};

use super::{filter, record_id, Backend, BackendError, EventAction, ListQuery, RecordEvent, Subscription};
use crate::config::Collections;
use crate::model::conversion::Fields;
use crate::model::dates::format_datetime;

type Store = HashMap<String, Vec<Value>>;
/// (collection, field) -> related collection.
type Relations = HashMap<(String, String), String>;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    GetOne,
    List,
    Delete,
}

/// A create or update the backend accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteLog {
    pub operation: Operation,
    pub collection: String,
    pub id: String,
    pub fields: Fields,
}

#[derive(Debug)]
struct Fault {
    operation: Operation,
    collection: String,
    id: Option<String>,
    error: BackendError,
}

#[derive(Debug, Clone)]
enum Broadcast {
    Event { collection: String, event: RecordEvent },
    Closed { collection: String },
}

#[derive(Debug)]
pub struct MemoryBackend {
    collections: Arc<RwLock<Store>>,
    relations: Arc<Relations>,
    events: broadcast::Sender<Broadcast>,
    faults: Mutex<Vec<Fault>>,
    writes: Mutex<Vec<WriteLog>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        MemoryBackend {
            collections: Arc::new(RwLock::new(HashMap::new())),
            relations: Arc::new(HashMap::new()),
            events,
            faults: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Backend with the OT schema's relation fields registered for expand.
    pub fn for_collections(names: &Collections) -> Self {
        Self::new()
            .with_relation(&names.procedures, "patient", &names.patients)
            .with_relation(&names.procedures, "ot_day", &names.ot_days)
            .with_relation(&names.procedures, "operating_room", &names.operating_rooms)
            .with_relation(&names.comments, "procedure", &names.procedures)
            .with_relation(&names.operating_rooms, "ot_list", &names.ot_lists)
            .with_relation(&names.ot_days, "ot_list", &names.ot_lists)
    }

    pub fn with_relation(mut self, collection: &str, field: &str, target: &str) -> Self {
        Arc::make_mut(&mut self.relations).insert((collection.to_string(), field.to_string()), target.to_string());
        self
    }

    /// Insert a record directly: no events, no write log, no faults.
    pub async fn seed(&self, collection: &str, record: Value) -> Value {
        let mut fields = match record {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        if fields.get("id").and_then(Value::as_str).is_none() {
            fields.insert("id".to_string(), Value::String(generate_id()));
        }
        fields.insert("collectionName".to_string(), Value::String(collection.to_string()));
        let record = Value::Object(fields);
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .push(record.clone());
        record
    }

    /// Fail the next `operation` on `collection` with `error`.
    pub async fn fail_next(&self, operation: Operation, collection: &str, error: BackendError) {
        self.faults.lock().await.push(Fault {
            operation,
            collection: collection.to_string(),
            id: None,
            error,
        });
    }

    /// Fail the next `operation` on one record.
    pub async fn fail_record(&self, operation: Operation, collection: &str, id: &str, error: BackendError) {
        self.faults.lock().await.push(Fault {
            operation,
            collection: collection.to_string(),
            id: Some(id.to_string()),
            error,
        });
    }

    pub async fn writes(&self) -> Vec<WriteLog> {
        self.writes.lock().await.clone()
    }

    pub async fn clear_writes(&self) {
        self.writes.lock().await.clear();
    }

    pub async fn records(&self, collection: &str) -> Vec<Value> {
        self.collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    async fn take_fault(&self, operation: Operation, collection: &str, id: Option<&str>) -> Result<(), BackendError> {
        let mut faults = self.faults.lock().await;
        let position = faults.iter().position(|fault| {
            fault.operation == operation
                && fault.collection == collection
                && fault.id.as_deref().map_or(true, |wanted| Some(wanted) == id)
        });
        match position {
            Some(index) => Err(faults.remove(index).error),
            None => Ok(()),
        }
    }

    async fn log(&self, operation: Operation, collection: &str, id: &str, fields: Fields) {
        self.writes.lock().await.push(WriteLog {
            operation,
            collection: collection.to_string(),
            id: id.to_string(),
            fields,
        });
    }

    fn publish(&self, collection: &str, action: EventAction, record: &Value) {
        // No receivers is fine.
        let _ = self.events.send(Broadcast::Event {
            collection: collection.to_string(),
            event: RecordEvent { action, record: record.clone() },
        });
    }
}

fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string().chars().take(15).collect()
}

fn not_found(collection: &str, id: &str) -> BackendError {
    BackendError::NotFound {
        collection: collection.to_string(),
        id: id.to_string(),
    }
}

fn expand_record(store: &Store, relations: &Relations, collection: &str, record: &mut Value, expand: &str) {
    let mut expanded = Map::new();
    for field in expand.split(',').map(str::trim).filter(|field| !field.is_empty()) {
        let Some(target) = relations.get(&(collection.to_string(), field.to_string())) else {
            continue;
        };
        let Some(id) = record.get(field).and_then(Value::as_str) else {
            continue;
        };
        let related = store
            .get(target)
            .and_then(|records| records.iter().find(|candidate| record_id(candidate) == Some(id)));
        if let Some(related) = related {
            expanded.insert(field.to_string(), related.clone());
        }
    }
    if !expanded.is_empty() {
        if let Some(fields) = record.as_object_mut() {
            fields.insert("expand".to_string(), Value::Object(expanded));
        }
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => {
            let (a, b) = (a.as_f64().unwrap_or_default(), b.as_f64().unwrap_or_default());
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

/// Stable multi-key sort: `order`, `-created`, `ot_day,order`.
fn sort_records(records: &mut [Value], sort: &str) {
    let keys: Vec<(&str, bool)> = sort
        .split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(|key| match key.strip_prefix('-') {
            Some(field) => (field, true),
            None => (key.strip_prefix('+').unwrap_or(key), false),
        })
        .collect();

    records.sort_by(|a, b| {
        keys.iter()
            .map(|(field, descending)| {
                let ordering = compare_values(a.get(*field), b.get(*field));
                if *descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            })
            .find(|ordering| *ordering != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn create(&self, collection: &str, fields: Fields) -> Result<Value, BackendError> {
        self.take_fault(Operation::Create, collection, None).await?;

        let mut record = fields.clone();
        let id = match record.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => generate_id(),
        };
        let now = Value::String(format_datetime(&Utc::now()));
        record.insert("id".to_string(), Value::String(id.clone()));
        record.insert("collectionName".to_string(), Value::String(collection.to_string()));
        record.insert("created".to_string(), now.clone());
        record.insert("updated".to_string(), now);
        let record = Value::Object(record);

        {
            let mut store = self.collections.write().await;
            let records = store.entry(collection.to_string()).or_default();
            if records.iter().any(|existing| record_id(existing) == Some(id.as_str())) {
                return Err(BackendError::from_error_body(
                    400,
                    r#"{"message":"Failed to create record.","data":{"id":{"message":"The id is invalid or already exists."}}}"#,
                ));
            }
            records.push(record.clone());
        }

        self.log(Operation::Create, collection, &id, fields).await;
        self.publish(collection, EventAction::Create, &record);
        Ok(record)
    }

    async fn update(&self, collection: &str, id: &str, fields: Fields) -> Result<Value, BackendError> {
        self.take_fault(Operation::Update, collection, Some(id)).await?;

        let record = {
            let mut store = self.collections.write().await;
            let existing = store
                .get_mut(collection)
                .and_then(|records| records.iter_mut().find(|record| record_id(record) == Some(id)))
                .ok_or_else(|| not_found(collection, id))?;
            if let Some(target) = existing.as_object_mut() {
                for (key, value) in &fields {
                    if key != "id" {
                        target.insert(key.clone(), value.clone());
                    }
                }
                target.insert("updated".to_string(), Value::String(format_datetime(&Utc::now())));
            }
            existing.clone()
        };

        self.log(Operation::Update, collection, id, fields).await;
        self.publish(collection, EventAction::Update, &record);
        Ok(record)
    }

    async fn get_one(&self, collection: &str, id: &str, expand: Option<&str>) -> Result<Value, BackendError> {
        self.take_fault(Operation::GetOne, collection, Some(id)).await?;

        let store = self.collections.read().await;
        let mut record = store
            .get(collection)
            .and_then(|records| records.iter().find(|record| record_id(record) == Some(id)))
            .cloned()
            .ok_or_else(|| not_found(collection, id))?;
        if let Some(expand) = expand {
            expand_record(&store, &self.relations, collection, &mut record, expand);
        }
        Ok(record)
    }

    async fn get_full_list(&self, collection: &str, query: &ListQuery) -> Result<Vec<Value>, BackendError> {
        self.take_fault(Operation::List, collection, None).await?;

        let clauses = match &query.filter {
            Some(expression) => filter::parse(expression).map_err(|err| BackendError::Rejected {
                status: 400,
                message: format!("Invalid filter parameters: {}", err),
                fields: Default::default(),
            })?,
            None => Vec::new(),
        };

        let store = self.collections.read().await;
        let mut records: Vec<Value> = store
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| clauses.iter().all(|clause| clause.matches(record)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(sort) = &query.sort {
            sort_records(&mut records, sort);
        }
        if let Some(expand) = &query.expand {
            for record in records.iter_mut() {
                expand_record(&store, &self.relations, collection, record, expand);
            }
        }
        Ok(records)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), BackendError> {
        self.take_fault(Operation::Delete, collection, Some(id)).await?;

        let removed = {
            let mut store = self.collections.write().await;
            let records = store.get_mut(collection).ok_or_else(|| not_found(collection, id))?;
            let index = records
                .iter()
                .position(|record| record_id(record) == Some(id))
                .ok_or_else(|| not_found(collection, id))?;
            records.remove(index)
        };

        self.publish(collection, EventAction::Delete, &removed);
        Ok(())
    }

    async fn subscribe(
        &self,
        collection: &str,
        pattern: &str,
        expand: Option<&str>,
    ) -> Result<Subscription, BackendError> {
        let receiver = self.events.subscribe();
        let wanted = collection.to_string();
        let pattern = pattern.to_string();
        let expand = expand.map(str::to_string);
        let store = Arc::clone(&self.collections);
        let relations = Arc::clone(&self.relations);

        let events = stream::unfold(receiver, move |mut receiver| {
            let wanted = wanted.clone();
            let pattern = pattern.clone();
            let expand = expand.clone();
            let store = Arc::clone(&store);
            let relations = Arc::clone(&relations);
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(Broadcast::Event { collection, mut event }) if collection == wanted => {
                            if pattern != "*" && record_id(&event.record) != Some(pattern.as_str()) {
                                continue;
                            }
                            if let (Some(expand), true) = (&expand, event.action != EventAction::Delete) {
                                let store = store.read().await;
                                expand_record(&store, &relations, &collection, &mut event.record, expand);
                            }
                            return Some((event, receiver));
                        }
                        Ok(Broadcast::Closed { collection }) if collection == wanted => return None,
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, collection = %wanted, "Realtime subscriber lagged");
                            continue;
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(Subscription::new(collection, events.boxed()))
    }

    async fn unsubscribe(&self, collection: &str) -> Result<(), BackendError> {
        let _ = self.events.send(Broadcast::Closed { collection: collection.to_string() });
        Ok(())
    }
}
