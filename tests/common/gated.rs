use std::sync::Arc;

use async_trait::async_trait;
use otlist::backend::memory::Operation;
use otlist::backend::{Backend, BackendError, ListQuery, MemoryBackend, Subscription};
use otlist::model::conversion::Fields;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

struct Gate {
    operation: Operation,
    collection: String,
    id: Option<String>,
    reached: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

impl Gate {
    fn matches(&self, operation: Operation, collection: &str, id: Option<&str>) -> bool {
        self.operation == operation
            && self.collection == collection
            && (self.id.is_none() || self.id.as_deref() == id)
    }
}

/// A call held open by [`GatedBackend::hold`].
pub struct Held {
    reached: oneshot::Receiver<()>,
    release: oneshot::Sender<()>,
}

impl Held {
    /// Wait until the held call has started.
    pub async fn reached(&mut self) {
        let _ = (&mut self.reached).await;
    }

    /// Let the held call through to the backend.
    pub fn release(self) {
        let _ = self.release.send(());
    }
}

/// Wraps a [`MemoryBackend`] and can stop one call before it reaches it, so
/// other store operations run while that call is in flight.
pub struct GatedBackend {
    inner: Arc<MemoryBackend>,
    gate: Mutex<Option<Gate>>,
}

impl GatedBackend {
    pub fn new(inner: Arc<MemoryBackend>) -> Self {
        GatedBackend { inner, gate: Mutex::new(None) }
    }

    /// Hold the next matching call; `id` of `None` matches any record.
    pub async fn hold(&self, operation: Operation, collection: &str, id: Option<&str>) -> Held {
        let (reached_tx, reached_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        *self.gate.lock().await = Some(Gate {
            operation,
            collection: collection.to_string(),
            id: id.map(str::to_string),
            reached: reached_tx,
            release: release_rx,
        });
        Held { reached: reached_rx, release: release_tx }
    }

    async fn pass(&self, operation: Operation, collection: &str, id: Option<&str>) {
        let gate = {
            let mut gate = self.gate.lock().await;
            match gate.as_ref() {
                Some(held) if held.matches(operation, collection, id) => gate.take(),
                _ => None,
            }
        };
        if let Some(gate) = gate {
            let _ = gate.reached.send(());
            let _ = gate.release.await;
        }
    }
}

#[async_trait]
impl Backend for GatedBackend {
    async fn create(&self, collection: &str, fields: Fields) -> Result<Value, BackendError> {
        self.pass(Operation::Create, collection, None).await;
        self.inner.create(collection, fields).await
    }

    async fn update(&self, collection: &str, id: &str, fields: Fields) -> Result<Value, BackendError> {
        self.pass(Operation::Update, collection, Some(id)).await;
        self.inner.update(collection, id, fields).await
    }

    async fn get_one(&self, collection: &str, id: &str, expand: Option<&str>) -> Result<Value, BackendError> {
        self.pass(Operation::GetOne, collection, Some(id)).await;
        self.inner.get_one(collection, id, expand).await
    }

    async fn get_full_list(&self, collection: &str, query: &ListQuery) -> Result<Vec<Value>, BackendError> {
        self.pass(Operation::List, collection, None).await;
        self.inner.get_full_list(collection, query).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), BackendError> {
        self.pass(Operation::Delete, collection, Some(id)).await;
        self.inner.delete(collection, id).await
    }

    async fn subscribe(
        &self,
        collection: &str,
        pattern: &str,
        expand: Option<&str>,
    ) -> Result<Subscription, BackendError> {
        self.inner.subscribe(collection, pattern, expand).await
    }

    async fn unsubscribe(&self, collection: &str) -> Result<(), BackendError> {
        self.inner.unsubscribe(collection).await
    }
}
