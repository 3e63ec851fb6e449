#![allow(dead_code)]

pub mod gated;

use std::sync::Arc;

use otlist::backend::MemoryBackend;
use otlist::config::Collections;
use otlist::model::{PatientDraft, ProcedureDraft};
use otlist::store::{ProcedureListStore, State};
use serde_json::json;

use gated::GatedBackend;

pub const DAY: &str = "d1";
pub const ROOM: &str = "r1";

pub struct TestContext {
    pub backend: Arc<MemoryBackend>,
    pub store: ProcedureListStore<MemoryBackend>,
}

/// In-memory backend with one patient `pat1`, seeded procedures on `DAY` in
/// `ROOM`, and a store that has loaded them.
pub async fn setup_store(procedures: &[(&str, u32)]) -> TestContext {
    let backend = seeded_backend(procedures).await;
    let store = ProcedureListStore::new(Arc::clone(&backend), Collections::default(), DAY);
    store.load().await.unwrap();
    TestContext { backend, store }
}

pub struct GatedContext {
    pub backend: Arc<MemoryBackend>,
    pub gated: Arc<GatedBackend>,
    pub store: ProcedureListStore<GatedBackend>,
}

/// Same seed as [`setup_store`], with the store talking through a
/// [`GatedBackend`] so one call can be held in flight.
pub async fn setup_gated(procedures: &[(&str, u32)]) -> GatedContext {
    let backend = seeded_backend(procedures).await;
    let gated = Arc::new(GatedBackend::new(Arc::clone(&backend)));
    let store = ProcedureListStore::new(Arc::clone(&gated), Collections::default(), DAY);
    store.load().await.unwrap();
    GatedContext { backend, gated, store }
}

async fn seeded_backend(procedures: &[(&str, u32)]) -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::for_collections(&Collections::default()));
    backend
        .seed("patients", json!({"id": "pat1", "name": "A. Perera", "hospital_id": "H-100"}))
        .await;
    for (id, order) in procedures {
        seed_procedure(&backend, id, DAY, *order, false).await;
    }
    backend
}

pub async fn seed_procedure(backend: &MemoryBackend, id: &str, day: &str, order: u32, removed: bool) {
    backend
        .seed(
            "procedures",
            json!({
                "id": id,
                "patient": "pat1",
                "ot_day": day,
                "operating_room": ROOM,
                "order": order,
                "removed": removed,
                "procedure": format!("Case {}", id),
            }),
        )
        .await;
}

pub fn drafts(name: &str) -> (PatientDraft, ProcedureDraft) {
    (
        PatientDraft { name: name.to_string(), hospital_id: format!("H-{}", name), ..Default::default() },
        ProcedureDraft { operating_room: ROOM.to_string(), procedure: format!("Case {}", name), ..Default::default() },
    )
}

/// (id, order) of the live records in `ROOM`, in list order.
pub fn room_orders(state: &State) -> Vec<(String, u32)> {
    let mut rows: Vec<(String, u32)> = state
        .procedures
        .iter()
        .filter(|record| !record.removed && record.operating_room == ROOM)
        .map(|record| (record.id.clone(), record.order))
        .collect();
    rows.sort_by_key(|(_, order)| *order);
    rows
}
