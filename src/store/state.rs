//! Pure state transitions for one OT day's procedure list.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::Value;

use super::pending::Pending;
use crate::backend::{BackendError, EventAction};
use crate::model::conversion::Fields;
use crate::model::{PatientPatch, Procedure, ProcedurePatch, RecordId};

/// What a failed record was trying to do, kept so the user can retry it.
#[derive(Debug, Clone, PartialEq)]
pub enum FailedOperation {
    /// Create patient, then procedure, from the placeholder's fields.
    /// `patient_id` is set once the patient write went through, so a retry
    /// does not create it twice.
    Add { patient_id: Option<RecordId> },
    Update {
        patient: PatientPatch,
        procedure: ProcedurePatch,
    },
    /// A single procedure update (remove, restore, reorder, move).
    Write { fields: Fields },
    /// The destination list could not be read before a move.
    Move { ot_day: RecordId },
    /// Reloading server truth after a discard failed.
    Reload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailureDetail {
    pub message: String,
    pub status: Option<u16>,
    /// Field-level validation messages from the backend.
    pub field_errors: BTreeMap<String, String>,
    /// The payload that was sent (or was about to be).
    pub payload: Value,
    pub operation: FailedOperation,
}

impl FailureDetail {
    pub fn new(error: &BackendError, payload: Value, operation: FailedOperation) -> Self {
        FailureDetail {
            message: error.to_string(),
            status: error.status(),
            field_errors: error.field_errors(),
            payload,
            operation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Settled,
    Updating,
    Failed,
    /// Not in this view.
    Missing,
}

/// A realtime push decoded into a procedure.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureEvent {
    pub action: EventAction,
    pub record: Procedure,
}

#[derive(Debug, Clone)]
pub enum Action {
    SetList(Vec<Procedure>),
    Select(Option<RecordId>),
    InsertPlaceholder(Procedure),
    /// Swap a placeholder's temporary id for the server's.
    Reconcile { temp_id: RecordId, record: Procedure },
    /// Optimistic local edit.
    ApplyLocal(Procedure),
    MarkUpdating(Vec<RecordId>),
    /// A write issued at `version` succeeded.
    Acknowledge {
        id: RecordId,
        record: Option<Procedure>,
        version: u64,
    },
    MarkFailed {
        id: RecordId,
        detail: FailureDetail,
        version: u64,
    },
    /// A failed record is being sent again.
    Retry(RecordId),
    Discard(RecordId),
    /// Authoritative copy from the backend, replacing any local guess.
    ServerTruth(Procedure),
    /// The record left this view.
    Remove(RecordId),
    Realtime { ot_day: RecordId, event: ProcedureEvent },
}

#[derive(Debug, Clone, Default)]
pub struct State {
    pub procedures: Vec<Procedure>,
    pub selected: Option<RecordId>,
    pub updating: HashSet<RecordId>,
    pub failed: HashMap<RecordId, FailureDetail>,
    /// Keyed by temporary id; kept after confirmation for id resolution.
    pub placeholders: HashMap<RecordId, Pending<RecordId>>,
    versions: HashMap<RecordId, u64>,
    clock: u64,
}

/// `(State, Action) -> State`.
pub fn reduce(mut state: State, action: Action) -> State {
    state.apply(action);
    state
}

impl State {
    pub fn get(&self, id: &str) -> Option<&Procedure> {
        self.procedures.iter().find(|record| record.id == id)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.procedures.iter().position(|record| record.id == id)
    }

    /// Map a possibly stale temporary id to the id the record has now.
    pub fn resolve(&self, id: &str) -> RecordId {
        self.placeholders
            .get(id)
            .map(|pending| pending.current_id().to_string())
            .unwrap_or_else(|| id.to_string())
    }

    /// True for a placeholder whose create has not been acknowledged.
    pub fn is_unconfirmed(&self, id: &str) -> bool {
        self.placeholders
            .get(id)
            .map_or(false, |pending| !pending.is_confirmed())
    }

    pub fn status(&self, id: &str) -> RecordStatus {
        if self.failed.contains_key(id) {
            RecordStatus::Failed
        } else if self.updating.contains(id) {
            RecordStatus::Updating
        } else if self.get(id).is_some() {
            RecordStatus::Settled
        } else {
            RecordStatus::Missing
        }
    }

    /// Local version of a record; 0 if it was never edited locally.
    pub fn version(&self, id: &str) -> u64 {
        self.versions.get(id).copied().unwrap_or(0)
    }

    fn bump(&mut self, id: &str) -> u64 {
        self.clock += 1;
        self.versions.insert(id.to_string(), self.clock);
        self.clock
    }

    fn is_current(&self, id: &str, version: u64) -> bool {
        self.version(id) <= version
    }

    fn drop_record(&mut self, id: &str) {
        self.procedures.retain(|record| record.id != id);
        if self.selected.as_deref() == Some(id) {
            self.selected = None;
        }
        self.updating.remove(id);
    }

    fn upsert(&mut self, mut record: Procedure) {
        match self.position(&record.id) {
            Some(index) => {
                record.inherit_expand(&self.procedures[index]);
                self.procedures[index] = record;
            }
            None => self.procedures.push(record),
        }
    }

    pub fn apply(&mut self, action: Action) {
        match action {
            Action::SetList(records) => {
                // The server cannot return records it has not created yet.
                let unconfirmed: Vec<Procedure> = self
                    .procedures
                    .iter()
                    .filter(|record| self.is_unconfirmed(&record.id))
                    .cloned()
                    .collect();
                self.procedures = records;
                self.procedures.extend(unconfirmed);
            }
            Action::Select(id) => {
                self.selected = id;
            }
            Action::InsertPlaceholder(record) => {
                let id = record.id.clone();
                self.bump(&id);
                self.procedures.push(record);
                self.updating.insert(id.clone());
                self.placeholders.insert(id.clone(), Pending::new(id.clone()));
                self.selected = Some(id);
            }
            Action::Reconcile { temp_id, mut record } => {
                let server_id = record.id.clone();
                if server_id != temp_id {
                    // A realtime echo may have landed before the create returned.
                    self.procedures.retain(|existing| existing.id != server_id);
                }
                match self.position(&temp_id) {
                    Some(index) => {
                        let placeholder = &self.procedures[index];
                        if record.patient_snapshot().is_none() {
                            record.expand = placeholder.expand.clone();
                            let patient_id = record.patient.clone();
                            if let Some(patient) = record.patient_snapshot_mut() {
                                patient.id = patient_id;
                            }
                        }
                        self.procedures[index] = record;
                    }
                    None => self.procedures.push(record),
                }

                if self.selected.as_deref() == Some(temp_id.as_str()) {
                    self.selected = Some(server_id.clone());
                }
                self.updating.remove(&temp_id);
                self.failed.remove(&temp_id);
                if let Some(version) = self.versions.remove(&temp_id) {
                    self.versions.insert(server_id.clone(), version);
                }
                self.placeholders
                    .entry(temp_id.clone())
                    .or_insert_with(|| Pending::new(temp_id))
                    .confirm(server_id);
            }
            Action::ApplyLocal(record) => {
                if let Some(index) = self.position(&record.id) {
                    self.bump(&record.id);
                    self.procedures[index] = record;
                }
            }
            Action::MarkUpdating(ids) => {
                self.updating.extend(ids);
            }
            Action::Acknowledge { id, record, version } => {
                if !self.is_current(&id, version) {
                    tracing::debug!(id = %id, version, "Ignoring stale acknowledgement");
                    return;
                }
                if let Some(record) = record {
                    if self.position(&record.id).is_some() {
                        self.upsert(record);
                    }
                }
                self.updating.remove(&id);
                self.failed.remove(&id);
            }
            Action::MarkFailed { id, detail, version } => {
                if self.is_current(&id, version) {
                    self.updating.remove(&id);
                }
                self.failed.insert(id, detail);
            }
            Action::Retry(id) => {
                self.failed.remove(&id);
                self.updating.insert(id);
            }
            Action::Discard(id) => {
                self.failed.remove(&id);
                if self.is_unconfirmed(&id) {
                    self.drop_record(&id);
                    self.placeholders.remove(&id);
                    self.versions.remove(&id);
                }
            }
            Action::ServerTruth(record) => {
                self.upsert(record);
            }
            Action::Remove(id) => {
                self.drop_record(&id);
                self.failed.remove(&id);
            }
            Action::Realtime { ot_day, event } => {
                let id = event.record.id.clone();
                if self.updating.contains(&id) || self.failed.contains_key(&id) {
                    // The local write is newer; its acknowledgement or a discard
                    // brings server truth back.
                    tracing::debug!(id = %id, action = %event.action, "Realtime event deferred to local write");
                    return;
                }
                match event.action {
                    EventAction::Delete => self.drop_record(&id),
                    EventAction::Create | EventAction::Update => {
                        if event.record.ot_day != ot_day {
                            self.drop_record(&id);
                        } else {
                            self.upsert(event.record);
                        }
                    }
                }
            }
        }
    }
}
