//! Ordered procedure list store
//!
//! Client-side state for one OT day, kept in sync with the backend:
//! - Optimistic writes with per-record updating/failed tracking
//! - Placeholder reconciliation for records created locally
//! - Realtime merge of changes made by other clients

pub mod pending;
pub mod state;

pub use pending::Pending;
pub use state::{reduce, Action, FailedOperation, FailureDetail, ProcedureEvent, RecordStatus, State};

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::filter::{and, eq};
use crate::backend::{Backend, BackendError, EventAction, ListQuery, RecordEvent, Subscription};
use crate::config::Collections;
use crate::error::StoreError;
use crate::model::conversion::{fields, ConversionError, Fields, RecordConverter};
use crate::model::{
    temp_id, Comment, OperatingRoom, OtDay, Patient, PatientDraft, PatientPatch, Procedure, ProcedureDraft,
    ProcedureExpand, ProcedurePatch, RecordId,
};
use crate::schedule::{self, close_gap, is_dense, next_order, renumber, scope};

const PATIENT_EXPAND: &str = "patient";

/// One procedure update staged against the local version it was made at.
#[derive(Debug, Clone)]
struct Write {
    id: RecordId,
    fields: Fields,
    version: u64,
}

fn as_fields<T: Serialize + DeserializeOwned>(value: &T) -> Result<Fields, BackendError> {
    Ok(value.to_fields()?)
}

fn decode_all<T: RecordConverter>(records: Vec<Value>) -> Result<Vec<T>, ConversionError> {
    records.into_iter().map(T::from_record).collect()
}

/// Patient fields for a create, taken from a placeholder's snapshot.
fn patient_create_fields(patient: &Patient) -> Result<Fields, BackendError> {
    let mut fields = as_fields(patient)?;
    fields.remove("id");
    Ok(fields)
}

/// The procedure list of one OT day.
///
/// Every backend failure is turned into state; mutating operations return the
/// record's status afterwards instead of an error. The state lock is never
/// held across a backend call, so completions may interleave.
pub struct ProcedureListStore<B: Backend> {
    backend: Arc<B>,
    collections: Collections,
    ot_day: RecordId,
    state: Mutex<State>,
}

impl<B: Backend> ProcedureListStore<B> {
    pub fn new(backend: Arc<B>, collections: Collections, ot_day: impl Into<RecordId>) -> Self {
        ProcedureListStore {
            backend,
            collections,
            ot_day: ot_day.into(),
            state: Mutex::new(State::default()),
        }
    }

    pub fn ot_day(&self) -> &str {
        &self.ot_day
    }

    pub async fn dispatch(&self, action: Action) {
        self.state.lock().await.apply(action);
    }

    /// Copy of the current state for rendering.
    pub async fn snapshot(&self) -> State {
        self.state.lock().await.clone()
    }

    pub async fn status(&self, id: &str) -> RecordStatus {
        let state = self.state.lock().await;
        state.status(&state.resolve(id))
    }

    /// Map a temporary id to the id the record is known by now.
    pub async fn resolve(&self, id: &str) -> RecordId {
        self.state.lock().await.resolve(id)
    }

    pub async fn set_list(&self, records: Vec<Procedure>) {
        self.dispatch(Action::SetList(records)).await;
    }

    pub async fn select(&self, id: Option<&str>) {
        let mut state = self.state.lock().await;
        let id = id.map(|id| state.resolve(id));
        state.apply(Action::Select(id));
    }

    /// Replace the list with this day's procedures from the backend.
    pub async fn load(&self) -> Result<usize, StoreError> {
        let query = ListQuery::new()
            .filter(eq("ot_day", &self.ot_day))
            .sort("order")
            .expand(PATIENT_EXPAND);
        let records = self.backend.get_full_list(&self.collections.procedures, &query).await?;
        let procedures: Vec<Procedure> = decode_all(records)?;
        let count = procedures.len();
        let writes = {
            let mut state = self.state.lock().await;
            state.apply(Action::SetList(procedures));
            self.repair_orders(&mut state)
        };
        info!(ot_day = %self.ot_day, count, "Loaded procedure list");
        if !writes.is_empty() {
            warn!(ot_day = %self.ot_day, repaired = writes.len(), "Renumbering rooms with gaps or duplicate positions");
            self.persist(writes).await;
        }
        Ok(count)
    }

    /// Stage dense positions for every room of the day that lost them.
    fn repair_orders(&self, state: &mut State) -> Vec<Write> {
        let mut rooms: Vec<RecordId> = state
            .procedures
            .iter()
            .filter(|record| !record.removed && record.ot_day == self.ot_day)
            .map(|record| record.operating_room.clone())
            .collect();
        rooms.sort();
        rooms.dedup();

        let mut writes = Vec::new();
        for room in rooms {
            let scoped = scope(&state.procedures, &self.ot_day, &room);
            if !is_dense(&scoped) {
                writes.extend(self.stage_orders(state, renumber(&scoped)));
            }
        }
        writes
    }

    pub async fn fetch_day(&self) -> Result<OtDay, StoreError> {
        let record = self.backend.get_one(&self.collections.ot_days, &self.ot_day, None).await?;
        Ok(OtDay::from_record(record)?)
    }

    /// Rooms of the day's OT list in print order.
    pub async fn rooms(&self, day: &OtDay) -> Result<Vec<OperatingRoom>, StoreError> {
        let query = ListQuery::new().filter(eq("ot_list", &day.ot_list)).sort("position");
        let records = self.backend.get_full_list(&self.collections.operating_rooms, &query).await?;
        Ok(decode_all(records)?)
    }

    /// Add a patient and a procedure for them. The placeholder shows up and is
    /// selected at once; the returned id is the server id on success, the
    /// placeholder's temporary id otherwise.
    pub async fn add_procedure(&self, patient: PatientDraft, procedure: ProcedureDraft) -> RecordId {
        let id = temp_id();
        {
            let mut state = self.state.lock().await;
            let order = next_order(&state.procedures, &self.ot_day, &procedure.operating_room);
            let placeholder = procedure.to_placeholder(id.clone(), &self.ot_day, order, patient.to_patient(temp_id()));
            debug!(id = %id, order, "Inserting placeholder");
            state.apply(Action::InsertPlaceholder(placeholder));
        }
        self.run_add(&id, None).await
    }

    /// Create the patient (unless `patient_id` says it exists) and then the
    /// procedure, from whatever the placeholder holds now.
    async fn run_add(&self, id: &str, patient_id: Option<RecordId>) -> RecordId {
        let Some((placeholder, version)) = self.placeholder(id).await else {
            return id.to_string();
        };
        let patient = placeholder.patient_snapshot().cloned().unwrap_or_default();

        let patient_fields = match patient_create_fields(&patient) {
            Ok(fields) => fields,
            Err(err) => {
                let detail = FailureDetail::new(&err, Value::Null, FailedOperation::Add { patient_id });
                self.fail(id, detail, version).await;
                return id.to_string();
            }
        };
        let mut payload = json!({ "patient": patient_fields.clone(), "procedure": Value::Null });

        let patient_id = match patient_id {
            // Edits made while the procedure create was failing still reach the patient.
            Some(patient_id) => {
                match self
                    .backend
                    .update(&self.collections.patients, &patient_id, patient_fields)
                    .await
                {
                    Ok(_) => patient_id,
                    Err(err) => {
                        let operation = FailedOperation::Add { patient_id: Some(patient_id) };
                        self.fail(id, FailureDetail::new(&err, payload, operation), version).await;
                        return id.to_string();
                    }
                }
            }
            None => match self.create_patient(patient_fields).await {
                Ok(patient_id) => patient_id,
                Err(err) => {
                    let operation = FailedOperation::Add { patient_id: None };
                    self.fail(id, FailureDetail::new(&err, payload, operation), version).await;
                    return id.to_string();
                }
            },
        };

        // Drags and edits made while the patient write was in flight go into the create.
        let Some((mut procedure, version)) = self.placeholder(id).await else {
            return id.to_string();
        };
        procedure.patient = patient_id.clone();
        let result = match procedure.create_fields() {
            Ok(procedure_fields) => {
                payload["procedure"] = Value::Object(procedure_fields.clone());
                self.create_procedure(procedure_fields).await
            }
            Err(err) => Err(err.into()),
        };

        match result {
            Ok(record) => {
                let server_id = record.id.clone();
                info!(temp_id = %id, id = %server_id, "Procedure created");
                let writes = {
                    let mut state = self.state.lock().await;
                    let edited = state.version(id) > version;
                    let local = state.get(id).cloned();
                    state.apply(Action::Reconcile { temp_id: id.to_string(), record });
                    match local {
                        Some(local) if edited => self.stage_edits(&mut state, local, &server_id, &patient_id),
                        _ => Vec::new(),
                    }
                };
                if !writes.is_empty() {
                    debug!(id = %server_id, "Sending edits made while the create was in flight");
                    self.persist(writes).await;
                }
                server_id
            }
            Err(err) => {
                let operation = FailedOperation::Add { patient_id: Some(patient_id) };
                self.fail(id, FailureDetail::new(&err, payload, operation), version).await;
                id.to_string()
            }
        }
    }

    async fn placeholder(&self, id: &str) -> Option<(Procedure, u64)> {
        let state = self.state.lock().await;
        let found = state.get(id).map(|record| (record.clone(), state.version(id)));
        if found.is_none() {
            debug!(id = %id, "Placeholder gone before create");
        }
        found
    }

    /// The create carried an older copy of the placeholder; put the local
    /// values on the server record.
    fn stage_edits(&self, state: &mut State, mut local: Procedure, server_id: &str, patient_id: &str) -> Vec<Write> {
        local.id = server_id.to_string();
        local.patient = patient_id.to_string();
        if let Some(snapshot) = local.patient_snapshot_mut() {
            snapshot.id = patient_id.to_string();
        }
        match local.create_fields() {
            Ok(fields) => self.stage(state, vec![(local, fields)]),
            Err(err) => {
                warn!(id = %server_id, "Cannot send edits made during create: {err}");
                Vec::new()
            }
        }
    }

    async fn create_patient(&self, fields: Fields) -> Result<RecordId, BackendError> {
        let record = self.backend.create(&self.collections.patients, fields).await?;
        let patient = Patient::from_record(record)?;
        Ok(patient.id)
    }

    async fn create_procedure(&self, fields: Fields) -> Result<Procedure, BackendError> {
        let record = self.backend.create(&self.collections.procedures, fields).await?;
        Ok(Procedure::from_record(record)?)
    }

    /// Edit a procedure and its patient together. The edit shows at once;
    /// a failure keeps it in place and is recorded against the procedure.
    pub async fn update_procedure_and_patient(
        &self,
        id: &str,
        patient: PatientPatch,
        procedure: ProcedurePatch,
    ) -> RecordStatus {
        let (id, patient_id, version) = {
            let mut state = self.state.lock().await;
            let id = state.resolve(id);
            let Some(current) = state.get(&id).cloned() else {
                debug!(id = %id, "Update for unknown procedure ignored");
                return RecordStatus::Missing;
            };
            let mut next = current;
            procedure.apply_to(&mut next);
            if let Some(snapshot) = next.patient_snapshot_mut() {
                patient.apply_to(snapshot);
            }
            let patient_id = next.patient.clone();
            state.apply(Action::ApplyLocal(next));

            // The pending create sends whatever the placeholder holds.
            if state.is_unconfirmed(&id) {
                return state.status(&id);
            }
            state.apply(Action::MarkUpdating(vec![id.clone()]));
            (id.clone(), patient_id, state.version(&id))
        };

        self.run_update(&id, &patient_id, patient, procedure, version).await
    }

    async fn run_update(
        &self,
        id: &str,
        patient_id: &str,
        patient: PatientPatch,
        procedure: ProcedurePatch,
        version: u64,
    ) -> RecordStatus {
        let payload = json!({ "patient": &patient, "procedure": &procedure });
        let operation = FailedOperation::Update { patient: patient.clone(), procedure: procedure.clone() };

        let result = async {
            if !patient.is_empty() {
                self.backend
                    .update(&self.collections.patients, patient_id, as_fields(&patient)?)
                    .await?;
            }
            if procedure.is_empty() {
                return Ok(None);
            }
            let record = self
                .backend
                .update(&self.collections.procedures, id, as_fields(&procedure)?)
                .await?;
            Ok::<_, BackendError>(Some(Procedure::from_record(record)?))
        }
        .await;

        match result {
            Ok(record) => {
                self.dispatch(Action::Acknowledge { id: id.to_string(), record, version }).await;
            }
            Err(err) => {
                warn!(id = %id, "Procedure update failed: {err}");
                self.fail(id, FailureDetail::new(&err, payload, operation), version).await;
            }
        }
        self.status(id).await
    }

    /// Soft-delete a procedure and close the gap it leaves in its room. The
    /// removed record keeps its position for the audit trail.
    pub async fn remove_procedure(&self, id: &str) -> RecordStatus {
        let writes = {
            let mut state = self.state.lock().await;
            let id = state.resolve(id);
            let Some(current) = state.get(&id).cloned() else {
                debug!(id = %id, "Remove for unknown procedure ignored");
                return RecordStatus::Missing;
            };
            if current.removed || state.is_unconfirmed(&id) {
                debug!(id = %id, "Nothing to remove");
                return state.status(&id);
            }

            let shifted = close_gap(&state.procedures, &self.ot_day, &current.operating_room, current.order, &id);
            let mut removed = current;
            removed.removed = true;
            let mut changes = vec![(removed, fields([("removed", json!(true))]))];
            changes.extend(order_changes(shifted));
            self.stage(&mut state, changes)
        };
        self.persist(writes).await.first().map_or(RecordStatus::Missing, |(_, status)| *status)
    }

    /// Bring a removed procedure back at the end of its room's list.
    pub async fn restore_procedure(&self, id: &str) -> RecordStatus {
        let writes = {
            let mut state = self.state.lock().await;
            let id = state.resolve(id);
            let Some(current) = state.get(&id).cloned() else {
                debug!(id = %id, "Restore for unknown procedure ignored");
                return RecordStatus::Missing;
            };
            if !current.removed {
                return state.status(&id);
            }

            let order = next_order(&state.procedures, &self.ot_day, &current.operating_room);
            let mut restored = current;
            restored.removed = false;
            restored.order = order;
            let change = fields([("removed", json!(false)), ("order", json!(order))]);
            self.stage(&mut state, vec![(restored, change)])
        };
        self.persist(writes).await.first().map_or(RecordStatus::Missing, |(_, status)| *status)
    }

    /// Apply new positions, one backend update per record. Failures are kept
    /// per record; the other updates still go out.
    pub async fn apply_reorder(&self, changed: Vec<Procedure>) -> Vec<(RecordId, RecordStatus)> {
        let writes = {
            let mut state = self.state.lock().await;
            self.stage_orders(&mut state, changed)
        };
        self.persist(writes).await
    }

    /// Drag `source` onto `target` within the source's room.
    pub async fn reorder(&self, source: &str, target: &str) -> Vec<(RecordId, RecordStatus)> {
        let writes = {
            let mut state = self.state.lock().await;
            let source = state.resolve(source);
            let target = state.resolve(target);
            let Some(room) = state.get(&source).map(|record| record.operating_room.clone()) else {
                debug!(source = %source, "Drag of unknown procedure ignored");
                return Vec::new();
            };
            let scoped = scope(&state.procedures, &self.ot_day, &room);
            let changed = schedule::reorder(&scoped, &source, &target);
            self.stage_orders(&mut state, changed)
        };
        self.persist(writes).await
    }

    /// Move a procedure to the end of the same room's list on another day,
    /// closing the gap it leaves here.
    pub async fn move_to_another_day(&self, id: &str, ot_day: &str) -> RecordStatus {
        let (id, room, version) = {
            let state = self.state.lock().await;
            let id = state.resolve(id);
            let Some(current) = state.get(&id) else {
                debug!(id = %id, "Move of unknown procedure ignored");
                return RecordStatus::Missing;
            };
            if ot_day == self.ot_day || state.is_unconfirmed(&id) {
                return state.status(&id);
            }
            (id.clone(), current.operating_room.clone(), state.version(&id))
        };

        let order = match self.destination_order(ot_day, &room).await {
            Ok(order) => order,
            Err(err) => {
                warn!(id = %id, ot_day, "Cannot read destination list: {err}");
                let operation = FailedOperation::Move { ot_day: ot_day.to_string() };
                self.fail(&id, FailureDetail::new(&err, json!({ "ot_day": ot_day }), operation), version)
                    .await;
                return RecordStatus::Failed;
            }
        };

        let writes = {
            let mut state = self.state.lock().await;
            let Some(current) = state.get(&id).cloned() else {
                return RecordStatus::Missing;
            };
            let shifted = close_gap(&state.procedures, &self.ot_day, &current.operating_room, current.order, &id);
            let mut moved = current;
            moved.ot_day = ot_day.to_string();
            moved.order = order;
            let mut changes = vec![(moved, fields([("ot_day", json!(ot_day)), ("order", json!(order))]))];
            changes.extend(order_changes(shifted));
            self.stage(&mut state, changes)
        };
        info!(id = %id, from = %self.ot_day, to = ot_day, order, "Moving procedure");
        self.persist(writes).await.first().map_or(RecordStatus::Missing, |(_, status)| *status)
    }

    async fn destination_order(&self, ot_day: &str, room: &str) -> Result<u32, BackendError> {
        let query = ListQuery::new().filter(and([
            eq("ot_day", ot_day),
            eq("operating_room", room),
            eq("removed", false),
        ]));
        let records = self.backend.get_full_list(&self.collections.procedures, &query).await?;
        let procedures: Vec<Procedure> = decode_all(records)?;
        Ok(next_order(&procedures, ot_day, room))
    }

    /// Drop a failure. An unconfirmed placeholder goes away; a saved record
    /// is reloaded from the backend.
    pub async fn discard(&self, id: &str) -> RecordStatus {
        let (id, version) = {
            let mut state = self.state.lock().await;
            let id = state.resolve(id);
            let unconfirmed = state.is_unconfirmed(&id);
            state.apply(Action::Discard(id.clone()));
            if unconfirmed {
                debug!(id = %id, "Discarded placeholder");
                return RecordStatus::Missing;
            }
            (id.clone(), state.version(&id))
        };

        let reloaded = match self
            .backend
            .get_one(&self.collections.procedures, &id, Some(PATIENT_EXPAND))
            .await
        {
            Ok(record) => Procedure::from_record(record).map(Some).map_err(BackendError::from),
            Err(BackendError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        };

        match reloaded {
            Ok(Some(record)) if record.ot_day == self.ot_day => self.dispatch(Action::ServerTruth(record)).await,
            Ok(_) => self.dispatch(Action::Remove(id.clone())).await,
            Err(err) => {
                warn!(id = %id, "Reload after discard failed: {err}");
                self.fail(&id, FailureDetail::new(&err, Value::Null, FailedOperation::Reload), version)
                    .await;
            }
        }
        self.status(&id).await
    }

    /// Send a failed operation again with what it tried last time.
    pub async fn retry(&self, id: &str) -> RecordStatus {
        let (id, detail) = {
            let state = self.state.lock().await;
            let id = state.resolve(id);
            match state.failed.get(&id) {
                Some(detail) => (id.clone(), detail.clone()),
                None => return state.status(&id),
            }
        };
        info!(id = %id, "Retrying failed operation");

        if detail.operation == FailedOperation::Reload {
            return self.discard(&id).await;
        }

        let version = {
            let mut state = self.state.lock().await;
            state.apply(Action::Retry(id.clone()));
            state.version(&id)
        };

        match detail.operation {
            FailedOperation::Add { patient_id } => {
                let id = self.run_add(&id, patient_id).await;
                self.status(&id).await
            }
            FailedOperation::Update { patient, procedure } => {
                let patient_id = {
                    let state = self.state.lock().await;
                    state.get(&id).map(|record| record.patient.clone()).unwrap_or_default()
                };
                self.run_update(&id, &patient_id, patient, procedure, version).await
            }
            FailedOperation::Write { fields } => {
                self.write(Write { id: id.clone(), fields, version }).await;
                self.status(&id).await
            }
            FailedOperation::Move { ot_day } => self.move_to_another_day(&id, &ot_day).await,
            FailedOperation::Reload => self.status(&id).await,
        }
    }

    /// Merge one realtime event into the list.
    pub async fn apply_realtime(&self, event: RecordEvent) -> Result<(), StoreError> {
        let mut record = Procedure::from_record(event.record)?;

        // New records from other clients arrive without the patient inlined
        // when the channel does not expand.
        if event.action == EventAction::Create && record.ot_day == self.ot_day && record.patient_snapshot().is_none() {
            let known = self.state.lock().await.get(&record.id).is_some();
            if !known && !record.patient.is_empty() {
                match self.fetch_patient(&record.patient).await {
                    Ok(patient) => record.expand = Some(ProcedureExpand { patient: Some(patient) }),
                    Err(err) => warn!(id = %record.id, "Cannot fetch patient for realtime record: {err}"),
                }
            }
        }

        debug!(id = %record.id, action = %event.action, "Realtime event");
        self.dispatch(Action::Realtime {
            ot_day: self.ot_day.clone(),
            event: ProcedureEvent { action: event.action, record },
        })
        .await;
        Ok(())
    }

    async fn fetch_patient(&self, id: &str) -> Result<Patient, BackendError> {
        let record = self.backend.get_one(&self.collections.patients, id, None).await?;
        Ok(Patient::from_record(record)?)
    }

    pub async fn subscribe(&self) -> Result<Subscription, StoreError> {
        let subscription = self
            .backend
            .subscribe(&self.collections.procedures, "*", Some(PATIENT_EXPAND))
            .await?;
        info!(ot_day = %self.ot_day, "Watching procedures");
        Ok(subscription)
    }

    /// Merge events until the subscription ends. Returns how many were merged.
    pub async fn follow(&self, subscription: &mut Subscription) -> usize {
        let mut merged = 0;
        while let Some(event) = subscription.next().await {
            match self.apply_realtime(event).await {
                Ok(()) => merged += 1,
                Err(err) => warn!(collection = subscription.collection(), "Skipping realtime event: {err}"),
            }
        }
        merged
    }

    /// Subscribe and merge events until the channel closes.
    pub async fn watch(&self) -> Result<usize, StoreError> {
        let mut subscription = self.subscribe().await?;
        Ok(self.follow(&mut subscription).await)
    }

    pub async fn unsubscribe(&self) -> Result<(), StoreError> {
        self.backend.unsubscribe(&self.collections.procedures).await?;
        Ok(())
    }

    pub async fn add_comment(&self, procedure_id: &str, user: &str, text: &str) -> Result<Comment, StoreError> {
        let id = self.resolve(procedure_id).await;
        if self.state.lock().await.is_unconfirmed(&id) {
            return Err(StoreError::Unsaved(id));
        }
        let fields = fields([("procedure", json!(id)), ("user", json!(user)), ("text", json!(text))]);
        let record = self.backend.create(&self.collections.comments, fields).await?;
        Ok(Comment::from_record(record)?)
    }

    /// Comments on a procedure, oldest first.
    pub async fn comments(&self, procedure_id: &str) -> Result<Vec<Comment>, StoreError> {
        let id = self.resolve(procedure_id).await;
        if self.state.lock().await.is_unconfirmed(&id) {
            return Ok(Vec::new());
        }
        let query = ListQuery::new().filter(eq("procedure", &id)).sort("created");
        let records = self.backend.get_full_list(&self.collections.comments, &query).await?;
        Ok(decode_all(records)?)
    }

    /// Apply local edits and mark them updating. Unconfirmed placeholders
    /// change locally only; their create carries the new values.
    fn stage(&self, state: &mut State, changes: Vec<(Procedure, Fields)>) -> Vec<Write> {
        let mut writes = Vec::new();
        for (record, fields) in changes {
            let id = record.id.clone();
            state.apply(Action::ApplyLocal(record));
            if state.is_unconfirmed(&id) {
                continue;
            }
            state.apply(Action::MarkUpdating(vec![id.clone()]));
            writes.push(Write { version: state.version(&id), id, fields });
        }
        writes
    }

    fn stage_orders(&self, state: &mut State, changed: Vec<Procedure>) -> Vec<Write> {
        let changes = changed
            .into_iter()
            .filter_map(|change| {
                let id = state.resolve(&change.id);
                let mut record = state.get(&id)?.clone();
                record.order = change.order;
                Some(record)
            })
            .collect();
        self.stage(state, order_changes(changes))
    }

    async fn persist(&self, writes: Vec<Write>) -> Vec<(RecordId, RecordStatus)> {
        let mut results = Vec::with_capacity(writes.len());
        for write in writes {
            let id = write.id.clone();
            self.write(write).await;
            results.push((id.clone(), self.status(&id).await));
        }
        results
    }

    async fn write(&self, write: Write) {
        let mut next = Some(write);
        while let Some(write) = next.take() {
            let result = match self
                .backend
                .update(&self.collections.procedures, &write.id, write.fields.clone())
                .await
            {
                Ok(record) => Procedure::from_record(record).map_err(BackendError::from),
                Err(err) => Err(err),
            };

            let mut state = self.state.lock().await;
            match result {
                Ok(record) => {
                    // A newer write for this record already settled, so this
                    // one reached the server last and left older values there.
                    let overtaken = state.version(&write.id) > write.version
                        && state.status(&write.id) == RecordStatus::Settled;
                    let left_day = record.ot_day != self.ot_day;
                    state.apply(Action::Acknowledge { id: write.id.clone(), record: Some(record), version: write.version });
                    if overtaken {
                        next = self.resend(&mut state, &write);
                    } else if left_day && state.status(&write.id) == RecordStatus::Settled {
                        state.apply(Action::Remove(write.id));
                    }
                }
                Err(err) => {
                    warn!(id = %write.id, "Procedure write failed: {err}");
                    let payload = Value::Object(write.fields.clone());
                    let detail = FailureDetail::new(&err, payload, FailedOperation::Write { fields: write.fields });
                    state.apply(Action::MarkFailed { id: write.id, detail, version: write.version });
                }
            }
        }
    }

    /// The same keys as `write`, with the values the record holds locally now.
    fn resend(&self, state: &mut State, write: &Write) -> Option<Write> {
        let current = as_fields(state.get(&write.id)?).ok()?;
        let fields: Fields = write
            .fields
            .keys()
            .filter_map(|key| current.get(key).map(|value| (key.clone(), value.clone())))
            .collect();
        debug!(id = %write.id, version = write.version, "Write landed after a newer one, sending local values again");
        state.apply(Action::MarkUpdating(vec![write.id.clone()]));
        Some(Write { id: write.id.clone(), fields, version: state.version(&write.id) })
    }

    async fn fail(&self, id: &str, detail: FailureDetail, version: u64) {
        warn!(id = %id, status = ?detail.status, "{}", detail.message);
        self.dispatch(Action::MarkFailed { id: id.to_string(), detail, version }).await;
    }
}

fn order_changes(records: Vec<Procedure>) -> Vec<(Procedure, Fields)> {
    records
        .into_iter()
        .map(|record| {
            let change = fields([("order", json!(record.order))]);
            (record, change)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::Operation;
    use crate::backend::MemoryBackend;
    use pretty_assertions::assert_eq;

    async fn store_with(records: &[(&str, u32)]) -> (Arc<MemoryBackend>, ProcedureListStore<MemoryBackend>) {
        let collections = Collections::default();
        let backend = Arc::new(MemoryBackend::for_collections(&collections));
        for (id, order) in records {
            backend
                .seed(
                    "procedures",
                    json!({"id": id, "ot_day": "d1", "operating_room": "r1", "order": order, "removed": false}),
                )
                .await;
        }
        let store = ProcedureListStore::new(Arc::clone(&backend), collections, "d1");
        store.load().await.unwrap();
        (backend, store)
    }

    fn orders(state: &State) -> Vec<(String, u32, bool)> {
        let mut rows: Vec<_> = state
            .procedures
            .iter()
            .map(|r| (r.id.clone(), r.order, r.removed))
            .collect();
        rows.sort();
        rows
    }

    #[tokio::test]
    async fn load_sorts_by_order() {
        let (_, store) = store_with(&[("b", 2), ("a", 1)]).await;
        let ids: Vec<String> = store.snapshot().await.procedures.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn load_renumbers_rooms_with_gaps_and_duplicates() {
        let (backend, store) = store_with(&[("a", 2), ("b", 4), ("c", 4)]).await;

        let state = store.snapshot().await;
        assert_eq!(
            orders(&state),
            vec![("a".into(), 1, false), ("b".into(), 2, false), ("c".into(), 3, false)]
        );
        assert!(state.updating.is_empty());
        assert_eq!(backend.writes().await.len(), 3);

        backend.clear_writes().await;
        store.load().await.unwrap();
        assert_eq!(orders(&store.snapshot().await), orders(&state));
        assert!(backend.writes().await.is_empty());
    }

    #[tokio::test]
    async fn load_failure_is_returned() {
        let (backend, store) = store_with(&[]).await;
        backend
            .fail_next(Operation::List, "procedures", BackendError::Connection("x".into()))
            .await;
        assert!(matches!(store.load().await, Err(StoreError::Backend(_))));
    }

    #[tokio::test]
    async fn remove_closes_gap_behind() {
        let (backend, store) = store_with(&[("a", 1), ("b", 2), ("c", 3)]).await;
        assert_eq!(store.remove_procedure("a").await, RecordStatus::Settled);

        let state = store.snapshot().await;
        assert_eq!(
            orders(&state),
            vec![("a".into(), 1, true), ("b".into(), 1, false), ("c".into(), 2, false)]
        );
        assert!(schedule::is_dense(&state.procedures));
        assert_eq!(backend.writes().await.len(), 3);
    }

    #[tokio::test]
    async fn failed_write_keeps_local_value() {
        let (backend, store) = store_with(&[("a", 1), ("b", 2)]).await;
        backend
            .fail_record(Operation::Update, "procedures", "b", BackendError::Connection("x".into()))
            .await;

        let results = store.reorder("b", "a").await;
        assert_eq!(
            results,
            vec![("b".to_string(), RecordStatus::Failed), ("a".to_string(), RecordStatus::Settled)]
        );
        let state = store.snapshot().await;
        assert_eq!(state.get("b").unwrap().order, 1);
        let detail = &state.failed["b"];
        assert_eq!(detail.payload, json!({"order": 1}));
    }

    #[tokio::test]
    async fn update_sends_patient_then_procedure() {
        let (backend, store) = store_with(&[]).await;
        let id = store
            .add_procedure(
                PatientDraft { name: "Ann".into(), ..Default::default() },
                ProcedureDraft { operating_room: "r1".into(), ..Default::default() },
            )
            .await;
        backend.clear_writes().await;

        let status = store
            .update_procedure_and_patient(
                &id,
                PatientPatch { phone: Some("0771".into()), ..Default::default() },
                ProcedurePatch { bed: Some("7".into()), ..Default::default() },
            )
            .await;
        assert_eq!(status, RecordStatus::Settled);

        let writes = backend.writes().await;
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].collection, "patients");
        assert_eq!(writes[1].collection, "procedures");

        let state = store.snapshot().await;
        let record = state.get(&id).unwrap();
        assert_eq!(record.bed, "7");
        assert_eq!(record.patient_snapshot().unwrap().phone, "0771");
    }

    #[tokio::test]
    async fn comments_are_listed_oldest_first() {
        let (_, store) = store_with(&[("a", 1)]).await;
        store.add_comment("a", "u1", "Fasting from midnight").await.unwrap();
        store.add_comment("a", "u2", "Consent signed").await.unwrap();

        let texts: Vec<String> = store.comments("a").await.unwrap().into_iter().map(|c| c.text).collect();
        assert_eq!(texts, vec!["Fasting from midnight", "Consent signed"]);
    }
}
