//! OT scheduling records
//!
//! Plain serde types mirroring the backend collections:
//! - Procedures (one planned surgical case)
//! - Patients, OT days, OT lists and operating rooms
//! - Comments attached to procedures

pub mod conversion;
pub mod dates;
pub mod drafts;

pub use drafts::{PatientDraft, PatientPatch, ProcedureDraft, ProcedurePatch};

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Opaque backend record id. Locally generated temporary ids share the type.
pub type RecordId = String;

const TEMP_ID_PREFIX: &str = "tmp_";

/// Generate a temporary id for a record that has not reached the backend yet.
pub fn temp_id() -> RecordId {
    format!("{}{}", TEMP_ID_PREFIX, uuid::Uuid::new_v4().simple())
}

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// One planned surgical case on an OT day.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Procedure {
    pub id: RecordId,
    #[serde(default)]
    pub patient: RecordId,
    #[serde(default)]
    pub ot_day: RecordId,
    #[serde(default)]
    pub operating_room: RecordId,
    /// 1-based position within the (OT day, operating room) list.
    #[serde(default)]
    pub order: u32,
    /// Soft delete. Removed procedures stay in the collection for audit.
    #[serde(default)]
    pub removed: bool,
    #[serde(default)]
    pub diagnosis: String,
    #[serde(default)]
    pub procedure: String,
    #[serde(default)]
    pub comorbidities: String,
    #[serde(default)]
    pub anesthesia: String,
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub remarks: String,
    #[serde(default)]
    pub special_requirements: String,
    #[serde(default)]
    pub bed: String,
    #[serde(default)]
    pub added_by: RecordId,
    #[serde(default, with = "dates::datetime_opt")]
    pub added_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expand: Option<ProcedureExpand>,
}

/// Related records the backend inlines when asked to `expand`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcedureExpand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient: Option<Patient>,
}

impl Procedure {
    pub fn patient_snapshot(&self) -> Option<&Patient> {
        self.expand.as_ref().and_then(|expand| expand.patient.as_ref())
    }

    pub fn patient_snapshot_mut(&mut self) -> Option<&mut Patient> {
        self.expand.as_mut().and_then(|expand| expand.patient.as_mut())
    }

    pub fn in_scope(&self, ot_day: &str, operating_room: &str) -> bool {
        self.ot_day == ot_day && self.operating_room == operating_room
    }

    /// Carry over the inlined patient when `incoming` arrived without one.
    pub fn inherit_expand(&mut self, previous: &Procedure) {
        if self.patient_snapshot().is_none() && self.patient == previous.patient {
            self.expand = previous.expand.clone();
        }
    }
}

/// Demographic record, owned independently of procedures.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Patient {
    pub id: RecordId,
    #[serde(default)]
    pub national_id: String,
    #[serde(default)]
    pub hospital_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, with = "dates::date_opt")]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default)]
    pub sex: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub address: String,
}

impl Patient {
    /// Age in completed years on the given day.
    pub fn age_on(&self, day: NaiveDate) -> Option<u32> {
        let born = self.date_of_birth?;
        let mut age = day.year() - born.year();
        if (day.month(), day.day()) < (born.month(), born.day()) {
            age -= 1;
        }
        u32::try_from(age).ok()
    }
}

/// A calendar date bound to one OT list.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OtDay {
    pub id: RecordId,
    #[serde(default, with = "dates::date_opt")]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub ot_list: RecordId,
    #[serde(default)]
    pub disabled: bool,
    /// Why the day was disabled.
    #[serde(default)]
    pub remarks: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OperatingRoom {
    pub id: RecordId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ot_list: RecordId,
    #[serde(default)]
    pub position: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Comment {
    pub id: RecordId,
    #[serde(default)]
    pub procedure: RecordId,
    #[serde(default)]
    pub user: RecordId,
    #[serde(default)]
    pub text: String,
    #[serde(default, with = "dates::datetime_opt")]
    pub created: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn procedure_decodes_backend_record() {
        let raw = json!({
            "id": "p1",
            "collectionName": "procedures",
            "patient": "pat1",
            "ot_day": "d1",
            "operating_room": "r1",
            "order": 2,
            "removed": false,
            "diagnosis": "Cholelithiasis",
            "procedure": "Lap cholecystectomy",
            "added_date": "2024-03-01 08:30:00.000Z",
            "expand": {
                "patient": { "id": "pat1", "name": "A. Perera", "date_of_birth": "1980-05-02 00:00:00.000Z" }
            }
        });

        let procedure: Procedure = serde_json::from_value(raw).unwrap();
        assert_eq!(procedure.order, 2);
        assert_eq!(procedure.patient_snapshot().unwrap().name, "A. Perera");
        assert!(procedure.added_date.is_some());
        assert!(procedure.remarks.is_empty());
    }

    #[test]
    fn empty_dates_decode_as_none() {
        let day: OtDay = serde_json::from_value(json!({"id": "d1", "date": "", "ot_list": "l1"})).unwrap();
        assert_eq!(day.date, None);
    }

    #[test]
    fn temp_ids_are_recognisable() {
        let id = temp_id();
        assert!(is_temp_id(&id));
        assert!(!is_temp_id("r0b5k2x8q1m3n4z"));
        assert_ne!(id, temp_id());
    }

    #[test]
    fn age_counts_completed_years() {
        let patient = Patient {
            date_of_birth: NaiveDate::from_ymd_opt(1980, 5, 2),
            ..Default::default()
        };
        assert_eq!(patient.age_on(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()), Some(43));
        assert_eq!(patient.age_on(NaiveDate::from_ymd_opt(2024, 5, 2).unwrap()), Some(44));
    }

    #[test]
    fn inherit_expand_keeps_snapshot_for_same_patient() {
        let previous = Procedure {
            id: "p1".into(),
            patient: "pat1".into(),
            expand: Some(ProcedureExpand {
                patient: Some(Patient { id: "pat1".into(), name: "B".into(), ..Default::default() }),
            }),
            ..Default::default()
        };
        let mut incoming = Procedure { id: "p1".into(), patient: "pat1".into(), order: 4, ..Default::default() };
        incoming.inherit_expand(&previous);
        assert_eq!(incoming.patient_snapshot().map(|p| p.name.as_str()), Some("B"));

        let mut other = Procedure { id: "p1".into(), patient: "pat2".into(), ..Default::default() };
        other.inherit_expand(&previous);
        assert!(other.patient_snapshot().is_none());
    }
}
