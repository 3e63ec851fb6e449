use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::{dates, Patient, Procedure, ProcedureExpand, RecordId};

/// Patient fields entered before the record exists.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PatientDraft {
    pub national_id: String,
    pub hospital_id: String,
    pub name: String,
    #[serde(default, with = "dates::date_opt")]
    pub date_of_birth: Option<NaiveDate>,
    pub sex: String,
    pub phone: String,
    pub address: String,
}

impl PatientDraft {
    pub fn to_patient(&self, id: RecordId) -> Patient {
        Patient {
            id,
            national_id: self.national_id.clone(),
            hospital_id: self.hospital_id.clone(),
            name: self.name.clone(),
            date_of_birth: self.date_of_birth,
            sex: self.sex.clone(),
            phone: self.phone.clone(),
            address: self.address.clone(),
        }
    }
}

/// Procedure fields entered before the record exists. Day, patient and
/// position are filled in by the store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcedureDraft {
    pub operating_room: RecordId,
    pub diagnosis: String,
    pub procedure: String,
    pub comorbidities: String,
    pub anesthesia: String,
    pub duration: String,
    pub remarks: String,
    pub special_requirements: String,
    pub bed: String,
    pub added_by: RecordId,
}

impl ProcedureDraft {
    /// Build the placeholder rendered while the backend writes are in flight.
    pub fn to_placeholder(&self, id: RecordId, ot_day: &str, order: u32, patient: Patient) -> Procedure {
        Procedure {
            id,
            patient: patient.id.clone(),
            ot_day: ot_day.to_string(),
            operating_room: self.operating_room.clone(),
            order,
            removed: false,
            diagnosis: self.diagnosis.clone(),
            procedure: self.procedure.clone(),
            comorbidities: self.comorbidities.clone(),
            anesthesia: self.anesthesia.clone(),
            duration: self.duration.clone(),
            remarks: self.remarks.clone(),
            special_requirements: self.special_requirements.clone(),
            bed: self.bed.clone(),
            added_by: self.added_by.clone(),
            added_date: Some(Utc::now()),
            expand: Some(ProcedureExpand { patient: Some(patient) }),
        }
    }
}

/// Partial patient edit; only the `Some` fields are sent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PatientPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub national_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hospital_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "dates::date_opt")]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl PatientPatch {
    pub fn is_empty(&self) -> bool {
        *self == PatientPatch::default()
    }

    pub fn apply_to(&self, patient: &mut Patient) {
        overlay(&mut patient.national_id, &self.national_id);
        overlay(&mut patient.hospital_id, &self.hospital_id);
        overlay(&mut patient.name, &self.name);
        if self.date_of_birth.is_some() {
            patient.date_of_birth = self.date_of_birth;
        }
        overlay(&mut patient.sex, &self.sex);
        overlay(&mut patient.phone, &self.phone);
        overlay(&mut patient.address, &self.address);
    }
}

/// Partial procedure edit; only the `Some` fields are sent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcedurePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procedure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comorbidities: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anesthesia: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_requirements: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bed: Option<String>,
}

impl ProcedurePatch {
    pub fn is_empty(&self) -> bool {
        *self == ProcedurePatch::default()
    }

    pub fn apply_to(&self, procedure: &mut Procedure) {
        overlay(&mut procedure.diagnosis, &self.diagnosis);
        overlay(&mut procedure.procedure, &self.procedure);
        overlay(&mut procedure.comorbidities, &self.comorbidities);
        overlay(&mut procedure.anesthesia, &self.anesthesia);
        overlay(&mut procedure.duration, &self.duration);
        overlay(&mut procedure.remarks, &self.remarks);
        overlay(&mut procedure.special_requirements, &self.special_requirements);
        overlay(&mut procedure.bed, &self.bed);
    }
}

fn overlay(field: &mut String, value: &Option<String>) {
    if let Some(value) = value {
        field.clone_from(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn patch_serializes_only_set_fields() {
        let patch = ProcedurePatch {
            diagnosis: Some("Appendicitis".into()),
            bed: Some("12".into()),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!({"diagnosis": "Appendicitis", "bed": "12"})
        );
        assert!(ProcedurePatch::default().is_empty());
        assert!(!patch.is_empty());
    }

    #[test]
    fn patient_patch_overlays_in_place() {
        let mut patient = Patient { id: "p".into(), name: "Old".into(), phone: "1".into(), ..Default::default() };
        PatientPatch { name: Some("New".into()), ..Default::default() }.apply_to(&mut patient);
        assert_eq!(patient.name, "New");
        assert_eq!(patient.phone, "1");
    }

    #[test]
    fn placeholder_embeds_patient_snapshot() {
        let draft = ProcedureDraft { operating_room: "r1".into(), procedure: "TURP".into(), ..Default::default() };
        let patient = PatientDraft { name: "C".into(), ..Default::default() }.to_patient("tmp_pat".into());
        let placeholder = draft.to_placeholder("tmp_proc".into(), "d1", 3, patient);

        assert_eq!(placeholder.patient, "tmp_pat");
        assert_eq!(placeholder.order, 3);
        assert_eq!(placeholder.ot_day, "d1");
        assert_eq!(placeholder.patient_snapshot().unwrap().name, "C");
    }
}
