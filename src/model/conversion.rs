use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use super::Procedure;

/// Field map sent to the backend on create/update.
pub type Fields = Map<String, Value>;

#[derive(Debug, thiserror::Error)]
#[error("record conversion failed: {0}")]
pub struct ConversionError(#[from] serde_json::Error);

/// Converts between typed records and the backend's JSON shape.
pub trait RecordConverter: Sized {
    fn to_fields(&self) -> Result<Fields, ConversionError>;
    fn from_record(record: Value) -> Result<Self, ConversionError>;
}

impl<T> RecordConverter for T
where
    T: Serialize + DeserializeOwned,
{
    fn to_fields(&self) -> Result<Fields, ConversionError> {
        match serde_json::to_value(self)? {
            Value::Object(fields) => Ok(fields),
            // Only structs are converted; anything else is an empty write.
            _ => Ok(Fields::new()),
        }
    }

    fn from_record(record: Value) -> Result<Self, ConversionError> {
        Ok(serde_json::from_value(record)?)
    }
}

impl Procedure {
    /// Fields for creating this procedure on the backend. The local id and
    /// inlined relations are never sent.
    pub fn create_fields(&self) -> Result<Fields, ConversionError> {
        let mut fields = self.to_fields()?;
        fields.remove("id");
        fields.remove("expand");
        Ok(fields)
    }
}

/// Build a field map from literal pairs.
pub fn fields<I, K>(pairs: I) -> Fields
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(key, value)| (key.into(), value)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Patient, ProcedureExpand};
    use serde_json::json;

    #[test]
    fn create_fields_strip_local_only_keys() {
        let procedure = Procedure {
            id: "tmp_1".into(),
            patient: "pat1".into(),
            order: 1,
            expand: Some(ProcedureExpand { patient: Some(Patient::default()) }),
            ..Default::default()
        };
        let fields = procedure.create_fields().unwrap();
        assert!(!fields.contains_key("id"));
        assert!(!fields.contains_key("expand"));
        assert_eq!(fields["patient"], json!("pat1"));
        assert_eq!(fields["order"], json!(1));
    }

    #[test]
    fn from_record_reports_type_mismatch() {
        let err = Procedure::from_record(json!({"id": "p", "order": "first"})).unwrap_err();
        assert!(err.to_string().contains("record conversion failed"));
    }

    #[test]
    fn literal_fields() {
        let map = fields([("removed", json!(true)), ("order", json!(4))]);
        assert_eq!(Value::Object(map), json!({"removed": true, "order": 4}));
    }
}
