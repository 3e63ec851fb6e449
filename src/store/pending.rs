use crate::model::RecordId;

/// A locally created record waiting for its server id.
///
/// The temporary id stays the key; `confirmed` is filled in once the backend
/// acknowledges the create, so a caller still holding the temporary id can
/// always be resolved to the live one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pending<T> {
    pub temp_id: RecordId,
    pub confirmed: Option<T>,
}

impl<T> Pending<T> {
    pub fn new(temp_id: RecordId) -> Self {
        Pending { temp_id, confirmed: None }
    }

    pub fn confirm(&mut self, value: T) {
        self.confirmed = Some(value);
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed.is_some()
    }
}

impl Pending<RecordId> {
    /// The id the record is currently known by.
    pub fn current_id(&self) -> &str {
        self.confirmed.as_deref().unwrap_or(&self.temp_id)
    }
}
