//! otlist: operating theatre list client
//!
//! Keeps a day's ordered procedure list in sync with a hosted backend,
//! with optimistic writes, placeholder reconciliation, drag reordering and
//! realtime merge of other clients' changes.

pub mod backend;
pub mod config;
pub mod error;
pub mod model;
pub mod print;
pub mod schedule;
pub mod store;

pub use backend::{Backend, BackendError, HttpBackend, MemoryBackend};
pub use config::{load_config, Config};
pub use error::{OtListError, StoreError};
pub use store::{ProcedureListStore, RecordStatus};
