//! Procedure ordering
//!
//! Position bookkeeping for a (OT day, operating room) list:
//! - Drag-and-drop reordering with minimal change sets
//! - Next position, gap closing and dense renumbering helpers

pub mod ordering;
pub mod reorder;

pub use ordering::{close_gap, is_dense, next_order, renumber, scope};
pub use reorder::{reorder, reorder_preview};

use crate::model::Procedure;

/// Anything that carries an id and a 1-based list position.
pub trait Ordered: Clone {
    fn key(&self) -> &str;
    fn order(&self) -> u32;
    fn set_order(&mut self, order: u32);
}

impl Ordered for Procedure {
    fn key(&self) -> &str {
        &self.id
    }

    fn order(&self) -> u32 {
        self.order
    }

    fn set_order(&mut self, order: u32) {
        self.order = order;
    }
}

/// Assign `index + 1` over `sequence` and return the records whose position
/// changed, in sequence order.
pub(crate) fn dense_changes<T: Ordered>(sequence: &mut [T]) -> Vec<T> {
    let mut changed = Vec::new();
    for (index, record) in sequence.iter_mut().enumerate() {
        let position = index as u32 + 1;
        if record.order() != position {
            record.set_order(position);
            changed.push(record.clone());
        }
    }
    changed
}
