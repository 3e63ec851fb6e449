use super::{dense_changes, Ordered};

/// Sort by current position. `sort_by_key` is stable, so equal positions keep
/// their input order.
fn sorted<T: Ordered>(records: &[T]) -> Vec<T> {
    let mut sorted = records.to_vec();
    sorted.sort_by_key(|record| record.order());
    sorted
}

/// Move `source` into `target`'s slot. `None` when the drag is a no-op.
fn moved<T: Ordered>(records: &[T], source: &str, target: &str) -> Option<Vec<T>> {
    if source == target {
        return None;
    }
    let mut sequence = sorted(records);
    let from = sequence.iter().position(|record| record.key() == source)?;
    let to = sequence.iter().position(|record| record.key() == target)?;

    let dragged = sequence.remove(from);
    sequence.insert(to, dragged);
    Some(sequence)
}

/// Apply a drag of `source` onto `target` within one (OT day, room) list.
///
/// Returns only the records whose `order` changed, carrying their new
/// position. Dragging onto itself or naming an id outside the list yields an
/// empty change set.
pub fn reorder<T: Ordered>(records: &[T], source: &str, target: &str) -> Vec<T> {
    match moved(records, source, target) {
        Some(mut sequence) => dense_changes(&mut sequence),
        None => {
            tracing::debug!(source, target, "Ignoring no-op drag");
            Vec::new()
        }
    }
}

/// The full list as it reads after the drag, densely renumbered. A no-op drag
/// returns the list sorted and renumbered as it stands.
pub fn reorder_preview<T: Ordered>(records: &[T], source: &str, target: &str) -> Vec<T> {
    let mut sequence = moved(records, source, target).unwrap_or_else(|| sorted(records));
    dense_changes(&mut sequence);
    sequence
}
