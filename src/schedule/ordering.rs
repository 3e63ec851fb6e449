use crate::model::Procedure;

use super::dense_changes;

/// Non-removed procedures of one (OT day, room) list, sorted by position.
pub fn scope(records: &[Procedure], ot_day: &str, operating_room: &str) -> Vec<Procedure> {
    let mut scoped: Vec<Procedure> = records
        .iter()
        .filter(|record| !record.removed && record.in_scope(ot_day, operating_room))
        .cloned()
        .collect();
    scoped.sort_by_key(|record| record.order);
    scoped
}

/// Position for a record appended to the list: one past the highest
/// non-removed position, or 1 for an empty list.
pub fn next_order(records: &[Procedure], ot_day: &str, operating_room: &str) -> u32 {
    records
        .iter()
        .filter(|record| !record.removed && record.in_scope(ot_day, operating_room))
        .map(|record| record.order)
        .max()
        .unwrap_or(0)
        + 1
}

/// Records that shift up by one after `vacated` is freed in a list.
/// `leaving` is excluded even if it still sits in the list.
pub fn close_gap(
    records: &[Procedure],
    ot_day: &str,
    operating_room: &str,
    vacated: u32,
    leaving: &str,
) -> Vec<Procedure> {
    scope(records, ot_day, operating_room)
        .into_iter()
        .filter(|record| record.id != leaving && record.order > vacated)
        .map(|mut record| {
            record.order -= 1;
            record
        })
        .collect()
}

/// Densely renumber a list, returning only the records that moved.
pub fn renumber(records: &[Procedure]) -> Vec<Procedure> {
    let mut sequence = records.to_vec();
    sequence.sort_by_key(|record| record.order);
    dense_changes(&mut sequence)
}

/// True when the non-removed positions are exactly `1..=N`.
pub fn is_dense<'a, I>(records: I) -> bool
where
    I: IntoIterator<Item = &'a Procedure>,
{
    let mut orders: Vec<u32> = records
        .into_iter()
        .filter(|record| !record.removed)
        .map(|record| record.order)
        .collect();
    orders.sort_unstable();
    orders.iter().enumerate().all(|(index, order)| *order == index as u32 + 1)
}
