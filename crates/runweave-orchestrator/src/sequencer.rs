//! Result ordering within a node's result sequence.
//!
//! Results are grouped by batch. A batch not yet present is appended at the
//! end; within a batch items are ordered by `(order, secondary_order)` and a
//! missing secondary order sorts after any present one.

use runweave_core::types::{BatchId, ResultItem};

/// True when an item with `new` secondary order belongs after one with
/// `existing`, given equal primary order.
fn goes_after(existing: Option<u32>, new: Option<u32>) -> bool {
    match (existing, new) {
        (None, None) => true,
        (None, Some(_)) => false,
        (Some(_), None) => true,
        (Some(e), Some(n)) => e <= n,
    }
}

/// Index at which a result with the given keys should be inserted.
///
/// Equal keys land after the existing items, so arrival order is kept among
/// ties.
pub fn insertion_index(
    items: &[ResultItem],
    batch_id: &BatchId,
    order: u32,
    secondary_order: Option<u32>,
) -> usize {
    let same_batch: Vec<usize> = items
        .iter()
        .enumerate()
        .filter(|(_, item)| &item.batch_id == batch_id)
        .map(|(i, _)| i)
        .collect();

    let (Some(&first), Some(&last)) = (same_batch.first(), same_batch.last()) else {
        return items.len();
    };

    let mut left = 0;
    let mut right = same_batch.len();
    while left < right {
        let mid = left + (right - left) / 2;
        let existing = &items[same_batch[mid]];
        let after = existing.order < order
            || (existing.order == order && goes_after(existing.secondary_order, secondary_order));
        if after {
            left = mid + 1;
        } else {
            right = mid;
        }
    }

    if left == 0 {
        first
    } else if left == same_batch.len() {
        last + 1
    } else {
        same_batch[left]
    }
}

/// Insert `item` at its ordered position.
pub fn insert_ordered(items: &mut Vec<ResultItem>, item: ResultItem) -> usize {
    let index = insertion_index(items, &item.batch_id, item.order, item.secondary_order);
    items.insert(index, item);
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn item(batch: &str, order: u32, secondary: Option<u32>) -> ResultItem {
        ResultItem {
            batch_id: batch.into(),
            order,
            secondary_order: secondary,
            payload: json!(format!("{batch}:{order}:{secondary:?}")),
            input: None,
        }
    }

    fn keys(items: &[ResultItem]) -> Vec<(String, u32, Option<u32>)> {
        items
            .iter()
            .map(|i| (i.batch_id.0.clone(), i.order, i.secondary_order))
            .collect()
    }

    #[test]
    fn empty_sequence_inserts_at_zero() {
        assert_eq!(insertion_index(&[], &"b1".into(), 5, None), 0);
    }

    #[test]
    fn new_batch_appends() {
        let items = vec![item("b1", 0, None), item("b1", 1, None)];
        assert_eq!(insertion_index(&items, &"b2".into(), 0, None), 2);
    }

    #[test]
    fn orders_within_batch() {
        let mut items = Vec::new();
        for order in [3, 0, 2, 1] {
            insert_ordered(&mut items, item("b1", order, None));
        }
        let orders: Vec<u32> = items.iter().map(|i| i.order).collect();
        assert_eq!(orders, vec![0, 1, 2, 3]);
    }

    #[test]
    fn batches_stay_grouped() {
        let mut items = Vec::new();
        insert_ordered(&mut items, item("b1", 1, None));
        insert_ordered(&mut items, item("b2", 1, None));
        insert_ordered(&mut items, item("b1", 0, None));
        insert_ordered(&mut items, item("b2", 0, None));
        insert_ordered(&mut items, item("b1", 2, None));
        assert_eq!(
            keys(&items),
            vec![
                ("b1".into(), 0, None),
                ("b1".into(), 1, None),
                ("b1".into(), 2, None),
                ("b2".into(), 0, None),
                ("b2".into(), 1, None),
            ]
        );
    }

    #[test]
    fn missing_secondary_sorts_last() {
        let mut items = Vec::new();
        insert_ordered(&mut items, item("b1", 0, None));
        insert_ordered(&mut items, item("b1", 0, Some(1)));
        insert_ordered(&mut items, item("b1", 0, Some(0)));
        assert_eq!(
            keys(&items),
            vec![
                ("b1".into(), 0, Some(0)),
                ("b1".into(), 0, Some(1)),
                ("b1".into(), 0, None),
            ]
        );
    }

    #[test]
    fn ties_keep_arrival_order() {
        let mut items = vec![item("b1", 0, Some(0))];
        let mut second = item("b1", 0, Some(0));
        second.payload = json!("second");
        let index = insert_ordered(&mut items, second);
        assert_eq!(index, 1);
        assert_eq!(items[1].payload, json!("second"));
    }

    #[test]
    fn insert_before_whole_batch_lands_at_its_start() {
        let items = vec![item("b0", 0, None), item("b1", 4, None), item("b1", 5, None)];
        assert_eq!(insertion_index(&items, &"b1".into(), 1, None), 1);
    }

    proptest! {
        #[test]
        fn any_arrival_order_sorts_each_batch(
            entries in prop::collection::vec((0u8..3, 0u32..6, prop::option::of(0u32..3)), 0..40)
        ) {
            let mut items = Vec::new();
            for (batch, order, secondary) in &entries {
                insert_ordered(&mut items, item(&format!("b{batch}"), *order, *secondary));
            }
            prop_assert_eq!(items.len(), entries.len());

            // Each batch occupies one contiguous run.
            let mut seen: Vec<String> = Vec::new();
            for it in &items {
                if seen.last() != Some(&it.batch_id.0) {
                    prop_assert!(!seen.contains(&it.batch_id.0));
                    seen.push(it.batch_id.0.clone());
                }
            }

            // Within a batch, keys never decrease.
            let rank = |s: Option<u32>| s.map_or(u64::MAX, u64::from);
            for pair in items.windows(2) {
                if pair[0].batch_id == pair[1].batch_id {
                    let a = (pair[0].order, rank(pair[0].secondary_order));
                    let b = (pair[1].order, rank(pair[1].secondary_order));
                    prop_assert!(a <= b);
                }
            }
        }
    }
}
