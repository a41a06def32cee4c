//! Grouping of a page into independent lanes.
//!
//! A lane is a root item plus every descendant of it found in the same page,
//! ordered so a parent always precedes its children. Lanes share no items, so
//! they can run on different workers; the items of one lane run in order on a
//! single worker.

use crate::migrator::SourceItem;
use std::collections::HashMap;

pub type Lane = Vec<SourceItem>;

/// Split `items` into lanes. Lane order follows the first appearance of each
/// root; items inside a lane are sorted by depth, then by `order_key`.
pub fn build_lanes(items: Vec<SourceItem>) -> Vec<Lane> {
    let index: HashMap<&str, usize> = items
        .iter()
        .enumerate()
        .map(|(i, item)| (item.source_id.as_str(), i))
        .collect();

    // (root, depth) for every item; parents outside the page end the walk
    let placement: Vec<(usize, usize)> = (0..items.len())
        .map(|start| {
            let mut current = start;
            let mut depth = 0;
            while let Some(parent) = items[current]
                .parent_id
                .as_deref()
                .and_then(|p| index.get(p).copied())
            {
                // A parent cycle inside the page; treat the item as a root
                if depth >= items.len() || parent == start {
                    return (start, 0);
                }
                current = parent;
                depth += 1;
            }
            (current, depth)
        })
        .collect();

    let mut lane_of_root: HashMap<usize, usize> = HashMap::new();
    let mut lanes: Vec<Vec<(usize, SourceItem)>> = Vec::new();
    for (i, item) in items.into_iter().enumerate() {
        let (root, depth) = placement[i];
        let lane = *lane_of_root.entry(root).or_insert_with(|| {
            lanes.push(Vec::new());
            lanes.len() - 1
        });
        lanes[lane].push((depth, item));
    }

    lanes
        .into_iter()
        .map(|mut lane| {
            lane.sort_by(|(da, a), (db, b)| da.cmp(db).then_with(|| a.order_key.cmp(&b.order_key)));
            lane.into_iter().map(|(_, item)| item).collect()
        })
        .collect()
}
