//! The Distribution Engine: a pure bin-packing function over backend
//! capacities and content sizes.
//!
//! `distribute` never performs IO and never removes an existing placement.
//! It only answers "which backends should additionally hold which content";
//! acting on the answer is the orchestrator's `sync`.

use std::collections::{BTreeMap, BTreeSet};

use manifold_types::ContentHash;

/// Backend name to capacity in bytes.
pub type Bins = BTreeMap<String, u64>;

/// Content hash to size in bytes.
pub type Items = BTreeMap<ContentHash, u64>;

/// Backend name to the set of content hashes it holds (or should hold).
pub type Placement = BTreeMap<String, BTreeSet<ContentHash>>;

/// Compute a target placement from bin capacities, item sizes, and the
/// placement that already exists.
///
/// The result is strictly additive over `current`: an item is never removed
/// from a bin it already occupies, so replication only grows. A bin large
/// enough for every item is assigned the full item set outright, and items
/// covered that way are done for the pass: they gain no further replicas on
/// the smaller bins. Without such a bin, items run through a best-fit,
/// largest-item-first greedy packer: each item goes to the smallest bin
/// that still fits it and does not already hold it.
/// Items that fit nowhere are dropped for this pass; that is not an error,
/// they simply gain no redundancy this round. Ties between equally-sized
/// candidates go to the lexically first name, so the result is
/// deterministic.
///
/// Every bin named in `bins` appears in the result, even when unchanged.
pub fn distribute(bins: &Bins, items: &Items, current: &Placement) -> Placement {
    let mut placement: Placement = bins
        .keys()
        .map(|name| {
            let seeded = current.get(name).cloned().unwrap_or_default();
            (name.clone(), seeded)
        })
        .collect();

    let total_size: u64 = items.values().sum();

    // Residual capacity after accounting for what the bin already holds.
    let mut residual: BTreeMap<&str, u64> = BTreeMap::new();
    let mut open_bins: Vec<&str> = Vec::new();
    let mut all_covered = false;
    for (name, &capacity) in bins {
        let held: u64 = placement[name]
            .iter()
            .filter_map(|h| items.get(h))
            .sum();
        let free = capacity.saturating_sub(held);

        if capacity >= total_size {
            // Large enough for everything: hold the full item set. Items
            // covered this way are settled, so the packer never sees them.
            let set = placement.get_mut(name).expect("seeded above");
            set.extend(items.keys().cloned());
            all_covered = true;
            continue;
        }
        residual.insert(name.as_str(), free);
        open_bins.push(name.as_str());
    }
    if all_covered {
        return placement;
    }

    // Largest item first; equal sizes break lexically for determinism.
    let mut queue: Vec<(&ContentHash, u64)> = items.iter().map(|(h, &s)| (h, s)).collect();
    queue.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    for (hash, size) in queue {
        // Smallest bin that fits and does not already hold the item; equal
        // residuals break lexically. BTreeMap iteration gives the lexical
        // order, min_by_key keeps the first minimum.
        let target = open_bins
            .iter()
            .filter(|name| residual[**name] >= size && !placement[**name].contains(hash))
            .min_by_key(|name| residual[**name])
            .copied();
        if let Some(name) = target {
            *residual.get_mut(name).expect("open bin") -= size;
            placement
                .get_mut(name)
                .expect("seeded above")
                .insert(hash.clone());
        }
    }

    placement
}
