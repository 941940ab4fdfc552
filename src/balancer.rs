//! Smooth weighted round robin.
//!
//! Each address carries a *current* weight that survives between calls. On every
//! pick all current weights grow by their configured weight, the largest one wins
//! and pays back the sum of all configured weights. Over `total` picks each address
//! is chosen exactly `weight` times, interleaved rather than in bursts.

use std::collections::BTreeMap;

/// Address to weight, ordered by address so ties always resolve the same way.
pub type WeightMap = BTreeMap<String, i64>;

/// Picks one address.
///
/// Only addresses present in `current` are candidates; a configured address that
/// has no current weight yet is not selectable. Addresses missing from
/// `configured` grow by 0. When several addresses share the maximum, the first
/// in address order wins.
///
/// Arithmetic saturates, so extreme weights skew the rotation instead of panicking.
///
/// Returns the updated current weights and the chosen address, or `None` when
/// `current` is empty.
#[must_use]
pub fn select(current: &WeightMap, configured: &WeightMap) -> (WeightMap, Option<String>) {
    let total = configured
        .values()
        .fold(0_i64, |sum, weight| sum.saturating_add(*weight));

    let mut next = WeightMap::new();
    let mut best: Option<(&String, i64)> = None;

    for (address, weight) in current {
        let grown = weight.saturating_add(configured.get(address).copied().unwrap_or(0));

        if best.is_none_or(|(_, max)| grown > max) {
            best = Some((address, grown));
        }

        next.insert(address.clone(), grown);
    }

    let chosen = best.map(|(address, _)| address.clone());

    if let Some(address) = &chosen {
        if let Some(weight) = next.get_mut(address) {
            *weight = weight.saturating_sub(total);
        }
    }

    (next, chosen)
}
