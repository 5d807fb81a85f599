//! Load-balancing selection shared by the router and the gateway.
//!
//! Every selection scans candidates in sorted key order, so results
//! are deterministic regardless of map iteration order. Ties on
//! weight are broken by an explicit, configured rule rather than an
//! implicit comparison direction.

use serde::{Deserialize, Serialize};

/// How equal-weight candidates are separated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Keep the candidate with the lexicographically smallest key.
    #[default]
    LowestKey,
    /// Keep the candidate with the lexicographically largest key.
    HighestKey,
}

/// Picks the minimum-weight key from `(key, weight)` pairs.
///
/// Candidates are sorted by key first; with `LowestKey` the first of
/// an equal-weight run wins, with `HighestKey` the last.
pub fn pick_min_weight<K>(items: Vec<(K, i32)>, tie_break: TieBreak) -> Option<K>
where
    K: Ord,
{
    let mut items = items;
    items.sort_by(|a, b| a.0.cmp(&b.0));

    let mut best: Option<(K, i32)> = None;
    for (key, weight) in items {
        best = match best {
            None => Some((key, weight)),
            Some((best_key, best_weight)) => {
                if weight < best_weight
                    || (weight == best_weight && tie_break == TieBreak::HighestKey)
                {
                    Some((key, weight))
                } else {
                    Some((best_key, best_weight))
                }
            }
        };
    }
    best.map(|(key, _)| key)
}
