use serde::Serialize;

use crate::error::TallyError;
use crate::store::{GroupKey, ResultRecord};

/// Groups smaller than this are left alone.
pub const DEFAULT_MIN_GROUP_SIZE: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Loser {
    pub id: String,
    pub uses: i64,
}

/// The write set for one duplicate group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergePlan {
    pub key: GroupKey,
    pub winner_id: String,
    /// Winner's counter before the merge.
    pub winner_uses: i64,
    pub losers: Vec<Loser>,
    pub total_uses: i64,
}

impl MergePlan {
    /// Winner total when only `deleted` losers actually went away, so the
    /// rows left behind still add up to the group's original sum.
    pub fn total_for(&self, deleted: &[&Loser]) -> i64 {
        deleted.iter().fold(self.winner_uses, |acc, l| acc.saturating_add(l.uses))
    }
}

/// Decide how to merge one duplicate group.
///
/// `Ok(None)` when the group is below `min_group_size`. Members are ordered by
/// `created_at` then `id`, so the same rows always pick the same winner no
/// matter what order the store returned them in.
pub fn plan_merge(
    group: &[ResultRecord],
    min_group_size: usize,
) -> Result<Option<MergePlan>, TallyError> {
    if group.is_empty() || group.len() < min_group_size {
        return Ok(None);
    }

    let mut parsed = group
        .iter()
        .map(|r| r.parse_uses().map(|n| (r, n)))
        .collect::<Result<Vec<_>, _>>()?;
    parsed.sort_by(|(a, _), (b, _)| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let key = parsed[0].0.key();
    let total_uses = parsed
        .iter()
        .try_fold(0i64, |acc, (_, n)| acc.checked_add(*n))
        .ok_or_else(|| TallyError::UsesOverflow(key.to_string()))?;

    let (winner, winner_uses) = parsed[0];
    let losers = parsed[1..]
        .iter()
        .filter(|(r, _)| r.id != winner.id)
        .map(|(r, n)| Loser { id: r.id.clone(), uses: *n })
        .collect();

    Ok(Some(MergePlan {
        winner_id: winner.id.clone(),
        winner_uses,
        losers,
        total_uses,
        key,
    }))
}

#[cfg(test)]
#[path = "merge_tests.rs"]
mod merge_tests;
