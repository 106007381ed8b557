use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::pipeline::spec::SearchSpecs;

/// Remaining downloads allowed per search.
///
/// A unit is taken before a download is dispatched and handed back if the
/// download fails, so the number of successful downloads never passes the
/// limit even with several workers on the same search.
#[derive(Debug, Default)]
pub struct Countdowns {
    remaining: HashMap<String, Option<AtomicU64>>,
}

impl Countdowns {
    pub fn from_specs(specs: &SearchSpecs) -> Self {
        let remaining = specs
            .searches()
            .map(|spec| (spec.directory.clone(), spec.post_limit.map(AtomicU64::new)))
            .collect();
        Self { remaining }
    }

    /// Rebuilds from a persisted snapshot. Searches missing from it start at their limit.
    pub fn restore_from(specs: &SearchSpecs, snapshot: &BTreeMap<String, Option<u64>>) -> Self {
        let mut countdowns = Self::from_specs(specs);
        for (directory, value) in snapshot {
            if let Some(slot) = countdowns.remaining.get_mut(directory) {
                *slot = value.map(AtomicU64::new);
            }
        }
        countdowns
    }

    /// Takes one unit. Unknown and unbounded searches always succeed.
    pub fn try_take(&self, directory: &str) -> bool {
        match self.remaining.get(directory) {
            Some(Some(counter)) => counter
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok(),
            _ => true,
        }
    }

    /// Returns a unit taken by `try_take`.
    pub fn restore(&self, directory: &str) {
        if let Some(Some(counter)) = self.remaining.get(directory) {
            counter.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// `None` when the search is unbounded or unknown.
    pub fn remaining(&self, directory: &str) -> Option<u64> {
        self.remaining
            .get(directory)
            .and_then(|slot| slot.as_ref().map(|c| c.load(Ordering::Acquire)))
    }

    pub fn is_available(&self, directory: &str) -> bool {
        self.remaining(directory).is_none_or(|n| n > 0)
    }

    /// True while at least one search can still accept a download.
    pub fn any_available(&self) -> bool {
        self.remaining.is_empty() || self.remaining.keys().any(|dir| self.is_available(dir))
    }

    pub fn snapshot(&self) -> BTreeMap<String, Option<u64>> {
        self.remaining
            .iter()
            .map(|(dir, slot)| (dir.clone(), slot.as_ref().map(|c| c.load(Ordering::Acquire))))
            .collect()
    }
}
