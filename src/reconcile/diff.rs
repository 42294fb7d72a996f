//! Pure session diffing

use std::collections::{BTreeSet, HashSet};

use crate::model::normalize_username;

/// Changes between the recorded and the live username sets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionDiff {
    /// Live but not recorded
    pub newly_online: BTreeSet<String>,
    /// Recorded but no longer live
    pub newly_offline: BTreeSet<String>,
    /// Present in both; nothing is written for these
    pub unchanged: usize,
}

impl SessionDiff {
    pub fn is_empty(&self) -> bool {
        self.newly_online.is_empty() && self.newly_offline.is_empty()
    }
}

/// Normalize device-reported names, dropping empty ones
pub fn normalize_all<I, S>(raw: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .map(|name| normalize_username(name.as_ref()))
        .filter(|name| !name.is_empty())
        .collect()
}

/// Compute `live - recorded` and `recorded - live`
pub fn diff(live: &BTreeSet<String>, recorded: &HashSet<String>) -> SessionDiff {
    let newly_online: BTreeSet<String> = live
        .iter()
        .filter(|name| !recorded.contains(*name))
        .cloned()
        .collect();
    let newly_offline: BTreeSet<String> = recorded
        .iter()
        .filter(|name| !live.contains(*name))
        .cloned()
        .collect();
    let unchanged = live.len() - newly_online.len();

    SessionDiff {
        newly_online,
        newly_offline,
        unchanged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_normalize_all() {
        let names = normalize_all(["  Alice", "alice", "BOB ", "", "   "]);
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["alice", "bob"]);
    }

    #[test]
    fn test_diff() {
        let live = normalize_all(["alice", "carol"]);
        let recorded = set(&["alice", "bob"]);

        let d = diff(&live, &recorded);
        assert_eq!(d.newly_online.into_iter().collect::<Vec<_>>(), vec!["carol"]);
        assert_eq!(d.newly_offline.into_iter().collect::<Vec<_>>(), vec!["bob"]);
        assert_eq!(d.unchanged, 1);
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let live = normalize_all(["alice", "bob"]);
        let d = diff(&live, &set(&["alice", "bob"]));
        assert!(d.is_empty());
        assert_eq!(d.unchanged, 2);
    }

    #[test]
    fn test_diff_empty_live_drops_everyone() {
        let d = diff(&BTreeSet::new(), &set(&["alice", "bob"]));
        assert!(d.newly_online.is_empty());
        assert_eq!(d.newly_offline.len(), 2);
    }
}
