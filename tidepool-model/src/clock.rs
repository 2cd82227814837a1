//! Causal clocks: version vectors and dotted version vectors.
//!
//! A `VersionVector` summarizes how many events from each replica have been
//! observed. A `Dvv` tags a single write: the `dot` identifies the event
//! itself and `context` captures everything the writer had seen when it
//! wrote. Dominance between effective clocks decides which siblings survive
//! a merge.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Replica id → highest event count observed from that replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector(BTreeMap<String, u64>);

impl VersionVector {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, replica: &str) -> u64 {
        self.0.get(replica).copied().unwrap_or(0)
    }

    pub fn set(&mut self, replica: impl Into<String>, count: u64) {
        self.0.insert(replica.into(), count);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pointwise max of both vectors.
    pub fn merge(&mut self, other: &VersionVector) {
        for (replica, count) in &other.0 {
            let entry = self.0.entry(replica.clone()).or_insert(0);
            if *count > *entry {
                *entry = *count;
            }
        }
    }

    /// True iff self is pointwise ≥ other.
    pub fn descends(&self, other: &VersionVector) -> bool {
        other.0.iter().all(|(replica, count)| self.get(replica) >= *count)
    }

    /// True iff self strictly dominates other.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        self.descends(other) && self != other
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.0.iter()
    }
}

/// A single event: the `count`-th write issued by `replica`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dot {
    pub replica: String,
    pub count: u64,
}

/// Dotted version vector: one event plus the context it was issued against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dvv {
    pub dot: Option<Dot>,
    pub context: VersionVector,
}

impl Dvv {
    pub fn new(dot: Dot, context: VersionVector) -> Self {
        Self { dot: Some(dot), context }
    }

    /// Context-only clock ("I observed these versions, wrote nothing").
    pub fn context_only(context: VersionVector) -> Self {
        Self { dot: None, context }
    }

    /// The full clock: context with the dot folded in.
    pub fn effective(&self) -> VersionVector {
        let mut vv = self.context.clone();
        if let Some(dot) = &self.dot {
            if dot.count > vv.get(&dot.replica) {
                vv.set(dot.replica.clone(), dot.count);
            }
        }
        vv
    }

    pub fn descends(&self, other: &Dvv) -> bool {
        self.effective().descends(&other.effective())
    }

    pub fn dominates(&self, other: &Dvv) -> bool {
        self.effective().dominates(&other.effective())
    }

    /// The highest count this clock has seen for `replica`, dot included.
    pub fn max_count(&self, replica: &str) -> u64 {
        let mut max = self.context.get(replica);
        if let Some(dot) = &self.dot {
            if dot.replica == replica && dot.count > max {
                max = dot.count;
            }
        }
        max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vv(pairs: &[(&str, u64)]) -> VersionVector {
        let mut v = VersionVector::new();
        for (r, c) in pairs {
            v.set(*r, *c);
        }
        v
    }

    #[test]
    fn descends_is_pointwise() {
        assert!(vv(&[("a", 2), ("b", 1)]).descends(&vv(&[("a", 1)])));
        assert!(!vv(&[("a", 2)]).descends(&vv(&[("b", 1)])));
        assert!(vv(&[]).descends(&vv(&[])));
    }

    #[test]
    fn concurrent_vectors_do_not_dominate() {
        let a = vv(&[("a", 1)]);
        let b = vv(&[("b", 1)]);
        assert!(!a.dominates(&b));
        assert!(!b.dominates(&a));
    }

    #[test]
    fn dvv_effective_folds_dot() {
        let clock = Dvv::new(Dot { replica: "a".into(), count: 3 }, vv(&[("a", 2), ("b", 1)]));
        assert_eq!(clock.effective(), vv(&[("a", 3), ("b", 1)]));
        assert_eq!(clock.max_count("a"), 3);
        assert_eq!(clock.max_count("b"), 1);
    }

    #[test]
    fn dvv_dominance() {
        let older = Dvv::new(Dot { replica: "a".into(), count: 1 }, vv(&[]));
        let newer = Dvv::new(Dot { replica: "a".into(), count: 2 }, vv(&[("a", 1)]));
        assert!(newer.dominates(&older));
        assert!(!older.descends(&newer));
    }
}
