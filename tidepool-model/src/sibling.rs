//! Sibling sets: concurrent values for a key with causal metadata.

use crate::clock::{Dot, Dvv, VersionVector};
use serde::{Deserialize, Serialize};

/// One version of a key's value. `value: None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sibling {
    pub clock: Dvv,
    pub value: Option<Vec<u8>>,
    /// Wall-clock millis at creation. Informational only; never consulted
    /// for ordering decisions.
    pub timestamp: u64,
}

impl Sibling {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// The set of causally concurrent versions currently stored for a key.
///
/// Joining two sets keeps exactly the siblings not dominated by any sibling
/// of the other set. The join is commutative, associative, and idempotent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiblingSet(Vec<Sibling>);

impl SiblingSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_siblings(mut siblings: Vec<Sibling>) -> Self {
        Self::canonicalize(&mut siblings);
        Self(siblings)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn size(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sibling> {
        self.0.iter()
    }

    /// All live (non-tombstone) values.
    pub fn live_values(&self) -> Vec<&[u8]> {
        self.0
            .iter()
            .filter_map(|s| s.value.as_deref())
            .collect()
    }

    /// True when every sibling is a tombstone (the key is deleted).
    pub fn is_tombstone_set(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|s| s.is_tombstone())
    }

    /// Union minus causally dominated siblings.
    pub fn join(&self, other: &SiblingSet) -> SiblingSet {
        let mut all: Vec<Sibling> = self.0.iter().chain(other.0.iter()).cloned().collect();
        Self::canonicalize(&mut all);

        let clocks: Vec<VersionVector> = all.iter().map(|s| s.clock.effective()).collect();
        let survivors = all
            .into_iter()
            .enumerate()
            .filter(|(i, _)| {
                !clocks
                    .iter()
                    .enumerate()
                    .any(|(j, other_clock)| j != *i && other_clock.dominates(&clocks[*i]))
            })
            .map(|(_, s)| s)
            .collect();

        SiblingSet(survivors)
    }

    /// Drop siblings the writer had already observed: anything whose clock
    /// is covered by `context`.
    pub fn discard(&mut self, context: &VersionVector) {
        self.0.retain(|s| !context.descends(&s.clock.effective()));
    }

    /// Create the minimum new sibling dominating `context`: the next event
    /// for `replica` given everything this set and the context have seen.
    pub fn event(&self, context: VersionVector, replica: &str, value: Option<Vec<u8>>) -> Sibling {
        let mut count = context.get(replica);
        for sibling in &self.0 {
            let seen = sibling.clock.max_count(replica);
            if seen > count {
                count = seen;
            }
        }

        Sibling {
            clock: Dvv::new(
                Dot { replica: replica.to_string(), count: count + 1 },
                context,
            ),
            value,
            timestamp: crate::ids::now_millis(),
        }
    }

    /// Stable content hash of the canonical encoding, XOR-combinable at the
    /// Merkle layer. Timestamps are excluded so replicas agree on hashes.
    pub fn hash(&self, key: &[u8]) -> u128 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(key);
        for sibling in &self.0 {
            let clock = serde_json::to_vec(&sibling.clock).unwrap_or_default();
            hasher.update(&(clock.len() as u32).to_be_bytes());
            hasher.update(&clock);
            match &sibling.value {
                Some(v) => {
                    hasher.update(&[1]);
                    hasher.update(&(v.len() as u32).to_be_bytes());
                    hasher.update(v);
                }
                None => {
                    hasher.update(&[0]);
                }
            }
        }
        let digest = hasher.finalize();
        u128::from_be_bytes(digest.as_bytes()[..16].try_into().unwrap_or([0u8; 16]))
    }

    /// Sort by clock encoding and drop duplicate events, keeping the first.
    /// Two siblings with the same dot are the same event.
    fn canonicalize(siblings: &mut Vec<Sibling>) {
        siblings.sort_by(|a, b| {
            let ka = serde_json::to_vec(&a.clock).unwrap_or_default();
            let kb = serde_json::to_vec(&b.clock).unwrap_or_default();
            ka.cmp(&kb)
        });
        siblings.dedup_by(|a, b| a.clock == b.clock);
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

    fn sibling(replica: &str, count: u64, context: &[(&str, u64)], value: &[u8]) -> Sibling {
        Sibling {
            clock: Dvv::new(Dot { replica: replica.into(), count }, vv(context)),
            value: Some(value.to_vec()),
            timestamp: 0,
        }
    }

    #[test]
    fn join_discards_dominated() {
        let old = SiblingSet::from_siblings(vec![sibling("a", 1, &[], b"v1")]);
        let new = SiblingSet::from_siblings(vec![sibling("a", 2, &[("a", 1)], b"v2")]);

        let joined = old.join(&new);
        assert_eq!(joined.size(), 1);
        assert_eq!(joined.live_values(), vec![b"v2".as_slice()]);
    }

    #[test]
    fn join_keeps_concurrent_siblings() {
        let a = SiblingSet::from_siblings(vec![sibling("a", 1, &[], b"from-a")]);
        let b = SiblingSet::from_siblings(vec![sibling("b", 1, &[], b"from-b")]);

        let joined = a.join(&b);
        assert_eq!(joined.size(), 2);
    }

    #[test]
    fn join_is_commutative_associative_idempotent() {
        let a = SiblingSet::from_siblings(vec![sibling("a", 1, &[], b"1")]);
        let b = SiblingSet::from_siblings(vec![sibling("b", 1, &[], b"2")]);
        let c = SiblingSet::from_siblings(vec![sibling("c", 1, &[], b"3")]);

        assert_eq!(a.join(&b), b.join(&a));
        assert_eq!(a.join(&a), a);
        assert_eq!(a.join(&b).join(&c), a.join(&b.join(&c)));
    }

    #[test]
    fn event_dominates_context_and_set() {
        let set = SiblingSet::from_siblings(vec![
            sibling("a", 2, &[], b"x"),
            sibling("b", 1, &[], b"y"),
        ]);
        let context = vv(&[("a", 2), ("b", 1)]);

        let next = set.event(context.clone(), "a", Some(b"merged".to_vec()));
        assert_eq!(next.clock.dot.as_ref().unwrap().count, 3);

        // Joining the new sibling in replaces everything it observed
        let merged = set.join(&SiblingSet::from_siblings(vec![next]));
        assert_eq!(merged.size(), 1);
        assert_eq!(merged.live_values(), vec![b"merged".as_slice()]);
    }

    #[test]
    fn event_with_empty_context_is_concurrent() {
        let set = SiblingSet::from_siblings(vec![sibling("a", 1, &[], b"x")]);
        let next = set.event(VersionVector::new(), "b", Some(b"blind".to_vec()));

        let merged = set.join(&SiblingSet::from_siblings(vec![next]));
        assert_eq!(merged.size(), 2, "blind write must not clobber concurrent sibling");
    }

    #[test]
    fn discard_drops_observed_siblings() {
        let mut set = SiblingSet::from_siblings(vec![
            sibling("a", 1, &[], b"seen"),
            sibling("b", 5, &[], b"unseen"),
        ]);
        set.discard(&vv(&[("a", 1)]));
        assert_eq!(set.size(), 1);
        assert_eq!(set.live_values(), vec![b"unseen".as_slice()]);
    }

    #[test]
    fn tombstone_set_detection() {
        let mut dead = sibling("a", 2, &[("a", 1)], b"");
        dead.value = None;
        let set = SiblingSet::from_siblings(vec![dead]);
        assert!(set.is_tombstone_set());
        assert!(set.live_values().is_empty());
    }

    #[test]
    fn hash_ignores_timestamps() {
        let mut s1 = sibling("a", 1, &[], b"v");
        let mut s2 = sibling("a", 1, &[], b"v");
        s1.timestamp = 100;
        s2.timestamp = 200;
        let h1 = SiblingSet::from_siblings(vec![s1]).hash(b"k");
        let h2 = SiblingSet::from_siblings(vec![s2]).hash(b"k");
        assert_eq!(h1, h2);
    }
}
