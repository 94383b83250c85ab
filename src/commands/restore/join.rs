use std::collections::{BTreeMap, btree_map::Entry};

/// One half of a pair.
#[derive(Debug)]
pub enum Side<L, R> {
    Left(L),
    Right(R),
}

#[derive(Debug)]
pub enum Offer<L, R> {
    /// Held until the other half shows up.
    Waiting,
    Complete(L, R),
    /// The same half was already waiting under this key; the offered value
    /// is handed back.
    Duplicate(Side<L, R>),
}

/// Rendezvous of two unordered sequences correlated by key. At most one
/// half is held per key; the second half completes and removes the entry.
#[derive(Debug)]
pub struct PairJoin<K, L, R> {
    pending: BTreeMap<K, Side<L, R>>,
}

impl<K, L, R> Default for PairJoin<K, L, R> {
    fn default() -> Self {
        Self {
            pending: BTreeMap::new(),
        }
    }
}

impl<K: Ord, L, R> PairJoin<K, L, R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer_left(&mut self, key: K, left: L) -> Offer<L, R> {
        self.offer(key, Side::Left(left))
    }

    pub fn offer_right(&mut self, key: K, right: R) -> Offer<L, R> {
        self.offer(key, Side::Right(right))
    }

    fn offer(&mut self, key: K, half: Side<L, R>) -> Offer<L, R> {
        let held = match self.pending.entry(key) {
            Entry::Vacant(v) => {
                v.insert(half);
                return Offer::Waiting;
            }
            Entry::Occupied(o) => o.remove_entry(),
        };
        match (held, half) {
            ((_, Side::Left(l)), Side::Right(r)) | ((_, Side::Right(r)), Side::Left(l)) => {
                Offer::Complete(l, r)
            }
            ((key, held), half) => {
                self.pending.insert(key, held);
                Offer::Duplicate(half)
            }
        }
    }

    /// Removes and returns whatever waits under `key`.
    pub fn take(&mut self, key: &K) -> Option<Side<L, R>> {
        self.pending.remove(key)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Unmatched halves in key order.
    pub fn into_orphans(self) -> impl Iterator<Item = (K, Side<L, R>)> {
        self.pending.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn left_then_right_completes() {
        let mut j: PairJoin<&str, u32, char> = PairJoin::new();
        assert!(matches!(j.offer_left("a", 1), Offer::Waiting));
        assert_eq!(j.len(), 1);
        assert!(matches!(j.offer_right("a", 'x'), Offer::Complete(1, 'x')));
        assert_eq!(j.len(), 0);
    }

    #[test]
    fn right_then_left_completes() {
        let mut j: PairJoin<&str, u32, char> = PairJoin::new();
        assert!(matches!(j.offer_right("a", 'x'), Offer::Waiting));
        assert!(matches!(j.offer_left("a", 1), Offer::Complete(1, 'x')));
        assert_eq!(j.len(), 0);
    }

    #[test]
    fn duplicate_half_is_handed_back() {
        let mut j: PairJoin<&str, u32, char> = PairJoin::new();
        j.offer_left("a", 1);
        assert!(matches!(j.offer_left("a", 2), Offer::Duplicate(Side::Left(2))));
        // The first one still waits.
        assert!(matches!(j.offer_right("a", 'x'), Offer::Complete(1, 'x')));
    }

    #[test]
    fn orphans_in_key_order() {
        let mut j: PairJoin<&str, u32, char> = PairJoin::new();
        j.offer_right("b", 'y');
        j.offer_left("a", 1);
        j.offer_left("c", 3);
        j.offer_right("c", 'z');
        assert!(j.take(&"zz").is_none());
        let keys: Vec<&str> = j.into_orphans().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
