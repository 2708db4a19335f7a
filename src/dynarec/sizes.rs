//! Live block size histogram
//!
//! Keeps a count per guest block size so the largest live size is known
//! without walking every block. Range cleaning uses that maximum as the
//! distance to look back from a written address.

use std::collections::BTreeMap;

#[derive(Debug, Default, Clone)]
pub struct SizeHistogram {
    counts: BTreeMap<u64, u32>,
    total: usize,
}

impl SizeHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, size: u64) {
        *self.counts.entry(size).or_insert(0) += 1;
        self.total += 1;
    }

    /// Drop one block of `size`. Returns false if no such size was recorded.
    pub fn remove(&mut self, size: u64) -> bool {
        match self.counts.get_mut(&size) {
            Some(n) if *n > 1 => *n -= 1,
            Some(_) => {
                self.counts.remove(&size);
            }
            None => return false,
        }
        self.total -= 1;
        true
    }

    /// Largest live size, 0 when empty
    pub fn max(&self) -> u64 {
        self.counts.keys().next_back().copied().unwrap_or(0)
    }

    pub fn count(&self, size: u64) -> u32 {
        self.counts.get(&size).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_max_follows_removals() {
        let mut h = SizeHistogram::new();
        assert_eq!(h.max(), 0);
        h.add(16);
        h.add(64);
        h.add(64);
        h.add(8);
        assert_eq!(h.max(), 64);
        assert!(h.remove(64));
        assert_eq!(h.max(), 64);
        assert!(h.remove(64));
        assert_eq!(h.max(), 16);
        assert!(!h.remove(64));
        assert_eq!(h.count(8), 1);
        assert_eq!(h.len(), 2);
    }

    proptest! {
        #[test]
        fn prop_max_is_true_max(
            sizes in prop::collection::vec(1u64..512, 1..64),
            removals in prop::collection::vec(any::<prop::sample::Index>(), 0..64),
        ) {
            let mut h = SizeHistogram::new();
            let mut live = sizes.clone();
            for &s in &sizes {
                h.add(s);
            }
            for idx in removals {
                if live.is_empty() {
                    break;
                }
                let s = live.swap_remove(idx.index(live.len()));
                prop_assert!(h.remove(s));
            }
            prop_assert_eq!(h.max(), live.iter().copied().max().unwrap_or(0));
            prop_assert_eq!(h.len(), live.len());
        }
    }
}
