//! Sparse value ↔ slot mappings decoded from report descriptors.
//!
//! Descriptors declare usages, report IDs, and string indices either as
//! explicit values or as ranges that may span the entire 32-bit space.
//! [`Indexes`] stores whichever shape the descriptor used and answers
//! membership and slot queries in time proportional to the number of
//! declared ranges/slots, never the raw value span.

/// A sparse, ordered mapping between raw descriptor values and slots
/// `0..count()`.
///
/// Slot order mirrors declaration order in the descriptor and is
/// significant: `all_values()` yields values slot by slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Indexes {
    /// Shared "absent" sentinel, distinct in intent from a present-but-empty
    /// mapping. `count()` is 0 and every query misses.
    Unset,

    /// Inclusive value ranges in declaration order. Each raw value inside a
    /// range owns its own slot, so a range `(lo, hi)` contributes
    /// `hi - lo + 1` slots.
    Range { ranges: Vec<(u32, u32)> },

    /// Explicit slots, each owning one or more raw values.
    List { slots: Vec<Vec<u32>> },
}

impl Indexes {
    /// Builds a single-range mapping over `lo..=hi`.
    pub fn from_range(lo: u32, hi: u32) -> Indexes {
        Indexes::Range {
            ranges: vec![(lo.min(hi), lo.max(hi))],
        }
    }

    /// Builds a mapping from ranges in declaration order.
    pub fn from_ranges(ranges: Vec<(u32, u32)>) -> Indexes {
        Indexes::Range { ranges }
    }

    /// Builds an explicit list with one slot per value.
    pub fn from_values(values: &[u32]) -> Indexes {
        Indexes::List {
            slots: values.iter().map(|&v| vec![v]).collect(),
        }
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, Indexes::Unset)
    }

    /// Number of slots.
    pub fn count(&self) -> usize {
        match self {
            Indexes::Unset => 0,
            Indexes::Range { ranges } => {
                // A range may cover the full u32 span; accumulate wide.
                let total: u64 = ranges
                    .iter()
                    .map(|&(lo, hi)| u64::from(hi) - u64::from(lo) + 1)
                    .sum();
                usize::try_from(total).unwrap_or(usize::MAX)
            }
            Indexes::List { slots } => slots.len(),
        }
    }

    /// Raw values owned by `slot`, lazily and restartably. Empty when `slot`
    /// is out of `[0, count())`.
    pub fn values_of(&self, slot: usize) -> Box<dyn Iterator<Item = u32> + '_> {
        match self {
            Indexes::Unset => Box::new(std::iter::empty()),
            Indexes::Range { ranges } => {
                let mut remaining = slot as u64;
                for &(lo, hi) in ranges {
                    let len = u64::from(hi) - u64::from(lo) + 1;
                    if remaining < len {
                        let value = lo + remaining as u32;
                        return Box::new(std::iter::once(value));
                    }
                    remaining -= len;
                }
                Box::new(std::iter::empty())
            }
            Indexes::List { slots } => match slots.get(slot) {
                Some(values) => Box::new(values.iter().copied()),
                None => Box::new(std::iter::empty()),
            },
        }
    }

    /// The slot owning `value`, if any.
    pub fn slot_of(&self, value: u32) -> Option<usize> {
        match self {
            Indexes::Unset => None,
            Indexes::Range { ranges } => {
                let mut base = 0u64;
                for &(lo, hi) in ranges {
                    if value >= lo && value <= hi {
                        let slot = base + u64::from(value - lo);
                        return usize::try_from(slot).ok();
                    }
                    base += u64::from(hi) - u64::from(lo) + 1;
                }
                None
            }
            Indexes::List { slots } => slots.iter().position(|s| s.contains(&value)),
        }
    }

    pub fn contains_value(&self, value: u32) -> bool {
        self.slot_of(value).is_some()
    }

    /// All raw values in slot order.
    pub fn all_values(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.count()).flat_map(move |slot| self.values_of(slot))
    }
}

impl Default for Indexes {
    fn default() -> Self {
        Indexes::Unset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_is_empty() {
        let unset = Indexes::Unset;
        assert_eq!(unset.count(), 0);
        assert_eq!(unset.all_values().count(), 0);
        assert_eq!(unset.slot_of(0), None);
        assert!(!unset.contains_value(42));
        assert_eq!(unset.values_of(0).count(), 0);
    }

    #[test]
    fn range_round_trip() {
        let idx = Indexes::from_ranges(vec![(0x30, 0x33), (0x90, 0x91)]);
        assert_eq!(idx.count(), 6);
        for v in [0x30, 0x31, 0x32, 0x33, 0x90, 0x91] {
            let slot = idx.slot_of(v).expect("value should be present");
            assert!(idx.values_of(slot).any(|x| x == v));
            assert!(idx.contains_value(v));
        }
        assert!(!idx.contains_value(0x34));
        assert!(!idx.contains_value(0x8F));
    }

    #[test]
    fn range_slot_order_matches_declaration_order() {
        let idx = Indexes::from_ranges(vec![(5, 6), (1, 2)]);
        let values: Vec<u32> = idx.all_values().collect();
        assert_eq!(values, vec![5, 6, 1, 2]);
        assert_eq!(idx.slot_of(5), Some(0));
        assert_eq!(idx.slot_of(2), Some(3));
    }

    #[test]
    fn range_spanning_high_u32_values() {
        let idx = Indexes::from_range(0xFFFF_0000, 0xFFFF_FFFF);
        assert_eq!(idx.count(), 0x1_0000);
        assert_eq!(idx.slot_of(0xFFFF_0000), Some(0));
        assert_eq!(idx.slot_of(0xFFFF_FFFF), Some(0xFFFF));
        assert!(!idx.contains_value(0xFFFE_FFFF));
        assert_eq!(idx.values_of(1).next(), Some(0xFFFF_0001));
    }

    #[test]
    fn list_slots_own_multiple_values() {
        let idx = Indexes::List {
            slots: vec![vec![1, 2], vec![7]],
        };
        assert_eq!(idx.count(), 2);
        assert_eq!(idx.slot_of(2), Some(0));
        assert_eq!(idx.slot_of(7), Some(1));
        assert_eq!(idx.values_of(0).collect::<Vec<_>>(), vec![1, 2]);
        let all: Vec<u32> = idx.all_values().collect();
        assert_eq!(all, vec![1, 2, 7]);
    }

    #[test]
    fn from_values_preserves_order() {
        let idx = Indexes::from_values(&[9, 3, 3]);
        assert_eq!(idx.count(), 3);
        // First match wins for duplicated values.
        assert_eq!(idx.slot_of(3), Some(1));
        assert_eq!(idx.all_values().collect::<Vec<_>>(), vec![9, 3, 3]);
    }

    #[test]
    fn out_of_range_slot_is_empty() {
        let idx = Indexes::from_range(1, 3);
        assert_eq!(idx.values_of(3).count(), 0);
        assert_eq!(idx.values_of(usize::MAX).count(), 0);
    }
}
