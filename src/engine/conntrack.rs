//! Approximate per-host flow membership
//!
//! A fixed-capacity open-addressed table of 5-tuple hashes, stamped with
//! the tick window they were last seen in. A packet counts as a new flow
//! iff its tuple was not already seen in the current window; at most one
//! flow increment per tuple per window.
//!
//! Membership is approximate by design: when the probe neighbourhood is
//! full, the stalest slot is evicted.

const PROBE_LIMIT: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    key: u64,
    window: u32,
}

/// Bounded conntrack sketch
#[derive(Debug)]
pub struct FlowSketch {
    slots: Box<[Slot]>,
    mask: usize,
}

impl FlowSketch {
    /// Capacity is rounded up to a power of two, minimum 16 slots
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(16).next_power_of_two();
        Self {
            slots: vec![Slot::default(); capacity].into_boxed_slice(),
            mask: capacity - 1,
        }
    }

    /// Record one observation of `key` in `window`. Returns `true` when the
    /// tuple was not yet seen this window, i.e. the flow counter should be
    /// incremented.
    pub fn observe(&mut self, key: u64, window: u32) -> bool {
        // Zero marks an empty slot; remap the (unlikely) zero hash
        let key = if key == 0 { 1 } else { key };

        let start = key as usize & self.mask;
        let mut stalest: usize = start;
        let mut stalest_window = u32::MAX;

        for i in 0..PROBE_LIMIT {
            let idx = (start + i) & self.mask;
            let slot = self.slots[idx];

            if slot.key == key {
                if slot.window == window {
                    return false;
                }
                self.slots[idx].window = window;
                return true;
            }

            if slot.key == 0 {
                // Empty slot: the tuple is definitely absent
                self.slots[idx] = Slot { key, window };
                return true;
            }

            if slot.window < stalest_window {
                stalest_window = slot.window;
                stalest = idx;
            }
        }

        // Neighbourhood full: evict the stalest entry
        self.slots[stalest] = Slot { key, window };
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_tuple_counts_once_per_window() {
        let mut sketch = FlowSketch::with_capacity(64);

        assert!(sketch.observe(42, 1));
        assert!(!sketch.observe(42, 1));
        assert!(!sketch.observe(42, 1));

        // Next window counts again
        assert!(sketch.observe(42, 2));
        assert!(!sketch.observe(42, 2));
    }

    #[test]
    fn test_distinct_tuples_all_count() {
        let mut sketch = FlowSketch::with_capacity(256);
        let mut new_flows = 0;
        for key in 1..=100u64 {
            if sketch.observe(key * 0x9E37_79B9_7F4A_7C15, 1) {
                new_flows += 1;
            }
        }
        assert_eq!(new_flows, 100);
    }

    #[test]
    fn test_zero_key_remapped() {
        let mut sketch = FlowSketch::with_capacity(16);
        assert!(sketch.observe(0, 1));
        assert!(!sketch.observe(0, 1));
    }

    #[test]
    fn test_eviction_keeps_counting() {
        // Capacity far below tuple count: membership degrades but the
        // sketch keeps answering without growing.
        let mut sketch = FlowSketch::with_capacity(16);
        for key in 1..=10_000u64 {
            sketch.observe(key, 1);
        }
        // A fresh key in a fresh window still registers
        assert!(sketch.observe(999_999, 2));
    }
}
