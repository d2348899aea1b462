//! Duplicate suppression scoped to the open batch
//!
//! The filter only remembers keys of the batch currently being filled. When
//! that batch closes the filter is cleared, so a redelivery arriving after the
//! close is indistinguishable from a new message and is buffered again. That is
//! the accepted at-least-once trade-off; there is no cross-batch memory.

use crate::clock::Timestamp;
use std::collections::HashMap;

/// Bookkeeping for one key seen in the open batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupEntry {
    pub seen_count: u32,
    pub first_seen_at: Timestamp,
}

/// Result of checking a key against the open batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupCheck {
    /// First sighting; the key is now recorded with count 1.
    New,
    /// Already buffered in this batch. The caller acks the delivery without
    /// buffering its body again.
    Duplicate {
        seen_count: u32,
        first_seen_at: Timestamp,
    },
}

#[derive(Debug, Default)]
pub struct DedupFilter {
    seen: HashMap<String, DedupEntry>,
}

impl DedupFilter {
    pub fn new() -> Self {
        DedupFilter {
            seen: HashMap::new(),
        }
    }

    pub fn check(&mut self, key: &str, now: Timestamp) -> DedupCheck {
        if let Some(entry) = self.seen.get_mut(key) {
            entry.seen_count = entry.seen_count.saturating_add(1);
            return DedupCheck::Duplicate {
                seen_count: entry.seen_count,
                first_seen_at: entry.first_seen_at,
            };
        }

        self.seen.insert(
            key.to_string(),
            DedupEntry {
                seen_count: 1,
                first_seen_at: now,
            },
        );
        DedupCheck::New
    }

    /// Forget a key recorded by `check` whose message never made it into the batch.
    pub fn forget(&mut self, key: &str) {
        self.seen.remove(key);
    }

    pub fn entry(&self, key: &str) -> Option<&DedupEntry> {
        self.seen.get(key)
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_then_duplicate() {
        let mut filter = DedupFilter::new();
        assert_eq!(filter.check("a", Timestamp(10)), DedupCheck::New);
        assert_eq!(
            filter.check("a", Timestamp(20)),
            DedupCheck::Duplicate {
                seen_count: 2,
                first_seen_at: Timestamp(10)
            }
        );
        assert_eq!(
            filter.check("a", Timestamp(30)),
            DedupCheck::Duplicate {
                seen_count: 3,
                first_seen_at: Timestamp(10)
            }
        );
        assert_eq!(filter.check("b", Timestamp(30)), DedupCheck::New);
        assert_eq!(filter.len(), 2);
    }

    #[test]
    fn test_clear_forgets_window() {
        let mut filter = DedupFilter::new();
        filter.check("a", Timestamp(0));
        filter.clear();

        assert!(filter.is_empty());
        // Redelivery after the window closed is indistinguishable from new
        assert_eq!(filter.check("a", Timestamp(5)), DedupCheck::New);
        assert_eq!(filter.entry("a").map(|e| e.first_seen_at), Some(Timestamp(5)));
    }

    #[test]
    fn test_forget_single_key() {
        let mut filter = DedupFilter::new();
        filter.check("a", Timestamp(0));
        filter.check("b", Timestamp(0));
        filter.forget("a");

        assert!(filter.entry("a").is_none());
        assert_eq!(filter.check("a", Timestamp(1)), DedupCheck::New);
        assert!(matches!(filter.check("b", Timestamp(1)), DedupCheck::Duplicate { .. }));
    }
}
