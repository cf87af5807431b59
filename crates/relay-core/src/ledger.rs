//! Pending request ledger: correlation ids still awaiting an external reply.

use std::time::{Duration, Instant};

/// Default age after which an unanswered request is forgotten.
pub const DEFAULT_LEDGER_TTL: Duration = Duration::from_secs(30);

/// Outstanding resids in send order, each with the instant it was recorded.
#[derive(Debug, Clone)]
pub struct PendingLedger {
    entries: Vec<(u64, Instant)>,
    ttl: Duration,
}

impl Default for PendingLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_TTL)
    }
}

impl PendingLedger {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Vec::new(),
            ttl,
        }
    }

    /// Record a resid. Recording one that is already pending refreshes nothing.
    pub fn record(&mut self, resid: u64, now: Instant) {
        if !self.contains(resid) {
            self.entries.push((resid, now));
        }
    }

    /// Remove exactly this resid. Returns whether it was pending.
    pub fn resolve(&mut self, resid: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(id, _)| *id != resid);
        self.entries.len() != before
    }

    pub fn contains(&self, resid: u64) -> bool {
        self.entries.iter().any(|(id, _)| *id == resid)
    }

    /// Drop entries older than the TTL. Returns how many were evicted.
    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries
            .retain(|(_, at)| now.saturating_duration_since(*at) < ttl);
        before - self.entries.len()
    }

    /// Pending resids in send order.
    pub fn resids(&self) -> Vec<u64> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_removes_only_the_match() {
        let now = Instant::now();
        let mut ledger = PendingLedger::default();
        ledger.record(111_111_111, now);
        ledger.record(222_222_222, now);

        assert!(ledger.resolve(111_111_111));
        assert_eq!(ledger.resids(), vec![222_222_222]);
        assert!(!ledger.resolve(111_111_111));
    }

    #[test]
    fn test_record_is_idempotent() {
        let now = Instant::now();
        let mut ledger = PendingLedger::default();
        ledger.record(5, now);
        ledger.record(5, now + Duration::from_secs(10));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_evict_stale_respects_ttl() {
        let start = Instant::now();
        let mut ledger = PendingLedger::new(Duration::from_secs(30));
        ledger.record(1, start);
        ledger.record(2, start + Duration::from_secs(20));

        assert_eq!(ledger.evict_stale(start + Duration::from_secs(29)), 0);
        assert_eq!(ledger.evict_stale(start + Duration::from_secs(30)), 1);
        assert_eq!(ledger.resids(), vec![2]);
        assert_eq!(ledger.evict_stale(start + Duration::from_secs(60)), 1);
        assert!(ledger.is_empty());
    }
}
