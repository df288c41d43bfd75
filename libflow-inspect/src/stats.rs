use serde::Serialize;

/// Why a flow was evicted from the cache
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[repr(usize)]
pub enum PruneReason {
    Excess,
    Uni,
    Preemptive,
    Memcap,
    Ha,
    Stale,
    Idle,
    None,
}

pub const PRUNE_REASON_MAX: usize = 8;

impl PruneReason {
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            PruneReason::Excess => "excess",
            PruneReason::Uni => "uni",
            PruneReason::Preemptive => "preemptive",
            PruneReason::Memcap => "memcap",
            PruneReason::Ha => "ha_sync",
            PruneReason::Stale => "stale",
            PruneReason::Idle => "idle",
            PruneReason::None => "none",
        }
    }
}

/// Per-reason eviction counters
#[derive(Clone, Default, Debug, Serialize)]
pub struct PruneStats {
    counts: [u64; PRUNE_REASON_MAX],
}

impl PruneStats {
    pub fn update(&mut self, reason: PruneReason) {
        self.counts[reason.index()] += 1;
    }

    #[inline]
    pub fn get(&self, reason: PruneReason) -> u64 {
        self.counts[reason.index()]
    }

    /// Sum over all reasons
    pub fn get_total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn reset(&mut self) {
        self.counts = [0; PRUNE_REASON_MAX];
    }
}

/// Analyzer-level peg counts, one instance per packet thread
#[derive(Clone, Default, Debug, Serialize)]
pub struct AuxCounts {
    /// messages pulled from the capture driver
    pub total_from_daq: u64,
    /// raw bytes seen on packet messages
    pub rx_bytes: u64,
    /// messages disposed of by the skip count
    pub skipped: u64,
    /// receive timeouts handled as idle work
    pub idle: u64,
    /// blocked-session verdicts downgraded by tunnel bypass
    pub internal_blacklist: u64,
    /// whitelist verdicts downgraded by tunnel bypass
    pub internal_whitelist: u64,
    /// messages queued for retry delivery
    pub retries_queued: u64,
}

impl AuxCounts {
    /// (name, value) pairs for the stats reporter
    pub fn pegs(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("total_from_daq", self.total_from_daq),
            ("rx_bytes", self.rx_bytes),
            ("skipped", self.skipped),
            ("idle", self.idle),
            ("internal_blacklist", self.internal_blacklist),
            ("internal_whitelist", self.internal_whitelist),
            ("retries_queued", self.retries_queued),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_totals() {
        let mut stats = PruneStats::default();
        stats.update(PruneReason::Idle);
        stats.update(PruneReason::Idle);
        stats.update(PruneReason::Excess);
        assert_eq!(stats.get(PruneReason::Idle), 2);
        assert_eq!(stats.get(PruneReason::Excess), 1);
        assert_eq!(stats.get(PruneReason::Uni), 0);
        assert_eq!(stats.get_total(), 3);
        stats.reset();
        assert_eq!(stats.get_total(), 0);
    }
}
