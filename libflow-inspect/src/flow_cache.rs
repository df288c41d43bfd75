use crate::config::FlowCacheConfig;
use crate::flow::{Flow, SessionFlags};
use crate::flow_key::FlowKey;
use crate::packet::PktType;
use crate::stats::{PruneReason, PruneStats};
use crate::uni_list::UniList;
use fnv::FnvHashMap;
use rand::prelude::*;
use rand_chacha::ChaChaRng;

/// Bounded LRU table of flow records.
///
/// All flow storage is allocated up front in an arena of `max_flows` slots;
/// the hash table maps keys to slot indices and a free list recycles slots.
/// Bound slots are threaded on an intrusive LRU list (head = least recently
/// touched) and, while half-open, on one of two uni lists.
pub struct FlowCache {
    config: FlowCacheConfig,
    arena: Vec<Flow>,
    free: Vec<usize>,
    hash: FnvHashMap<FlowKey, usize>,
    lru_head: Option<usize>,
    lru_tail: Option<usize>,
    /// saved LRU position for incremental timeout scans
    timeout_cursor: Option<usize>,
    uni_flows: UniList,
    uni_ip_flows: UniList,
    purging: bool,
    prune_stats: PruneStats,
    mem_allocated: u64,
    trng: ChaChaRng,
}

impl FlowCache {
    pub fn new(config: FlowCacheConfig) -> Self {
        let max = config.max_flows;
        let mut arena = Vec::with_capacity(max);
        arena.resize_with(max, Flow::default);
        // LIFO free list; pop order is highest index first
        let free: Vec<usize> = (0..max).collect();
        FlowCache {
            config,
            arena,
            free,
            hash: FnvHashMap::with_capacity_and_hasher(max, Default::default()),
            lru_head: None,
            lru_tail: None,
            timeout_cursor: None,
            uni_flows: UniList::default(),
            uni_ip_flows: UniList::default(),
            purging: false,
            prune_stats: PruneStats::default(),
            mem_allocated: 0,
            trng: ChaChaRng::from_rng(rand::thread_rng()).expect("seed rng"),
        }
    }

    /// Use the provided seed for flow id generation.
    ///
    /// This option is intended for use in testing.
    pub fn with_rng_seed(self, seed: u64) -> Self {
        let trng = <ChaChaRng as SeedableRng>::seed_from_u64(seed);
        FlowCache { trng, ..self }
    }

    #[inline]
    pub fn get_count(&self) -> usize {
        self.hash.len()
    }

    #[inline]
    pub fn flow(&self, idx: usize) -> &Flow {
        &self.arena[idx]
    }

    #[inline]
    pub fn flow_mut(&mut self, idx: usize) -> &mut Flow {
        &mut self.arena[idx]
    }

    #[inline]
    pub fn config(&self) -> &FlowCacheConfig {
        &self.config
    }

    pub fn get_prunes(&self, reason: PruneReason) -> u64 {
        self.prune_stats.get(reason)
    }

    pub fn get_total_prunes(&self) -> u64 {
        self.prune_stats.get_total()
    }

    pub fn reset_stats(&mut self) {
        self.prune_stats.reset();
    }

    pub fn get_uni_count(&self, pkt_type: PktType) -> usize {
        if pkt_type == PktType::Ip {
            self.uni_ip_flows.get_count()
        } else {
            self.uni_flows.get_count()
        }
    }

    #[inline]
    pub fn is_uni_linked(&self, idx: usize) -> bool {
        self.arena[idx].uni_linked
    }

    #[inline]
    fn cap_weight(&self, pkt_type: PktType) -> u64 {
        u64::from(self.config.proto[pkt_type.index()].cap_weight)
    }

    /// True when the memory cap is armed and exceeded
    #[inline]
    pub fn memcap_over_threshold(&self) -> bool {
        self.config.memcap > 0 && self.mem_allocated > self.config.memcap
    }

    // ---- LRU list ----------------------------------------------------

    fn lru_unlink(&mut self, idx: usize) {
        let prev = self.arena[idx].lru_prev;
        let next = self.arena[idx].lru_next;
        match prev {
            Some(p) => self.arena[p].lru_next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(n) => self.arena[n].lru_prev = prev,
            None => self.lru_tail = prev,
        }
        self.arena[idx].lru_prev = None;
        self.arena[idx].lru_next = None;
    }

    fn lru_push_back(&mut self, idx: usize) {
        self.arena[idx].lru_next = None;
        self.arena[idx].lru_prev = self.lru_tail;
        if let Some(old) = self.lru_tail {
            self.arena[old].lru_next = Some(idx);
        }
        self.lru_tail = Some(idx);
        if self.lru_head.is_none() {
            self.lru_head = Some(idx);
        }
    }

    fn lru_touch(&mut self, idx: usize) {
        if self.lru_tail == Some(idx) {
            return;
        }
        self.lru_unlink(idx);
        self.lru_push_back(idx);
    }

    /// Rotate the LRU front to the back; false when rotation is impossible
    fn touch_front(&mut self) -> bool {
        match self.lru_head {
            Some(front) if self.lru_head != self.lru_tail => {
                self.lru_touch(front);
                true
            }
            _ => false,
        }
    }

    /// LRU-ordered slot walk, oldest first (testing and reporters)
    pub fn lru_iter(&self) -> LruIter {
        LruIter {
            cache: self,
            cur: self.lru_head,
        }
    }

    // ---- uni lists ---------------------------------------------------

    fn link_uni(&mut self, idx: usize) {
        if self.arena[idx].key.pkt_type == PktType::Ip {
            self.uni_ip_flows.link_uni(&mut self.arena, idx);
        } else {
            self.uni_flows.link_uni(&mut self.arena, idx);
        }
    }

    pub fn unlink_uni(&mut self, idx: usize) {
        if self.arena[idx].key.pkt_type == PktType::Ip {
            self.uni_ip_flows.unlink_uni(&mut self.arena, idx);
        } else {
            self.uni_flows.unlink_uni(&mut self.arena, idx);
        }
    }

    // ---- lookup / allocation -----------------------------------------

    /// Lookup without allocation. A hit refreshes `last_data_seen` and makes
    /// the flow most recently used.
    pub fn find(&mut self, key: &FlowKey, now_secs: u32) -> Option<usize> {
        let idx = *self.hash.get(key)?;
        if self.arena[idx].last_data_seen < now_secs {
            self.arena[idx].last_data_seen = now_secs;
        }
        self.lru_touch(idx);
        Some(idx)
    }

    /// Lookup-or-allocate. On a miss the eviction policies run in order
    /// (stale, uni overflow, excess) until a slot is available; binding never
    /// fails while `max_flows >= 1`.
    pub fn get(&mut self, key: &FlowKey, now_secs: u32) -> usize {
        if let Some(&idx) = self.hash.get(key) {
            self.lru_touch(idx);
            if self.arena[idx].session.is_some() && self.arena[idx].pkt_type != key.pkt_type {
                self.arena[idx].term();
            }
            self.arena[idx].last_data_seen = now_secs;
            return idx;
        }

        if self.free.is_empty() {
            if self.prune_stale(now_secs, None) == 0 && self.prune_unis(key.pkt_type) == 0 {
                self.prune_excess(None);
            }
            if self.free.is_empty() {
                // single-flow cache: the resident flow must still turn over
                if let Some(front) = self.lru_head {
                    self.arena[front].ssn_state.session_flags |= SessionFlags::PRUNED;
                    self.release_idx(front, PruneReason::Excess, true);
                }
            }
        }

        let idx = self.free.pop().expect("flow arena exhausted");
        if self.arena[idx].session.is_some() && self.arena[idx].pkt_type != key.pkt_type {
            self.arena[idx].term();
        } else {
            self.arena[idx].reset(true);
        }
        self.arena[idx].key = key.clone();
        self.arena[idx].id = self.trng.gen();
        self.arena[idx].last_data_seen = now_secs;
        self.hash.insert(key.clone(), idx);
        self.lru_push_back(idx);
        self.link_uni(idx);
        self.mem_allocated += self.cap_weight(key.pkt_type);
        trace!("new flow bound (id=0x{:x}) {}", self.arena[idx].id, key);
        idx
    }

    // ---- release / removal -------------------------------------------

    /// Reset a flow, account the prune reason, and detach it from the cache.
    /// Returns false if the slot was not bound (repeat release is a no-op);
    /// re-entrant deletions during a purge are no-ops too.
    pub fn release(&mut self, idx: usize, reason: PruneReason, do_cleanup: bool) -> bool {
        if self.purging {
            return false;
        }
        self.release_idx(idx, reason, do_cleanup)
    }

    fn release_idx(&mut self, idx: usize, reason: PruneReason, do_cleanup: bool) -> bool {
        self.arena[idx].reset(do_cleanup);
        self.prune_stats.update(reason);
        self.remove(idx)
    }

    /// Stronger release: also terminates the session. Accounted under the
    /// `None` reason; this is the purge path.
    pub fn retire(&mut self, idx: usize) -> bool {
        self.retire_idx(idx)
    }

    fn retire_idx(&mut self, idx: usize) -> bool {
        self.arena[idx].reset(true);
        self.arena[idx].term();
        self.prune_stats.update(PruneReason::None);
        self.remove(idx)
    }

    fn remove(&mut self, idx: usize) -> bool {
        // only the owning slot may detach the hash entry; a slot released
        // twice (or rebound under the same key) must not free the new owner
        if self.hash.get(&self.arena[idx].key) != Some(&idx) {
            return false;
        }
        if self.arena[idx].uni_linked {
            self.unlink_uni(idx);
        }
        if self.timeout_cursor == Some(idx) {
            self.timeout_cursor = self.arena[idx].lru_next;
        }
        let key = self.arena[idx].key.clone();
        self.hash.remove(&key);
        self.lru_unlink(idx);
        self.mem_allocated = self
            .mem_allocated
            .saturating_sub(self.cap_weight(key.pkt_type));
        self.free.push(idx);
        true
    }

    // ---- eviction policies -------------------------------------------

    /// Evict LRU-front flows idle longer than the pruning timeout, up to
    /// `cleanup_flows`. Stops at `save_me` (by contract the newest flow), a
    /// suspended flow, or the first flow that is not stale.
    pub fn prune_stale(&mut self, now_secs: u32, save_me: Option<usize>) -> usize {
        let mut pruned = 0;
        while pruned < self.config.cleanup_flows {
            let front = match self.lru_head {
                Some(i) => i,
                None => break,
            };
            if save_me == Some(front) {
                break;
            }
            let flow = &self.arena[front];
            if flow.is_suspended() {
                break;
            }
            if u64::from(flow.last_data_seen) + u64::from(self.config.pruning_timeout)
                >= u64::from(now_secs)
            {
                break;
            }
            self.arena[front].ssn_state.session_flags |= SessionFlags::TIMEDOUT;
            self.release_idx(front, PruneReason::Idle, true);
            pruned += 1;
        }
        pruned
    }

    /// Trim the uni list matching `pkt_type` while it exceeds its share of
    /// the cache, oldest first, skipping blocked flows.
    pub fn prune_unis(&mut self, pkt_type: PktType) -> usize {
        let max_uni = (self.config.max_flows >> 2) + 1;
        let is_ip = pkt_type == PktType::Ip;
        let mut cur = if is_ip {
            self.uni_ip_flows.get_oldest_uni()
        } else {
            self.uni_flows.get_oldest_uni()
        };
        let mut pruned = 0;
        while pruned < self.config.cleanup_flows {
            let count = if is_ip {
                self.uni_ip_flows.get_count()
            } else {
                self.uni_flows.get_count()
            };
            if count <= max_uni {
                break;
            }
            let idx = match cur {
                Some(i) => i,
                None => break,
            };
            cur = self.arena[idx].uni_prev;
            if self.arena[idx].was_blocked() {
                continue;
            }
            self.release_idx(idx, PruneReason::Uni, true);
            pruned += 1;
        }
        pruned
    }

    /// Evict LRU flows until the cache is at its watermark. Blocked flows
    /// and `save_me` are rotated past; suspended flows are exempt on the
    /// first pass over the table only. Falls back to a forced single
    /// eviction if a full cycle freed nothing.
    pub fn prune_excess(&mut self, save_me: Option<usize>) -> usize {
        let max_cap = self.config.excess_watermark();
        let mut pruned = 0;
        let mut blocks = 0;
        let mut ignore_offloads = self.get_count();

        while self.get_count() > max_cap && self.get_count() > blocks {
            let front = match self.lru_head {
                Some(i) => i,
                None => break,
            };
            let flow = &self.arena[front];
            if save_me == Some(front)
                || flow.was_blocked()
                || (flow.is_suspended() && ignore_offloads > 0)
            {
                if flow.was_blocked() {
                    blocks += 1;
                }
                if !self.touch_front() {
                    break;
                }
            } else {
                self.arena[front].ssn_state.session_flags |= SessionFlags::PRUNED;
                self.release_idx(front, PruneReason::Excess, true);
                pruned += 1;
            }
            if ignore_offloads > 0 {
                ignore_offloads -= 1;
            }
        }

        if pruned == 0 && self.get_count() > max_cap && self.prune_one(PruneReason::Excess, true) {
            pruned += 1;
        }
        pruned
    }

    /// Force-evict the single LRU flow. Never evicts the last flow in the
    /// cache (assumed to be the one currently being processed).
    pub fn prune_one(&mut self, reason: PruneReason, do_cleanup: bool) -> bool {
        if self.get_count() <= 1 {
            return false;
        }
        let front = match self.lru_head {
            Some(i) => i,
            None => return false,
        };
        self.arena[front].ssn_state.session_flags |= SessionFlags::PRUNED;
        self.release_idx(front, reason, do_cleanup);
        true
    }

    /// Walk the LRU from the saved cursor, evicting up to `num_flows` whose
    /// hard expiration or idle timeout has elapsed. Suspended and HA-standby
    /// flows are skipped; the scan stops at the first flow not yet due.
    pub fn timeout(&mut self, num_flows: usize, now_secs: u32) -> usize {
        let mut retired = 0;
        let mut cur = self.timeout_cursor.or(self.lru_head);

        while retired < num_flows {
            let idx = match cur {
                Some(i) => i,
                None => break,
            };
            let flow = &self.arena[idx];
            if flow.is_hard_expiration() {
                if flow.expire_time > u64::from(now_secs) {
                    break;
                }
            } else {
                let timeout = self.config.proto[flow.key.pkt_type.index()].nominal_timeout;
                if u64::from(flow.last_data_seen) + u64::from(timeout) > u64::from(now_secs) {
                    break;
                }
            }
            if flow.ha_standby || flow.is_suspended() {
                cur = self.arena[idx].lru_next;
                continue;
            }
            self.arena[idx].ssn_state.session_flags |= SessionFlags::TIMEDOUT;
            // remove() advances the cursor past idx
            self.timeout_cursor = Some(idx);
            self.release_idx(idx, PruneReason::Idle, true);
            cur = self.timeout_cursor;
            retired += 1;
        }

        self.timeout_cursor = cur;
        retired
    }

    /// Retire every flow. Re-entrant releases (from session teardown) become
    /// no-ops for the duration.
    pub fn purge(&mut self) -> usize {
        self.purging = true;
        let mut retired = 0;
        while let Some(front) = self.lru_head {
            self.retire_idx(front);
            retired += 1;
        }
        // sessions parked on free slots die with the cache
        for flow in self.arena.iter_mut() {
            flow.term();
        }
        self.purging = false;
        retired
    }
}

/// Iterator over bound slots in LRU order (oldest first)
pub struct LruIter<'a> {
    cache: &'a FlowCache,
    cur: Option<usize>,
}

impl<'a> Iterator for LruIter<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let idx = self.cur?;
        self.cur = self.cache.arena[idx].lru_next;
        Some(idx)
    }
}
