use crate::flow::Flow;
use crate::packet::{Packet, PktType, SsnDir};
use crate::session::FlowData;
use fnv::FnvHashMap;
use std::collections::VecDeque;
use std::net::IpAddr;

/// How long a reservation waits for its data connection, seconds
const EXPECT_TTL_SECS: u32 = 300;
/// Reservations queued behind one endpoint pair
const MAX_LIST: usize = 5;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ExpectKey {
    src: IpAddr,
    sp: u16,
    dst: IpAddr,
    dp: u16,
}

struct ExpectNode {
    expires: u32,
    pkt_type: PktType,
    ip_proto: u8,
    /// direction(s) exempt from inspection once the flow appears
    direction: SsnDir,
    protocol_id: Option<u16>,
    flow_data: Vec<Box<dyn FlowData>>,
}

/// Counters for the reservation table
#[derive(Clone, Copy, Debug, Default)]
pub struct ExpectStats {
    pub expected: u64,
    pub realized: u64,
    pub overflows: u64,
    pub prunes: u64,
}

/// Short-lived reservations for control-channel-announced child flows.
///
/// A control protocol inspector announces "expect a data connection from
/// A:p to B:q"; when a packet matching the reservation arrives, the reserved
/// flow data moves onto the new flow and the reservation is consumed.
/// A zero source port is a wildcard.
pub struct ExpectCache {
    max: usize,
    table: FnvHashMap<ExpectKey, VecDeque<ExpectNode>>,
    /// insertion order, for overflow eviction
    order: VecDeque<ExpectKey>,
    count: usize,
    pub stats: ExpectStats,
}

impl ExpectCache {
    pub fn new(max: usize) -> Self {
        ExpectCache {
            max: max.max(2),
            table: FnvHashMap::default(),
            order: VecDeque::new(),
            count: 0,
            stats: ExpectStats::default(),
        }
    }

    /// Install a reservation announced by `ctrl_pkt`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_flow(
        &mut self,
        ctrl_pkt: &Packet,
        pkt_type: PktType,
        ip_proto: u8,
        src: IpAddr,
        sp: u16,
        dst: IpAddr,
        dp: u16,
        direction: SsnDir,
        protocol_id: Option<u16>,
        flow_data: Vec<Box<dyn FlowData>>,
    ) -> bool {
        while self.count >= self.max {
            if !self.prune_oldest() {
                self.stats.overflows += 1;
                return false;
            }
            self.stats.overflows += 1;
        }
        let key = ExpectKey { src, sp, dst, dp };
        let list = self.table.entry(key.clone()).or_insert_with(VecDeque::new);
        if list.len() >= MAX_LIST {
            self.stats.overflows += 1;
            return false;
        }
        list.push_back(ExpectNode {
            expires: ctrl_pkt.ts.secs().wrapping_add(EXPECT_TTL_SECS),
            pkt_type,
            ip_proto,
            direction,
            protocol_id,
            flow_data,
        });
        self.order.push_back(key);
        self.count += 1;
        self.stats.expected += 1;
        trace!("expected flow installed {}:{} -> {}:{}", src, sp, dst, dp);
        true
    }

    fn prune_oldest(&mut self) -> bool {
        while let Some(key) = self.order.pop_front() {
            let emptied = match self.table.get_mut(&key) {
                Some(list) => {
                    list.pop_front();
                    self.count -= 1;
                    self.stats.prunes += 1;
                    list.is_empty()
                }
                None => continue,
            };
            if emptied {
                self.table.remove(&key);
            }
            return true;
        }
        false
    }

    fn candidate_keys(p: &Packet) -> [ExpectKey; 4] {
        [
            // as announced
            ExpectKey { src: p.src, sp: p.sp, dst: p.dst, dp: p.dp },
            // wildcard source port
            ExpectKey { src: p.src, sp: 0, dst: p.dst, dp: p.dp },
            // data connection opened from the announced destination
            ExpectKey { src: p.dst, sp: p.dp, dst: p.src, dp: p.sp },
            ExpectKey { src: p.dst, sp: 0, dst: p.src, dp: p.sp },
        ]
    }

    fn lookup(&self, p: &Packet) -> Option<ExpectKey> {
        for key in Self::candidate_keys(p).iter() {
            if let Some(list) = self.table.get(key) {
                if list
                    .iter()
                    .any(|n| n.pkt_type == p.pkt_type && n.ip_proto == p.ip_proto)
                {
                    return Some(key.clone());
                }
            }
        }
        None
    }

    /// Membership test without consumption
    pub fn is_expected(&self, p: &Packet) -> bool {
        match self.lookup(p) {
            Some(key) => self
                .table
                .get(&key)
                .map(|list| list.iter().any(|n| n.expires >= p.ts.secs()))
                .unwrap_or(false),
            None => false,
        }
    }

    /// If `p` matches a reservation, move the reserved state onto `flow` and
    /// consume the reservation. Returns true when the new flow should be
    /// exempted from inspection.
    pub fn check(&mut self, p: &mut Packet, flow: &mut Flow) -> bool {
        let key = match self.lookup(p) {
            Some(k) => k,
            None => return false,
        };
        let node = {
            let list = match self.table.get_mut(&key) {
                Some(l) => l,
                None => return false,
            };
            let pos = match list
                .iter()
                .position(|n| n.pkt_type == p.pkt_type && n.ip_proto == p.ip_proto)
            {
                Some(i) => i,
                None => return false,
            };
            let node = list.remove(pos).expect("position in list");
            if list.is_empty() {
                self.table.remove(&key);
            }
            node
        };
        self.count -= 1;

        if node.expires < p.ts.secs() {
            self.stats.prunes += 1;
            return false;
        }

        for mut fd in node.flow_data {
            fd.handle_expected(p);
            flow.set_flow_data(fd);
        }
        flow.protocol_id = node.protocol_id;
        flow.set_ignore_direction(node.direction);
        self.stats.realized += 1;
        debug!("expected flow realized {}", flow.key);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libflow_tools::PktTime;
    use std::any::Any;
    use std::net::Ipv4Addr;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    fn data_packet(src: IpAddr, sp: u16, dst: IpAddr, dp: u16, secs: u32) -> Packet {
        let mut p = Packet::default();
        p.pkt_type = PktType::Tcp;
        p.ip_proto = 6;
        p.src = src;
        p.sp = sp;
        p.dst = dst;
        p.dp = dp;
        p.ts = PktTime::new(secs, 0);
        p
    }

    struct ChannelData {
        seen: bool,
    }

    impl FlowData for ChannelData {
        fn id(&self) -> u64 {
            7
        }
        fn handle_expected(&mut self, _p: &mut Packet) {
            self.seen = true;
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn reservation_consumed_on_first_match() {
        let mut cache = ExpectCache::new(4);
        let ctrl = data_packet(ip(10, 0, 0, 1), 21, ip(10, 0, 0, 2), 4242, 100);
        assert!(cache.add_flow(
            &ctrl,
            PktType::Tcp,
            6,
            ip(10, 0, 0, 2),
            0,
            ip(10, 0, 0, 1),
            2021,
            SsnDir::BOTH,
            Some(33),
            vec![Box::new(ChannelData { seen: false })],
        ));

        // wildcard source port matches any client port
        let mut p = data_packet(ip(10, 0, 0, 2), 31337, ip(10, 0, 0, 1), 2021, 101);
        assert!(cache.is_expected(&p));

        let mut flow = Flow::default();
        assert!(cache.check(&mut p, &mut flow));
        assert_eq!(flow.get_ignore_direction(), SsnDir::BOTH);
        assert_eq!(flow.protocol_id, Some(33));
        let fd = flow.get_flow_data(7).expect("reserved data attached");
        assert!(fd.as_any_mut().downcast_mut::<ChannelData>().unwrap().seen);

        // consumed: a second identical packet no longer matches
        let mut p2 = data_packet(ip(10, 0, 0, 2), 31337, ip(10, 0, 0, 1), 2021, 102);
        assert!(!cache.is_expected(&p2));
        let mut flow2 = Flow::default();
        assert!(!cache.check(&mut p2, &mut flow2));
        assert_eq!(cache.stats.realized, 1);
    }

    #[test]
    fn expired_reservation_does_not_match() {
        let mut cache = ExpectCache::new(4);
        let ctrl = data_packet(ip(10, 0, 0, 1), 21, ip(10, 0, 0, 2), 4242, 100);
        cache.add_flow(
            &ctrl,
            PktType::Tcp,
            6,
            ip(10, 0, 0, 2),
            0,
            ip(10, 0, 0, 1),
            2021,
            SsnDir::BOTH,
            None,
            Vec::new(),
        );
        let mut late = data_packet(ip(10, 0, 0, 2), 1234, ip(10, 0, 0, 1), 2021, 100 + EXPECT_TTL_SECS + 1);
        assert!(!cache.is_expected(&late));
        let mut flow = Flow::default();
        assert!(!cache.check(&mut late, &mut flow));
    }

    #[test]
    fn overflow_evicts_oldest_reservation() {
        let mut cache = ExpectCache::new(2);
        let ctrl = data_packet(ip(10, 0, 0, 1), 21, ip(10, 0, 0, 2), 4242, 100);
        for dp in [1000u16, 1001, 1002].iter() {
            cache.add_flow(
                &ctrl,
                PktType::Tcp,
                6,
                ip(10, 0, 0, 2),
                0,
                ip(10, 0, 0, 1),
                *dp,
                SsnDir::BOTH,
                None,
                Vec::new(),
            );
        }
        // the first reservation was displaced
        let p = data_packet(ip(10, 0, 0, 2), 555, ip(10, 0, 0, 1), 1000, 101);
        assert!(!cache.is_expected(&p));
        let p2 = data_packet(ip(10, 0, 0, 2), 555, ip(10, 0, 0, 1), 1002, 101);
        assert!(cache.is_expected(&p2));
        assert_eq!(cache.stats.overflows, 1);
    }
}
