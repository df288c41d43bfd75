use crate::bus::{
    DataBus, Event, FLOW_STATE_SETUP_EVENT, STREAM_ICMP_NEW_FLOW_EVENT, STREAM_IP_NEW_FLOW_EVENT,
    STREAM_TCP_MIDSTREAM_EVENT, STREAM_TCP_SYN_ACK_EVENT, STREAM_TCP_SYN_EVENT,
    STREAM_UDP_NEW_FLOW_EVENT,
};
use crate::capture::MsgFlags;
use crate::config::{EngineConfig, PolicyIds};
use crate::expect_cache::ExpectCache;
use crate::flow::{Flow, FlowState};
use crate::flow_cache::FlowCache;
use crate::flow_key::FlowKey;
use crate::ha::HighAvailability;
use crate::packet::{DecodeFlags, Direction, Packet, PacketFlags, PktType, SsnDir, PKT_TYPE_MAX};
use crate::session::{FlowData, SessionFactory};
use crate::stats::PruneReason;
use std::net::IpAddr;

struct ProtoEntry {
    get_ssn: Option<SessionFactory>,
}

impl Default for ProtoEntry {
    fn default() -> Self {
        ProtoEntry { get_ssn: None }
    }
}

/// Packet-to-flow dispatch layer.
///
/// Builds the canonical key, finds or creates the flow, instantiates the
/// protocol session, and drives the per-packet state machine. One instance
/// per packet thread; nothing here is shared.
pub struct FlowControl {
    cache: FlowCache,
    exp_cache: ExpectCache,
    proto: [ProtoEntry; PKT_TYPE_MAX],
    types: Vec<PktType>,
    next: usize,
    num_flows: u64,
    flows_by_type: [u64; PKT_TYPE_MAX],
    last_pkt_type: Option<PktType>,
    policies: PolicyIds,
    track_on_syn: bool,
}

impl FlowControl {
    pub fn new(config: &EngineConfig) -> Self {
        let exp_slots = (config.flow.max_flows >> 9).max(2);
        FlowControl {
            cache: FlowCache::new(config.flow.clone()),
            exp_cache: ExpectCache::new(exp_slots),
            proto: Default::default(),
            types: Vec::new(),
            next: 0,
            num_flows: 0,
            flows_by_type: [0; PKT_TYPE_MAX],
            last_pkt_type: None,
            policies: config.policies,
            track_on_syn: config.track_on_syn,
        }
    }

    /// Re-read settings after a configuration swap
    pub fn set_config(&mut self, config: &EngineConfig) {
        self.policies = config.policies;
        self.track_on_syn = config.track_on_syn;
    }

    /// Register the session factory for a packet type
    pub fn init_proto(&mut self, pkt_type: PktType, get_ssn: SessionFactory) {
        self.proto[pkt_type.index()].get_ssn = Some(get_ssn);
        self.types.push(pkt_type);
    }

    #[inline]
    pub fn cache(&self) -> &FlowCache {
        &self.cache
    }

    #[inline]
    pub fn cache_mut(&mut self) -> &mut FlowCache {
        &mut self.cache
    }

    #[inline]
    pub fn flow(&self, idx: usize) -> &Flow {
        self.cache.flow(idx)
    }

    #[inline]
    pub fn flow_mut(&mut self, idx: usize) -> &mut Flow {
        self.cache.flow_mut(idx)
    }

    // ---- counters ----------------------------------------------------

    pub fn get_total_prunes(&self) -> u64 {
        self.cache.get_total_prunes()
    }

    pub fn get_prunes(&self, reason: PruneReason) -> u64 {
        self.cache.get_prunes(reason)
    }

    #[inline]
    pub fn get_num_flows(&self) -> u64 {
        self.num_flows
    }

    /// Type of the most recently dispatched packet
    #[inline]
    pub fn last_pkt_type(&self) -> Option<PktType> {
        self.last_pkt_type
    }

    pub fn get_flows_by_type(&self, pkt_type: PktType) -> u64 {
        self.flows_by_type[pkt_type.index()]
    }

    /// Reset all counters (once, regardless of registered types)
    pub fn clear_counts(&mut self) {
        self.cache.reset_stats();
        self.num_flows = 0;
        self.flows_by_type = [0; PKT_TYPE_MAX];
    }

    // ---- cache passthroughs ------------------------------------------

    pub fn find_flow(&mut self, key: &FlowKey, now_secs: u32) -> Option<usize> {
        self.cache.find(key, now_secs)
    }

    pub fn delete_flow(&mut self, key: &FlowKey, now_secs: u32) {
        if let Some(idx) = self.cache.find(key, now_secs) {
            self.cache.release(idx, PruneReason::Ha, true);
        }
    }

    pub fn release_flow(&mut self, idx: usize, reason: PruneReason) {
        self.cache.release(idx, reason, true);
    }

    pub fn purge_flows(&mut self) -> usize {
        self.cache.purge()
    }

    pub fn prune_one(&mut self, reason: PruneReason, do_cleanup: bool) -> bool {
        self.cache.prune_one(reason, do_cleanup)
    }

    /// Periodic idle work: retire one timed-out flow
    pub fn timeout_flows(&mut self, now_secs: u32) {
        if self.types.is_empty() {
            return;
        }
        self.next = (self.next + 1) % self.types.len();
        self.cache.timeout(1, now_secs);
    }

    /// Evict until the memory cap is satisfied or nothing can go
    pub fn preemptive_cleanup(&mut self) {
        while self.cache.memcap_over_threshold() {
            if !self.cache.prune_one(PruneReason::Preemptive, true) {
                break;
            }
        }
    }

    // ---- expected flows ----------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn add_expected(
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
        self.exp_cache.add_flow(
            ctrl_pkt,
            pkt_type,
            ip_proto,
            src,
            sp,
            dst,
            dp,
            direction,
            protocol_id,
            flow_data,
        )
    }

    pub fn is_expected(&self, p: &Packet) -> bool {
        self.exp_cache.is_expected(p)
    }

    // ---- packet processing -------------------------------------------

    /// Dispatch one decoded packet. Returns false if no session factory is
    /// registered for the type (packet is not tracked); `new_flow` reports
    /// whether a flow was created.
    pub fn process_packet(
        &mut self,
        pkt_type: PktType,
        p: &mut Packet,
        bus: &mut DataBus,
        ha: &mut dyn HighAvailability,
        new_flow: &mut bool,
    ) -> bool {
        if self.proto[pkt_type.index()].get_ssn.is_none() {
            return false;
        }

        let key = FlowKey::from_packet(p);
        let mut idx = self.cache.find(&key, p.ts.secs());

        // drivers are authoritative about flow identity
        if let Some(i) = idx {
            if p.msg_flags.contains(MsgFlags::NEW_FLOW) {
                debug!("releasing stale flow on driver hint {}", key);
                self.cache.release(i, PruneReason::Stale, true);
                idx = None;
            }
        }

        if idx.is_none() {
            idx = ha.import(p, &key, &mut self.cache);
            if idx.is_none() {
                if !want_flow(pkt_type, p, self.track_on_syn) {
                    return true;
                }
                idx = Some(self.cache.get(&key, p.ts.secs()));
                *new_flow = true;
            }
        }
        let idx = match idx {
            Some(i) => i,
            None => return true,
        };

        if self.cache.flow(idx).session.is_none() {
            self.cache.flow_mut(idx).init(pkt_type, p.ip_proto);
            let factory = self.proto[pkt_type.index()]
                .get_ssn
                .as_ref()
                .expect("factory checked above");
            let session = factory(self.cache.flow(idx));
            self.cache.flow_mut(idx).session = Some(session);
        }

        let news = self.process_flow(idx, p, bus);
        self.num_flows += u64::from(news);
        if news > 0 {
            self.flows_by_type[pkt_type.index()] += 1;
        }

        if self.cache.is_uni_linked(idx) && self.cache.flow(idx).is_bidirectional() {
            self.cache.unlink_uni(idx);
        }
        true
    }

    /// Core per-packet routine, once the flow is resolved
    fn process_flow(&mut self, idx: usize, p: &mut Packet, bus: &mut DataBus) -> u32 {
        {
            let flow = self.cache.flow_mut(idx);
            flow.previous_ssn_state = flow.ssn_state.clone();
        }
        p.flow = Some(idx);
        p.disable_inspect = self.cache.flow(idx).is_inspection_disabled();
        self.last_pkt_type = Some(p.pkt_type);

        self.preemptive_cleanup();

        let mut news = 0u32;
        let flow = self.cache.flow_mut(idx);
        flow.set_direction(p);
        flow.session_precheck(p);

        if flow.flow_state != FlowState::Setup {
            p.inspection_policy_id = flow.inspection_policy_id;
            p.ips_policy_id = flow.ips_policy_id;
            p.network_policy_id = flow.network_policy_id;
        } else {
            flow.inspection_policy_id = self.policies.inspection;
            flow.ips_policy_id = self.policies.ips;
            flow.network_policy_id = self.policies.network;

            init_roles(p, flow);
            bus.publish(FLOW_STATE_SETUP_EVENT, &Event::Packet(p));
            if let Some(name) = new_flow_event(flow.pkt_type, p) {
                bus.publish(name, &Event::Packet(p));
            }

            if self.exp_cache.check(p, flow) {
                // reservation matched; inspection is pre-empted
                p.disable_inspect = true;
            }

            // the session may promote the flow to INSPECT here; declining
            // (no client side, unsupported variant) leaves it allowed
            if !flow.session_setup(p) {
                flow.set_state(FlowState::Allow);
            }
            news = 1;
        }
        flow.mark_seen();

        // requires the packet direction to be settled
        if p.decode_flags.contains(DecodeFlags::MPLS) {
            flow.set_mpls_layer_per_dir(p);
        }

        match flow.flow_state {
            FlowState::Setup => flow.set_state(FlowState::Allow),
            FlowState::Inspect => {
                debug_assert!(flow.session.is_some());
            }
            FlowState::Allow => {
                if news > 0 {
                    flow.stop_inspection();
                } else {
                    p.disable_inspect = true;
                }
                p.decode_flags |= DecodeFlags::TRUST;
            }
            FlowState::Block => {
                if news > 0 {
                    flow.block_both();
                    p.active.drop_packet();
                } else {
                    p.active.block_again();
                }
                p.disable_inspect = true;
            }
            FlowState::Reset => {
                if news > 0 {
                    p.active.drop_packet();
                } else {
                    p.active.reset_again();
                }
                flow.block_both();
                p.disable_inspect = true;
            }
        }

        news
    }
}

/// Pre-instantiation filter: some packets never deserve a flow
fn want_flow(pkt_type: PktType, p: &mut Packet, track_on_syn: bool) -> bool {
    if pkt_type != PktType::Tcp {
        return true;
    }
    if p.tcp_flags.is_rst() {
        // guessing direction based on ports is misleading
        return false;
    }
    if !p.tcp_flags.is_syn_only() || track_on_syn || p.decode_flags.contains(DecodeFlags::WSCALE) {
        return true;
    }
    // tracking starts on data; still orient the handshake
    p.packet_flags |= PacketFlags::FROM_CLIENT;
    false
}

fn assign(flow: &mut Flow, p: &Packet, client_is_src: bool) {
    if client_is_src {
        flow.ssn_state.direction = Direction::FromClient;
        flow.client_ip = p.src;
        flow.client_port = p.sp;
        flow.server_ip = p.dst;
        flow.server_port = p.dp;
    } else {
        flow.ssn_state.direction = Direction::FromServer;
        flow.client_ip = p.dst;
        flow.client_port = p.dp;
        flow.server_ip = p.src;
        flow.server_port = p.sp;
    }
}

/// First-packet role assignment
fn init_roles(p: &mut Packet, flow: &mut Flow) {
    match flow.pkt_type {
        PktType::Ip | PktType::Icmp => assign(flow, p, true),
        PktType::Tcp => {
            if p.tcp_flags.is_syn_only() {
                assign(flow, p, true);
            } else if p.tcp_flags.is_syn_ack() {
                assign(flow, p, false);
            } else {
                // midstream heuristic: the higher port is the client;
                // on a tie the sender is the client
                assign(flow, p, p.sp >= p.dp);
            }
        }
        PktType::Udp => assign(flow, p, true),
        PktType::Pdu | PktType::File => {
            assign(flow, p, p.decode_flags.contains(DecodeFlags::C2S))
        }
    }
    p.packet_flags &= !(PacketFlags::FROM_CLIENT | PacketFlags::FROM_SERVER);
    if flow.ssn_state.direction == Direction::FromClient {
        p.packet_flags |= PacketFlags::FROM_CLIENT;
    } else {
        p.packet_flags |= PacketFlags::FROM_SERVER;
    }
}

fn new_flow_event(pkt_type: PktType, p: &Packet) -> Option<&'static str> {
    match pkt_type {
        PktType::Ip => Some(STREAM_IP_NEW_FLOW_EVENT),
        PktType::Icmp => Some(STREAM_ICMP_NEW_FLOW_EVENT),
        PktType::Udp => Some(STREAM_UDP_NEW_FLOW_EVENT),
        PktType::Tcp => {
            if p.tcp_flags.is_syn_only() {
                Some(STREAM_TCP_SYN_EVENT)
            } else if p.tcp_flags.is_syn_ack() {
                Some(STREAM_TCP_SYN_ACK_EVENT)
            } else {
                Some(STREAM_TCP_MIDSTREAM_EVENT)
            }
        }
        PktType::Pdu | PktType::File => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ha::NoHa;
    use crate::packet::TcpFlags;
    use crate::session::NullSession;
    use libflow_tools::PktTime;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    fn engine_config(max_flows: usize) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.flow.max_flows = max_flows;
        config
    }

    fn control(max_flows: usize) -> FlowControl {
        let mut fc = FlowControl::new(&engine_config(max_flows));
        for t in PktType::all().iter() {
            fc.init_proto(*t, Box::new(|_| Box::new(NullSession)));
        }
        fc
    }

    fn tcp_packet(
        src: IpAddr,
        sp: u16,
        dst: IpAddr,
        dp: u16,
        flags: TcpFlags,
        secs: u32,
    ) -> Packet {
        let mut p = Packet::default();
        p.pkt_type = PktType::Tcp;
        p.ip_proto = 6;
        p.src = src;
        p.sp = sp;
        p.dst = dst;
        p.dp = dp;
        p.tcp_flags = flags;
        p.ts = PktTime::new(secs, 0);
        p
    }

    fn udp_packet(src: IpAddr, sp: u16, dst: IpAddr, dp: u16, secs: u32) -> Packet {
        let mut p = Packet::default();
        p.pkt_type = PktType::Udp;
        p.ip_proto = 17;
        p.src = src;
        p.sp = sp;
        p.dst = dst;
        p.dp = dp;
        p.ts = PktTime::new(secs, 0);
        p
    }

    fn run(fc: &mut FlowControl, p: &mut Packet) -> bool {
        let mut bus = DataBus::new();
        let mut ha = NoHa;
        let mut new_flow = false;
        let handled = fc.process_packet(p.pkt_type, p, &mut bus, &mut ha, &mut new_flow);
        assert!(handled);
        new_flow
    }

    #[test]
    fn cold_cache_single_syn() {
        // cold cache, one TCP SYN: flow created, roles assigned, allow state
        let mut fc = control(4);
        let mut p = tcp_packet(ip(10, 0, 0, 1), 1000, ip(10, 0, 0, 2), 80, TcpFlags::SYN, 100);
        let new_flow = run(&mut fc, &mut p);
        assert!(new_flow);
        assert!(p.is_from_client());
        assert_eq!(fc.cache().get_count(), 1);
        assert_eq!(fc.cache().get_uni_count(PktType::Tcp), 1);

        let idx = p.flow.expect("flow bound");
        let flow = fc.flow(idx);
        assert_eq!(flow.client_ip, ip(10, 0, 0, 1));
        assert_eq!(flow.client_port, 1000);
        assert_eq!(flow.server_ip, ip(10, 0, 0, 2));
        assert_eq!(flow.server_port, 80);
        // no session setup registered: setup collapses to allow
        assert_eq!(flow.flow_state, FlowState::Allow);
        assert_eq!(fc.get_num_flows(), 1);
        assert_eq!(fc.get_flows_by_type(PktType::Tcp), 1);
    }

    #[test]
    fn syn_ack_completes_flow_bidirectionally() {
        let mut fc = control(4);
        let mut syn = tcp_packet(ip(10, 0, 0, 1), 1000, ip(10, 0, 0, 2), 80, TcpFlags::SYN, 100);
        assert!(run(&mut fc, &mut syn));
        let idx = syn.flow.unwrap();

        let mut syn_ack = tcp_packet(
            ip(10, 0, 0, 2),
            80,
            ip(10, 0, 0, 1),
            1000,
            TcpFlags::SYN | TcpFlags::ACK,
            101,
        );
        let new_flow = run(&mut fc, &mut syn_ack);
        assert!(!new_flow);
        assert_eq!(syn_ack.flow, Some(idx));
        assert!(syn_ack.is_from_server());
        assert_eq!(fc.cache().get_count(), 1);
        // both sides seen: the flow left the uni list
        assert!(fc.flow(idx).is_bidirectional());
        assert_eq!(fc.cache().get_uni_count(PktType::Tcp), 0);
        assert_eq!(fc.get_num_flows(), 1);
    }

    #[test]
    fn udp_role_symmetry() {
        // swapping src/dst yields the same key with swapped roles
        let mut fc = control(4);
        let mut p = udp_packet(ip(10, 0, 0, 1), 5000, ip(10, 0, 0, 2), 53, 100);
        run(&mut fc, &mut p);
        let idx = p.flow.unwrap();
        assert_eq!(fc.flow(idx).client_ip, ip(10, 0, 0, 1));

        let mut fc2 = control(4);
        let mut r = udp_packet(ip(10, 0, 0, 2), 53, ip(10, 0, 0, 1), 5000, 100);
        run(&mut fc2, &mut r);
        let idx2 = r.flow.unwrap();
        assert_eq!(fc2.flow(idx2).client_ip, ip(10, 0, 0, 2));
        assert_eq!(fc.flow(idx).key, fc2.flow(idx2).key);
    }

    #[test]
    fn syn_ack_first_assigns_server_side() {
        let mut fc = control(4);
        let mut p = tcp_packet(
            ip(10, 0, 0, 2),
            80,
            ip(10, 0, 0, 1),
            1000,
            TcpFlags::SYN | TcpFlags::ACK,
            100,
        );
        run(&mut fc, &mut p);
        let flow = fc.flow(p.flow.unwrap());
        assert_eq!(flow.client_ip, ip(10, 0, 0, 1));
        assert_eq!(flow.server_ip, ip(10, 0, 0, 2));
        assert!(p.is_from_server());
    }

    #[test]
    fn midstream_higher_port_is_client() {
        let mut fc = control(4);
        let mut p = tcp_packet(ip(10, 0, 0, 2), 80, ip(10, 0, 0, 1), 40000, TcpFlags::ACK, 100);
        run(&mut fc, &mut p);
        let flow = fc.flow(p.flow.unwrap());
        assert_eq!(flow.client_ip, ip(10, 0, 0, 1));
        assert_eq!(flow.client_port, 40000);
        assert!(p.is_from_server());

        // tie: the sender is the client
        let mut fc2 = control(4);
        let mut q = tcp_packet(ip(10, 0, 0, 9), 7000, ip(10, 0, 0, 8), 7000, TcpFlags::ACK, 100);
        run(&mut fc2, &mut q);
        let flow = fc2.flow(q.flow.unwrap());
        assert_eq!(flow.client_ip, ip(10, 0, 0, 9));
        assert!(q.is_from_client());
    }

    #[test]
    fn rst_never_creates_a_flow() {
        let mut fc = control(4);
        let mut p = tcp_packet(ip(10, 0, 0, 1), 1000, ip(10, 0, 0, 2), 80, TcpFlags::RST, 100);
        let new_flow = run(&mut fc, &mut p);
        assert!(!new_flow);
        assert_eq!(fc.cache().get_count(), 0);
    }

    #[test]
    fn bare_syn_rejected_when_tracking_on_data() {
        let mut config = engine_config(4);
        config.track_on_syn = false;
        let mut fc = FlowControl::new(&config);
        fc.init_proto(PktType::Tcp, Box::new(|_| Box::new(NullSession)));

        let mut p = tcp_packet(ip(10, 0, 0, 1), 1000, ip(10, 0, 0, 2), 80, TcpFlags::SYN, 100);
        let new_flow = run(&mut fc, &mut p);
        assert!(!new_flow);
        assert_eq!(fc.cache().get_count(), 0);
        // the handshake direction is still reported
        assert!(p.is_from_client());

        // the same segment with a window scale option is tracked
        let mut q = tcp_packet(ip(10, 0, 0, 1), 1001, ip(10, 0, 0, 2), 80, TcpFlags::SYN, 100);
        q.decode_flags |= DecodeFlags::WSCALE;
        assert!(run(&mut fc, &mut q));
        assert_eq!(fc.cache().get_count(), 1);
    }

    #[test]
    fn driver_new_flow_hint_releases_stale_flow() {
        let mut fc = control(4);
        let mut p = udp_packet(ip(10, 0, 0, 1), 5000, ip(10, 0, 0, 2), 53, 100);
        run(&mut fc, &mut p);
        let first_id = fc.flow(p.flow.unwrap()).id;

        let mut q = udp_packet(ip(10, 0, 0, 1), 5000, ip(10, 0, 0, 2), 53, 200);
        q.msg_flags |= MsgFlags::NEW_FLOW;
        let new_flow = run(&mut fc, &mut q);
        assert!(new_flow);
        assert_eq!(fc.get_prunes(PruneReason::Stale), 1);
        assert_ne!(fc.flow(q.flow.unwrap()).id, first_id);
        assert_eq!(fc.cache().get_count(), 1);
    }

    #[test]
    fn untracked_type_is_not_consumed() {
        let mut config = engine_config(4);
        config.track_on_syn = true;
        let mut fc = FlowControl::new(&config);
        // only UDP registered
        fc.init_proto(PktType::Udp, Box::new(|_| Box::new(NullSession)));

        let mut p = tcp_packet(ip(10, 0, 0, 1), 1000, ip(10, 0, 0, 2), 80, TcpFlags::SYN, 100);
        let mut bus = DataBus::new();
        let mut ha = NoHa;
        let mut new_flow = false;
        assert!(!fc.process_packet(PktType::Tcp, &mut p, &mut bus, &mut ha, &mut new_flow));
    }

    #[test]
    fn setup_publishes_events() {
        let mut fc = control(4);
        let mut bus = DataBus::new();
        let setup_hits = Arc::new(AtomicUsize::new(0));
        let syn_hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = setup_hits.clone();
            bus.subscribe(
                FLOW_STATE_SETUP_EVENT,
                Box::new(move |_| {
                    hits.fetch_add(1, Ordering::Relaxed);
                }),
            );
            let hits = syn_hits.clone();
            bus.subscribe(
                STREAM_TCP_SYN_EVENT,
                Box::new(move |_| {
                    hits.fetch_add(1, Ordering::Relaxed);
                }),
            );
        }
        let mut ha = NoHa;
        let mut new_flow = false;
        let mut p = tcp_packet(ip(10, 0, 0, 1), 1000, ip(10, 0, 0, 2), 80, TcpFlags::SYN, 100);
        fc.process_packet(PktType::Tcp, &mut p, &mut bus, &mut ha, &mut new_flow);
        assert_eq!(setup_hits.load(Ordering::Relaxed), 1);
        assert_eq!(syn_hits.load(Ordering::Relaxed), 1);

        // second packet of the same flow publishes nothing
        let mut q = tcp_packet(ip(10, 0, 0, 1), 1000, ip(10, 0, 0, 2), 80, TcpFlags::ACK, 101);
        fc.process_packet(PktType::Tcp, &mut q, &mut bus, &mut ha, &mut new_flow);
        assert_eq!(setup_hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn allowed_flow_trusts_later_packets() {
        let mut fc = control(4);
        let mut p = udp_packet(ip(10, 0, 0, 1), 5000, ip(10, 0, 0, 2), 53, 100);
        run(&mut fc, &mut p);
        assert_eq!(fc.flow(p.flow.unwrap()).flow_state, FlowState::Allow);

        let mut q = udp_packet(ip(10, 0, 0, 2), 53, ip(10, 0, 0, 1), 5000, 101);
        run(&mut fc, &mut q);
        assert!(q.disable_inspect);
        assert!(q.decode_flags.contains(DecodeFlags::TRUST));
    }

    #[test]
    fn blocked_flow_blocks_again() {
        let mut fc = control(4);
        let mut p = udp_packet(ip(10, 0, 0, 1), 5000, ip(10, 0, 0, 2), 53, 100);
        run(&mut fc, &mut p);
        let idx = p.flow.unwrap();
        fc.flow_mut(idx).set_state(FlowState::Block);

        let mut q = udp_packet(ip(10, 0, 0, 1), 5000, ip(10, 0, 0, 2), 53, 101);
        run(&mut fc, &mut q);
        assert!(q.active.session_was_blocked());
        assert!(q.active.packet_was_dropped());
        assert!(q.disable_inspect);
    }

    #[test]
    fn expected_flow_consumed_on_setup() {
        let mut fc = control(8);
        let ctrl = tcp_packet(ip(10, 0, 0, 1), 21, ip(10, 0, 0, 2), 4242, TcpFlags::ACK, 100);
        assert!(fc.add_expected(
            &ctrl,
            PktType::Tcp,
            6,
            ip(10, 0, 0, 2),
            0,
            ip(10, 0, 0, 1),
            2021,
            SsnDir::BOTH,
            Some(99),
            Vec::new(),
        ));

        let mut p = tcp_packet(ip(10, 0, 0, 2), 31337, ip(10, 0, 0, 1), 2021, TcpFlags::SYN, 101);
        assert!(fc.is_expected(&p));
        let new_flow = run(&mut fc, &mut p);
        assert!(new_flow);
        let flow = fc.flow(p.flow.unwrap());
        assert_eq!(flow.protocol_id, Some(99));
        assert_eq!(flow.get_ignore_direction(), SsnDir::BOTH);
        assert!(p.disable_inspect);
        // consumed with the first match
        assert!(!fc.is_expected(&p));
    }

    #[test]
    fn count_never_exceeds_max_flows() {
        let mut fc = control(3);
        for i in 0..20u16 {
            let mut p = udp_packet(ip(10, 0, 0, 1), 10_000 + i, ip(10, 0, 0, 2), 53, 100 + u32::from(i));
            run(&mut fc, &mut p);
            assert!(fc.cache().get_count() <= 3);
        }
    }
}
