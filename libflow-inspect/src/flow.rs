use crate::flow_key::FlowKey;
use crate::packet::{DecodeFlags, Direction, Packet, PacketFlags, PktType, SsnDir};
use crate::session::{FlowData, Session};
use bitflags::bitflags;
use std::net::{IpAddr, Ipv4Addr};

/// Random identifier assigned when a flow is bound to a key
pub type FlowId = u64;

bitflags! {
    /// Accumulated session facts, preserved across packets
    #[derive(Default)]
    pub struct SessionFlags: u32 {
        const SEEN_CLIENT = 0x0000_0001;
        const SEEN_SERVER = 0x0000_0002;
        /// evicted because its idle timeout elapsed
        const TIMEDOUT = 0x0000_0004;
        /// evicted to make room
        const PRUNED = 0x0000_0008;
        /// flow was blocked by policy or inspection
        const BLOCK = 0x0000_0010;
        const DROP_CLIENT = 0x0000_0020;
        const DROP_SERVER = 0x0000_0040;
        /// expire_time is absolute and overrides the idle timeout
        const HARD_EXPIRATION = 0x0000_0080;
        const LOGIN_SUCCEEDED = 0x0000_0100;
    }
}

/// Session-state snapshot carried on the flow
#[derive(Clone, Debug)]
pub struct SsnState {
    pub session_flags: SessionFlags,
    pub direction: Direction,
    /// directions exempted from further inspection
    pub ignore_direction: SsnDir,
}

impl Default for SsnState {
    fn default() -> Self {
        SsnState {
            session_flags: SessionFlags::default(),
            direction: Direction::FromClient,
            ignore_direction: SsnDir::empty(),
        }
    }
}

/// Flow processing state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowState {
    Setup,
    Inspect,
    Allow,
    Block,
    Reset,
}

/// One tracked conversation.
///
/// Storage lives in the cache arena for the process lifetime; a slot is
/// reset and rebound as flows come and go. Intrusive LRU and uni-list links
/// are arena indices managed by the cache.
pub struct Flow {
    pub id: FlowId,
    /// copy of the hash key this slot is bound to
    pub key: FlowKey,
    pub pkt_type: PktType,
    pub ip_proto: u8,

    pub ssn_state: SsnState,
    pub previous_ssn_state: SsnState,

    pub client_ip: IpAddr,
    pub client_port: u16,
    pub server_ip: IpAddr,
    pub server_port: u16,

    pub flow_state: FlowState,

    /// packet-time seconds of the last packet on this flow
    pub last_data_seen: u32,
    /// absolute expiration, seconds; meaningful iff HARD_EXPIRATION is set
    pub expire_time: u64,

    /// offload in progress; exempt from eviction
    pub suspended: bool,
    /// owned by the HA peer; exempt from timeout
    pub ha_standby: bool,

    pub session: Option<Box<dyn Session>>,
    flow_data: Vec<Box<dyn FlowData>>,

    /// first MPLS label seen from each role
    pub mpls_client: Option<u32>,
    pub mpls_server: Option<u32>,

    pub inspection_policy_id: u32,
    pub ips_policy_id: u32,
    pub network_policy_id: u32,
    /// expected-flow protocol binding, when reserved by a control channel
    pub protocol_id: Option<u16>,

    pub inspection_disabled: bool,
    pub trigger_finalize_event: bool,

    // cache-managed intrusive links
    pub(crate) lru_prev: Option<usize>,
    pub(crate) lru_next: Option<usize>,
    pub(crate) uni_prev: Option<usize>,
    pub(crate) uni_next: Option<usize>,
    pub(crate) uni_linked: bool,
}

impl Default for Flow {
    fn default() -> Self {
        Flow {
            id: 0,
            key: FlowKey::default(),
            pkt_type: PktType::Ip,
            ip_proto: 0,
            ssn_state: SsnState::default(),
            previous_ssn_state: SsnState::default(),
            client_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            client_port: 0,
            server_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            server_port: 0,
            flow_state: FlowState::Setup,
            last_data_seen: 0,
            expire_time: 0,
            suspended: false,
            ha_standby: false,
            session: None,
            flow_data: Vec::new(),
            mpls_client: None,
            mpls_server: None,
            inspection_policy_id: 0,
            ips_policy_id: 0,
            network_policy_id: 0,
            protocol_id: None,
            inspection_disabled: false,
            trigger_finalize_event: false,
            lru_prev: None,
            lru_next: None,
            uni_prev: None,
            uni_next: None,
            uni_linked: false,
        }
    }
}

impl Flow {
    /// First-packet initialization, after the cache bound this slot
    pub fn init(&mut self, pkt_type: PktType, ip_proto: u8) {
        self.pkt_type = pkt_type;
        self.ip_proto = ip_proto;
        self.flow_state = FlowState::Setup;
    }

    /// Clear conversation state for slot reuse.
    ///
    /// The session object stays attached (reset, not terminated) so a
    /// same-type rebind can reuse it. `do_cleanup` gives the session a
    /// chance to flush; release paths that already know the session is dead
    /// pass false.
    pub fn reset(&mut self, do_cleanup: bool) {
        if do_cleanup {
            if let Some(session) = self.session.as_mut() {
                session.reset();
            }
        }
        self.id = 0;
        self.ssn_state = SsnState::default();
        self.previous_ssn_state = SsnState::default();
        self.flow_state = FlowState::Setup;
        self.expire_time = 0;
        self.suspended = false;
        self.ha_standby = false;
        self.flow_data.clear();
        self.mpls_client = None;
        self.mpls_server = None;
        self.protocol_id = None;
        self.inspection_disabled = false;
        self.trigger_finalize_event = false;
    }

    /// Terminate and drop the session
    pub fn term(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.term(self);
        }
    }

    #[inline]
    pub fn set_state(&mut self, state: FlowState) {
        self.flow_state = state;
    }

    /// Orient the packet against the flow roles.
    ///
    /// On the first packet the roles are not assigned yet; flow control
    /// overrides the result via role assignment before anything reads it.
    pub fn set_direction(&mut self, p: &mut Packet) {
        let from_client = match self.pkt_type {
            PktType::Tcp | PktType::Udp | PktType::Pdu | PktType::File => {
                p.src == self.client_ip && p.sp == self.client_port
            }
            _ => p.src == self.client_ip,
        };
        p.packet_flags &= !(PacketFlags::FROM_CLIENT | PacketFlags::FROM_SERVER);
        if from_client {
            self.ssn_state.direction = Direction::FromClient;
            p.packet_flags |= PacketFlags::FROM_CLIENT;
        } else {
            self.ssn_state.direction = Direction::FromServer;
            p.packet_flags |= PacketFlags::FROM_SERVER;
        }
    }

    /// Record which side of the conversation the current packet came from
    pub fn mark_seen(&mut self) {
        match self.ssn_state.direction {
            Direction::FromClient => self.ssn_state.session_flags |= SessionFlags::SEEN_CLIENT,
            Direction::FromServer => self.ssn_state.session_flags |= SessionFlags::SEEN_SERVER,
        }
    }

    #[inline]
    pub fn is_bidirectional(&self) -> bool {
        let bidir = SessionFlags::SEEN_CLIENT | SessionFlags::SEEN_SERVER;
        self.ssn_state.session_flags.contains(bidir)
    }

    #[inline]
    pub fn was_blocked(&self) -> bool {
        self.ssn_state.session_flags.contains(SessionFlags::BLOCK)
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    #[inline]
    pub fn is_inspection_disabled(&self) -> bool {
        self.inspection_disabled
    }

    /// Exempt both directions from further inspection
    pub fn stop_inspection(&mut self) {
        self.ssn_state.ignore_direction = SsnDir::BOTH;
        self.inspection_disabled = true;
    }

    #[inline]
    pub fn set_ignore_direction(&mut self, dir: SsnDir) {
        self.ssn_state.ignore_direction = dir;
    }

    #[inline]
    pub fn get_ignore_direction(&self) -> SsnDir {
        self.ssn_state.ignore_direction
    }

    /// Mark the flow blocked in both directions
    pub fn block_both(&mut self) {
        self.ssn_state.session_flags |=
            SessionFlags::BLOCK | SessionFlags::DROP_CLIENT | SessionFlags::DROP_SERVER;
    }

    /// Arm an absolute expiration that overrides the idle timeout
    pub fn set_expire(&mut self, now_secs: u32, timeout_secs: u64) {
        self.expire_time = u64::from(now_secs) + timeout_secs;
        self.ssn_state.session_flags |= SessionFlags::HARD_EXPIRATION;
    }

    #[inline]
    pub fn is_hard_expiration(&self) -> bool {
        self.ssn_state
            .session_flags
            .contains(SessionFlags::HARD_EXPIRATION)
    }

    /// Record the MPLS label for the packet's direction, first label wins
    pub fn set_mpls_layer_per_dir(&mut self, p: &Packet) {
        if !p.decode_flags.contains(DecodeFlags::MPLS) {
            return;
        }
        match self.ssn_state.direction {
            Direction::FromClient => {
                if self.mpls_client.is_none() {
                    self.mpls_client = Some(p.mpls_label);
                }
            }
            Direction::FromServer => {
                if self.mpls_server.is_none() {
                    self.mpls_server = Some(p.mpls_label);
                }
            }
        }
    }

    /// Attach opaque inspector state, replacing any entry with the same id
    pub fn set_flow_data(&mut self, fd: Box<dyn FlowData>) {
        let id = fd.id();
        self.flow_data.retain(|d| d.id() != id);
        self.flow_data.push(fd);
    }

    pub fn get_flow_data(&mut self, id: u64) -> Option<&mut Box<dyn FlowData>> {
        self.flow_data.iter_mut().find(|d| d.id() == id)
    }

    pub fn free_flow_data(&mut self, id: u64) {
        self.flow_data.retain(|d| d.id() != id);
    }

    /// Run the session precheck without aliasing the session slot
    pub fn session_precheck(&mut self, p: &mut Packet) {
        if let Some(mut session) = self.session.take() {
            session.precheck(self, p);
            self.session = Some(session);
        }
    }

    /// Run the session setup; true means the session accepted the flow
    pub fn session_setup(&mut self, p: &mut Packet) -> bool {
        if let Some(mut session) = self.session.take() {
            let ok = session.setup(self, p);
            self.session = Some(session);
            ok
        } else {
            false
        }
    }
}
