use crate::capture::{MsgFlags, PktHdr};
use bitflags::bitflags;
use libflow_tools::{Error, PktTime};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};

/// Tracked packet classes, in dispatch-table order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(usize)]
pub enum PktType {
    Ip,
    Icmp,
    Tcp,
    Udp,
    Pdu,
    File,
}

pub const PKT_TYPE_MAX: usize = 6;

impl PktType {
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Configuration table name for this type
    pub fn name(self) -> &'static str {
        match self {
            PktType::Ip => "ip",
            PktType::Icmp => "icmp",
            PktType::Tcp => "tcp",
            PktType::Udp => "udp",
            PktType::Pdu => "pdu",
            PktType::File => "file",
        }
    }

    /// All tracked types, for registration loops
    pub fn all() -> [PktType; PKT_TYPE_MAX] {
        [
            PktType::Ip,
            PktType::Icmp,
            PktType::Tcp,
            PktType::Udp,
            PktType::Pdu,
            PktType::File,
        ]
    }
}

/// Packet direction relative to the flow roles
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Direction {
    FromClient,
    FromServer,
}

bitflags! {
    /// Flow-relative direction set (ignore masks, drop masks)
    #[derive(Default, Serialize)]
    pub struct SsnDir: u8 {
        const FROM_CLIENT = 0x1;
        const FROM_SERVER = 0x2;
        const BOTH = 0x3;
    }
}

bitflags! {
    /// Facts established by the decoder
    #[derive(Default)]
    pub struct DecodeFlags: u16 {
        /// packet is an IP fragment
        const FRAG = 0x0001;
        /// user PDU flows client to server
        const C2S = 0x0002;
        /// TCP window scale option present
        const WSCALE = 0x0004;
        /// decoder vouches for this packet; latch trust on the flow
        const TRUST = 0x0008;
        /// a VLAN layer was decoded
        const VLAN = 0x0010;
        /// an MPLS layer was decoded
        const MPLS = 0x0020;
    }
}

bitflags! {
    /// Facts established during processing
    #[derive(Default)]
    pub struct PacketFlags: u16 {
        const FROM_CLIENT = 0x0001;
        const FROM_SERVER = 0x0002;
        /// do not inspect or track
        const IGNORE = 0x0004;
        /// payload normalized in place
        const MODIFIED = 0x0008;
        /// payload trimmed; must be re-injected
        const RESIZED = 0x0010;
        /// not a wire packet
        const PSEUDO = 0x0020;
    }
}

bitflags! {
    /// TCP header flags
    #[derive(Default)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

impl TcpFlags {
    #[inline]
    pub fn is_syn_only(self) -> bool {
        self & (TcpFlags::SYN | TcpFlags::ACK | TcpFlags::RST | TcpFlags::FIN) == TcpFlags::SYN
    }

    #[inline]
    pub fn is_syn_ack(self) -> bool {
        self.contains(TcpFlags::SYN | TcpFlags::ACK) && !self.contains(TcpFlags::RST)
    }

    #[inline]
    pub fn is_rst(self) -> bool {
        self.contains(TcpFlags::RST)
    }
}

/// Forwarding action requested for the current packet
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum ActiveAction {
    Pass,
    Retry,
    Drop,
    Block,
    Reset,
}

/// Per-packet active response state, consulted by the verdict distiller.
///
/// Tracks what inspectors asked to happen to the current packet and its
/// session, independent of whether the deployment can actually block.
#[derive(Clone, Debug)]
pub struct Active {
    action: ActiveAction,
    session_blocked: bool,
    tunnel_bypass: bool,
    force_dropped: bool,
    held: bool,
}

impl Default for Active {
    fn default() -> Self {
        Active {
            action: ActiveAction::Pass,
            session_blocked: false,
            tunnel_bypass: false,
            force_dropped: false,
            held: false,
        }
    }
}

impl Active {
    pub fn reset(&mut self) {
        *self = Active::default();
    }

    /// Ask for this message to be redelivered later
    pub fn retry_packet(&mut self) {
        if self.action < ActiveAction::Drop {
            self.action = ActiveAction::Retry;
        }
    }

    #[inline]
    pub fn packet_retry_requested(&self) -> bool {
        self.action == ActiveAction::Retry
    }

    pub fn drop_packet(&mut self) {
        if self.action < ActiveAction::Drop {
            self.action = ActiveAction::Drop;
        }
    }

    pub fn force_drop_packet(&mut self) {
        self.force_dropped = true;
        self.drop_packet();
    }

    #[inline]
    pub fn packet_was_dropped(&self) -> bool {
        self.action >= ActiveAction::Drop
    }

    #[inline]
    pub fn packet_force_dropped(&self) -> bool {
        self.force_dropped
    }

    /// Record that the owning session is blocked
    pub fn block_session(&mut self) {
        self.session_blocked = true;
    }

    #[inline]
    pub fn session_was_blocked(&self) -> bool {
        self.session_blocked
    }

    /// Drop one more packet of an already-blocked flow
    pub fn block_again(&mut self) {
        self.session_blocked = true;
        if self.action < ActiveAction::Block {
            self.action = ActiveAction::Block;
        }
    }

    /// As block_again, for reset flows
    pub fn reset_again(&mut self) {
        self.session_blocked = true;
        self.action = ActiveAction::Reset;
    }

    pub fn set_tunnel_bypass(&mut self) {
        self.tunnel_bypass = true;
    }

    #[inline]
    pub fn get_tunnel_bypass(&self) -> bool {
        self.tunnel_bypass
    }

    pub fn hold_packet(&mut self) {
        self.held = true;
    }

    #[inline]
    pub fn is_packet_held(&self) -> bool {
        self.held
    }
}

/// Decoded view of one capture message.
///
/// Filled by the decoder, annotated by flow control and inspectors, read by
/// the verdict distiller. One instance lives in each inspection context and
/// is reset between packets.
#[derive(Debug)]
pub struct Packet {
    pub ts: PktTime,
    pub pkt_type: PktType,
    pub ip_proto: u8,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub sp: u16,
    pub dp: u16,
    pub icmp_type: u8,
    pub ip_id: u16,
    pub vlan_id: u16,
    pub mpls_label: u32,
    pub address_space_id: u16,
    pub tcp_flags: TcpFlags,
    pub decode_flags: DecodeFlags,
    pub packet_flags: PacketFlags,
    pub msg_flags: MsgFlags,
    pub pktlen: u32,
    pub payload_len: u32,
    /// replacement payload staged by a normalizer
    pub rewritten: Option<Vec<u8>>,
    /// arena slot of the owning flow, bound during processing
    pub flow: Option<usize>,
    pub disable_inspect: bool,
    pub inspection_policy_id: u32,
    pub ips_policy_id: u32,
    pub network_policy_id: u32,
    pub active: Active,
}

impl Default for Packet {
    fn default() -> Self {
        Packet {
            ts: PktTime::default(),
            pkt_type: PktType::Ip,
            ip_proto: 0,
            src: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            sp: 0,
            dp: 0,
            icmp_type: 0,
            ip_id: 0,
            vlan_id: 0,
            mpls_label: 0,
            address_space_id: 0,
            tcp_flags: TcpFlags::default(),
            decode_flags: DecodeFlags::default(),
            packet_flags: PacketFlags::default(),
            msg_flags: MsgFlags::default(),
            pktlen: 0,
            payload_len: 0,
            rewritten: None,
            flow: None,
            disable_inspect: false,
            inspection_policy_id: 0,
            ips_policy_id: 0,
            network_policy_id: 0,
            active: Active::default(),
        }
    }
}

impl Packet {
    /// Clear per-packet state so the context can be reused
    pub fn reset(&mut self) {
        *self = Packet::default();
    }

    #[inline]
    pub fn is_from_client(&self) -> bool {
        self.packet_flags.contains(PacketFlags::FROM_CLIENT)
    }

    #[inline]
    pub fn is_from_server(&self) -> bool {
        self.packet_flags.contains(PacketFlags::FROM_SERVER)
    }
}

/// Turns raw capture bytes into a `Packet`.
///
/// Protocol decoding is a collaborator of the core; the engine ships one
/// Ethernet/IP decoder for the readback driver and tests may install their
/// own.
pub trait Decoder: Send {
    fn decode(
        &self,
        hdr: &PktHdr,
        data: &[u8],
        retry: bool,
        p: &mut Packet,
    ) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_flag_predicates() {
        assert!(TcpFlags::SYN.is_syn_only());
        assert!(!(TcpFlags::SYN | TcpFlags::ACK).is_syn_only());
        assert!((TcpFlags::SYN | TcpFlags::ACK).is_syn_ack());
        assert!(!(TcpFlags::SYN | TcpFlags::ACK | TcpFlags::RST).is_syn_ack());
        assert!((TcpFlags::RST | TcpFlags::ACK).is_rst());
    }

    #[test]
    fn active_escalation() {
        let mut act = Active::default();
        act.retry_packet();
        assert!(act.packet_retry_requested());
        // a drop outranks a pending retry
        act.drop_packet();
        assert!(!act.packet_retry_requested());
        assert!(act.packet_was_dropped());
        // retry cannot downgrade a drop
        act.retry_packet();
        assert!(act.packet_was_dropped());
    }

    #[test]
    fn active_block_again_marks_session() {
        let mut act = Active::default();
        act.block_again();
        assert!(act.session_was_blocked());
        assert!(act.packet_was_dropped());
    }
}
