use crate::packet::{DecodeFlags, Packet, PktType};
use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// Canonical flow identifier.
///
/// The two endpoints are stored in a fixed order chosen at build time, so a
/// packet and its reply hash and compare as the same key; flow control
/// recovers the original direction from the packet when assigning roles.
///
/// Tenancy separators (`vlan_id`, `mpls_label`, `address_space_id`) are part
/// of the key; zero means "not present".
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub struct FlowKey {
    pub pkt_type: PktType,
    pub ip_proto: u8,
    pub addr_lo: IpAddr,
    pub port_lo: u16,
    pub addr_hi: IpAddr,
    pub port_hi: u16,
    pub vlan_id: u16,
    pub mpls_label: u32,
    pub address_space_id: u16,
}

impl Default for FlowKey {
    fn default() -> Self {
        FlowKey {
            pkt_type: PktType::Ip,
            ip_proto: 0,
            addr_lo: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_lo: 0,
            addr_hi: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_hi: 0,
            vlan_id: 0,
            mpls_label: 0,
            address_space_id: 0,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{} <-> {}:{} [{:?}/{}]",
            self.addr_lo, self.port_lo, self.addr_hi, self.port_hi, self.pkt_type, self.ip_proto
        )
    }
}

impl FlowKey {
    /// Build a canonical key from an endpoint pair
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        pkt_type: PktType,
        ip_proto: u8,
        src: IpAddr,
        sp: u16,
        dst: IpAddr,
        dp: u16,
        vlan_id: u16,
        mpls_label: u32,
        address_space_id: u16,
    ) -> FlowKey {
        let ((addr_lo, port_lo), (addr_hi, port_hi)) = if (src, sp) <= (dst, dp) {
            ((src, sp), (dst, dp))
        } else {
            ((dst, dp), (src, sp))
        };
        FlowKey {
            pkt_type,
            ip_proto,
            addr_lo,
            port_lo,
            addr_hi,
            port_hi,
            vlan_id,
            mpls_label,
            address_space_id,
        }
    }

    /// Build the key for a decoded packet.
    ///
    /// Fragments key on the IP ID instead of ports (the transport header may
    /// be absent); the ID belongs to the datagram, not an endpoint, so it is
    /// placed after address ordering. ICMP keys on the message type.
    pub fn from_packet(p: &Packet) -> FlowKey {
        if p.decode_flags.contains(DecodeFlags::FRAG) {
            let mut key = FlowKey::init(
                p.pkt_type,
                p.ip_proto,
                p.src,
                0,
                p.dst,
                0,
                p.vlan_id,
                p.mpls_label,
                p.address_space_id,
            );
            key.port_lo = p.ip_id;
            return key;
        }
        let (sp, dp) = if p.pkt_type == PktType::Icmp {
            (u16::from(p.icmp_type), 0)
        } else {
            (p.sp, p.dp)
        };
        FlowKey::init(
            p.pkt_type,
            p.ip_proto,
            p.src,
            sp,
            p.dst,
            dp,
            p.vlan_id,
            p.mpls_label,
            p.address_space_id,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn key_is_direction_agnostic() {
        let k1 = FlowKey::init(PktType::Tcp, 6, ip(10, 0, 0, 1), 1000, ip(10, 0, 0, 2), 80, 0, 0, 0);
        let k2 = FlowKey::init(PktType::Tcp, 6, ip(10, 0, 0, 2), 80, ip(10, 0, 0, 1), 1000, 0, 0, 0);
        assert_eq!(k1, k2);
    }

    #[test]
    fn tenancy_separates_keys() {
        let k1 = FlowKey::init(PktType::Udp, 17, ip(10, 0, 0, 1), 53, ip(10, 0, 0, 2), 53, 0, 0, 0);
        let k2 = FlowKey::init(PktType::Udp, 17, ip(10, 0, 0, 1), 53, ip(10, 0, 0, 2), 53, 7, 0, 0);
        let k3 = FlowKey::init(PktType::Udp, 17, ip(10, 0, 0, 1), 53, ip(10, 0, 0, 2), 53, 0, 0, 9);
        assert_ne!(k1, k2);
        assert_ne!(k1, k3);
        assert_ne!(k2, k3);
    }

    #[test]
    fn same_port_pair_keys_on_address() {
        let k1 = FlowKey::init(PktType::Udp, 17, ip(10, 0, 0, 9), 500, ip(10, 0, 0, 1), 500, 0, 0, 0);
        let k2 = FlowKey::init(PktType::Udp, 17, ip(10, 0, 0, 1), 500, ip(10, 0, 0, 9), 500, 0, 0, 0);
        assert_eq!(k1, k2);
        assert_eq!(k1.addr_lo, ip(10, 0, 0, 1));
    }

    #[test]
    fn fragment_keys_on_ip_id() {
        let mut p = Packet::default();
        p.pkt_type = PktType::Ip;
        p.ip_proto = 6;
        p.src = ip(10, 0, 0, 1);
        p.dst = ip(10, 0, 0, 2);
        p.sp = 1000;
        p.dp = 80;
        p.ip_id = 0xbeef;
        p.decode_flags |= DecodeFlags::FRAG;
        let key = FlowKey::from_packet(&p);
        assert_eq!(key.port_lo, 0xbeef);
        assert_eq!(key.port_hi, 0);

        // a later fragment with no transport header maps to the same key
        let mut p2 = Packet::default();
        p2.pkt_type = PktType::Ip;
        p2.ip_proto = 6;
        p2.src = ip(10, 0, 0, 2);
        p2.dst = ip(10, 0, 0, 1);
        p2.ip_id = 0xbeef;
        p2.decode_flags |= DecodeFlags::FRAG;
        assert_eq!(key, FlowKey::from_packet(&p2));
    }

    #[test]
    fn icmp_keys_on_message_type() {
        let mut p = Packet::default();
        p.pkt_type = PktType::Icmp;
        p.ip_proto = 1;
        p.src = ip(10, 0, 0, 1);
        p.dst = ip(10, 0, 0, 2);
        p.icmp_type = 8;
        let key = FlowKey::from_packet(&p);
        assert_eq!(key.port_lo.max(key.port_hi), 8);
    }
}
