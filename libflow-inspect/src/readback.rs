use crate::capture::{
    Capture, CaptureMsg, Interruptor, MsgFlags, MsgType, PktHdr, RecvStatus, Verdict, VERDICT_MAX,
};
use crate::packet::{DecodeFlags, Decoder, Packet, PktType, TcpFlags};
use libflow_tools::{Error, PktTime};
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::*;
use pnet_packet::ethernet::{EtherTypes, EthernetPacket};
use pnet_packet::icmp::IcmpPacket;
use pnet_packet::icmpv6::Icmpv6Packet;
use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet_packet::ipv4::{Ipv4Flags, Ipv4Packet};
use pnet_packet::ipv6::Ipv6Packet;
use pnet_packet::tcp::{TcpOptionNumbers, TcpPacket};
use pnet_packet::udp::UdpPacket;
use pnet_packet::vlan::VlanPacket;
use pnet_packet::Packet as _;
use std::collections::VecDeque;
use std::io::{Cursor, Read};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const BUFFER_CAPACITY: usize = 1024 * 1024;

/// Interrupt token shared with other threads
#[derive(Default)]
struct InterruptFlag {
    raised: AtomicBool,
}

impl InterruptFlag {
    fn take(&self) -> bool {
        self.raised.swap(false, Ordering::AcqRel)
    }
}

impl Interruptor for InterruptFlag {
    fn interrupt(&self) {
        self.raised.store(true, Ordering::Release);
    }
}

#[derive(Clone)]
struct IfaceInfo {
    linktype: i32,
    if_tsresol: u8,
    if_tsoffset: u64,
}

type ChainedInput = std::io::Chain<Cursor<Vec<u8>>, Box<dyn Read + Send>>;

enum PcapReader {
    Legacy(LegacyPcapReader<ChainedInput>),
    Ng(PcapNGReader<ChainedInput>),
}

impl PcapReader {
    fn next(&mut self) -> Result<(usize, PcapBlockOwned), PcapError<&[u8]>> {
        match self {
            PcapReader::Legacy(r) => r.next(),
            PcapReader::Ng(r) => r.next(),
        }
    }

    fn consume(&mut self, offset: usize) {
        match self {
            PcapReader::Legacy(r) => r.consume(offset),
            PcapReader::Ng(r) => r.consume(offset),
        }
    }

    fn refill(&mut self) -> Result<(), String> {
        match self {
            PcapReader::Legacy(r) => r.refill().map_err(|e| format!("{:?}", e)),
            PcapReader::Ng(r) => r.refill().map_err(|e| format!("{:?}", e)),
        }
    }
}

fn pcapng_iface(idb: &InterfaceDescriptionBlock) -> IfaceInfo {
    let mut if_tsresol: u8 = 6;
    let mut if_tsoffset: u64 = 0;
    for opt in idb.options.iter() {
        match opt.code {
            OptionCode::IfTsresol => {
                let v = opt.value.as_ref();
                if !v.is_empty() {
                    if_tsresol = v[0];
                }
            }
            OptionCode::IfTsoffset => {
                let v = opt.value.as_ref();
                if v.len() >= 8 {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(&v[..8]);
                    if_tsoffset = u64::from_le_bytes(bytes);
                }
            }
            _ => (),
        }
    }
    IfaceInfo {
        linktype: idb.linktype.0,
        if_tsresol,
        if_tsoffset,
    }
}

fn build_ts(ts_high: u32, ts_low: u32, tsoffset: u64, tsresol: u8) -> PktTime {
    let ts = (u64::from(ts_high) << 32) | u64::from(ts_low);
    let unit: u64 = if tsresol & 0x80 != 0 {
        1u64 << (tsresol & 0x7f)
    } else {
        10u64.pow(u32::from(tsresol.min(9)))
    };
    if unit == 0 {
        return PktTime::default();
    }
    let secs = tsoffset.wrapping_add(ts / unit);
    let frac = ts % unit;
    let micros = if unit >= 1_000_000 {
        frac / (unit / 1_000_000)
    } else {
        frac * (1_000_000 / unit)
    };
    PktTime::new(secs as u32, micros as u32)
}

/// File readback capture driver.
///
/// Reads a pcap or pcap-ng stream and serves its packets through the
/// capture interface. Verdicts are counted rather than acted on (there is
/// no wire to forward to) and injection is a counter for the same reason.
pub struct ReadbackCapture {
    input: Option<Box<dyn Read + Send>>,
    reader: Option<PcapReader>,
    interrupt: Arc<InterruptFlag>,
    queue: VecDeque<CaptureMsg>,
    interfaces: Vec<IfaceInfo>,
    started: bool,
    eof: bool,
    seq: u64,
    block_index: usize,
    last_incomplete: usize,
    batch: usize,
    pool: usize,
    last_error: String,
    pub verdict_counts: [u64; VERDICT_MAX],
    pub injected: u64,
}

impl ReadbackCapture {
    pub fn new(input: Box<dyn Read + Send>) -> Self {
        ReadbackCapture {
            input: Some(input),
            reader: None,
            interrupt: Arc::new(InterruptFlag::default()),
            queue: VecDeque::new(),
            interfaces: Vec::new(),
            started: false,
            eof: false,
            seq: 0,
            block_index: 0,
            last_incomplete: usize::MAX,
            batch: 64,
            pool: 256,
            last_error: String::new(),
            verdict_counts: [0; VERDICT_MAX],
            injected: 0,
        }
    }

    /// Handle one parsed block; returns a message for packet blocks
    fn handle_block(&mut self, block: PcapBlockOwned) -> Option<CaptureMsg> {
        match block {
            PcapBlockOwned::LegacyHeader(ref hdr) => {
                debug!("legacy pcap, link type {}", hdr.network);
                self.interfaces.push(IfaceInfo {
                    linktype: hdr.network.0,
                    if_tsresol: 6,
                    if_tsoffset: 0,
                });
                None
            }
            PcapBlockOwned::Legacy(ref b) => {
                let linktype = self.interfaces.first()?.linktype;
                let caplen = (b.caplen as usize).min(b.data.len());
                Some(self.make_msg(
                    PktTime::new(b.ts_sec, b.ts_usec),
                    b.caplen,
                    b.origlen,
                    0,
                    linktype,
                    &b.data[..caplen],
                ))
            }
            PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                debug!("pcap-ng: new section");
                self.interfaces.clear();
                None
            }
            PcapBlockOwned::NG(Block::InterfaceDescription(ref idb)) => {
                self.interfaces.push(pcapng_iface(idb));
                None
            }
            PcapBlockOwned::NG(Block::EnhancedPacket(ref epb)) => {
                let iface = self.interfaces.get(epb.if_id as usize)?.clone();
                let ts = build_ts(epb.ts_high, epb.ts_low, iface.if_tsoffset, iface.if_tsresol);
                let caplen = (epb.caplen as usize).min(epb.data.len());
                Some(self.make_msg(
                    ts,
                    epb.caplen,
                    epb.origlen,
                    epb.if_id,
                    iface.linktype,
                    &epb.data[..caplen],
                ))
            }
            PcapBlockOwned::NG(Block::SimplePacket(ref spb)) => {
                let iface = self.interfaces.first()?.clone();
                let caplen = spb.data.len() as u32;
                Some(self.make_msg(
                    PktTime::default(),
                    caplen,
                    spb.origlen,
                    0,
                    iface.linktype,
                    spb.data,
                ))
            }
            PcapBlockOwned::NG(_) => None,
        }
    }

    fn receive_loop(&mut self, reader: &mut PcapReader, max: usize) -> RecvStatus {
        let mut received = 0;
        while received < max {
            match reader.next() {
                Ok((offset, block)) => {
                    self.block_index += 1;
                    if let Some(msg) = self.handle_block(block) {
                        self.queue.push_back(msg);
                        received += 1;
                    }
                    reader.consume(offset);
                }
                Err(PcapError::Eof) => {
                    self.eof = true;
                    break;
                }
                Err(PcapError::Incomplete) => {
                    if self.last_incomplete == self.block_index {
                        warn!("incomplete data block; input may be truncated");
                        self.eof = true;
                        break;
                    }
                    self.last_incomplete = self.block_index;
                    if let Err(e) = reader.refill() {
                        self.last_error = e;
                        return RecvStatus::Error;
                    }
                }
                Err(e) => {
                    self.last_error = format!("{:?}", e);
                    return RecvStatus::Error;
                }
            }
        }

        if received == 0 && self.queue.is_empty() && self.eof {
            RecvStatus::Eof
        } else {
            RecvStatus::Ok
        }
    }

    fn make_msg(
        &mut self,
        ts: PktTime,
        caplen: u32,
        origlen: u32,
        interface: u32,
        linktype: i32,
        data: &[u8],
    ) -> CaptureMsg {
        self.seq += 1;
        CaptureMsg {
            msg_type: MsgType::Packet,
            hdr: PktHdr {
                ts,
                caplen,
                origlen,
                flags: MsgFlags::empty(),
                address_space_id: 0,
                interface,
                linktype,
            },
            data: data.to_vec(),
            seq: self.seq,
        }
    }
}

impl Capture for ReadbackCapture {
    fn start(&mut self) -> Result<(), Error> {
        let mut input = self
            .input
            .take()
            .ok_or_else(|| Error::Capture("instance already started".to_owned()))?;
        // peek the magic to pick the reader flavor, then hand the bytes back
        let mut magic = [0u8; 4];
        input.read_exact(&mut magic)?;
        let chained = Cursor::new(magic.to_vec()).chain(input);
        let reader = match magic {
            [0x0a, 0x0d, 0x0d, 0x0a] => PcapReader::Ng(
                PcapNGReader::new(BUFFER_CAPACITY, chained).map_err(Error::from)?,
            ),
            _ => PcapReader::Legacy(
                LegacyPcapReader::new(BUFFER_CAPACITY, chained).map_err(Error::from)?,
            ),
        };
        self.reader = Some(reader);
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.reader = None;
        self.started = false;
    }

    fn was_started(&self) -> bool {
        self.started
    }

    fn interruptor(&self) -> Arc<dyn Interruptor> {
        self.interrupt.clone()
    }

    fn receive_messages(&mut self, max: usize) -> RecvStatus {
        if !self.started {
            self.last_error = "receive on stopped instance".to_owned();
            return RecvStatus::Error;
        }
        if self.interrupt.take() {
            return RecvStatus::Interrupted;
        }
        if self.eof {
            return RecvStatus::Eof;
        }
        // parsed blocks borrow the reader's buffer, so the reader steps out
        // of self while messages are copied off
        let mut reader = match self.reader.take() {
            Some(r) => r,
            None => return RecvStatus::Error,
        };
        let status = self.receive_loop(&mut reader, max);
        self.reader = Some(reader);
        status
    }

    fn next_message(&mut self) -> Option<CaptureMsg> {
        self.queue.pop_front()
    }

    fn finalize_message(&mut self, msg: CaptureMsg, verdict: Verdict) {
        trace!("finalize msg {} verdict {}", msg.seq, verdict.name());
        self.verdict_counts[verdict.index()] += 1;
    }

    fn inject(&mut self, _msg: &CaptureMsg, _flags: u32, _payload: &[u8]) -> Result<(), Error> {
        self.injected += 1;
        Ok(())
    }

    fn batch_size(&self) -> usize {
        self.batch
    }

    fn pool_size(&self) -> usize {
        self.pool
    }

    fn error(&self) -> String {
        self.last_error.clone()
    }

    fn pegs(&self) -> Vec<(String, u64)> {
        let mut pegs: Vec<(String, u64)> = Verdict::all()
            .iter()
            .map(|v| (format!("verdict_{}", v.name()), self.verdict_counts[v.index()]))
            .collect();
        pegs.push(("injected".to_owned(), self.injected));
        pegs
    }
}

// ---- decoding --------------------------------------------------------

const DLT_NULL: i32 = 0;
const DLT_EN10MB: i32 = 1;
const DLT_RAW: i32 = 101;
const DLT_LOOP: i32 = 108;
const ETHERTYPE_MPLS: u16 = 0x8847;
const ETHERTYPE_MPLS_MCAST: u16 = 0x8848;

/// Ethernet/IP decoder for readback and live drivers that present L2 frames
pub struct EthDecoder;

impl Decoder for EthDecoder {
    fn decode(&self, hdr: &PktHdr, data: &[u8], _retry: bool, p: &mut Packet) -> Result<(), Error> {
        p.ts = hdr.ts;
        p.pktlen = hdr.origlen;
        p.address_space_id = hdr.address_space_id;
        match hdr.linktype {
            DLT_EN10MB => decode_ethernet(data, p),
            DLT_RAW => decode_ip_version(data, p),
            DLT_NULL | DLT_LOOP => {
                if data.len() <= 4 {
                    return Err(Error::Generic("short null-link packet"));
                }
                decode_ip_version(&data[4..], p)
            }
            _ => Err(Error::Generic("unsupported link type")),
        }
    }
}

fn decode_ethernet(data: &[u8], p: &mut Packet) -> Result<(), Error> {
    let eth = EthernetPacket::new(data).ok_or(Error::Generic("short ethernet frame"))?;
    let mut ethertype = eth.get_ethertype();
    let mut payload = &data[14..];

    if ethertype == EtherTypes::Vlan {
        let vlan = VlanPacket::new(payload).ok_or(Error::Generic("short vlan header"))?;
        p.vlan_id = vlan.get_vlan_identifier();
        p.decode_flags |= DecodeFlags::VLAN;
        ethertype = vlan.get_ethertype();
        payload = &payload[4..];
    }

    if ethertype.0 == ETHERTYPE_MPLS || ethertype.0 == ETHERTYPE_MPLS_MCAST {
        payload = decode_mpls(payload, p)?;
        return decode_ip_version(payload, p);
    }

    match ethertype {
        EtherTypes::Ipv4 => decode_ipv4(payload, p),
        EtherTypes::Ipv6 => decode_ipv6(payload, p),
        t => {
            trace!("ignoring ethertype 0x{:04x}", t.0);
            Err(Error::Generic("unhandled ethertype"))
        }
    }
}

/// Walk the MPLS label stack; the top label keys the flow
fn decode_mpls<'a>(data: &'a [u8], p: &mut Packet) -> Result<&'a [u8], Error> {
    let mut rest = data;
    let mut top = true;
    loop {
        if rest.len() < 4 {
            return Err(Error::Generic("short mpls stack"));
        }
        let label = (u32::from(rest[0]) << 12) | (u32::from(rest[1]) << 4) | u32::from(rest[2] >> 4);
        let bottom = rest[2] & 0x01 != 0;
        if top {
            p.mpls_label = label;
            p.decode_flags |= DecodeFlags::MPLS;
            top = false;
        }
        rest = &rest[4..];
        if bottom {
            return Ok(rest);
        }
    }
}

fn decode_ip_version(data: &[u8], p: &mut Packet) -> Result<(), Error> {
    match data.first().map(|b| b >> 4) {
        Some(4) => decode_ipv4(data, p),
        Some(6) => decode_ipv6(data, p),
        _ => Err(Error::Generic("unknown ip version")),
    }
}

fn decode_ipv4(data: &[u8], p: &mut Packet) -> Result<(), Error> {
    let ipv4 = Ipv4Packet::new(data).ok_or(Error::Generic("short ipv4 header"))?;
    p.src = IpAddr::V4(ipv4.get_source());
    p.dst = IpAddr::V4(ipv4.get_destination());
    p.ip_id = ipv4.get_identification();

    let fragmented = ipv4.get_flags() & Ipv4Flags::MoreFragments != 0 || ipv4.get_fragment_offset() > 0;
    let proto = ipv4.get_next_level_protocol();
    p.ip_proto = proto.0;

    // trim padding below the IP total length
    let total = ipv4.get_total_length() as usize;
    let header = usize::from(ipv4.get_header_length()) * 4;
    let l4_data = if total >= header && total <= data.len() {
        &data[header..total]
    } else if data.len() > header {
        &data[header..]
    } else {
        &[]
    };

    if fragmented {
        // transport header may be absent; fragments key on the IP ID
        p.decode_flags |= DecodeFlags::FRAG;
        p.pkt_type = PktType::Ip;
        p.payload_len = l4_data.len() as u32;
        return Ok(());
    }
    decode_transport(proto, l4_data, p)
}

fn decode_ipv6(data: &[u8], p: &mut Packet) -> Result<(), Error> {
    let ipv6 = Ipv6Packet::new(data).ok_or(Error::Generic("short ipv6 header"))?;
    p.src = IpAddr::V6(ipv6.get_source());
    p.dst = IpAddr::V6(ipv6.get_destination());
    let proto = ipv6.get_next_header();
    p.ip_proto = proto.0;
    decode_transport(proto, ipv6.payload(), p)
}

fn decode_transport(proto: IpNextHeaderProtocol, data: &[u8], p: &mut Packet) -> Result<(), Error> {
    match proto {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(data).ok_or(Error::Generic("short tcp header"))?;
            p.pkt_type = PktType::Tcp;
            p.sp = tcp.get_source();
            p.dp = tcp.get_destination();
            p.tcp_flags = tcp_flags(tcp.get_flags() as u8);
            for opt in tcp.get_options_iter() {
                if opt.get_number() == TcpOptionNumbers::WSCALE {
                    p.decode_flags |= DecodeFlags::WSCALE;
                }
            }
            let offset = usize::from(tcp.get_data_offset()) * 4;
            p.payload_len = data.len().saturating_sub(offset) as u32;
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(data).ok_or(Error::Generic("short udp header"))?;
            p.pkt_type = PktType::Udp;
            p.sp = udp.get_source();
            p.dp = udp.get_destination();
            p.payload_len = data.len().saturating_sub(8) as u32;
        }
        IpNextHeaderProtocols::Icmp => {
            let icmp = IcmpPacket::new(data).ok_or(Error::Generic("short icmp header"))?;
            p.pkt_type = PktType::Icmp;
            p.icmp_type = icmp.get_icmp_type().0;
            p.payload_len = data.len().saturating_sub(8) as u32;
        }
        IpNextHeaderProtocols::Icmpv6 => {
            let icmp = Icmpv6Packet::new(data).ok_or(Error::Generic("short icmpv6 header"))?;
            p.pkt_type = PktType::Icmp;
            p.icmp_type = icmp.get_icmpv6_type().0;
            p.payload_len = data.len().saturating_sub(8) as u32;
        }
        _ => {
            p.pkt_type = PktType::Ip;
            p.payload_len = data.len() as u32;
        }
    }
    Ok(())
}

fn tcp_flags(raw: u8) -> TcpFlags {
    TcpFlags::from_bits_truncate(raw)
}
