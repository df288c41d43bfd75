use crate::capture::{Capture, CaptureMsg, Verdict};
use crate::flow::Flow;
use crate::packet::{DecodeFlags, Packet, PacketFlags, SsnDir};
use crate::stats::AuxCounts;

/// Re-encode a packet whose payload was rewritten in place
fn encode_update(p: &mut Packet, msg: &mut CaptureMsg) {
    if let Some(buf) = p.rewritten.take() {
        msg.data = buf;
    }
}

/// Distill the per-packet active state, packet flags, and flow state into a
/// single forwarding verdict. Runs exactly once per finalized packet.
pub fn distill_verdict(
    p: &mut Packet,
    mut flow: Option<&mut Flow>,
    msg: &mut CaptureMsg,
    capture: &mut dyn Capture,
    allow_block: bool,
    inline_mode: bool,
    counts: &mut AuxCounts,
) -> Verdict {
    let mut verdict = Verdict::Pass;

    // first pass
    if p.active.packet_retry_requested() {
        verdict = Verdict::Retry;
    } else if p.active.session_was_blocked() {
        if !allow_block {
            verdict = Verdict::Pass;
        } else if p.active.get_tunnel_bypass() {
            counts.internal_blacklist += 1;
            verdict = Verdict::Block;
        } else if inline_mode || p.active.packet_force_dropped() {
            verdict = Verdict::Blacklist;
        } else {
            verdict = Verdict::Ignore;
        }
    }

    // second pass, now with side effects
    if p.active.packet_was_dropped() && allow_block {
        if verdict == Verdict::Pass {
            verdict = Verdict::Block;
        }
    } else if verdict == Verdict::Retry {
        // waits in the retry queue; nothing more to decide
    } else if p.packet_flags.contains(PacketFlags::RESIZED) {
        // payload was trimmed; the wire packet is dropped and the trimmed
        // copy injected in its place
        encode_update(p, msg);
        if capture.inject(msg, 0, &msg.data).is_ok() {
            verdict = Verdict::Block;
        }
    } else if p.packet_flags.contains(PacketFlags::MODIFIED) {
        encode_update(p, msg);
        verdict = Verdict::Replace;
    } else if p.packet_flags.contains(PacketFlags::IGNORE)
        || flow
            .as_deref()
            .map_or(false, |f| f.get_ignore_direction() == SsnDir::BOTH)
    {
        if !p.active.get_tunnel_bypass() {
            verdict = Verdict::Whitelist;
        } else {
            verdict = Verdict::Pass;
            counts.internal_whitelist += 1;
        }
    } else if p.decode_flags.contains(DecodeFlags::TRUST) {
        if let Some(f) = flow.as_deref_mut() {
            f.set_ignore_direction(SsnDir::BOTH);
        }
        verdict = Verdict::Whitelist;
    }

    verdict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Interruptor, MsgType, PktHdr, RecvStatus};
    use libflow_tools::Error;
    use std::sync::Arc;

    struct NullInterrupt;
    impl Interruptor for NullInterrupt {
        fn interrupt(&self) {}
    }

    #[derive(Default)]
    struct StubCapture {
        injected: Vec<Vec<u8>>,
    }

    impl Capture for StubCapture {
        fn start(&mut self) -> Result<(), Error> {
            Ok(())
        }
        fn stop(&mut self) {}
        fn was_started(&self) -> bool {
            true
        }
        fn interruptor(&self) -> Arc<dyn Interruptor> {
            Arc::new(NullInterrupt)
        }
        fn receive_messages(&mut self, _max: usize) -> RecvStatus {
            RecvStatus::Eof
        }
        fn next_message(&mut self) -> Option<CaptureMsg> {
            None
        }
        fn finalize_message(&mut self, _msg: CaptureMsg, _verdict: Verdict) {}
        fn inject(&mut self, _msg: &CaptureMsg, _flags: u32, payload: &[u8]) -> Result<(), Error> {
            self.injected.push(payload.to_vec());
            Ok(())
        }
    }

    fn msg() -> CaptureMsg {
        CaptureMsg {
            msg_type: MsgType::Packet,
            hdr: PktHdr::default(),
            data: vec![1, 2, 3],
            seq: 0,
        }
    }

    fn distill(p: &mut Packet, flow: Option<&mut Flow>, inline_mode: bool) -> Verdict {
        let mut capture = StubCapture::default();
        let mut counts = AuxCounts::default();
        let mut m = msg();
        distill_verdict(p, flow, &mut m, &mut capture, true, inline_mode, &mut counts)
    }

    #[test]
    fn default_is_pass() {
        let mut p = Packet::default();
        assert_eq!(distill(&mut p, None, false), Verdict::Pass);
    }

    #[test]
    fn retry_wins_over_everything() {
        let mut p = Packet::default();
        p.active.retry_packet();
        p.packet_flags |= PacketFlags::MODIFIED;
        assert_eq!(distill(&mut p, None, false), Verdict::Retry);
    }

    #[test]
    fn blocked_session_inline_is_blacklist() {
        let mut p = Packet::default();
        p.active.block_again();
        assert_eq!(distill(&mut p, None, true), Verdict::Blacklist);
    }

    #[test]
    fn blocked_session_passive_without_drop_is_ignore() {
        let mut p = Packet::default();
        p.active.block_session();
        assert_eq!(distill(&mut p, None, false), Verdict::Ignore);
    }

    #[test]
    fn blocked_session_readonly_is_pass() {
        let mut p = Packet::default();
        p.active.block_again();
        let mut capture = StubCapture::default();
        let mut counts = AuxCounts::default();
        let mut m = msg();
        let v = distill_verdict(&mut p, None, &mut m, &mut capture, false, true, &mut counts);
        assert_eq!(v, Verdict::Pass);
    }

    #[test]
    fn tunnel_bypass_downgrades_blacklist_to_block() {
        let mut p = Packet::default();
        p.active.block_again();
        p.active.set_tunnel_bypass();
        let mut capture = StubCapture::default();
        let mut counts = AuxCounts::default();
        let mut m = msg();
        let v = distill_verdict(&mut p, None, &mut m, &mut capture, true, true, &mut counts);
        assert_eq!(v, Verdict::Block);
        assert_eq!(counts.internal_blacklist, 1);
    }

    #[test]
    fn dropped_packet_upgrades_pass_to_block() {
        let mut p = Packet::default();
        p.active.drop_packet();
        assert_eq!(distill(&mut p, None, false), Verdict::Block);
    }

    #[test]
    fn resized_packet_is_injected_and_blocked() {
        let mut p = Packet::default();
        p.packet_flags |= PacketFlags::RESIZED;
        p.rewritten = Some(vec![9, 9]);
        let mut capture = StubCapture::default();
        let mut counts = AuxCounts::default();
        let mut m = msg();
        let v = distill_verdict(&mut p, None, &mut m, &mut capture, true, false, &mut counts);
        assert_eq!(v, Verdict::Block);
        assert_eq!(capture.injected, vec![vec![9, 9]]);
    }

    #[test]
    fn modified_packet_is_replaced() {
        let mut p = Packet::default();
        p.packet_flags |= PacketFlags::MODIFIED;
        p.rewritten = Some(vec![7]);
        let mut capture = StubCapture::default();
        let mut counts = AuxCounts::default();
        let mut m = msg();
        let v = distill_verdict(&mut p, None, &mut m, &mut capture, true, false, &mut counts);
        assert_eq!(v, Verdict::Replace);
        assert_eq!(m.data, vec![7]);
    }

    #[test]
    fn flow_ignoring_both_directions_is_whitelisted() {
        let mut p = Packet::default();
        let mut flow = Flow::default();
        flow.set_ignore_direction(SsnDir::BOTH);
        assert_eq!(distill(&mut p, Some(&mut flow), false), Verdict::Whitelist);
    }

    #[test]
    fn trust_latches_flow_and_whitelists() {
        let mut p = Packet::default();
        p.decode_flags |= DecodeFlags::TRUST;
        let mut flow = Flow::default();
        assert_eq!(distill(&mut p, Some(&mut flow), false), Verdict::Whitelist);
        assert_eq!(flow.get_ignore_direction(), SsnDir::BOTH);
    }

    #[test]
    fn tunnel_bypass_downgrades_whitelist_to_pass() {
        let mut p = Packet::default();
        p.packet_flags |= PacketFlags::IGNORE;
        p.active.set_tunnel_bypass();
        let mut capture = StubCapture::default();
        let mut counts = AuxCounts::default();
        let mut m = msg();
        let v = distill_verdict(&mut p, None, &mut m, &mut capture, true, false, &mut counts);
        assert_eq!(v, Verdict::Pass);
        assert_eq!(counts.internal_whitelist, 1);
    }
}
