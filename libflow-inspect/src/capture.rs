use bitflags::bitflags;
use libflow_tools::{Error, PktTime};
use serde::Serialize;
use std::sync::Arc;

/// Result of a batched receive on the capture driver
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvStatus {
    Ok,
    WouldBlock,
    Timeout,
    Interrupted,
    NoBuf,
    Error,
    Eof,
    Invalid,
}

/// Forwarding decision returned to the capture driver for each message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[repr(usize)]
pub enum Verdict {
    Pass,
    Block,
    Replace,
    Whitelist,
    Blacklist,
    Ignore,
    Retry,
}

pub const VERDICT_MAX: usize = 7;

impl Verdict {
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn all() -> [Verdict; VERDICT_MAX] {
        [
            Verdict::Pass,
            Verdict::Block,
            Verdict::Replace,
            Verdict::Whitelist,
            Verdict::Blacklist,
            Verdict::Ignore,
            Verdict::Retry,
        ]
    }

    pub fn name(self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::Block => "block",
            Verdict::Replace => "replace",
            Verdict::Whitelist => "whitelist",
            Verdict::Blacklist => "blacklist",
            Verdict::Ignore => "ignore",
            Verdict::Retry => "retry",
        }
    }
}

/// Capture message class
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgType {
    Packet,
    /// start-of-flow meta message
    Sof,
    /// end-of-flow meta message
    Eof,
    Other(u8),
}

bitflags! {
    /// Driver-provided facts about a message
    #[derive(Default)]
    pub struct MsgFlags: u32 {
        /// the driver asserts this packet starts a new flow
        const NEW_FLOW = 0x0001;
        /// packet was received decrypted from a tunnel
        const TUNNEL = 0x0002;
    }
}

/// Message header, shared by all message types
#[derive(Clone, Copy, Debug, Default)]
pub struct PktHdr {
    pub ts: PktTime,
    pub caplen: u32,
    pub origlen: u32,
    pub flags: MsgFlags,
    pub address_space_id: u16,
    pub interface: u32,
    /// pcap linktype of the payload (driver dependent)
    pub linktype: i32,
}

/// One message pulled from the capture driver.
///
/// Messages are owned values: custody moves from the driver to the analyzer,
/// possibly through the retry queue or a suspended context, and ends in
/// exactly one `finalize_message` call.
#[derive(Debug)]
pub struct CaptureMsg {
    pub msg_type: MsgType,
    pub hdr: PktHdr,
    pub data: Vec<u8>,
    /// driver-assigned message id, for diagnostics
    pub seq: u64,
}

/// Cross-thread handle used to break a blocking receive
pub trait Interruptor: Send + Sync {
    fn interrupt(&self);
}

/// The capture driver interface consumed by the analyzer.
///
/// Mirrors a batched acquisition API: `receive_messages` blocks for up to a
/// batch, `next_message` drains the batch, and every message must be returned
/// through `finalize_message` with a verdict.
pub trait Capture: Send {
    fn start(&mut self) -> Result<(), Error>;
    fn stop(&mut self);
    fn reload(&mut self) {}
    fn was_started(&self) -> bool;

    /// Handle that can break `receive_messages` from another thread
    fn interruptor(&self) -> Arc<dyn Interruptor>;

    fn receive_messages(&mut self, max: usize) -> RecvStatus;
    fn next_message(&mut self) -> Option<CaptureMsg>;
    fn finalize_message(&mut self, msg: CaptureMsg, verdict: Verdict);

    /// Inject a replacement payload for `msg` onto the wire
    fn inject(&mut self, msg: &CaptureMsg, flags: u32, payload: &[u8]) -> Result<(), Error>;

    /// Preferred receive batch size
    fn batch_size(&self) -> usize {
        64
    }

    /// Size of the driver message pool; bounds in-flight messages
    fn pool_size(&self) -> usize {
        256
    }

    fn can_run_unprivileged(&self) -> bool {
        true
    }

    /// Last driver error, for fatal logs
    fn error(&self) -> String {
        String::new()
    }

    /// Driver-side counters for the stats reporter
    fn pegs(&self) -> Vec<(String, u64)> {
        Vec::new()
    }
}
