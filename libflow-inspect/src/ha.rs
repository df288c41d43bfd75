use crate::flow_cache::FlowCache;
use crate::flow_key::FlowKey;
use crate::flow::Flow;
use crate::packet::Packet;

/// High-availability sidecar interface.
///
/// A deployment pairing two engines can import flows handed over by the
/// peer, push state updates after each verdict, and park standby flows that
/// the peer currently owns (standby flows are exempt from timeout).
pub trait HighAvailability: Send {
    /// The peer may own this flow; import it into the cache on a miss.
    /// Returns the bound arena slot when an import happened.
    fn import(&mut self, p: &mut Packet, key: &FlowKey, cache: &mut FlowCache) -> Option<usize> {
        let _ = (p, key, cache);
        None
    }

    /// Report post-verdict flow state to the peer
    fn process_update(&mut self, flow: Option<&mut Flow>, p: &Packet) {
        let _ = (flow, p);
    }

    /// Drain pending messages from the peer
    fn process_receive(&mut self) {}

    /// Whether the peer currently owns this flow. The cache consults the
    /// flow's standby flag directly during timeout scans; implementations
    /// keep that flag in sync.
    fn in_standby(&self, flow: &Flow) -> bool {
        flow.ha_standby
    }
}

/// Standalone deployment: no peer, every hook is a no-op
#[derive(Default)]
pub struct NoHa;

impl HighAvailability for NoHa {}
