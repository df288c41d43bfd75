use crate::flow::Flow;
use crate::packet::{Direction, Packet};
use std::any::Any;
use std::net::IpAddr;

/// Per-protocol state attached to a flow by its session plugin.
///
/// The session never holds a reference back to its flow; callbacks receive
/// the flow explicitly (the flow takes the session out of its slot for the
/// duration of the call).
pub trait Session: Send {
    /// Called for every packet, before state dispatch
    fn precheck(&mut self, flow: &mut Flow, p: &mut Packet);

    /// Called once on the first packet of the flow. Returning false declines
    /// the session (no client side, unsupported variant); the flow is then
    /// allowed without inspection.
    fn setup(&mut self, flow: &mut Flow, p: &mut Packet) -> bool {
        let _ = (flow, p);
        true
    }

    /// Roles were corrected after the fact (e.g. expected flow matched)
    fn update_direction(&mut self, flow: &mut Flow, dir: Direction, ip: IpAddr, port: u16) {
        let _ = (flow, dir, ip, port);
    }

    /// Clear state for slot reuse; the session object survives
    fn reset(&mut self) {}

    /// Final teardown; the session object is dropped after this
    fn term(&mut self, flow: &mut Flow) {
        let _ = flow;
    }
}

/// Factory producing a session for a freshly initialized flow
pub type SessionFactory = Box<dyn Fn(&Flow) -> Box<dyn Session> + Send>;

/// Opaque per-flow state owned by inspectors and carried by the flow.
///
/// Identified by a plugin-assigned id; one entry per id per flow.
pub trait FlowData: Send {
    fn id(&self) -> u64;

    /// An expect-cache reservation carrying this data just matched `p`
    fn handle_expected(&mut self, p: &mut Packet) {
        let _ = p;
    }

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Session that tracks nothing; used for passthrough protocols and tests
#[derive(Default)]
pub struct NullSession;

impl Session for NullSession {
    fn precheck(&mut self, _flow: &mut Flow, _p: &mut Packet) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TagData {
        tag: u32,
    }

    impl FlowData for TagData {
        fn id(&self) -> u64 {
            42
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn flow_data_downcast() {
        let mut fd: Box<dyn FlowData> = Box::new(TagData { tag: 7 });
        assert_eq!(fd.id(), 42);
        let tag = fd
            .as_any_mut()
            .downcast_mut::<TagData>()
            .expect("downcast")
            .tag;
        assert_eq!(tag, 7);
    }
}
