use crate::capture::{MsgType, Verdict};
use crate::packet::Packet;
use multimap::MultiMap;

// Event names published by the core.
pub const FLOW_STATE_SETUP_EVENT: &str = "flow.state_setup";
pub const STREAM_IP_NEW_FLOW_EVENT: &str = "stream.ip_new_flow";
pub const STREAM_UDP_NEW_FLOW_EVENT: &str = "stream.udp_new_flow";
pub const STREAM_ICMP_NEW_FLOW_EVENT: &str = "stream.icmp_new_flow";
pub const STREAM_TCP_SYN_EVENT: &str = "stream.tcp_syn";
pub const STREAM_TCP_SYN_ACK_EVENT: &str = "stream.tcp_syn_ack";
pub const STREAM_TCP_MIDSTREAM_EVENT: &str = "stream.tcp_midstream";
pub const FINALIZE_PACKET_EVENT: &str = "analyzer.finalize_packet";
pub const THREAD_IDLE_EVENT: &str = "analyzer.thread_idle";
pub const THREAD_ROTATE_EVENT: &str = "analyzer.thread_rotate";
pub const DAQ_META_EVENT: &str = "analyzer.daq_meta";

/// Payload handed to event observers
pub enum Event<'a> {
    /// no payload (thread lifecycle events)
    Signal,
    Packet(&'a Packet),
    FinalizePacket { packet: &'a Packet, verdict: Verdict },
    DaqMeta { msg_type: MsgType, data: &'a [u8] },
}

pub type EventHandler = Box<dyn FnMut(&Event) + Send>;

/// In-process publish/subscribe bus, one instance per packet thread.
///
/// Observers register under an event name; publishing runs every handler
/// registered for that name, in registration order.
#[derive(Default)]
pub struct DataBus {
    handlers: MultiMap<&'static str, EventHandler>,
}

impl DataBus {
    pub fn new() -> Self {
        DataBus::default()
    }

    pub fn subscribe(&mut self, name: &'static str, handler: EventHandler) {
        self.handlers.insert(name, handler);
    }

    pub fn publish(&mut self, name: &'static str, event: &Event) {
        if let Some(list) = self.handlers.get_vec_mut(name) {
            for handler in list.iter_mut() {
                handler(event);
            }
        }
    }

    /// Number of handlers registered for an event name
    pub fn num_subscribers(&self, name: &'static str) -> usize {
        self.handlers.get_vec(name).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn publish_reaches_all_subscribers_for_name() {
        let mut bus = DataBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let hits = hits.clone();
            bus.subscribe(
                THREAD_IDLE_EVENT,
                Box::new(move |_| {
                    hits.fetch_add(1, Ordering::Relaxed);
                }),
            );
        }
        let other = hits.clone();
        bus.subscribe(
            THREAD_ROTATE_EVENT,
            Box::new(move |_| {
                other.fetch_add(100, Ordering::Relaxed);
            }),
        );

        bus.publish(THREAD_IDLE_EVENT, &Event::Signal);
        assert_eq!(hits.load(Ordering::Relaxed), 2);
        bus.publish(THREAD_ROTATE_EVENT, &Event::Signal);
        assert_eq!(hits.load(Ordering::Relaxed), 102);
        // publishing an event nobody subscribed to is fine
        bus.publish(DAQ_META_EVENT, &Event::Signal);
    }
}
