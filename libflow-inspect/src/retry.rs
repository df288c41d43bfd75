use crate::capture::CaptureMsg;
use libflow_tools::PktTime;
use std::collections::VecDeque;

struct Entry {
    next_try: PktTime,
    msg: CaptureMsg,
}

/// FIFO of capture messages awaiting redelivery.
///
/// A fixed interval is applied uniformly, so deadlines are monotonic and
/// only the head ever needs checking. The analyzer drains the queue with
/// block verdicts before the queue is dropped.
pub struct RetryQueue {
    queue: VecDeque<Entry>,
    interval: PktTime,
}

impl RetryQueue {
    pub fn new(interval_ms: u32) -> Self {
        assert!(interval_ms > 0);
        RetryQueue {
            queue: VecDeque::new(),
            interval: PktTime::from_millis(interval_ms),
        }
    }

    /// Append a message, due `interval` from `now`
    pub fn put(&mut self, msg: CaptureMsg, now: PktTime) {
        self.queue.push_back(Entry {
            next_try: now + self.interval,
            msg,
        });
    }

    /// Pop the head if it is due at `now`; `None` for `now` ignores the
    /// deadline (shutdown drain).
    pub fn get(&mut self, now: Option<PktTime>) -> Option<CaptureMsg> {
        let due = match self.queue.front() {
            Some(entry) => match now {
                Some(now) => now >= entry.next_try,
                None => true,
            },
            None => return None,
        };
        if due {
            self.queue.pop_front().map(|e| e.msg)
        } else {
            None
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for RetryQueue {
    fn drop(&mut self) {
        // all custody must have been handed back before teardown
        debug_assert!(self.queue.is_empty(), "retry queue dropped with messages");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{MsgType, PktHdr};

    fn msg(seq: u64) -> CaptureMsg {
        CaptureMsg {
            msg_type: MsgType::Packet,
            hdr: PktHdr::default(),
            data: Vec::new(),
            seq,
        }
    }

    #[test]
    fn head_not_due_before_interval() {
        let mut q = RetryQueue::new(200);
        q.put(msg(1), PktTime::new(10, 0));
        // 199 ms later: not due
        assert!(q.get(Some(PktTime::new(10, 199_000))).is_none());
        // exactly 200 ms later: due
        let m = q.get(Some(PktTime::new(10, 200_000))).expect("due");
        assert_eq!(m.seq, 1);
        assert!(q.is_empty());
    }

    #[test]
    fn fifo_order_preserved() {
        let mut q = RetryQueue::new(100);
        q.put(msg(1), PktTime::new(1, 0));
        q.put(msg(2), PktTime::new(1, 50_000));
        q.put(msg(3), PktTime::new(2, 0));
        let late = PktTime::new(10, 0);
        assert_eq!(q.get(Some(late)).unwrap().seq, 1);
        assert_eq!(q.get(Some(late)).unwrap().seq, 2);
        assert_eq!(q.get(Some(late)).unwrap().seq, 3);
        assert!(q.get(Some(late)).is_none());
    }

    #[test]
    fn none_deadline_drains_unconditionally() {
        let mut q = RetryQueue::new(60_000);
        q.put(msg(1), PktTime::new(5, 0));
        assert!(q.get(Some(PktTime::new(5, 1))).is_none());
        assert_eq!(q.get(None).unwrap().seq, 1);
    }
}
