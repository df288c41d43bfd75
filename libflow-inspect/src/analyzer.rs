use crate::bus::{DataBus, Event, DAQ_META_EVENT, FINALIZE_PACKET_EVENT, THREAD_IDLE_EVENT, THREAD_ROTATE_EVENT};
use crate::capture::{Capture, CaptureMsg, MsgType, RecvStatus, Verdict};
use crate::commands::AnalyzerCommand;
use crate::config::EngineConfig;
use crate::context_switcher::{ContextId, ContextSwitcher};
use crate::flow::Flow;
use crate::flow_control::FlowControl;
use crate::ha::HighAvailability;
use crate::packet::{Decoder, Packet, PacketFlags};
use crate::retry::RetryQueue;
use crate::stats::AuxCounts;
use crate::verdict::distill_verdict;
use crossbeam_channel::{unbounded, Receiver, Sender};
use libflow_tools::PktTime;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

/// Packet thread lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum State {
    New = 0,
    Initialized,
    Started,
    Running,
    Paused,
    Stopped,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::New,
            1 => State::Initialized,
            2 => State::Started,
            3 => State::Running,
            4 => State::Paused,
            _ => State::Stopped,
        }
    }
}

/// Result of the main inspection hook
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookResult {
    Complete,
    /// an inspector offloaded the packet; the context stays suspended and
    /// the message is not finalized yet
    Offloaded,
}

/// The main per-packet inspection hook (detection lives behind it).
///
/// An offloading hook keeps the context id and reports completion through
/// the analyzer's onload channel.
pub trait MainHook: Send {
    fn eval(&mut self, ctx_id: ContextId, p: &mut Packet, flow: Option<&mut Flow>) -> HookResult;
}

/// Hook that inspects nothing
pub struct IgnoreHook;

impl MainHook for IgnoreHook {
    fn eval(&mut self, _ctx_id: ContextId, _p: &mut Packet, _flow: Option<&mut Flow>) -> HookResult {
        HookResult::Complete
    }
}

/// Cross-thread face of an analyzer: command queues and observable state.
///
/// Everything here must stay safe to touch from the main thread while the
/// packet thread runs.
pub struct AnalyzerHandle {
    id: usize,
    state: AtomicU8,
    pending: Mutex<VecDeque<Box<dyn AnalyzerCommand>>>,
    completed: Mutex<Vec<Box<dyn AnalyzerCommand>>>,
    interruptor: Arc<dyn crate::capture::Interruptor>,
}

impl AnalyzerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn get_state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Post a command to the owning packet thread. Breaks the capture
    /// receive so the command is observed promptly.
    pub fn execute(&self, command: Box<dyn AnalyzerCommand>) {
        {
            let mut queue = self.pending.lock().expect("pending queue poisoned");
            queue.push_back(command);
        }
        let state = self.get_state();
        if state >= State::Started && state < State::Stopped {
            self.interruptor.interrupt();
        }
    }

    /// Drain commands the packet thread finished executing
    pub fn take_completed(&self) -> Vec<Box<dyn AnalyzerCommand>> {
        let mut queue = self.completed.lock().expect("completed queue poisoned");
        std::mem::take(&mut *queue)
    }
}

fn wall_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Per-thread packet analyzer: owns the capture instance, the flow state,
/// the retry queue, and the context pool. Driven by `analyze()` on its own
/// thread and steered from outside through the `AnalyzerHandle`.
pub struct Analyzer {
    handle: Arc<AnalyzerHandle>,
    config: Arc<EngineConfig>,
    capture: Box<dyn Capture>,
    decoder: Box<dyn Decoder>,
    hook: Box<dyn MainHook>,
    ha: Box<dyn HighAvailability>,
    flow_control: FlowControl,
    switcher: ContextSwitcher,
    retry_queue: RetryQueue,
    bus: DataBus,
    uncompleted: Vec<Box<dyn AnalyzerCommand>>,
    /// messages held by an inspector, finalized at teardown if never claimed
    held: Vec<CaptureMsg>,
    onload_tx: Sender<ContextId>,
    onload_rx: Receiver<ContextId>,
    poke: Option<Sender<(usize, State)>>,
    counts: AuxCounts,
    packet_time: PktTime,
    exit_requested: bool,
    skip_cnt: u64,
    exit_after_cnt: u64,
    pause_after_cnt: u64,
    source: String,
}

impl Analyzer {
    pub fn new(
        id: usize,
        config: Arc<EngineConfig>,
        capture: Box<dyn Capture>,
        decoder: Box<dyn Decoder>,
        hook: Box<dyn MainHook>,
        ha: Box<dyn HighAvailability>,
        source: &str,
    ) -> Analyzer {
        let handle = Arc::new(AnalyzerHandle {
            id,
            state: AtomicU8::new(State::New as u8),
            pending: Mutex::new(VecDeque::new()),
            completed: Mutex::new(Vec::new()),
            interruptor: capture.interruptor(),
        });
        let (onload_tx, onload_rx) = unbounded();
        let contexts = config.max_contexts.min(capture.pool_size());
        Analyzer {
            handle,
            flow_control: FlowControl::new(&config),
            switcher: ContextSwitcher::new(contexts),
            retry_queue: RetryQueue::new(config.retry_interval_ms),
            config,
            capture,
            decoder,
            hook,
            ha,
            bus: DataBus::new(),
            uncompleted: Vec::new(),
            held: Vec::new(),
            onload_tx,
            onload_rx,
            poke: None,
            counts: AuxCounts::default(),
            packet_time: PktTime::default(),
            exit_requested: false,
            skip_cnt: 0,
            exit_after_cnt: 0,
            pause_after_cnt: 0,
            source: source.to_owned(),
        }
    }

    pub fn handle(&self) -> Arc<AnalyzerHandle> {
        self.handle.clone()
    }

    pub fn flow_control(&self) -> &FlowControl {
        &self.flow_control
    }

    pub fn flow_control_mut(&mut self) -> &mut FlowControl {
        &mut self.flow_control
    }

    pub fn bus_mut(&mut self) -> &mut DataBus {
        &mut self.bus
    }

    pub fn counts(&self) -> &AuxCounts {
        &self.counts
    }

    /// Capture-driver counters (verdicts, injections, ...)
    pub fn capture_pegs(&self) -> Vec<(String, u64)> {
        self.capture.pegs()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Completion sender for offloading inspectors
    pub fn onload_sender(&self) -> Sender<ContextId> {
        self.onload_tx.clone()
    }

    /// Replace the main inspection hook (before the loop starts)
    pub fn set_hook(&mut self, hook: Box<dyn MainHook>) {
        self.hook = hook;
    }

    /// Channel notified on every state change
    pub fn set_poke(&mut self, poke: Sender<(usize, State)>) {
        self.poke = Some(poke);
    }

    pub fn set_skip_cnt(&mut self, count: u64) {
        self.skip_cnt = count;
    }

    pub fn set_exit_after_cnt(&mut self, count: u64) {
        self.exit_after_cnt = count;
    }

    pub fn set_pause_after_cnt(&mut self, count: u64) {
        self.pause_after_cnt = count;
    }

    pub fn get_state(&self) -> State {
        self.handle.get_state()
    }

    fn set_state(&mut self, state: State) {
        self.handle.set_state(state);
        if let Some(poke) = &self.poke {
            let _ = poke.send((self.handle.id, state));
        }
    }

    pub fn get_state_string(&self) -> &'static str {
        match self.get_state() {
            State::New => "NEW",
            State::Initialized => "INITIALIZED",
            State::Started => "STARTED",
            State::Running => "RUNNING",
            State::Paused => "PAUSED",
            State::Stopped => "STOPPED",
        }
    }

    // ---- thread entry ------------------------------------------------

    /// Run the analyzer to completion on the current thread
    pub fn exec(mut self) -> Analyzer {
        debug!("analyzer {} starting on {}", self.handle.id, self.source);
        self.set_state(State::Initialized);
        self.analyze();
        self.term();
        self.set_state(State::Stopped);
        self
    }

    /// Run the analyzer on its own packet thread; join to get it back for
    /// final stats.
    pub fn spawn(self) -> thread::JoinHandle<Analyzer> {
        let name = format!("analyzer {}", self.handle.id);
        thread::Builder::new()
            .name(name)
            .spawn(move || self.exec())
            .expect("spawn analyzer thread")
    }

    // ---- lifecycle ---------------------------------------------------

    pub fn start(&mut self) {
        debug_assert_eq!(self.get_state(), State::Initialized);
        if let Err(e) = self.capture.start() {
            error!("Analyzer: Failed to start capture instance: {}", e);
            self.exit_requested = true;
        }
        self.set_state(State::Started);
    }

    pub fn run(&mut self, paused: bool) {
        debug_assert_eq!(self.get_state(), State::Started);
        self.init_unprivileged();
        if paused {
            self.set_state(State::Paused);
        } else {
            self.set_state(State::Running);
        }
    }

    fn init_unprivileged(&mut self) {
        // context pool must not exceed the driver pool or the loop can
        // stall polling for messages that cannot arrive
        let contexts = self.config.max_contexts.min(self.capture.pool_size());
        if contexts != self.switcher.capacity() {
            self.switcher = ContextSwitcher::new(contexts);
        }
        // messages waiting from the peer are processed before traffic
        self.ha.process_receive();
    }

    pub fn stop(&mut self) {
        self.exit_requested = true;
    }

    pub fn pause(&mut self) {
        if self.get_state() == State::Running {
            self.set_state(State::Paused);
            info!("== [{}] paused", self.handle.id);
        } else {
            error!(
                "Analyzer: Received PAUSE command while in state {}",
                self.get_state_string()
            );
        }
    }

    pub fn resume(&mut self, msg_cnt: u64) {
        if self.get_state() == State::Paused {
            self.pause_after_cnt = msg_cnt;
            self.set_state(State::Running);
        } else {
            error!(
                "Analyzer: Received RESUME command while in state {}",
                self.get_state_string()
            );
        }
    }

    pub fn rotate(&mut self) {
        self.bus.publish(THREAD_ROTATE_EVENT, &Event::Signal);
    }

    pub fn reload_daq(&mut self) {
        self.capture.reload();
    }

    pub fn swap_config(&mut self, config: Arc<EngineConfig>) {
        debug!("analyzer {} swapped configuration", self.handle.id);
        self.flow_control.set_config(&config);
        self.config = config;
    }

    fn term(&mut self) {
        debug!("analyzer {} terminating", self.handle.id);
        self.flow_control.purge_flows();

        // cancellation: suspended inspections, queued retries, and held
        // packets all finalize as blocked
        for id in self.switcher.take_suspended() {
            if let Some(msg) = self.switcher.get(id).msg.take() {
                self.capture.finalize_message(msg, Verdict::Block);
            }
        }
        while let Some(msg) = self.retry_queue.get(None) {
            self.capture.finalize_message(msg, Verdict::Block);
        }
        for msg in self.held.drain(..) {
            self.capture.finalize_message(msg, Verdict::Block);
        }
        if self.capture.was_started() {
            self.capture.stop();
        }
    }

    // ---- command handling --------------------------------------------

    fn handle_command(&mut self) -> bool {
        let command = {
            let mut queue = self.handle.pending.lock().expect("pending queue poisoned");
            queue.pop_front()
        };
        let mut command = match command {
            Some(c) => c,
            None => return false,
        };
        trace!("analyzer {} command {}", self.handle.id, command.name());
        if command.execute(self) {
            self.complete_command(command);
        } else {
            self.uncompleted.push(command);
        }
        true
    }

    fn handle_commands(&mut self) {
        while self.handle_command() {}
    }

    fn handle_uncompleted_commands(&mut self) {
        let mut pending = std::mem::take(&mut self.uncompleted);
        let mut still_pending = Vec::new();
        for mut command in pending.drain(..) {
            if command.execute(self) {
                self.complete_command(command);
            } else {
                still_pending.push(command);
            }
        }
        self.uncompleted = still_pending;
    }

    fn complete_command(&mut self, command: Box<dyn AnalyzerCommand>) {
        let mut queue = self.handle.completed.lock().expect("completed queue poisoned");
        queue.push(command);
    }

    // ---- message processing ------------------------------------------

    fn process_meta_msg(&mut self, msg: CaptureMsg) {
        self.packet_time = msg.hdr.ts;
        self.bus.publish(
            DAQ_META_EVENT,
            &Event::DaqMeta {
                msg_type: msg.msg_type,
                data: &msg.data,
            },
        );
        self.capture.finalize_message(msg, Verdict::Pass);
    }

    fn process_msg(&mut self, msg: CaptureMsg, retry: bool) {
        match msg.msg_type {
            MsgType::Packet => self.process_pkt_msg(msg, retry),
            MsgType::Sof | MsgType::Eof => self.process_meta_msg(msg),
            MsgType::Other(_) => self.capture.finalize_message(msg, Verdict::Pass),
        }
    }

    fn process_pkt_msg(&mut self, msg: CaptureMsg, retry: bool) {
        if !retry {
            self.counts.total_from_daq += 1;
            self.packet_time = msg.hdr.ts;
        }

        let ctx_id = match self.acquire_context() {
            Some(id) => id,
            None => {
                error!("inspection context pool exhausted with no offload in flight");
                self.exit_requested = true;
                self.capture.finalize_message(msg, Verdict::Block);
                return;
            }
        };

        {
            let ctx = self.switcher.get(ctx_id);
            ctx.packet_number = self.counts.total_from_daq;
            ctx.packet.reset();
            if let Err(e) = self.decoder.decode(&msg.hdr, &msg.data, retry, &mut ctx.packet) {
                debug!("decode failed (msg {}): {}", msg.seq, e);
                self.switcher.stop();
                self.capture.finalize_message(msg, Verdict::Pass);
                return;
            }
            ctx.packet.ts = msg.hdr.ts;
            ctx.packet.msg_flags = msg.hdr.flags;
            self.counts.rx_bytes += u64::from(ctx.packet.pktlen);
            ctx.msg = Some(msg);
        }

        let complete = {
            let ctx = self.switcher.get(ctx_id);
            let p = &mut ctx.packet;
            if p.packet_flags.contains(PacketFlags::IGNORE) {
                true
            } else {
                let mut new_flow = false;
                let pkt_type = p.pkt_type;
                self.flow_control
                    .process_packet(pkt_type, p, &mut self.bus, &mut *self.ha, &mut new_flow);
                let flow = match p.flow {
                    Some(i) => Some(self.flow_control.flow_mut(i)),
                    None => None,
                };
                self.hook.eval(ctx_id, p, flow) == HookResult::Complete
            }
        };

        if !complete {
            self.switcher.suspend_current();
            return;
        }

        self.post_process_pkt(ctx_id);
        self.switcher.stop();

        self.flow_control.timeout_flows(self.packet_time.secs());
        self.ha.process_receive();
    }

    /// Verdict distillation and message finalization for a finished context
    fn post_process_pkt(&mut self, ctx_id: ContextId) {
        let config = self.config.clone();
        let ctx = self.switcher.get(ctx_id);
        let mut msg = ctx.msg.take().expect("context holds message custody");
        let p = &mut ctx.packet;

        let flow = match p.flow {
            Some(i) => Some(self.flow_control.flow_mut(i)),
            None => None,
        };
        let verdict = distill_verdict(
            p,
            flow,
            &mut msg,
            &mut *self.capture,
            config.can_block(),
            config.inline_mode,
            &mut self.counts,
        );
        trace!("verdict for packet {}: {}", ctx.packet_number, verdict.name());

        let flow = match p.flow {
            Some(i) => Some(self.flow_control.flow_mut(i)),
            None => None,
        };
        self.ha.process_update(flow, p);

        if verdict == Verdict::Retry {
            self.counts.retries_queued += 1;
            self.retry_queue.put(msg, self.packet_time);
        } else if p.active.is_packet_held() {
            self.held.push(msg);
        } else {
            let wants_event = match p.flow {
                Some(i) => self.flow_control.flow(i).trigger_finalize_event,
                None => false,
            };
            if wants_event {
                self.bus.publish(
                    FINALIZE_PACKET_EVENT,
                    &Event::FinalizePacket { packet: p, verdict },
                );
            }
            self.capture.finalize_message(msg, verdict);
        }
    }

    /// Get a fresh context, finishing offloaded work if the pool ran dry
    fn acquire_context(&mut self) -> Option<ContextId> {
        loop {
            if let Some(id) = self.switcher.start() {
                return Some(id);
            }
            if self.switcher.suspended_count() == 0 {
                return None;
            }
            match self.onload_rx.recv() {
                Ok(id) => self.finish_onload(id),
                Err(_) => return None,
            }
        }
    }

    fn finish_onload(&mut self, ctx_id: ContextId) {
        if self.switcher.resume(ctx_id) {
            self.post_process_pkt(ctx_id);
            self.switcher.stop();
        }
    }

    /// Resume contexts whose offloaded inspection completed, in completion
    /// order
    fn drain_onload(&mut self) {
        while let Ok(ctx_id) = self.onload_rx.try_recv() {
            self.finish_onload(ctx_id);
        }
    }

    fn process_retry_queue(&mut self) {
        while let Some(msg) = self.retry_queue.get(Some(self.packet_time)) {
            self.process_msg(msg, true);
        }
    }

    fn process_messages(&mut self) -> RecvStatus {
        // max receive is the least of the batch size and the remaining
        // exit-after / pause-after counts
        let mut max_recv = self.capture.batch_size();
        if self.exit_after_cnt > 0 {
            max_recv = max_recv.min(self.exit_after_cnt as usize);
        }
        if self.pause_after_cnt > 0 {
            max_recv = max_recv.min(self.pause_after_cnt as usize);
        }

        let rstat = self.capture.receive_messages(max_recv);

        let mut num_recv: u64 = 0;
        while let Some(msg) = self.capture.next_message() {
            if self.skip_cnt > 0 {
                self.counts.skipped += 1;
                self.skip_cnt -= 1;
                self.capture.finalize_message(msg, Verdict::Pass);
                continue;
            }
            num_recv += 1;
            self.process_msg(msg, false);
            self.drain_onload();
            self.process_retry_queue();
            self.handle_uncompleted_commands();
        }

        if self.exit_after_cnt > 0 {
            self.exit_after_cnt = self.exit_after_cnt.saturating_sub(num_recv);
            if self.exit_after_cnt == 0 {
                self.stop();
            }
        }
        if self.pause_after_cnt > 0 {
            self.pause_after_cnt = self.pause_after_cnt.saturating_sub(num_recv);
            if self.pause_after_cnt == 0 {
                self.pause();
            }
        }
        rstat
    }

    fn idle(&mut self) {
        trace!("analyzer {} idle", self.handle.id);
        self.bus.publish(THREAD_IDLE_EVENT, &Event::Signal);
        let now = if self.config.read_mode {
            self.packet_time.secs()
        } else {
            wall_secs()
        };
        self.flow_control.timeout_flows(now);
        self.counts.idle += 1;
        self.ha.process_receive();
    }

    /// Main loop: receive and process message batches until exit. The
    /// receive status is evaluated after the batch is processed.
    pub fn analyze(&mut self) {
        while !self.exit_requested {
            // pre-start or paused: stall until steered elsewhere
            if self.get_state() != State::Running {
                if !self.handle_command() {
                    thread::sleep(std::time::Duration::from_millis(10));
                }
                continue;
            }

            let rstat = self.process_messages();
            match rstat {
                RecvStatus::Ok | RecvStatus::WouldBlock => {}
                RecvStatus::Timeout => self.idle(),
                RecvStatus::Interrupted => {
                    // an interrupt() is a hint that commands are pending
                    self.handle_commands();
                }
                RecvStatus::NoBuf => {
                    error!("Exhausted the capture message pool!");
                    break;
                }
                RecvStatus::Error => {
                    error!(
                        "Error receiving message from the capture instance: {}",
                        self.capture.error()
                    );
                    break;
                }
                // EOF: readback completed; INVALID: should not happen
                RecvStatus::Eof | RecvStatus::Invalid => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Interruptor, PktHdr};
    use crate::ha::NoHa;
    use libflow_tools::Error;

    struct NullInterrupt;
    impl Interruptor for NullInterrupt {
        fn interrupt(&self) {}
    }

    struct EofCapture {
        started: bool,
    }

    impl Capture for EofCapture {
        fn start(&mut self) -> Result<(), Error> {
            self.started = true;
            Ok(())
        }
        fn stop(&mut self) {
            self.started = false;
        }
        fn was_started(&self) -> bool {
            self.started
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
        fn inject(&mut self, _msg: &CaptureMsg, _flags: u32, _payload: &[u8]) -> Result<(), Error> {
            Ok(())
        }
    }

    struct NoopDecoder;
    impl Decoder for NoopDecoder {
        fn decode(
            &self,
            _hdr: &PktHdr,
            _data: &[u8],
            _retry: bool,
            _p: &mut Packet,
        ) -> Result<(), Error> {
            Ok(())
        }
    }

    fn analyzer() -> Analyzer {
        Analyzer::new(
            0,
            Arc::new(EngineConfig::default()),
            Box::new(EofCapture { started: false }),
            Box::new(NoopDecoder),
            Box::new(IgnoreHook),
            Box::new(NoHa),
            "test",
        )
    }

    #[test]
    fn state_machine_strings() {
        let mut a = analyzer();
        assert_eq!(a.get_state_string(), "NEW");
        a.set_state(State::Initialized);
        a.start();
        assert_eq!(a.get_state_string(), "STARTED");
        a.run(true);
        assert_eq!(a.get_state_string(), "PAUSED");
        a.resume(0);
        assert_eq!(a.get_state_string(), "RUNNING");
        a.pause();
        assert_eq!(a.get_state_string(), "PAUSED");
    }

    #[test]
    fn resume_outside_paused_is_rejected() {
        let mut a = analyzer();
        a.set_state(State::Running);
        a.resume(5);
        // still running, pause-after untouched
        assert_eq!(a.get_state(), State::Running);
        assert_eq!(a.pause_after_cnt, 0);
    }

    #[test]
    fn commands_complete_through_handle() {
        use crate::commands::{ACRotate, ACStop};

        let mut a = analyzer();
        let handle = a.handle();
        handle.execute(Box::new(ACRotate));
        handle.execute(Box::new(ACStop));
        assert!(a.handle_command());
        assert!(a.handle_command());
        assert!(!a.handle_command());
        assert!(a.exit_requested);
        let completed = handle.take_completed();
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[0].name(), "ROTATE");
        assert_eq!(completed[1].name(), "STOP");
    }

    #[test]
    fn analyze_exits_on_eof() {
        let mut a = analyzer();
        a.set_state(State::Initialized);
        a.start();
        a.run(false);
        // EOF from the stub capture breaks the loop immediately
        a.analyze();
        a.term();
        assert_eq!(a.counts().total_from_daq, 0);
    }

    #[test]
    fn swap_config_replaces_settings() {
        let mut a = analyzer();
        let mut new_config = EngineConfig::default();
        new_config.inline_mode = true;
        a.swap_config(Arc::new(new_config));
        assert!(a.config.inline_mode);
    }
}
