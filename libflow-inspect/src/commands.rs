use crate::analyzer::Analyzer;
use crate::config::EngineConfig;
use std::sync::Arc;

/// Control-plane command executed on the owning packet thread.
///
/// `execute` returns true when the command completed; an in-progress
/// command is moved to the uncompleted list and polled again after each
/// processed message until it reports completion.
pub trait AnalyzerCommand: Send {
    fn execute(&mut self, analyzer: &mut Analyzer) -> bool;
    fn name(&self) -> &'static str;
}

/// Start the capture driver
pub struct ACStart;

impl AnalyzerCommand for ACStart {
    fn execute(&mut self, analyzer: &mut Analyzer) -> bool {
        analyzer.start();
        true
    }
    fn name(&self) -> &'static str {
        "START"
    }
}

/// Enter the packet loop, optionally starting paused
pub struct ACRun {
    pub paused: bool,
}

impl AnalyzerCommand for ACRun {
    fn execute(&mut self, analyzer: &mut Analyzer) -> bool {
        analyzer.run(self.paused);
        true
    }
    fn name(&self) -> &'static str {
        "RUN"
    }
}

/// Request loop exit; teardown follows
pub struct ACStop;

impl AnalyzerCommand for ACStop {
    fn execute(&mut self, analyzer: &mut Analyzer) -> bool {
        analyzer.stop();
        true
    }
    fn name(&self) -> &'static str {
        "STOP"
    }
}

pub struct ACPause;

impl AnalyzerCommand for ACPause {
    fn execute(&mut self, analyzer: &mut Analyzer) -> bool {
        analyzer.pause();
        true
    }
    fn name(&self) -> &'static str {
        "PAUSE"
    }
}

/// Resume a paused analyzer; a nonzero `msg_cnt` pauses again after that
/// many messages.
pub struct ACResume {
    pub msg_cnt: u64,
}

impl AnalyzerCommand for ACResume {
    fn execute(&mut self, analyzer: &mut Analyzer) -> bool {
        analyzer.resume(self.msg_cnt);
        true
    }
    fn name(&self) -> &'static str {
        "RESUME"
    }
}

/// Log rotation point
pub struct ACRotate;

impl AnalyzerCommand for ACRotate {
    fn execute(&mut self, analyzer: &mut Analyzer) -> bool {
        analyzer.rotate();
        true
    }
    fn name(&self) -> &'static str {
        "ROTATE"
    }
}

/// Ask the capture driver to re-open its source
pub struct ACDaqReload;

impl AnalyzerCommand for ACDaqReload {
    fn execute(&mut self, analyzer: &mut Analyzer) -> bool {
        analyzer.reload_daq();
        true
    }
    fn name(&self) -> &'static str {
        "RELOAD_DAQ"
    }
}

/// Hand the thread a new configuration at a safe point
pub struct ACSwap {
    config: Option<Arc<EngineConfig>>,
}

impl ACSwap {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        ACSwap {
            config: Some(config),
        }
    }
}

impl AnalyzerCommand for ACSwap {
    fn execute(&mut self, analyzer: &mut Analyzer) -> bool {
        if let Some(config) = self.config.take() {
            analyzer.swap_config(config);
        }
        true
    }
    fn name(&self) -> &'static str {
        "SWAP"
    }
}
