use crate::packet::{PktType, PKT_TYPE_MAX};
use libflow_tools::Config;

/// Per-packet-type cache settings
#[derive(Clone, Copy, Debug)]
pub struct ProtoConfig {
    /// idle timeout applied by `FlowCache::timeout`, seconds
    pub nominal_timeout: u32,
    /// byte cost charged against the memory cap per flow
    pub cap_weight: u32,
}

impl Default for ProtoConfig {
    fn default() -> Self {
        ProtoConfig {
            nominal_timeout: 180,
            cap_weight: 64,
        }
    }
}

/// Flow cache sizing and eviction settings
#[derive(Clone, Debug)]
pub struct FlowCacheConfig {
    /// arena size; hard upper bound on tracked flows
    pub max_flows: usize,
    /// idle age making a flow eligible for stale pruning, seconds
    pub pruning_timeout: u32,
    /// eviction batch bound; also sets the excess-prune watermark
    pub cleanup_flows: usize,
    /// memory cap in bytes charged by cap_weight; 0 disables the cap
    pub memcap: u64,
    pub proto: [ProtoConfig; PKT_TYPE_MAX],
}

impl Default for FlowCacheConfig {
    fn default() -> Self {
        let mut proto = [ProtoConfig::default(); PKT_TYPE_MAX];
        proto[PktType::Tcp.index()] = ProtoConfig {
            nominal_timeout: 3600,
            cap_weight: 12288,
        };
        proto[PktType::Udp.index()] = ProtoConfig {
            nominal_timeout: 180,
            cap_weight: 128,
        };
        FlowCacheConfig {
            max_flows: 65536,
            pruning_timeout: 30,
            cleanup_flows: 15,
            memcap: 0,
            proto,
        }
    }
}

impl FlowCacheConfig {
    /// Read settings from the `flow` table of a configuration, keeping
    /// defaults for missing keys.
    pub fn from_config(config: &Config) -> Self {
        let mut fc = FlowCacheConfig::default();
        if let Some(n) = config.get_usize("flow.max_flows") {
            fc.max_flows = n.max(1);
        }
        if let Some(n) = config.get_u32("flow.pruning_timeout") {
            fc.pruning_timeout = n;
        }
        if let Some(n) = config.get_usize("flow.cleanup_flows") {
            fc.cleanup_flows = n.max(1);
        }
        if let Some(n) = config.get_usize("flow.memcap") {
            fc.memcap = n as u64;
        }
        for t in PktType::all().iter() {
            if let Some(n) = config.get_proto_usize("flow", t.name(), "nominal_timeout") {
                fc.proto[t.index()].nominal_timeout = n as u32;
            }
            if let Some(n) = config.get_proto_usize("flow", t.name(), "cap_weight") {
                fc.proto[t.index()].cap_weight = n as u32;
            }
        }
        fc
    }

    /// Watermark the excess pruner drains the cache down to
    #[inline]
    pub fn excess_watermark(&self) -> usize {
        self.max_flows.saturating_sub(self.cleanup_flows).max(1)
    }
}

/// Policy bindings stamped onto new flows
#[derive(Clone, Copy, Debug, Default)]
pub struct PolicyIds {
    pub inspection: u32,
    pub ips: u32,
    pub network: u32,
}

/// Engine-wide settings shared by all packet threads.
///
/// Reference counted; reload builds a new instance and swaps it into each
/// thread at a safe point.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub flow: FlowCacheConfig,
    /// only track TCP flows that start with a SYN
    pub track_on_syn: bool,
    /// deployed inline; blocked packets yield blacklist verdicts
    pub inline_mode: bool,
    /// reading a capture file; verdicts cannot block
    pub read_mode: bool,
    pub retry_interval_ms: u32,
    /// inspection context pool size, clamped to the driver pool
    pub max_contexts: usize,
    pub policies: PolicyIds,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            flow: FlowCacheConfig::default(),
            track_on_syn: true,
            inline_mode: false,
            read_mode: false,
            retry_interval_ms: 200,
            max_contexts: 255,
            policies: PolicyIds::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Self {
        let mut ec = EngineConfig {
            flow: FlowCacheConfig::from_config(config),
            ..EngineConfig::default()
        };
        if let Some(b) = config.get_bool("engine.track_on_syn") {
            ec.track_on_syn = b;
        }
        if let Some(b) = config.get_bool("engine.inline_mode") {
            ec.inline_mode = b;
        }
        if let Some(b) = config.get_bool("engine.read_mode") {
            ec.read_mode = b;
        }
        if let Some(n) = config.get_u32("engine.retry_interval_ms") {
            ec.retry_interval_ms = n.max(1);
        }
        if let Some(n) = config.get_usize("engine.max_contexts") {
            ec.max_contexts = n.max(1);
        }
        ec
    }

    /// Whether verdicts may block traffic in this deployment
    #[inline]
    pub fn can_block(&self) -> bool {
        !self.read_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_config_from_toml() {
        let config: Config = "[flow]\nmax_flows = 128\npruning_timeout = 60\n\
                              [flow.tcp]\nnominal_timeout = 600\n\
                              [engine]\ntrack_on_syn = true\nretry_interval_ms = 50\n"
            .parse()
            .expect("parse configuration");
        let ec = EngineConfig::from_config(&config);
        assert_eq!(ec.flow.max_flows, 128);
        assert_eq!(ec.flow.pruning_timeout, 60);
        assert_eq!(ec.flow.proto[PktType::Tcp.index()].nominal_timeout, 600);
        // untouched entries keep defaults
        assert_eq!(ec.flow.proto[PktType::Udp.index()].nominal_timeout, 180);
        assert!(ec.track_on_syn);
        assert_eq!(ec.retry_interval_ms, 50);
    }

    #[test]
    fn excess_watermark_clamped() {
        let fc = FlowCacheConfig {
            max_flows: 3,
            cleanup_flows: 1,
            ..FlowCacheConfig::default()
        };
        assert_eq!(fc.excess_watermark(), 2);
        let tiny = FlowCacheConfig {
            max_flows: 1,
            cleanup_flows: 15,
            ..FlowCacheConfig::default()
        };
        assert_eq!(tiny.excess_watermark(), 1);
    }
}
