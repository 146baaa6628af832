//! Configuration management for flovsim.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (`FLOVSIM_K`, `FLOVSIM_CYCLES`, ...)
//! 2. An explicit TOML file passed on the command line
//! 3. A project-local `flovsim.toml`
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # flovsim.toml
//!
//! [topology]
//! k = 4                    # mesh side length (k*k routers)
//! channel_latency = 1
//!
//! [router]
//! vcs = 4
//! vc_buf_size = 4
//! routing = "dimension_order"   # or "row_first_adaptive"
//! speculative = true
//!
//! [power]
//! drain_threshold = 300
//! bet_threshold = 10
//! wakeup_threshold = 10
//!
//! [traffic]
//! injection_rate = 0.02
//! packet_length = 4
//! seed = 1
//!
//! [sim]
//! cycles = 10000
//! ```

use crate::router::power::PowerConfig;
use crate::router::RouterParams;
use crate::routing::RoutingKind;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Configuration loading/validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level simulator configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub topology: TopologySection,
    pub router: RouterSection,
    pub power: PowerSection,
    pub traffic: TrafficSection,
    pub sim: SimSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TopologySection {
    /// Mesh side length; the network has `k * k` routers.
    pub k: usize,
    /// Link latency in cycles for flits, credits, and handshakes.
    pub channel_latency: u64,
}

impl Default for TopologySection {
    fn default() -> Self {
        Self { k: 4, channel_latency: 1 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouterSection {
    pub vcs: usize,
    pub vc_buf_size: usize,
    pub routing_delay: u64,
    pub vc_alloc_delay: u64,
    pub sw_alloc_delay: u64,
    pub speculative: bool,
    pub hold_switch_for_packet: bool,
    /// Per-output staging bound; omit for unbounded.
    pub output_buffer_size: Option<usize>,
    pub routing: RoutingKind,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            vcs: 4,
            vc_buf_size: 4,
            routing_delay: 1,
            vc_alloc_delay: 1,
            sw_alloc_delay: 1,
            speculative: true,
            hold_switch_for_packet: false,
            output_buffer_size: None,
            routing: RoutingKind::DimensionOrder,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PowerSection {
    pub drain_threshold: u64,
    pub bet_threshold: u64,
    pub wakeup_threshold: u64,
}

impl Default for PowerSection {
    fn default() -> Self {
        let d = PowerConfig::default();
        Self {
            drain_threshold: d.drain_threshold,
            bet_threshold: d.bet_threshold,
            wakeup_threshold: d.wakeup_threshold,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrafficSection {
    /// Per-node request probability per cycle.
    pub injection_rate: f64,
    /// Flits per packet.
    pub packet_length: usize,
    /// Traffic generator seed.
    pub seed: u64,
}

impl Default for TrafficSection {
    fn default() -> Self {
        Self { injection_rate: 0.02, packet_length: 4, seed: 1 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimSection {
    /// Cycles to simulate with traffic enabled.
    pub cycles: u64,
    /// Extra cycles afterwards to let in-flight traffic drain.
    pub drain_cycles: u64,
}

impl Default for SimSection {
    fn default() -> Self {
        Self { cycles: 10_000, drain_cycles: 5_000 }
    }
}

impl Config {
    /// Load configuration: defaults, then the file (explicit path or local
    /// `flovsim.toml`), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::load_from_file(p, true)?.unwrap_or_default(),
            None => Self::load_from_file(Path::new("flovsim.toml"), false)?.unwrap_or_default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path, required: bool) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            if required {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
                });
            }
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        log::info!("loaded config from {}", path.display());
        Ok(Some(config))
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Some(k) = env_parse("FLOVSIM_K") {
            self.topology.k = k;
        }
        if let Some(cycles) = env_parse("FLOVSIM_CYCLES") {
            self.sim.cycles = cycles;
        }
        if let Some(seed) = env_parse("FLOVSIM_SEED") {
            self.traffic.seed = seed;
        }
        if let Some(rate) = env_parse("FLOVSIM_INJECTION_RATE") {
            self.traffic.injection_rate = rate;
        }
    }

    /// Reject parameter combinations the model cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topology.k < 2 {
            return Err(ConfigError::Invalid("topology.k must be at least 2".into()));
        }
        if self.topology.channel_latency < 1 {
            return Err(ConfigError::Invalid(
                "topology.channel_latency must be at least 1".into(),
            ));
        }
        if self.router.vcs < 1 || self.router.vc_buf_size < 1 {
            return Err(ConfigError::Invalid(
                "router.vcs and router.vc_buf_size must be at least 1".into(),
            ));
        }
        if self.router.vc_alloc_delay < 1 || self.router.sw_alloc_delay < 1 {
            return Err(ConfigError::Invalid(
                "allocation delays must be at least 1 cycle".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.traffic.injection_rate) {
            return Err(ConfigError::Invalid(
                "traffic.injection_rate must be within [0, 1]".into(),
            ));
        }
        if self.traffic.packet_length < 1 {
            return Err(ConfigError::Invalid("traffic.packet_length must be at least 1".into()));
        }
        if self.power.bet_threshold < 1 || self.power.wakeup_threshold < 1 {
            return Err(ConfigError::Invalid("power thresholds must be at least 1 cycle".into()));
        }
        Ok(())
    }

    /// Router parameters derived from this configuration.
    pub fn router_params(&self) -> RouterParams {
        RouterParams {
            vcs: self.router.vcs,
            vc_buf_size: self.router.vc_buf_size,
            routing_delay: self.router.routing_delay,
            vc_alloc_delay: self.router.vc_alloc_delay,
            sw_alloc_delay: self.router.sw_alloc_delay,
            speculative: self.router.speculative,
            hold_switch_for_packet: self.router.hold_switch_for_packet,
            output_buffer_size: self.router.output_buffer_size,
            routing: self.router.routing,
            ..RouterParams::default()
        }
    }

    /// Power-gating thresholds derived from this configuration.
    pub fn power_config(&self) -> PowerConfig {
        PowerConfig {
            drain_threshold: self.power.drain_threshold,
            bet_threshold: self.power.bet_threshold,
            wakeup_threshold: self.power.wakeup_threshold,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    match std::env::var(name) {
        Ok(value) => match value.parse() {
            Ok(parsed) => {
                log::info!("using {name}={value} from environment");
                Some(parsed)
            }
            Err(_) => {
                log::warn!("ignoring unparseable {name}={value}");
                None
            }
        },
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.topology.k, 4);
        assert_eq!(config.router.vcs, 4);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [topology]
            k = 8

            [router]
            routing = "row_first_adaptive"
            vcs = 2

            [power]
            bet_threshold = 32
            "#,
        )
        .unwrap();
        assert_eq!(config.topology.k, 8);
        assert_eq!(config.router.vcs, 2);
        assert_eq!(config.router.routing, RoutingKind::RowFirstAdaptive);
        assert_eq!(config.power.bet_threshold, 32);
        // untouched sections keep defaults
        assert_eq!(config.router.vc_buf_size, 4);
        assert_eq!(config.sim.cycles, 10_000);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let parsed: Result<Config, _> = toml::from_str("[router]\nbogus = 1\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_invalid_rate_rejected() {
        let mut config = Config::default();
        config.traffic.injection_rate = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_router_params_carry_over() {
        let mut config = Config::default();
        config.router.speculative = false;
        config.router.vcs = 2;
        let params = config.router_params();
        assert!(!params.speculative);
        assert_eq!(params.vcs, 2);
        assert_eq!(params.inputs, 5);
    }
}
