//! Simulator configuration, loaded from a TOML file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use blit_core::window::scheduler::SchedulerConfig;
use blit_core::window::select::EncodingChoice;

/// Top-level simulator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub window: WindowConfig,
    pub workload: WorkloadConfig,
    pub link: LinkConfig,
    pub logging: LoggingConfig,
}

/// The simulated window the scheduler drives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    /// Bit depth of the captured pixels.
    pub depth: u8,
    /// What the "user" asked for; `auto` lets the selector decide.
    pub encoding: EncodingChoice,
    /// Base auto-refresh delay in ms; zero disables refreshes.
    pub auto_refresh_delay_ms: u64,
}

/// Shape of the synthetic damage stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// How long to generate damage for.
    pub duration_secs: u64,
    /// Damage ticks per second.
    pub events_per_sec: u32,
    /// Rectangles emitted per tick.
    pub burst: u32,
    /// Largest rectangle edge, in pixels.
    pub max_rect: u32,
    /// Deterministic runs share a seed.
    pub seed: u64,
}

/// The simulated client link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// One-way delivery latency before the client acks (ms).
    pub latency_ms: u64,
    /// Extra random latency on top, uniform in `0..=jitter_ms`.
    pub jitter_ms: u64,
    /// Bits per second the wire can move; zero means unlimited.
    pub bandwidth_bps: u64,
    /// Decode time the client reports in every ack (us). Negative
    /// values simulate client-side decode errors.
    pub decode_us: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter, overridable with `RUST_LOG`.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            workload: WorkloadConfig::default(),
            link: LinkConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 800,
            depth: 24,
            encoding: EncodingChoice::Auto,
            auto_refresh_delay_ms: 150,
        }
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            duration_secs: 10,
            events_per_sec: 60,
            burst: 3,
            max_rect: 256,
            seed: 7,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            latency_ms: 20,
            jitter_ms: 5,
            bandwidth_bps: 0,
            decode_us: 1_500,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl SimConfig {
    /// Load configuration from a TOML file, falling back to defaults
    /// when the file is missing or malformed.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => match toml::from_str(&text) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "loaded configuration");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "bad config file, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read config file, using defaults");
                Self::default()
            }
        }
    }

    /// Translate the window and link sections into a scheduler config.
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            width: self.window.width.max(1),
            height: self.window.height.max(1),
            image_depth: self.window.depth,
            encoding: self.window.encoding,
            auto_refresh_delay: self.window.auto_refresh_delay_ms,
            bandwidth_limit: self.link.bandwidth_bps,
            ack_jitter: self.link.jitter_ms,
            ..SchedulerConfig::default()
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let config = SimConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: SimConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.window.width, config.window.width);
        assert_eq!(back.workload.events_per_sec, config.workload.events_per_sec);
        assert_eq!(back.link.latency_ms, config.link.latency_ms);
        assert_eq!(back.logging.level, config.logging.level);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: SimConfig = toml::from_str(
            r#"
            [window]
            width = 640
            height = 480

            [link]
            bandwidth_bps = 1000000
            "#,
        )
        .unwrap();
        assert_eq!(config.window.width, 640);
        assert_eq!(config.window.depth, 24);
        assert_eq!(config.link.bandwidth_bps, 1_000_000);
        assert_eq!(config.workload.burst, 3);
    }

    #[test]
    fn scheduler_config_reflects_sections() {
        let mut config = SimConfig::default();
        config.window.width = 800;
        config.window.height = 600;
        config.link.bandwidth_bps = 2_000_000;
        let sched = config.to_scheduler_config();
        assert_eq!(sched.width, 800);
        assert_eq!(sched.height, 600);
        assert_eq!(sched.bandwidth_limit, 2_000_000);
    }

    #[test]
    fn zero_dimensions_are_clamped() {
        let mut config = SimConfig::default();
        config.window.width = 0;
        let sched = config.to_scheduler_config();
        assert_eq!(sched.width, 1);
    }
}
