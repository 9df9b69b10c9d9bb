//! Broker configuration structures.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::model::{HardwareConfig, Lab};
use crate::core::session::XpPolicy;
use crate::core::AppResult;

/// Environment variable pointing at the JSON configuration file.
pub const CONFIG_PATH_VAR: &str = "LAB_BROKER_CONFIG";

/// One lab rig.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabConfig {
    /// Display name.
    pub name: String,
    /// Hard session limit in seconds.
    pub max_session_secs: u64,
    /// Rig description handed to clients.
    #[serde(default)]
    pub hardware: HardwareConfig,
}

impl LabConfig {
    /// Validate lab values.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".into());
        }
        if self.max_session_secs == 0 {
            return Err("max_session_secs must be greater than 0".into());
        }
        Ok(())
    }

    /// Registry record for this lab.
    #[must_use]
    pub fn to_lab(&self, id: &str) -> Lab {
        Lab::new(id, self.name.clone(), Duration::from_secs(self.max_session_secs))
            .with_hardware(self.hardware.clone())
    }
}

/// Parameters of the queue wait estimate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitEstimateConfig {
    /// Number of recent finished sessions averaged.
    pub history_window: usize,
    /// Session length assumed for labs without history.
    pub fallback_session_secs: u64,
}

impl Default for WaitEstimateConfig {
    fn default() -> Self {
        Self {
            history_window: 10,
            fallback_session_secs: 1800,
        }
    }
}

const fn default_queue_entry_ttl_secs() -> u64 {
    900
}
const fn default_heartbeat_offline_secs() -> u64 {
    60
}
const fn default_offline_status_after_sweeps() -> u32 {
    3
}
const fn default_compilation_stall_secs() -> u64 {
    120
}
fn default_warning_thresholds_secs() -> Vec<u64> {
    vec![300, 60]
}
const fn default_sweep_interval_ms() -> u64 {
    1000
}
const fn default_max_bid() -> i64 {
    1000
}
const fn default_max_queue_depth() -> usize {
    50
}
const fn default_booking_no_show_grace_secs() -> u64 {
    600
}
const fn default_event_capacity() -> usize {
    1024
}
const fn default_hardware_log_capacity() -> usize {
    10_000
}
const fn default_transport_capacity() -> usize {
    256
}

/// Root broker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Map of lab identifier to configuration.
    pub labs: HashMap<String, LabConfig>,
    /// Lifetime of a queue entry.
    #[serde(default = "default_queue_entry_ttl_secs")]
    pub queue_entry_ttl_secs: u64,
    /// Heartbeat silence after which a lab counts as offline.
    #[serde(default = "default_heartbeat_offline_secs")]
    pub heartbeat_offline_secs: u64,
    /// Consecutive silent sweeps before an idle lab is moved to `offline`.
    #[serde(default = "default_offline_status_after_sweeps")]
    pub offline_status_after_sweeps: u32,
    /// Time without agent progress before a compilation job fails.
    #[serde(default = "default_compilation_stall_secs")]
    pub compilation_stall_secs: u64,
    /// Time a promoted user has to confirm; unset activates immediately.
    #[serde(default)]
    pub promotion_confirm_grace_secs: Option<u64>,
    /// Remaining-time thresholds that trigger a session warning.
    #[serde(default = "default_warning_thresholds_secs")]
    pub warning_thresholds_secs: Vec<u64>,
    /// Scheduler period.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Largest accepted bid.
    #[serde(default = "default_max_bid")]
    pub max_bid: i64,
    /// Largest number of waiters per lab.
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
    /// Grace after a booking's start before it becomes a no-show.
    #[serde(default = "default_booking_no_show_grace_secs")]
    pub booking_no_show_grace_secs: u64,
    /// Event bus buffer.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Hardware log entries kept in memory.
    #[serde(default = "default_hardware_log_capacity")]
    pub hardware_log_capacity: usize,
    /// Undelivered messages the in-process transport holds.
    #[serde(default = "default_transport_capacity")]
    pub transport_capacity: usize,
    /// Reward policy.
    #[serde(default)]
    pub xp: XpPolicy,
    /// Wait estimate policy.
    #[serde(default)]
    pub wait_estimate: WaitEstimateConfig,
}

impl BrokerConfig {
    /// Configuration with the given labs and default timeouts.
    #[must_use]
    pub fn with_labs(labs: HashMap<String, LabConfig>) -> Self {
        Self {
            labs,
            queue_entry_ttl_secs: default_queue_entry_ttl_secs(),
            heartbeat_offline_secs: default_heartbeat_offline_secs(),
            offline_status_after_sweeps: default_offline_status_after_sweeps(),
            compilation_stall_secs: default_compilation_stall_secs(),
            promotion_confirm_grace_secs: None,
            warning_thresholds_secs: default_warning_thresholds_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
            max_bid: default_max_bid(),
            max_queue_depth: default_max_queue_depth(),
            booking_no_show_grace_secs: default_booking_no_show_grace_secs(),
            event_capacity: default_event_capacity(),
            hardware_log_capacity: default_hardware_log_capacity(),
            transport_capacity: default_transport_capacity(),
            xp: XpPolicy::default(),
            wait_estimate: WaitEstimateConfig::default(),
        }
    }

    /// Validate all labs, timeouts and policies.
    pub fn validate(&self) -> Result<(), String> {
        if self.labs.is_empty() {
            return Err("at least one lab must be defined".into());
        }
        for (id, lab) in &self.labs {
            if id.trim().is_empty() || id.contains('/') {
                return Err(format!("lab id `{id}` must be non-empty and contain no `/`"));
            }
            lab.validate()
                .map_err(|e| format!("lab `{id}` invalid: {e}"))?;
        }

        let positive = [
            ("queue_entry_ttl_secs", self.queue_entry_ttl_secs),
            ("heartbeat_offline_secs", self.heartbeat_offline_secs),
            ("compilation_stall_secs", self.compilation_stall_secs),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("wait_estimate.fallback_session_secs", self.wait_estimate.fallback_session_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(format!("{name} must be greater than 0"));
            }
        }
        let sizes = [
            ("max_queue_depth", self.max_queue_depth),
            ("event_capacity", self.event_capacity),
            ("hardware_log_capacity", self.hardware_log_capacity),
            ("transport_capacity", self.transport_capacity),
            ("wait_estimate.history_window", self.wait_estimate.history_window),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(format!("{name} must be greater than 0"));
            }
        }

        if self.offline_status_after_sweeps == 0 {
            return Err("offline_status_after_sweeps must be greater than 0".into());
        }
        if self.max_bid < 0 {
            return Err("max_bid must not be negative".into());
        }
        if self.promotion_confirm_grace_secs == Some(0) {
            return Err("promotion_confirm_grace_secs must be greater than 0 when set".into());
        }
        if self.warning_thresholds_secs.contains(&0) {
            return Err("warning_thresholds_secs entries must be greater than 0".into());
        }
        if self.xp.max_xp == 0 {
            return Err("xp.max_xp must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse broker configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from the environment.
    ///
    /// Reads `.env` if present, parses the JSON file named by
    /// `LAB_BROKER_CONFIG`, then applies `LAB_BROKER_*` overrides.
    ///
    /// | Env Var                                   | Field                           |
    /// |-------------------------------------------|---------------------------------|
    /// | `LAB_BROKER_QUEUE_ENTRY_TTL_SECS`         | `queue_entry_ttl_secs`          |
    /// | `LAB_BROKER_HEARTBEAT_OFFLINE_SECS`       | `heartbeat_offline_secs`        |
    /// | `LAB_BROKER_COMPILATION_STALL_SECS`       | `compilation_stall_secs`        |
    /// | `LAB_BROKER_PROMOTION_CONFIRM_GRACE_SECS` | `promotion_confirm_grace_secs`  |
    /// | `LAB_BROKER_SWEEP_INTERVAL_MS`            | `sweep_interval_ms`             |
    /// | `LAB_BROKER_MAX_BID`                      | `max_bid`                       |
    /// | `LAB_BROKER_MAX_QUEUE_DEPTH`              | `max_queue_depth`               |
    ///
    /// # Errors
    /// Missing variable, unreadable file, or invalid values.
    pub fn from_env() -> AppResult<Self> {
        if let Err(e) = dotenvy::dotenv() {
            tracing::debug!(error = %e, "no .env file loaded");
        }
        let path = std::env::var(CONFIG_PATH_VAR)
            .map_err(|_| anyhow::anyhow!("{CONFIG_PATH_VAR} must point to a JSON config file"))?;
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("cannot read {path}: {e}"))?;
        let mut cfg: Self =
            serde_json::from_str(&raw).map_err(|e| anyhow::anyhow!("parse error in {path}: {e}"))?;
        cfg.apply_overrides(|key| std::env::var(key).ok())
            .map_err(|e| anyhow::anyhow!(e))?;
        cfg.validate().map_err(|e| anyhow::anyhow!("config invalid: {e}"))?;
        tracing::info!(path = %path, labs = cfg.labs.len(), "broker config loaded");
        Ok(cfg)
    }

    /// Apply `LAB_BROKER_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), String> {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, String> {
            raw.trim()
                .parse()
                .map_err(|_| format!("{key} must be a valid number, got `{raw}`"))
        }

        let read = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = read("LAB_BROKER_QUEUE_ENTRY_TTL_SECS") {
            self.queue_entry_ttl_secs = parse("LAB_BROKER_QUEUE_ENTRY_TTL_SECS", &v)?;
        }
        if let Some(v) = read("LAB_BROKER_HEARTBEAT_OFFLINE_SECS") {
            self.heartbeat_offline_secs = parse("LAB_BROKER_HEARTBEAT_OFFLINE_SECS", &v)?;
        }
        if let Some(v) = read("LAB_BROKER_COMPILATION_STALL_SECS") {
            self.compilation_stall_secs = parse("LAB_BROKER_COMPILATION_STALL_SECS", &v)?;
        }
        if let Some(v) = read("LAB_BROKER_PROMOTION_CONFIRM_GRACE_SECS") {
            self.promotion_confirm_grace_secs =
                Some(parse("LAB_BROKER_PROMOTION_CONFIRM_GRACE_SECS", &v)?);
        }
        if let Some(v) = read("LAB_BROKER_SWEEP_INTERVAL_MS") {
            self.sweep_interval_ms = parse("LAB_BROKER_SWEEP_INTERVAL_MS", &v)?;
        }
        if let Some(v) = read("LAB_BROKER_MAX_BID") {
            self.max_bid = parse("LAB_BROKER_MAX_BID", &v)?;
        }
        if let Some(v) = read("LAB_BROKER_MAX_QUEUE_DEPTH") {
            self.max_queue_depth = parse("LAB_BROKER_MAX_QUEUE_DEPTH", &v)?;
        }
        Ok(())
    }

    /// Queue entry lifetime.
    #[must_use]
    pub const fn queue_entry_ttl(&self) -> Duration {
        Duration::from_secs(self.queue_entry_ttl_secs)
    }

    /// Heartbeat staleness threshold.
    #[must_use]
    pub const fn heartbeat_offline(&self) -> Duration {
        Duration::from_secs(self.heartbeat_offline_secs)
    }

    /// Compilation stall timeout.
    #[must_use]
    pub const fn compilation_stall(&self) -> Duration {
        Duration::from_secs(self.compilation_stall_secs)
    }

    /// Promotion confirmation grace, if enabled.
    #[must_use]
    pub fn promotion_confirm_grace(&self) -> Option<Duration> {
        self.promotion_confirm_grace_secs.map(Duration::from_secs)
    }

    /// Scheduler period.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// No-show grace for bookings.
    #[must_use]
    pub const fn booking_no_show_grace(&self) -> Duration {
        Duration::from_secs(self.booking_no_show_grace_secs)
    }
}
