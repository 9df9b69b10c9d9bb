//! Configuration models for labs, timeouts, and policies.

pub mod broker;

pub use broker::{BrokerConfig, LabConfig, WaitEstimateConfig, CONFIG_PATH_VAR};
