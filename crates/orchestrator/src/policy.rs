//! Layered fan-in configuration: defaults < environment < runtime store.
//!
//! An invalid override at any layer is logged and that field reverts to the
//! next-lower layer's value. Resolution never fails: the monitor always gets
//! a usable config.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Effective configuration for one monitor tick.
#[derive(Debug, Clone, PartialEq)]
pub struct FanInConfig {
    /// Cadence the external scheduler is expected to tick at. Also bounds
    /// how late past its nominal timeout a job can be finalized.
    pub polling_interval_minutes: u32,
    pub job_timeout_minutes: i64,
    pub enable_partial_completion: bool,
    /// Minimum completed fraction for a timed-out job to still proceed.
    pub partial_completion_threshold: f64,
    pub max_jobs_per_cycle: usize,
}

impl Default for FanInConfig {
    fn default() -> Self {
        Self {
            polling_interval_minutes: 5,
            job_timeout_minutes: 30,
            enable_partial_completion: true,
            partial_completion_threshold: 0.5,
            max_jobs_per_cycle: 50,
        }
    }
}

/// One override layer; unset fields defer to the layer below.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigOverrides {
    pub polling_interval_minutes: Option<u32>,
    pub job_timeout_minutes: Option<i64>,
    pub enable_partial_completion: Option<bool>,
    pub partial_completion_threshold: Option<f64>,
    pub max_jobs_per_cycle: Option<usize>,
}

impl ConfigOverrides {
    /// Read the deployment-level layer from `MUSTER_*` environment variables.
    ///
    /// Unparseable values are logged and treated as unset.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            polling_interval_minutes: parse_var(&lookup, "MUSTER_POLLING_INTERVAL_MINUTES"),
            job_timeout_minutes: parse_var(&lookup, "MUSTER_JOB_TIMEOUT_MINUTES"),
            enable_partial_completion: parse_var(&lookup, "MUSTER_ENABLE_PARTIAL_COMPLETION"),
            partial_completion_threshold: parse_var(&lookup, "MUSTER_PARTIAL_COMPLETION_THRESHOLD"),
            max_jobs_per_cycle: parse_var(&lookup, "MUSTER_MAX_JOBS_PER_CYCLE"),
        }
    }
}

fn parse_var<T: FromStr>(lookup: impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "unparseable config override ignored");
            None
        }
    }
}

/// Resolve the effective config from the three layers.
pub fn resolve(env: &ConfigOverrides, stored: &ConfigOverrides) -> FanInConfig {
    let mut config = FanInConfig::default();
    apply_layer(&mut config, env, "environment");
    apply_layer(&mut config, stored, "store");
    config
}

fn apply_layer(config: &mut FanInConfig, layer: &ConfigOverrides, source: &str) {
    if let Some(v) = layer.polling_interval_minutes {
        if v > 0 {
            config.polling_interval_minutes = v;
        } else {
            warn!(source, value = v, "invalid pollingIntervalMinutes override ignored");
        }
    }
    if let Some(v) = layer.job_timeout_minutes {
        if v > 0 {
            config.job_timeout_minutes = v;
        } else {
            warn!(source, value = v, "invalid jobTimeoutMinutes override ignored");
        }
    }
    if let Some(v) = layer.enable_partial_completion {
        config.enable_partial_completion = v;
    }
    if let Some(v) = layer.partial_completion_threshold {
        if v.is_finite() && (0.0..=1.0).contains(&v) {
            config.partial_completion_threshold = v;
        } else {
            warn!(source, value = v, "invalid partialCompletionThreshold override ignored");
        }
    }
    if let Some(v) = layer.max_jobs_per_cycle {
        if v > 0 {
            config.max_jobs_per_cycle = v;
        } else {
            warn!(source, value = v, "invalid maxJobsPerCycle override ignored");
        }
    }
}
