//! TOML configuration surface for the orchestrator daemon.
//!
//! Every section is optional and falls back to the documented defaults, so
//! an empty config file is a valid one.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broker::BrokerConfig;
use crate::budget::BudgetConfig;
use crate::context::DEFAULT_COMPLETION_RESERVE;
use crate::health::HealthConfig;
use crate::memory::MemoryConfig;
use crate::scheduler::SchedulerConfig;

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaestroConfig {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub memory: MemorySection,
    #[serde(default)]
    pub budget: BudgetSection,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub health: HealthSection,
}

impl MaestroConfig {
    /// Parse a TOML document, filling omitted sections with defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerSection {
    #[serde(default = "default_max_tasks_per_cycle")]
    pub max_tasks_per_cycle: u32,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_tasks_per_cycle: default_max_tasks_per_cycle(),
        }
    }
}

impl From<&SchedulerSection> for SchedulerConfig {
    fn from(s: &SchedulerSection) -> Self {
        Self {
            max_tasks_per_cycle: s.max_tasks_per_cycle,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerSection {
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            history_size: default_history_size(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl From<&BrokerSection> for BrokerConfig {
    fn from(s: &BrokerSection) -> Self {
        Self {
            history_size: s.history_size,
            request_timeout: Duration::from_secs(s.request_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemorySection {
    #[serde(default = "default_short_term_ttl_secs")]
    pub short_term_ttl_secs: u64,
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,
    #[serde(default = "default_prune_threshold")]
    pub prune_threshold: f64,
    #[serde(default = "default_fetch_multiplier")]
    pub fetch_multiplier: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            short_term_ttl_secs: default_short_term_ttl_secs(),
            decay_rate: default_decay_rate(),
            prune_threshold: default_prune_threshold(),
            fetch_multiplier: default_fetch_multiplier(),
        }
    }
}

impl From<&MemorySection> for MemoryConfig {
    fn from(s: &MemorySection) -> Self {
        Self {
            short_term_ttl: Duration::from_secs(s.short_term_ttl_secs),
            decay_rate: s.decay_rate,
            prune_threshold: s.prune_threshold,
            fetch_multiplier: s.fetch_multiplier,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BudgetSection {
    #[serde(default = "default_agent_cap")]
    pub agent_cap: u64,
    #[serde(default = "default_project_cap")]
    pub project_cap: u64,
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: f64,
    #[serde(default = "default_prompt_split")]
    pub prompt_split: f64,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            agent_cap: default_agent_cap(),
            project_cap: default_project_cap(),
            warn_threshold: default_warn_threshold(),
            prompt_split: default_prompt_split(),
        }
    }
}

impl From<&BudgetSection> for BudgetConfig {
    fn from(s: &BudgetSection) -> Self {
        Self {
            agent_cap: s.agent_cap,
            project_cap: s.project_cap,
            warn_threshold: s.warn_threshold,
            prompt_split: s.prompt_split,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextSection {
    #[serde(default = "default_completion_reserve")]
    pub completion_reserve: usize,
    /// Per-model context limits, merged over the built-in table.
    #[serde(default)]
    pub model_limits: HashMap<String, usize>,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            completion_reserve: default_completion_reserve(),
            model_limits: HashMap::new(),
        }
    }
}

impl ContextSection {
    /// The built-in limit table overlaid with configured overrides.
    pub fn effective_limits(&self) -> HashMap<String, usize> {
        let mut limits = crate::context::default_model_limits();
        for (model, limit) in &self.model_limits {
            limits.insert(model.clone(), *limit);
        }
        limits
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthSection {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_stuck_threshold_secs")]
    pub stuck_threshold_secs: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            stuck_threshold_secs: default_stuck_threshold_secs(),
            max_restarts: default_max_restarts(),
        }
    }
}

impl From<&HealthSection> for HealthConfig {
    fn from(s: &HealthSection) -> Self {
        Self {
            poll_interval: Duration::from_secs(s.poll_interval_secs),
            stuck_threshold: Duration::from_secs(s.stuck_threshold_secs),
            max_restarts: s.max_restarts,
        }
    }
}

fn default_max_tasks_per_cycle() -> u32 {
    5
}
fn default_history_size() -> usize {
    1000
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_short_term_ttl_secs() -> u64 {
    60 * 60 * 24
}
fn default_decay_rate() -> f64 {
    0.1
}
fn default_prune_threshold() -> f64 {
    0.2
}
fn default_fetch_multiplier() -> usize {
    3
}
fn default_agent_cap() -> u64 {
    500_000
}
fn default_project_cap() -> u64 {
    2_000_000
}
fn default_warn_threshold() -> f64 {
    0.8
}
fn default_prompt_split() -> f64 {
    0.7
}
fn default_completion_reserve() -> usize {
    DEFAULT_COMPLETION_RESERVE
}
fn default_poll_interval_secs() -> u64 {
    30
}
fn default_stuck_threshold_secs() -> u64 {
    900
}
fn default_max_restarts() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = MaestroConfig::from_toml_str("").unwrap();
        assert_eq!(config.scheduler.max_tasks_per_cycle, 5);
        assert_eq!(config.broker.history_size, 1000);
        assert_eq!(config.broker.request_timeout_secs, 30);
        assert_eq!(config.memory.short_term_ttl_secs, 86_400);
        assert_eq!(config.memory.decay_rate, 0.1);
        assert_eq!(config.memory.prune_threshold, 0.2);
        assert_eq!(config.memory.fetch_multiplier, 3);
        assert_eq!(config.budget.agent_cap, 500_000);
        assert_eq!(config.budget.project_cap, 2_000_000);
        assert_eq!(config.budget.warn_threshold, 0.8);
        assert_eq!(config.context.completion_reserve, 4096);
        assert_eq!(config.health.poll_interval_secs, 30);
        assert_eq!(config.health.stuck_threshold_secs, 900);
        assert_eq!(config.health.max_restarts, 3);
    }

    #[test]
    fn sections_override_selected_fields() {
        let config = MaestroConfig::from_toml_str(
            r#"
[scheduler]
max_tasks_per_cycle = 2

[broker]
history_size = 50

[context]
completion_reserve = 2048

[context.model_limits]
"local-llm" = 32000
"#,
        )
        .unwrap();

        assert_eq!(config.scheduler.max_tasks_per_cycle, 2);
        assert_eq!(config.broker.history_size, 50);
        assert_eq!(config.broker.request_timeout_secs, 30);
        assert_eq!(config.context.completion_reserve, 2048);

        let limits = config.context.effective_limits();
        assert_eq!(limits.get("local-llm"), Some(&32_000));
        assert_eq!(limits.get("gpt-4"), Some(&8_192));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = MaestroConfig::from_toml_str("[scheduler]\nmystery = 1\n");
        assert!(err.is_err());
    }

    #[test]
    fn component_configs_convert() {
        let config = MaestroConfig::default();
        let broker: BrokerConfig = (&config.broker).into();
        assert_eq!(broker.request_timeout, Duration::from_secs(30));
        let health: HealthConfig = (&config.health).into();
        assert_eq!(health.stuck_threshold, Duration::from_secs(900));
        let memory: MemoryConfig = (&config.memory).into();
        assert_eq!(memory.short_term_ttl, Duration::from_secs(86_400));
    }
}
