//! Token budget tracking and enforcement.
//!
//! Tracks prompt/completion usage per agent and rolled up per project.
//! Crossing the warning threshold logs once per crossing; reaching a cap
//! fails closed: `can_proceed` gates further work.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Errors from budget operations.
#[derive(Debug, Error)]
pub enum BudgetError {
    /// The per-agent or project cap was crossed.
    #[error("budget exceeded for {scope}: {used} of {cap} tokens")]
    Exceeded { scope: String, used: u64, cap: u64 },
}

/// Token budget allocation for an agent or a project.
#[derive(Debug, Clone, Serialize)]
pub struct TokenBudget {
    pub max_prompt_tokens: u64,
    pub max_completion_tokens: u64,
    pub max_total_tokens: u64,
    pub warn_threshold: f64,
    pub used_prompt: u64,
    pub used_completion: u64,
}

impl TokenBudget {
    pub fn new(max_total: u64, prompt_split: f64, warn_threshold: f64) -> Self {
        Self {
            max_prompt_tokens: (max_total as f64 * prompt_split) as u64,
            max_completion_tokens: (max_total as f64 * (1.0 - prompt_split)) as u64,
            max_total_tokens: max_total,
            warn_threshold,
            used_prompt: 0,
            used_completion: 0,
        }
    }

    pub fn used_total(&self) -> u64 {
        self.used_prompt + self.used_completion
    }

    pub fn remaining_total(&self) -> u64 {
        self.max_total_tokens.saturating_sub(self.used_total())
    }

    pub fn utilization(&self) -> f64 {
        if self.max_total_tokens == 0 {
            return 0.0;
        }
        self.used_total() as f64 / self.max_total_tokens as f64
    }

    pub fn is_exceeded(&self) -> bool {
        self.used_total() >= self.max_total_tokens
    }

    pub fn is_warning(&self) -> bool {
        self.utilization() >= self.warn_threshold
    }
}

/// One recorded usage event.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub agent_id: String,
    pub prompt: u64,
    pub completion: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Configuration for the budget manager.
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    /// Default per-agent total cap.
    pub agent_cap: u64,
    /// Project-wide total cap.
    pub project_cap: u64,
    /// Utilization at which a warning fires.
    pub warn_threshold: f64,
    /// Fraction of an agent cap reserved for prompt tokens; the rest is
    /// completion.
    pub prompt_split: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            agent_cap: 500_000,
            project_cap: 2_000_000,
            warn_threshold: 0.8,
            prompt_split: 0.7,
        }
    }
}

#[derive(Debug)]
struct BudgetState {
    project: TokenBudget,
    agents: HashMap<String, TokenBudget>,
    usage_log: Vec<UsageRecord>,
}

/// Manages token budgets across agents and the project.
#[derive(Debug)]
pub struct BudgetManager {
    config: BudgetConfig,
    state: Mutex<BudgetState>,
}

impl BudgetManager {
    pub fn new(config: BudgetConfig) -> Self {
        let project = TokenBudget::new(config.project_cap, config.prompt_split, config.warn_threshold);
        Self {
            config,
            state: Mutex::new(BudgetState {
                project,
                agents: HashMap::new(),
                usage_log: Vec::new(),
            }),
        }
    }

    /// Allocate a budget for an agent, replacing any existing allocation.
    pub fn allocate_agent(&self, agent_id: &str, max_tokens: u64) -> TokenBudget {
        let budget = TokenBudget::new(max_tokens, self.config.prompt_split, self.config.warn_threshold);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.agents.insert(agent_id.to_string(), budget.clone());
        tracing::info!(agent_id, max_tokens, "budget allocated");
        budget
    }

    /// Record usage for an agent, rolling it into the project total.
    /// Agents without an allocation get the default cap on first use.
    ///
    /// Returns false once the agent's budget is exceeded.
    pub fn record_usage(&self, agent_id: &str, prompt: u64, completion: u64) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if !state.agents.contains_key(agent_id) {
            let budget = TokenBudget::new(
                self.config.agent_cap,
                self.config.prompt_split,
                self.config.warn_threshold,
            );
            state.agents.insert(agent_id.to_string(), budget);
        }

        let was_warning = state.agents[agent_id].is_warning();
        let was_project_warning = state.project.is_warning();

        {
            let agent = state.agents.get_mut(agent_id).expect("just inserted");
            agent.used_prompt += prompt;
            agent.used_completion += completion;
        }
        state.project.used_prompt += prompt;
        state.project.used_completion += completion;

        state.usage_log.push(UsageRecord {
            agent_id: agent_id.to_string(),
            prompt,
            completion,
            recorded_at: Utc::now(),
        });

        let agent = &state.agents[agent_id];
        if agent.is_warning() && !was_warning && !agent.is_exceeded() {
            tracing::warn!(
                agent_id,
                utilization = format!("{:.0}%", agent.utilization() * 100.0),
                "agent nearing token budget"
            );
        }
        if state.project.is_warning() && !was_project_warning && !state.project.is_exceeded() {
            tracing::warn!(
                utilization = format!("{:.0}%", state.project.utilization() * 100.0),
                "project nearing token budget"
            );
        }
        if agent.is_exceeded() {
            tracing::error!(
                agent_id,
                used = agent.used_total(),
                cap = agent.max_total_tokens,
                "agent exceeded token budget"
            );
            return false;
        }
        true
    }

    /// Whether an agent may continue: false iff the project total or the
    /// agent's own total reached its cap.
    pub fn can_proceed(&self, agent_id: &str) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.project.is_exceeded() {
            return false;
        }
        match state.agents.get(agent_id) {
            Some(agent) => !agent.is_exceeded(),
            None => true,
        }
    }

    /// Check an agent, surfacing the exceeded scope as an error.
    pub fn check(&self, agent_id: &str) -> Result<(), BudgetError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.project.is_exceeded() {
            return Err(BudgetError::Exceeded {
                scope: "project".to_string(),
                used: state.project.used_total(),
                cap: state.project.max_total_tokens,
            });
        }
        if let Some(agent) = state.agents.get(agent_id) {
            if agent.is_exceeded() {
                return Err(BudgetError::Exceeded {
                    scope: format!("agent {agent_id}"),
                    used: agent.used_total(),
                    cap: agent.max_total_tokens,
                });
            }
        }
        Ok(())
    }

    pub fn agent_budget(&self, agent_id: &str) -> Option<TokenBudget> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.agents.get(agent_id).cloned()
    }

    pub fn project_budget(&self) -> TokenBudget {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.project.clone()
    }

    /// Total tokens used across the project.
    pub fn total_used(&self) -> u64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.project.used_total()
    }

    /// Number of recorded usage events.
    pub fn usage_events(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.usage_log.len()
    }

    /// Reset an agent's counters, keeping its caps.
    pub fn reset_agent(&self, agent_id: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(agent) = state.agents.get_mut(agent_id) {
            agent.used_prompt = 0;
            agent.used_completion = 0;
        }
    }
}
