//! Context-window validation.
//!
//! Rejects prompts that exceed a model's context limit before they reach the
//! API, and truncates oldest-first while retaining system messages. Token
//! counts are estimated at roughly four characters per token plus a small
//! per-message overhead.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from context validation.
#[derive(Debug, Error)]
pub enum ContextError {
    /// The prompt cannot fit even after dropping every droppable message.
    #[error("prompt overflows {model} context: {tokens} tokens for {available} available")]
    Overflow {
        model: String,
        tokens: usize,
        available: usize,
    },
}

/// Reserved completion tokens when no override is given.
pub const DEFAULT_COMPLETION_RESERVE: usize = 4096;

/// A chat message as seen by the validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.role == "system"
    }
}

/// Published context limits per model name. The fallback for unknown models
/// is 128k.
pub fn default_model_limits() -> HashMap<String, usize> {
    let mut limits = HashMap::new();
    for (model, limit) in [
        ("gpt-4o", 128_000),
        ("gpt-4o-mini", 128_000),
        ("gpt-4-turbo", 128_000),
        ("gpt-4", 8_192),
        ("gpt-3.5-turbo", 16_385),
        ("claude-3-opus", 200_000),
        ("claude-3-sonnet", 200_000),
        ("claude-3-haiku", 200_000),
        ("claude-3.5-sonnet", 200_000),
        ("gemini-pro", 1_000_000),
        ("gemini-1.5-pro", 1_000_000),
    ] {
        limits.insert(model.to_string(), limit);
    }
    limits
}

const FALLBACK_CONTEXT_LIMIT: usize = 128_000;

/// Estimate tokens for a text: ~4 characters per token, minimum 1.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() / 4).max(1)
}

/// Estimate tokens for a message list: content + role per message, 4 tokens
/// of per-message overhead, 3 priming tokens.
pub fn estimate_messages_tokens(messages: &[ChatMessage]) -> usize {
    let mut total = 3;
    for msg in messages {
        total += 4;
        total += estimate_tokens(&msg.content);
        total += estimate_tokens(&msg.role);
    }
    total
}

/// Validates prompts against a model's context window.
#[derive(Debug, Clone)]
pub struct ContextWindowValidator {
    model: String,
    context_limit: usize,
    completion_reserve: usize,
}

impl ContextWindowValidator {
    pub fn new(model: &str, completion_reserve: usize) -> Self {
        Self::with_limits(model, completion_reserve, &default_model_limits())
    }

    /// Build against a caller-supplied name→limit table.
    pub fn with_limits(
        model: &str,
        completion_reserve: usize,
        limits: &HashMap<String, usize>,
    ) -> Self {
        let context_limit = limits.get(model).copied().unwrap_or(FALLBACK_CONTEXT_LIMIT);
        Self {
            model: model.to_string(),
            context_limit,
            completion_reserve,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn context_limit(&self) -> usize {
        self.context_limit
    }

    /// Tokens available for the prompt after the completion reserve.
    pub fn available_prompt_tokens(&self, reserve_override: Option<usize>) -> usize {
        let reserve = reserve_override.unwrap_or(self.completion_reserve);
        self.context_limit.saturating_sub(reserve)
    }

    /// Whether the messages fit within the window.
    pub fn fits(&self, messages: &[ChatMessage], reserve_override: Option<usize>) -> bool {
        estimate_messages_tokens(messages) <= self.available_prompt_tokens(reserve_override)
    }

    /// Drop oldest non-system messages until the prompt fits.
    ///
    /// With `keep_system`, system messages are always retained; if they
    /// alone exceed the window the prompt is unsalvageable and
    /// [`ContextError::Overflow`] is returned.
    pub fn truncate(
        &self,
        messages: &[ChatMessage],
        reserve_override: Option<usize>,
        keep_system: bool,
    ) -> Result<Vec<ChatMessage>, ContextError> {
        if self.fits(messages, reserve_override) {
            return Ok(messages.to_vec());
        }

        let available = self.available_prompt_tokens(reserve_override);
        let system: Vec<&ChatMessage> = if keep_system {
            messages.iter().filter(|m| m.is_system()).collect()
        } else {
            Vec::new()
        };
        let others: Vec<&ChatMessage> = messages.iter().filter(|m| !keep_system || !m.is_system()).collect();

        let system_tokens: usize = system
            .iter()
            .map(|m| estimate_messages_tokens(std::slice::from_ref(*m)))
            .sum();
        if system_tokens > available {
            return Err(ContextError::Overflow {
                model: self.model.clone(),
                tokens: system_tokens,
                available,
            });
        }

        // Keep the newest suffix of the remaining messages that fits.
        let mut remaining = available - system_tokens;
        let mut kept: Vec<&ChatMessage> = Vec::new();
        for msg in others.iter().rev() {
            let tokens = estimate_messages_tokens(std::slice::from_ref(*msg));
            if remaining >= tokens {
                kept.push(msg);
                remaining -= tokens;
            } else {
                break;
            }
        }
        kept.reverse();

        let result: Vec<ChatMessage> = system
            .into_iter()
            .chain(kept)
            .cloned()
            .collect();

        tracing::info!(
            model = %self.model,
            from = messages.len(),
            to = result.len(),
            "context truncated"
        );
        Ok(result)
    }
}
