//! Cross-project pattern transfer.
//!
//! Successful approaches from one project are registered as patterns and
//! surfaced for similar tasks in later projects. Pattern relevance combines
//! term overlap with applicability matches, weighted by the pattern's
//! observed success rate; failing patterns decay below the retrieval
//! threshold over time.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{AdrStatus, ArchitectureDecision};

/// Categories of learned patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternCategory {
    Architecture,
    CodeStructure,
    ErrorHandling,
    Testing,
    Security,
    Performance,
    Deployment,
    Workflow,
}

/// A learned, transferable pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectPattern {
    pub id: String,
    pub category: PatternCategory,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub problem_context: String,
    pub solution_approach: String,
    #[serde(default)]
    pub implementation_notes: String,
    #[serde(default)]
    pub success_count: u32,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub avg_quality_score: f64,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub frameworks: Vec<String>,
    #[serde(default)]
    pub project_types: Vec<String>,
    #[serde(default)]
    pub source_project_id: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

impl ProjectPattern {
    pub fn new(
        category: PatternCategory,
        name: impl Into<String>,
        problem_context: impl Into<String>,
        solution_approach: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            category,
            name: name.into(),
            description: String::new(),
            problem_context: problem_context.into(),
            solution_approach: solution_approach.into(),
            implementation_notes: String::new(),
            success_count: 0,
            failure_count: 0,
            avg_quality_score: 0.0,
            languages: Vec::new(),
            frameworks: Vec::new(),
            project_types: Vec::new(),
            source_project_id: String::new(),
            created_at: now,
            last_used: now,
        }
    }

    /// Observed success rate; 0.5 until any outcome is recorded.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.5
        } else {
            self.success_count as f64 / total as f64
        }
    }
}

/// Recorded outcome of applying a pattern to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternOutcome {
    pub pattern_id: String,
    pub task_id: String,
    pub project_id: String,
    pub success: bool,
    pub quality_score: f64,
    #[serde(default)]
    pub notes: String,
    pub recorded_at: DateTime<Utc>,
}

/// Filters for pattern retrieval.
#[derive(Debug, Clone, Default)]
pub struct PatternFilters {
    pub category: Option<PatternCategory>,
    pub language: Option<String>,
    pub framework: Option<String>,
    pub project_type: Option<String>,
    /// Patterns below this success rate are excluded. Defaults to 0.6.
    pub min_success_rate: Option<f64>,
}

const DEFAULT_MIN_SUCCESS_RATE: f64 = 0.6;

/// Registry of cross-project patterns and their outcomes.
#[derive(Debug, Default)]
pub struct PatternLibrary {
    patterns: RwLock<HashMap<String, ProjectPattern>>,
    outcomes: RwLock<Vec<PatternOutcome>>,
}

impl PatternLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pattern, deriving a content-based id when absent.
    pub fn register(&self, mut pattern: ProjectPattern) -> String {
        if pattern.id.is_empty() {
            pattern.id = pattern_id(&pattern);
        }
        let id = pattern.id.clone();
        tracing::info!(pattern = %pattern.name, category = ?pattern.category, "pattern registered");
        let mut patterns = self.patterns.write().unwrap_or_else(|e| e.into_inner());
        patterns.insert(id.clone(), pattern);
        id
    }

    pub fn get(&self, pattern_id: &str) -> Option<ProjectPattern> {
        let patterns = self.patterns.read().unwrap_or_else(|e| e.into_inner());
        patterns.get(pattern_id).cloned()
    }

    pub fn len(&self) -> usize {
        let patterns = self.patterns.read().unwrap_or_else(|e| e.into_inner());
        patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Patterns relevant to `task_description`, scored as
    ///
    /// `(0.3·overlap + 0.25·lang + 0.25·framework + 0.2·type) · (0.5 + 0.5·rate)`
    ///
    /// and filtered by the minimum success rate.
    pub fn find_similar(
        &self,
        task_description: &str,
        filters: &PatternFilters,
        limit: usize,
    ) -> Vec<ProjectPattern> {
        let min_rate = filters.min_success_rate.unwrap_or(DEFAULT_MIN_SUCCESS_RATE);
        let task_terms: std::collections::HashSet<String> = task_description
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let patterns = self.patterns.read().unwrap_or_else(|e| e.into_inner());
        let mut candidates: Vec<(f64, &ProjectPattern)> = Vec::new();

        for pattern in patterns.values() {
            if let Some(category) = filters.category {
                if pattern.category != category {
                    continue;
                }
            }
            if pattern.success_rate() < min_rate {
                continue;
            }
            if let Some(ref lang) = filters.language {
                if !pattern.languages.is_empty() && !pattern.languages.contains(lang) {
                    continue;
                }
            }
            if let Some(ref fw) = filters.framework {
                if !pattern.frameworks.is_empty() && !pattern.frameworks.contains(fw) {
                    continue;
                }
            }

            let score = relevance(pattern, &task_terms, filters);
            if score > 0.0 {
                candidates.push((score, pattern));
            }
        }

        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        candidates
            .into_iter()
            .take(limit)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Record the outcome of applying a pattern, updating its counters and
    /// running average quality.
    pub fn record_outcome(
        &self,
        pattern_id: &str,
        task_id: &str,
        project_id: &str,
        success: bool,
        quality_score: f64,
        notes: &str,
    ) {
        {
            let mut outcomes = self.outcomes.write().unwrap_or_else(|e| e.into_inner());
            outcomes.push(PatternOutcome {
                pattern_id: pattern_id.to_string(),
                task_id: task_id.to_string(),
                project_id: project_id.to_string(),
                success,
                quality_score,
                notes: notes.to_string(),
                recorded_at: Utc::now(),
            });
        }

        let mut patterns = self.patterns.write().unwrap_or_else(|e| e.into_inner());
        if let Some(pattern) = patterns.get_mut(pattern_id) {
            if success {
                pattern.success_count += 1;
            } else {
                pattern.failure_count += 1;
            }
            let total = (pattern.success_count + pattern.failure_count) as f64;
            pattern.avg_quality_score =
                (pattern.avg_quality_score * (total - 1.0) + quality_score) / total;
            pattern.last_used = Utc::now();
            tracing::info!(
                pattern = %pattern.name,
                success,
                rate = format!("{:.2}", pattern.success_rate()),
                "pattern outcome recorded"
            );
        }
    }

    /// Best practices for a category: success rate >= 0.7, sorted by rate
    /// then usage volume.
    pub fn best_practices(
        &self,
        category: PatternCategory,
        language: Option<&str>,
        limit: usize,
    ) -> Vec<ProjectPattern> {
        let patterns = self.patterns.read().unwrap_or_else(|e| e.into_inner());
        let mut matching: Vec<&ProjectPattern> = patterns
            .values()
            .filter(|p| p.category == category && p.success_rate() >= 0.7)
            .filter(|p| match language {
                Some(lang) => p.languages.is_empty() || p.languages.iter().any(|l| l == lang),
                None => true,
            })
            .collect();
        matching.sort_by(|a, b| {
            b.success_rate()
                .partial_cmp(&a.success_rate())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.success_count.cmp(&a.success_count))
        });
        matching.into_iter().take(limit).cloned().collect()
    }

    pub fn by_category(&self, category: PatternCategory) -> Vec<ProjectPattern> {
        let patterns = self.patterns.read().unwrap_or_else(|e| e.into_inner());
        patterns
            .values()
            .filter(|p| p.category == category)
            .cloned()
            .collect()
    }

    /// Convert a completed project's accepted architecture decisions into
    /// transferable patterns. Each extracted pattern starts with one success.
    pub fn extract_from_decisions(
        &self,
        project_id: &str,
        decisions: &[ArchitectureDecision],
        language: Option<&str>,
        framework: Option<&str>,
    ) -> Vec<String> {
        let mut ids = Vec::new();
        for adr in decisions.iter().filter(|d| d.status == AdrStatus::Accepted) {
            let mut pattern = ProjectPattern::new(
                PatternCategory::Architecture,
                format!("Architecture: {}", adr.title),
                adr.context.clone(),
                adr.decision.clone(),
            );
            pattern.description = adr.rationale.clone();
            pattern.implementation_notes = adr.consequences.join("; ");
            pattern.languages = language.map(|l| vec![l.to_string()]).unwrap_or_default();
            pattern.frameworks = framework.map(|f| vec![f.to_string()]).unwrap_or_default();
            pattern.source_project_id = project_id.to_string();
            pattern.success_count = 1;
            ids.push(self.register(pattern));
        }
        tracing::info!(project_id, extracted = ids.len(), "patterns extracted from decisions");
        ids
    }
}

fn relevance(
    pattern: &ProjectPattern,
    task_terms: &std::collections::HashSet<String>,
    filters: &PatternFilters,
) -> f64 {
    let mut pattern_terms: std::collections::HashSet<String> = pattern
        .description
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    pattern_terms.extend(
        pattern
            .problem_context
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string),
    );

    let overlap = task_terms.intersection(&pattern_terms).count();
    let mut score = 0.0;
    if overlap > 0 {
        score += 0.3 * (overlap as f64 / 5.0).min(1.0);
    }
    if let Some(ref lang) = filters.language {
        if pattern.languages.contains(lang) {
            score += 0.25;
        }
    }
    if let Some(ref fw) = filters.framework {
        if pattern.frameworks.contains(fw) {
            score += 0.25;
        }
    }
    if let Some(ref pt) = filters.project_type {
        if pattern.project_types.contains(pt) {
            score += 0.2;
        }
    }

    score * (0.5 + 0.5 * pattern.success_rate())
}

fn pattern_id(pattern: &ProjectPattern) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pattern.name.as_bytes());
    hasher.update(b":");
    hasher.update(format!("{:?}", pattern.category).as_bytes());
    hasher.update(b":");
    hasher.update(pattern.problem_context.as_bytes());
    hex::encode(hasher.finalize())[..12].to_string()
}
