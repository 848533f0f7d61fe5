//! Upstream error classification through the admin-configured rule set.

use regex::Regex;

use relay_types::{ErrorCategory, ErrorRule, MatchType};

/// Reduced outcome of an upstream attempt, consumed by the breaker and the
/// retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The attempt completed; breaker failure count resets.
    Success,
    /// Transient failure; counts toward the breaker and permits retry.
    RetryableFailure,
    /// Permanent failure; surfaced to the client, breaker unaffected.
    FatalFailure,
    /// Upstream concurrency pressure; retryable, never counted.
    ConcurrentLimited,
}

impl Outcome {
    /// Whether the dispatcher may re-enter selection after this outcome.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::RetryableFailure | Self::ConcurrentLimited)
    }
}

struct CompiledRule {
    rule: ErrorRule,
    regex: Option<Regex>,
}

/// The ordered rule set with patterns compiled once.
///
/// Rules are consulted in `(priority desc, created_at asc)` order and the
/// first match wins. Disabled rules and rules whose regex fails to compile
/// are dropped at construction.
pub struct RuleEngine {
    rules: Vec<CompiledRule>,
}

impl RuleEngine {
    /// Build an engine from the admin rule set.
    #[must_use]
    pub fn new(mut rules: Vec<ErrorRule>) -> Self {
        rules.retain(|r| r.is_enabled);
        rules.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        let rules = rules
            .into_iter()
            .filter_map(|rule| {
                let regex = match rule.match_type {
                    MatchType::Regex => match Regex::new(&rule.pattern) {
                        Ok(re) => Some(re),
                        Err(err) => {
                            tracing::warn!(rule_id = rule.id, %err, "dropping error rule with invalid regex");
                            return None;
                        }
                    },
                    _ => None,
                };
                Some(CompiledRule { rule, regex })
            })
            .collect();
        Self { rules }
    }

    /// An engine with no rules; classification falls back to status families.
    #[must_use]
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// First matching rule's category for `message`, if any.
    #[must_use]
    pub fn categorize(&self, message: &str) -> Option<ErrorCategory> {
        let lowered = message.to_lowercase();
        for compiled in &self.rules {
            let matched = match compiled.rule.match_type {
                MatchType::Regex => compiled
                    .regex
                    .as_ref()
                    .is_some_and(|re| re.is_match(message)),
                MatchType::Contains => lowered.contains(&compiled.rule.pattern.to_lowercase()),
                MatchType::Exact => message == compiled.rule.pattern,
            };
            if matched {
                return Some(compiled.rule.category);
            }
        }
        None
    }

    /// Reduce an upstream failure to an [`Outcome`]. Rule matches override
    /// the status-family default: 429 is concurrency pressure, 5xx and
    /// transport errors (no status) are retryable, remaining 4xx are fatal.
    #[must_use]
    pub fn classify(&self, status: Option<u16>, message: &str) -> Outcome {
        if let Some(category) = self.categorize(message) {
            return match category {
                ErrorCategory::Retryable => Outcome::RetryableFailure,
                ErrorCategory::Fatal => Outcome::FatalFailure,
                ErrorCategory::ConcurrentLimited => Outcome::ConcurrentLimited,
            };
        }
        match status {
            Some(429) => Outcome::ConcurrentLimited,
            Some(s) if s >= 500 => Outcome::RetryableFailure,
            Some(s) if s >= 400 => Outcome::FatalFailure,
            Some(_) => Outcome::Success,
            None => Outcome::RetryableFailure,
        }
    }
}
