//! Trust classification of tool invocations.
//!
//! A workspace's rules map glob patterns over tool names to a [`TrustTier`].
//! When several rules match, a [`RulePrecedence`] strategy picks the winner;
//! the default is [`MostSpecificMatch`]. No match yields the global default tier.
//! Store failures never degrade to a permissive answer.

use regex::Regex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::{TrustDefaultStore, TrustRule, TrustRuleStore, TrustTier};

#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("trust classification unavailable: {0}")]
    Unavailable(String),
}

/// A compiled tool-name glob. `*` matches any run of characters (including
/// none), `?` exactly one character; everything else is literal.
#[derive(Debug, Clone)]
pub struct ToolPattern {
    source: String,
    regex: Regex,
}

impl ToolPattern {
    pub fn compile(pattern: &str) -> Result<Self, regex::Error> {
        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        for c in pattern.chars() {
            match c {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
            }
        }
        expr.push('$');
        Ok(Self {
            source: pattern.to_string(),
            regex: Regex::new(&expr)?,
        })
    }

    pub fn matches(&self, tool_name: &str) -> bool {
        self.regex.is_match(tool_name)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Characters before the first wildcard.
    pub fn literal_prefix_len(&self) -> usize {
        self.source
            .chars()
            .take_while(|c| *c != '*' && *c != '?')
            .count()
    }

    /// Non-wildcard characters anywhere in the pattern.
    pub fn literal_len(&self) -> usize {
        self.source
            .chars()
            .filter(|c| *c != '*' && *c != '?')
            .count()
    }
}

/// A rule whose pattern matched the tool being classified.
#[derive(Debug, Clone)]
pub struct RuleMatch<'a> {
    pub rule: &'a TrustRule,
    pub pattern: ToolPattern,
}

/// Chooses among several matching rules.
pub trait RulePrecedence: Send + Sync {
    fn select<'a>(&self, tool_name: &str, matches: &[RuleMatch<'a>]) -> Option<&'a TrustRule>;
}

/// Longest literal prefix wins. Ties go to the pattern with more literal
/// characters, then to the stricter tier, then to the lexically smaller pattern.
#[derive(Debug, Default, Clone, Copy)]
pub struct MostSpecificMatch;

impl RulePrecedence for MostSpecificMatch {
    fn select<'a>(&self, _tool_name: &str, matches: &[RuleMatch<'a>]) -> Option<&'a TrustRule> {
        matches
            .iter()
            .max_by(|a, b| {
                a.pattern
                    .literal_prefix_len()
                    .cmp(&b.pattern.literal_prefix_len())
                    .then_with(|| a.pattern.literal_len().cmp(&b.pattern.literal_len()))
                    .then_with(|| a.rule.tier.cmp(&b.rule.tier))
                    .then_with(|| b.pattern.as_str().cmp(a.pattern.as_str()))
            })
            .map(|m| m.rule)
    }
}

pub struct TrustClassifier {
    rules: Arc<dyn TrustRuleStore>,
    defaults: Arc<dyn TrustDefaultStore>,
    precedence: Arc<dyn RulePrecedence>,
}

impl TrustClassifier {
    pub fn new(rules: Arc<dyn TrustRuleStore>, defaults: Arc<dyn TrustDefaultStore>) -> Self {
        Self::with_precedence(rules, defaults, Arc::new(MostSpecificMatch))
    }

    pub fn with_precedence(
        rules: Arc<dyn TrustRuleStore>,
        defaults: Arc<dyn TrustDefaultStore>,
        precedence: Arc<dyn RulePrecedence>,
    ) -> Self {
        Self {
            rules,
            defaults,
            precedence,
        }
    }

    pub fn classify(
        &self,
        workspace_id: &str,
        tool_name: &str,
    ) -> Result<TrustTier, ClassificationError> {
        let rules = self.rules.rules_for_workspace(workspace_id).map_err(|e| {
            warn!(
                "Failed to load trust rules for workspace {}: {:#}",
                workspace_id, e
            );
            ClassificationError::Unavailable("rule store".to_string())
        })?;

        // Any unusable rule fails the whole classification.
        let mut matches = Vec::new();
        for rule in &rules {
            let pattern = ToolPattern::compile(&rule.pattern).map_err(|e| {
                warn!(
                    "Unusable trust pattern '{}' in workspace {}: {}",
                    rule.pattern, workspace_id, e
                );
                ClassificationError::Unavailable("rule pattern".to_string())
            })?;
            if pattern.matches(tool_name) {
                matches.push(RuleMatch { rule, pattern });
            }
        }

        if let Some(rule) = self.precedence.select(tool_name, &matches) {
            debug!(
                "Tool {} in workspace {} matched '{}' -> {}",
                tool_name, workspace_id, rule.pattern, rule.tier
            );
            return Ok(rule.tier);
        }

        let tier = self.defaults.default_tier().map_err(|e| {
            warn!("Failed to load default trust tier: {:#}", e);
            ClassificationError::Unavailable("default store".to_string())
        })?;
        debug!(
            "Tool {} in workspace {} matched no rule, default {}",
            tool_name, workspace_id, tier
        );
        Ok(tier)
    }
}
