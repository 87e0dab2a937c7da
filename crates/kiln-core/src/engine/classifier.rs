//! Exception classifier for chunk retry/skip/no-rollback policies.
//!
//! Resolves an artifact error's class against the ordered rule lists
//! configured on a chunk step. Resolution is most-specific-match: the rule
//! whose class path sits deepest above (or at) the error's class decides.
//! An error under an excluded entry is not skippable/retryable even when a
//! shallower include also covers it; only a strictly deeper include
//! re-admits it. On an include/exclude tie at equal depth the exclusion
//! wins.
//!
//! When an error matches both the retryable and the skippable lists, retry
//! is consulted first; skip applies once the retry budget is exhausted.

use kiln_types::error::BatchError;
use kiln_types::job::{ChunkConfig, ExceptionRule, RuleAction};

/// Compiled view of a chunk step's exception rule lists.
#[derive(Debug, Clone, Default)]
pub struct ExceptionClassifier {
    skippable: Vec<ExceptionRule>,
    retryable: Vec<ExceptionRule>,
    no_rollback: Vec<ExceptionRule>,
}

impl ExceptionClassifier {
    pub fn from_config(config: &ChunkConfig) -> Self {
        Self {
            skippable: config.skippable_exceptions.clone(),
            retryable: config.retryable_exceptions.clone(),
            no_rollback: config.no_rollback_exceptions.clone(),
        }
    }

    pub fn is_skippable(&self, error: &BatchError) -> bool {
        resolve(&self.skippable, error)
    }

    pub fn is_retryable(&self, error: &BatchError) -> bool {
        resolve(&self.retryable, error)
    }

    /// Whether a retryable error re-attempts in place instead of rolling the
    /// chunk back.
    pub fn is_no_rollback(&self, error: &BatchError) -> bool {
        resolve(&self.no_rollback, error)
    }
}

/// Specificity of a rule pattern: path depth, with `*` at zero.
fn pattern_depth(pattern: &str) -> usize {
    if pattern == "*" || pattern.is_empty() {
        0
    } else {
        pattern.split('.').count()
    }
}

/// Most-specific-match resolution over one rule list.
fn resolve(rules: &[ExceptionRule], error: &BatchError) -> bool {
    let mut best_depth: Option<usize> = None;
    let mut included = false;

    for rule in rules {
        if !error.class.is_covered_by(&rule.class) {
            continue;
        }
        let depth = pattern_depth(&rule.class);
        let more_specific = match best_depth {
            None => true,
            Some(best) => depth > best,
        };
        if more_specific {
            best_depth = Some(depth);
            included = rule.action == RuleAction::Include;
        } else if best_depth == Some(depth) && rule.action == RuleAction::Exclude {
            // Equal specificity: exclusion wins regardless of order.
            included = false;
        }
    }

    included
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
