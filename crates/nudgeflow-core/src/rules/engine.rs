//! Rule registry and evaluation loop.
//!
//! Evaluates every enabled rule against one input and returns one result per
//! rule. A rule that errors or panics never stops the loop.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};

use super::{builtin_rules, Rule, RuleInput, RuleResult};

/// Ordered set of rules with per-id disabling.
pub struct RuleEngine {
    rules: Vec<Box<dyn Rule>>,
    disabled: BTreeSet<String>,
}

impl RuleEngine {
    /// Engine with no rules registered.
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            disabled: BTreeSet::new(),
        }
    }

    /// Engine with the built-in rule set.
    pub fn with_builtin_rules() -> Self {
        let mut engine = Self::empty();
        for rule in builtin_rules() {
            engine.register(rule);
        }
        engine
    }

    /// Add a rule. Rules are kept in `(priority, id)` order; registering an
    /// id twice replaces the earlier rule.
    pub fn register(&mut self, rule: Box<dyn Rule>) {
        self.rules.retain(|r| r.id() != rule.id());
        self.rules.push(rule);
        self.rules.sort_by(|a, b| a.priority().cmp(&b.priority()).then_with(|| a.id().cmp(b.id())));
    }

    /// Disable rules by id. Unknown ids are kept so that rules registered
    /// later are still disabled.
    pub fn disable<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disabled.extend(ids.into_iter().map(Into::into));
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        !self.disabled.contains(id)
    }

    /// Enabled rules in evaluation order.
    pub fn rules(&self) -> impl Iterator<Item = &dyn Rule> {
        self.rules
            .iter()
            .map(|r| r.as_ref())
            .filter(move |r| self.is_enabled(r.id()))
    }

    /// Evaluate all enabled rules.
    pub fn evaluate(&self, input: &RuleInput<'_>) -> Vec<RuleResult> {
        self.rules().map(|rule| Self::evaluate_one(rule, input)).collect()
    }

    fn evaluate_one(rule: &dyn Rule, input: &RuleInput<'_>) -> RuleResult {
        let outcome = catch_unwind(AssertUnwindSafe(|| rule.evaluate(input)));
        let result = match outcome {
            Ok(Ok(mut result)) => {
                // Identity always comes from the registry, not the rule body.
                result.rule_id = rule.id().to_string();
                result.rule_name = rule.name().to_string();
                result.rule_priority = rule.priority();
                result
            }
            Ok(Err(e)) => {
                tracing::warn!(rule_id = rule.id(), error = %e, "rule evaluation failed");
                RuleResult::failed(rule, e.to_string())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::warn!(rule_id = rule.id(), panic = %message, "rule panicked during evaluation");
                RuleResult::failed(rule, format!("panic: {message}"))
            }
        };

        tracing::debug!(
            rule_id = rule.id(),
            triggered = result.triggered,
            escalate = result.requires_escalation,
            "evaluated rule"
        );
        result
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::with_builtin_rules()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BucketThresholds;
    use crate::recommendation::RecommendationContext;
    use crate::rules::{RuleError, Severity};
    use crate::snapshot::UserStateSnapshot;
    use chrono::Utc;

    struct Fixed {
        id: &'static str,
        priority: u32,
        fire: bool,
    }

    impl Rule for Fixed {
        fn id(&self) -> &'static str {
            self.id
        }
        fn name(&self) -> &'static str {
            "Fixed"
        }
        fn priority(&self) -> u32 {
            self.priority
        }
        fn evaluate(&self, _input: &RuleInput<'_>) -> Result<RuleResult, RuleError> {
            if self.fire {
                Ok(RuleResult::triggered(self, Severity::Warning).with_evidence("reason", "fixed"))
            } else {
                Ok(RuleResult::not_triggered(self))
            }
        }
    }

    struct Failing;

    impl Rule for Failing {
        fn id(&self) -> &'static str {
            "failing"
        }
        fn name(&self) -> &'static str {
            "Failing"
        }
        fn priority(&self) -> u32 {
            1
        }
        fn evaluate(&self, _input: &RuleInput<'_>) -> Result<RuleResult, RuleError> {
            Err(RuleError::MissingData("tasks".into()))
        }
    }

    struct Panicking;

    impl Rule for Panicking {
        fn id(&self) -> &'static str {
            "panicking"
        }
        fn name(&self) -> &'static str {
            "Panicking"
        }
        fn priority(&self) -> u32 {
            2
        }
        fn evaluate(&self, _input: &RuleInput<'_>) -> Result<RuleResult, RuleError> {
            panic!("index out of bounds")
        }
    }

    fn with_input<T>(f: impl FnOnce(&RuleInput<'_>) -> T) -> T {
        let snapshot = UserStateSnapshot::new("u1", Utc::now());
        let thresholds = BucketThresholds::default();
        let input = RuleInput {
            snapshot: &snapshot,
            signals: &[],
            context: RecommendationContext::OnDemand,
            thresholds: &thresholds,
        };
        f(&input)
    }

    #[test]
    fn test_failures_do_not_block_other_rules() {
        let mut engine = RuleEngine::empty();
        engine.register(Box::new(Failing));
        engine.register(Box::new(Panicking));
        engine.register(Box::new(Fixed { id: "fires", priority: 3, fire: true }));

        let results = with_input(|input| engine.evaluate(input));
        assert_eq!(results.len(), 3);

        assert_eq!(results[0].rule_id, "failing");
        assert!(!results[0].triggered);
        assert!(results[0].error().unwrap().contains("tasks"));

        assert_eq!(results[1].rule_id, "panicking");
        assert!(!results[1].triggered);
        assert!(results[1].error().unwrap().contains("index out of bounds"));

        assert!(results[2].triggered);
    }

    #[test]
    fn test_disabled_rules_are_skipped() {
        let mut engine = RuleEngine::empty();
        engine.disable(["quiet"]);
        engine.register(Box::new(Fixed { id: "quiet", priority: 1, fire: true }));
        engine.register(Box::new(Fixed { id: "loud", priority: 2, fire: true }));

        let results = with_input(|input| engine.evaluate(input));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].rule_id, "loud");
    }

    #[test]
    fn test_rules_run_in_priority_order() {
        let mut engine = RuleEngine::empty();
        engine.register(Box::new(Fixed { id: "b", priority: 20, fire: false }));
        engine.register(Box::new(Fixed { id: "a", priority: 10, fire: false }));
        engine.register(Box::new(Fixed { id: "c", priority: 10, fire: false }));

        let ids: Vec<&str> = engine.rules().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }

    #[test]
    fn test_builtin_rules_registered_once() {
        let engine = RuleEngine::with_builtin_rules();
        let ids: BTreeSet<&str> = engine.rules().map(|r| r.id()).collect();
        assert_eq!(ids.len(), builtin_rules().len());
    }
}
