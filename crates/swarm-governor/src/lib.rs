//! Decision tables for swarm governance.
//!
//! A [DecisionTable] is an ordered list of [PolicyRule]s. Evaluation is a pure function
//! of the input facts and the rule set: rules are visited in ascending priority, the
//! first rule whose conditions all equal the facts wins, and every visited rule leaves
//! one line in the explain trace. When nothing matches the decision falls back to
//! [DEFAULT_ACTION]; tables that want deny-by-default add a catch-all rule with empty
//! conditions at the lowest priority.
//!
//! Conditions are exact equality only. There are no wildcards, ranges or patterns.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_ACTION: &str = "allow";

/// Input facts keyed by field name.
pub type Facts = BTreeMap<String, Value>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub rule_id: String,
    #[serde(default)]
    pub conditions: BTreeMap<String, Value>,
    pub action: String,
    #[serde(default)]
    pub priority: i64,
}

impl PolicyRule {
    pub fn new(rule_id: impl Into<String>, action: impl Into<String>, priority: i64) -> Self {
        Self {
            rule_id: rule_id.into(),
            conditions: BTreeMap::new(),
            action: action.into(),
            priority,
        }
    }

    pub fn when(mut self, field: impl Into<String>, expected: impl Into<Value>) -> Self {
        self.conditions.insert(field.into(), expected.into());
        self
    }

    /// Returns the first mismatching `(field, actual, expected)` or `None` on a full match.
    fn first_mismatch<'a>(
        &'a self,
        facts: &'a Facts,
    ) -> Option<(&'a str, Option<&'a Value>, &'a Value)> {
        self.conditions
            .iter()
            .find_map(|(field, expected)| match facts.get(field) {
                Some(actual) if actual == expected => None,
                actual => Some((field.as_str(), actual, expected)),
            })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    /// Empty when no rule matched.
    pub matched_rule_id: String,
    pub action: String,
    pub explain: Vec<String>,
    pub inputs: Facts,
    pub timestamp: DateTime<Utc>,
}

impl PolicyDecision {
    pub fn matched(&self) -> bool {
        !self.matched_rule_id.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum GovernorError {
    #[error("duplicate rule id: {0}")]
    DuplicateRule(String),
    #[error("Serialization error: {0}")]
    Serde(String),
}

/// Anything that turns facts into an explained decision.
pub trait DecisionEngine: Send + Sync {
    fn evaluate(&self, facts: &Facts) -> PolicyDecision;
}

#[derive(Clone, Debug, Default)]
pub struct DecisionTable {
    rules: Vec<PolicyRule>,
}

impl DecisionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rules(rules: impl IntoIterator<Item = PolicyRule>) -> Result<Self, GovernorError> {
        let mut table = Self::new();
        for rule in rules {
            table.add_rule(rule)?;
        }
        Ok(table)
    }

    /// Loads a JSON array of rules.
    pub fn from_json(json: &str) -> Result<Self, GovernorError> {
        let rules: Vec<PolicyRule> =
            serde_json::from_str(json).map_err(|err| GovernorError::Serde(err.to_string()))?;
        Self::from_rules(rules)
    }

    /// Inserts a rule and re-sorts the table by ascending priority. Rules with equal
    /// priority keep insertion order.
    pub fn add_rule(&mut self, rule: PolicyRule) -> Result<(), GovernorError> {
        if self.rules.iter().any(|r| r.rule_id == rule.rule_id) {
            return Err(GovernorError::DuplicateRule(rule.rule_id));
        }
        self.rules.push(rule);
        self.rules.sort_by_key(|r| r.priority);
        Ok(())
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl DecisionEngine for DecisionTable {
    fn evaluate(&self, facts: &Facts) -> PolicyDecision {
        let mut explain = Vec::with_capacity(self.rules.len() + 1);
        for rule in &self.rules {
            match rule.first_mismatch(facts) {
                None => {
                    explain.push(format!("{}: matched", rule.rule_id));
                    return PolicyDecision {
                        matched_rule_id: rule.rule_id.clone(),
                        action: rule.action.clone(),
                        explain,
                        inputs: facts.clone(),
                        timestamp: Utc::now(),
                    };
                }
                Some((field, actual, expected)) => explain.push(format!(
                    "{}: skip, {}={} != {}",
                    rule.rule_id,
                    field,
                    actual.map(render).unwrap_or_else(|| "<missing>".to_string()),
                    render(expected)
                )),
            }
        }
        explain.push(format!("no rule matched, default={}", DEFAULT_ACTION));
        PolicyDecision {
            matched_rule_id: String::new(),
            action: DEFAULT_ACTION.to_string(),
            explain,
            inputs: facts.clone(),
            timestamp: Utc::now(),
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn facts(pairs: &[(&str, Value)]) -> Facts {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn network_table() -> DecisionTable {
        DecisionTable::from_rules([
            PolicyRule::new("r2", "allow", 1).when("net", "online"),
            PolicyRule::new("r1", "block", 0).when("net", "offline"),
        ])
        .unwrap()
    }

    #[test]
    fn first_matching_rule_wins() {
        let decision = network_table().evaluate(&facts(&[("net", json!("offline"))]));
        assert_eq!(decision.matched_rule_id, "r1");
        assert_eq!(decision.action, "block");
        assert_eq!(decision.explain, vec!["r1: matched".to_string()]);
    }

    #[test]
    fn no_match_defaults_to_allow_with_full_trace() {
        let decision = network_table().evaluate(&facts(&[("net", json!("degraded"))]));
        assert_eq!(decision.matched_rule_id, "");
        assert!(!decision.matched());
        assert_eq!(decision.action, "allow");
        assert_eq!(
            decision.explain,
            vec![
                "r1: skip, net=degraded != offline".to_string(),
                "r2: skip, net=degraded != online".to_string(),
                "no rule matched, default=allow".to_string(),
            ]
        );
        assert_eq!(decision.inputs["net"], json!("degraded"));
    }

    #[test]
    fn rules_sorted_by_priority_stable_on_ties() {
        let mut table = DecisionTable::new();
        table.add_rule(PolicyRule::new("late", "a", 5)).unwrap();
        table.add_rule(PolicyRule::new("tie-1", "b", 1)).unwrap();
        table.add_rule(PolicyRule::new("tie-2", "c", 1)).unwrap();
        table.add_rule(PolicyRule::new("first", "d", -1)).unwrap();
        let order: Vec<&str> = table.rules().iter().map(|r| r.rule_id.as_str()).collect();
        assert_eq!(order, vec!["first", "tie-1", "tie-2", "late"]);
    }

    #[test]
    fn catch_all_gives_deny_by_default() {
        let mut table = network_table();
        table
            .add_rule(PolicyRule::new("deny-rest", "deny", 100))
            .unwrap();
        let decision = table.evaluate(&facts(&[("net", json!("degraded"))]));
        assert_eq!(decision.matched_rule_id, "deny-rest");
        assert_eq!(decision.action, "deny");
        assert_eq!(decision.explain.len(), 3);
    }

    #[test]
    fn missing_fact_is_a_mismatch() {
        let table =
            DecisionTable::from_rules([PolicyRule::new("ci", "block", 0).when("ci_green", false)])
                .unwrap();
        let decision = table.evaluate(&Facts::new());
        assert_eq!(decision.action, "allow");
        assert_eq!(decision.explain[0], "ci: skip, ci_green=<missing> != false");
    }

    #[test]
    fn all_conditions_must_match_exactly() {
        let table = DecisionTable::from_rules([PolicyRule::new("merge", "merge", 0)
            .when("ci_green", true)
            .when("approvals", 2)])
        .unwrap();
        let partial = table.evaluate(&facts(&[("ci_green", json!(true)), ("approvals", json!(1))]));
        assert_eq!(partial.action, "allow");
        assert_eq!(partial.explain[0], "merge: skip, approvals=1 != 2");

        let full = table.evaluate(&facts(&[("ci_green", json!(true)), ("approvals", json!(2))]));
        assert_eq!(full.matched_rule_id, "merge");
        assert_eq!(full.action, "merge");
    }

    #[test]
    fn trace_is_reproducible() {
        let table = network_table();
        let input = facts(&[("net", json!("degraded"))]);
        let a = table.evaluate(&input);
        let b = table.evaluate(&input);
        assert_eq!(a.explain, b.explain);
        assert_eq!(a.action, b.action);
        assert_eq!(a.matched_rule_id, b.matched_rule_id);
    }

    #[test]
    fn duplicate_rule_id_is_rejected() {
        let mut table = network_table();
        let err = table
            .add_rule(PolicyRule::new("r1", "allow", 9))
            .unwrap_err();
        assert!(matches!(err, GovernorError::DuplicateRule(id) if id == "r1"));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn table_loads_from_json() {
        let table = DecisionTable::from_json(
            r#"[
                {"rule_id": "freeze", "conditions": {"window": "freeze"}, "action": "block", "priority": 0},
                {"rule_id": "fallback", "action": "deny", "priority": 10}
            ]"#,
        )
        .unwrap();
        assert_eq!(table.len(), 2);
        let decision = table.evaluate(&facts(&[("window", json!("open"))]));
        assert_eq!(decision.matched_rule_id, "fallback");

        let err = DecisionTable::from_json(
            r#"[{"rule_id": "x", "action": "a"}, {"rule_id": "x", "action": "b"}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, GovernorError::DuplicateRule(_)));
    }
}
