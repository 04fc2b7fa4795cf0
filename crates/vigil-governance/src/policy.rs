//! Policy versions and rule evaluation
//!
//! A [`PolicyVersion`] is immutable once published and identified by the
//! digest of its canonical encoding. Rules are evaluated in order; the first
//! rule whose action and context constraints match decides the effect.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use vigil_core::{codec, domain, Digest, HashAlgorithmId, Result, VigilError};

/// `record_type` of a policy publication
pub const POLICY_PUBLISHED: &str = "vigil.policy.published";

/// `record_type` of a policy activation (forward or rollback)
pub const POLICY_ACTIVATED: &str = "vigil.policy.activated";

/// Rule action that matches every action kind
pub const ANY_ACTION: &str = "*";

/// Action under evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    /// Action kind rules match on, e.g. `deploy`
    pub kind: String,
    /// What the action is applied to
    pub subject: String,
}

impl ActionDescriptor {
    /// Build a descriptor
    pub fn new(kind: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            subject: subject.into(),
        }
    }
}

/// Free-form evaluation context, keyed by name
pub type DecisionContext = BTreeMap<String, Value>;

/// What a matching rule does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum RuleEffect {
    /// Approve without a vote
    Approve,
    /// Reject without a vote
    Reject,
    /// Approve only if the quorum is met; `threshold` overrides the policy's
    RequireQuorum {
        /// Approvals needed, if different from the policy threshold
        threshold: Option<u32>,
    },
    /// Neither approve nor reject
    Defer,
}

/// One ordered rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Stable rule name, echoed in receipts
    pub id: String,
    /// Action kind, or `*`
    pub action: String,
    /// Context entries that must be present with exactly these values
    #[serde(default)]
    pub context_equals: BTreeMap<String, Value>,
    /// Effect when matched
    pub effect: RuleEffect,
}

impl PolicyRule {
    /// Whether the rule applies
    pub fn matches(&self, action: &ActionDescriptor, context: &DecisionContext) -> bool {
        (self.action == ANY_ACTION || self.action == action.kind)
            && self
                .context_equals
                .iter()
                .all(|(key, expected)| context.get(key) == Some(expected))
    }
}

/// Who may vote and how many approvals are needed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumPolicy {
    /// Approvals needed
    pub threshold: u32,
    /// Eligible approvers; empty means anyone may vote
    #[serde(default)]
    pub approvers: BTreeSet<String>,
}

/// Immutable, hash-identified rule set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyVersion {
    /// Human-readable label, e.g. `v1.4`
    pub label: String,
    /// Version this one supersedes
    pub predecessor: Option<Digest>,
    /// Ordered rules
    pub rules: Vec<PolicyRule>,
    /// Quorum settings
    pub quorum: QuorumPolicy,
    /// Effect when no rule matches
    pub default_effect: RuleEffect,
}

/// Effect chosen for an action, with the rule that chose it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch<'a> {
    /// Matching rule, `None` when the default applied
    pub rule: Option<&'a PolicyRule>,
    /// Effect to apply
    pub effect: RuleEffect,
}

impl PolicyVersion {
    /// Content digest identifying this version
    pub fn hash(&self, algorithm: HashAlgorithmId) -> Result<Digest> {
        codec::canonical_digest(algorithm, domain::POLICY, self)
    }

    /// Reject versions that could never be evaluated consistently
    pub fn validate(&self) -> Result<()> {
        if self.label.trim().is_empty() {
            return Err(VigilError::policy_version("policy label must not be empty"));
        }
        let mut seen = BTreeSet::new();
        for rule in &self.rules {
            if !seen.insert(rule.id.as_str()) {
                return Err(VigilError::policy_version(format!(
                    "rule id '{}' appears twice",
                    rule.id
                )));
            }
            if let RuleEffect::RequireQuorum { threshold: Some(0) } = rule.effect {
                return Err(VigilError::policy_version(format!(
                    "rule '{}' requires a quorum of zero",
                    rule.id
                )));
            }
        }
        if self.quorum.threshold == 0 {
            return Err(VigilError::policy_version("quorum threshold must be at least 1"));
        }
        let eligible = self.quorum.approvers.len();
        if eligible > 0 && (self.quorum.threshold as usize) > eligible {
            return Err(VigilError::policy_version(format!(
                "quorum threshold {} exceeds the {eligible} eligible approvers",
                self.quorum.threshold
            )));
        }
        Ok(())
    }

    /// First matching rule, or the default effect
    pub fn select(&self, action: &ActionDescriptor, context: &DecisionContext) -> RuleMatch<'_> {
        match self.rules.iter().find(|r| r.matches(action, context)) {
            Some(rule) => RuleMatch {
                rule: Some(rule),
                effect: rule.effect,
            },
            None => RuleMatch {
                rule: None,
                effect: self.default_effect,
            },
        }
    }
}

/// How an activation came about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationMode {
    /// Moving forward to a successor
    Activate,
    /// Returning to an earlier version
    Rollback,
}

/// Ledger payload publishing a version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyPublished {
    /// Always [`POLICY_PUBLISHED`]
    pub record_type: String,
    /// Digest of `version`
    pub policy_hash: Digest,
    /// The published version
    pub version: PolicyVersion,
}

/// Ledger payload switching the active version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyActivated {
    /// Always [`POLICY_ACTIVATED`]
    pub record_type: String,
    /// Newly active version
    pub policy_hash: Digest,
    /// Version active before this entry
    pub previous: Option<Digest>,
    /// Forward activation or rollback
    pub mode: ActivationMode,
    /// Operator-supplied reason
    pub reason: String,
    /// Approvers on the governance token
    pub approvals: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> PolicyVersion {
        PolicyVersion {
            label: "v1".to_owned(),
            predecessor: None,
            rules: vec![
                PolicyRule {
                    id: "block-prod-friday".to_owned(),
                    action: "deploy".to_owned(),
                    context_equals: [
                        ("env".to_owned(), json!("prod")),
                        ("day".to_owned(), json!("fri")),
                    ]
                    .into_iter()
                    .collect(),
                    effect: RuleEffect::Reject,
                },
                PolicyRule {
                    id: "prod-needs-quorum".to_owned(),
                    action: "deploy".to_owned(),
                    context_equals: [("env".to_owned(), json!("prod"))].into_iter().collect(),
                    effect: RuleEffect::RequireQuorum { threshold: None },
                },
                PolicyRule {
                    id: "catch-all".to_owned(),
                    action: ANY_ACTION.to_owned(),
                    context_equals: BTreeMap::new(),
                    effect: RuleEffect::Approve,
                },
            ],
            quorum: QuorumPolicy {
                threshold: 2,
                approvers: ["alice", "bob", "carol"].iter().map(|s| (*s).to_owned()).collect(),
            },
            default_effect: RuleEffect::Defer,
        }
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let p = policy();
        let deploy = ActionDescriptor::new("deploy", "api");
        let friday: DecisionContext =
            [("env".to_owned(), json!("prod")), ("day".to_owned(), json!("fri"))]
                .into_iter()
                .collect();
        assert_eq!(p.select(&deploy, &friday).rule.unwrap().id, "block-prod-friday");

        let monday: DecisionContext =
            [("env".to_owned(), json!("prod")), ("day".to_owned(), json!("mon"))]
                .into_iter()
                .collect();
        assert_eq!(p.select(&deploy, &monday).rule.unwrap().id, "prod-needs-quorum");

        let other = ActionDescriptor::new("restart", "api");
        assert_eq!(
            p.select(&other, &DecisionContext::new()).effect,
            RuleEffect::Approve
        );
    }

    #[test]
    fn test_default_effect_when_nothing_matches() {
        let mut p = policy();
        p.rules.pop();
        let m = p.select(&ActionDescriptor::new("restart", "api"), &DecisionContext::new());
        assert!(m.rule.is_none());
        assert_eq!(m.effect, RuleEffect::Defer);
    }

    #[test]
    fn test_hash_is_content_addressed() {
        let a = policy();
        let mut b = policy();
        assert_eq!(
            a.hash(HashAlgorithmId::Sha256).unwrap(),
            b.hash(HashAlgorithmId::Sha256).unwrap()
        );
        b.label = "v2".to_owned();
        assert_ne!(
            a.hash(HashAlgorithmId::Sha256).unwrap(),
            b.hash(HashAlgorithmId::Sha256).unwrap()
        );
    }

    #[test]
    fn test_validation() {
        assert!(policy().validate().is_ok());

        let mut p = policy();
        p.quorum.threshold = 4;
        assert_eq!(p.validate().unwrap_err().kind(), vigil_core::ErrorKind::PolicyVersion);

        let mut p = policy();
        p.rules[1].id = "catch-all".to_owned();
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_effect_wire_format() {
        let json = serde_json::to_value(RuleEffect::RequireQuorum { threshold: Some(3) }).unwrap();
        assert_eq!(json, json!({"effect": "require_quorum", "threshold": 3}));
        let back: RuleEffect = serde_json::from_value(json!({"effect": "approve"})).unwrap();
        assert_eq!(back, RuleEffect::Approve);
    }
}
