//! Quorum simulation
//!
//! Tallies a supplied set of votes against a threshold. Only the first vote
//! from each approver counts; votes from approvers outside the eligible set
//! are set aside and reported.

use crate::policy::QuorumPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One approver's vote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// Approver name
    pub approver: String,
    /// `true` to approve
    pub approve: bool,
}

impl Vote {
    /// Approving vote
    pub fn approve(approver: impl Into<String>) -> Self {
        Self {
            approver: approver.into(),
            approve: true,
        }
    }

    /// Rejecting vote
    pub fn reject(approver: impl Into<String>) -> Self {
        Self {
            approver: approver.into(),
            approve: false,
        }
    }
}

/// Outcome of counting votes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumOutcome {
    /// Approvals reached the threshold
    Met,
    /// The threshold can no longer be reached
    Failed,
    /// Not enough votes either way
    Pending,
}

/// Counted votes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumTally {
    /// Approvals needed
    pub threshold: u32,
    /// Distinct eligible approvals
    pub approvals: u32,
    /// Distinct eligible rejections
    pub rejections: u32,
    /// Eligible approvers who have not voted, when the set is closed
    pub outstanding: Option<u32>,
    /// Approvers whose votes were not counted
    pub ignored: Vec<String>,
    /// Result of the count
    pub outcome: QuorumOutcome,
}

impl QuorumTally {
    /// Tally with no votes, used when a rule decides without a quorum
    pub fn not_required() -> Self {
        Self {
            threshold: 0,
            approvals: 0,
            rejections: 0,
            outstanding: None,
            ignored: Vec::new(),
            outcome: QuorumOutcome::Met,
        }
    }
}

/// Count `votes` against `threshold` for the approvers `policy` admits
pub fn tally(policy: &QuorumPolicy, threshold: u32, votes: &[Vote]) -> QuorumTally {
    let mut voted = BTreeSet::new();
    let mut ignored = Vec::new();
    let (mut approvals, mut rejections) = (0u32, 0u32);

    for vote in votes {
        let name = vote.approver.trim();
        let eligible = policy.approvers.is_empty() || policy.approvers.contains(name);
        if name.is_empty() || !eligible || !voted.insert(name.to_owned()) {
            ignored.push(vote.approver.clone());
            continue;
        }
        if vote.approve {
            approvals += 1;
        } else {
            rejections += 1;
        }
    }

    let outstanding = if policy.approvers.is_empty() {
        None
    } else {
        Some(policy.approvers.len() as u32 - approvals - rejections)
    };
    let outcome = if approvals >= threshold {
        QuorumOutcome::Met
    } else if outstanding.is_some_and(|left| approvals + left < threshold) {
        QuorumOutcome::Failed
    } else {
        QuorumOutcome::Pending
    };

    QuorumTally {
        threshold,
        approvals,
        rejections,
        outstanding,
        ignored,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed(threshold: u32) -> QuorumPolicy {
        QuorumPolicy {
            threshold,
            approvers: ["alice", "bob", "carol"].iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    #[test]
    fn test_threshold_met() {
        let t = tally(&closed(2), 2, &[Vote::approve("alice"), Vote::approve("bob")]);
        assert_eq!(t.outcome, QuorumOutcome::Met);
        assert_eq!(t.outstanding, Some(1));
    }

    #[test]
    fn test_duplicates_and_strangers_ignored() {
        let votes = [
            Vote::approve("alice"),
            Vote::approve("alice"),
            Vote::approve("mallory"),
        ];
        let t = tally(&closed(2), 2, &votes);
        assert_eq!(t.approvals, 1);
        assert_eq!(t.ignored, vec!["alice".to_owned(), "mallory".to_owned()]);
        assert_eq!(t.outcome, QuorumOutcome::Pending);
    }

    #[test]
    fn test_unreachable_threshold_fails() {
        let t = tally(&closed(2), 2, &[Vote::reject("alice"), Vote::reject("bob")]);
        assert_eq!(t.outcome, QuorumOutcome::Failed);
    }

    #[test]
    fn test_open_set_never_fails() {
        let open = QuorumPolicy {
            threshold: 2,
            approvers: BTreeSet::new(),
        };
        let t = tally(&open, 2, &[Vote::reject("x"), Vote::reject("y"), Vote::reject("z")]);
        assert_eq!(t.outcome, QuorumOutcome::Pending);
        assert_eq!(t.outstanding, None);
    }
}
