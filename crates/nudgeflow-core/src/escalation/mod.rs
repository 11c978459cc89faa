//! Escalation from detected situations to chosen interventions.
//!
//! Tier 0 is the rule's own candidate, tier 1 a sufficiently attested
//! playbook entry, tier 2 and above a pluggable [`TierSelector`].

pub mod controller;
pub mod selector;

pub use controller::{Decision, EscalationController, RankedCandidate, SelectionConfig};
pub use selector::{
    PoolRankingSelector, SelectionOutcome, SelectionRequest, SelectorError, TierSelector,
};
