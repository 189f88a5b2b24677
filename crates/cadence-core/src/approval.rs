//! Approval types for human-in-the-loop review of checkpoints and assets.
//!
//! These live in `cadence-core` so that the store, the orchestrator and any
//! API adapter agree on the wire names without depending on each other.

use crate::{CadenceError, CadenceResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Whether a checkpoint still awaits a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    /// Awaiting a decision.
    Pending,
    /// Closed with a [`Resolution`].
    Resolved,
    /// Closed without a decision because its agent was re-run by an
    /// intervention.
    Superseded,
}

impl CheckpointStatus {
    /// Wire name, identical to the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointStatus::Pending => "pending",
            CheckpointStatus::Resolved => "resolved",
            CheckpointStatus::Superseded => "superseded",
        }
    }
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The decision recorded on a resolved checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Accepted as is.
    Approved,
    /// Refused; the agent fails.
    Rejected,
    /// Sent back to the agent with feedback.
    RevisionRequested,
}

impl Resolution {
    /// Wire name, identical to the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Approved => "approved",
            Resolution::Rejected => "rejected",
            Resolution::RevisionRequested => "revision_requested",
        }
    }
}

impl FromStr for Resolution {
    type Err = CadenceError;

    /// Only the three canonical spellings are accepted.
    fn from_str(s: &str) -> CadenceResult<Self> {
        match s {
            "approved" => Ok(Resolution::Approved),
            "rejected" => Ok(Resolution::Rejected),
            "revision_requested" => Ok(Resolution::RevisionRequested),
            other => Err(CadenceError::Validation(format!(
                "invalid resolution '{other}' (expected approved, rejected or revision_requested)"
            ))),
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Approval state of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    /// Awaiting review.
    Pending,
    /// Accepted.
    Approved,
    /// Refused.
    Rejected,
}

/// What an auto-approval rule applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleTarget {
    /// Only checkpoints.
    Checkpoint,
    /// Only assets.
    Asset,
    /// Checkpoints and assets.
    #[default]
    Any,
}

/// Extra condition a pending item must satisfy for a rule to fire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCondition {
    /// No extra condition.
    #[default]
    Always,
    /// Checkpoint `kind` equals the value.
    CheckpointKind {
        /// Expected checkpoint kind.
        kind: String,
    },
    /// Checkpoint title or asset name contains the value (case-insensitive).
    TitleContains {
        /// Substring to look for.
        text: String,
    },
    /// Asset media kind equals the value.
    AssetKind {
        /// Expected media kind.
        kind: crate::model::AssetKind,
    },
}

/// Project-scoped rule: agent-type pattern x condition -> automatic resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoApprovalRule {
    /// Agent type, `*` wildcards allowed (`*_leader`, `*`).
    pub agent_type: String,
    /// Kind of item the rule resolves.
    #[serde(default)]
    pub target: RuleTarget,
    /// Extra condition on the item.
    #[serde(default)]
    pub condition: RuleCondition,
    /// Decision applied when the rule fires.
    #[serde(default = "default_resolution")]
    pub resolution: Resolution,
}

fn default_resolution() -> Resolution {
    Resolution::Approved
}

impl AutoApprovalRule {
    /// Approve everything produced by agents matching `agent_type`.
    pub fn approve_all(agent_type: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            target: RuleTarget::Any,
            condition: RuleCondition::Always,
            resolution: Resolution::Approved,
        }
    }

    /// Reject empty patterns and revision requests on assets.
    pub fn validate(&self) -> CadenceResult<()> {
        if self.agent_type.trim().is_empty() {
            return Err(CadenceError::Validation(
                "auto-approval rule needs an agent_type pattern".into(),
            ));
        }
        if self.resolution == Resolution::RevisionRequested && self.target != RuleTarget::Checkpoint
        {
            return Err(CadenceError::Validation(
                "revision_requested rules must target checkpoints only".into(),
            ));
        }
        Ok(())
    }
}
