use cadence_core::{
    ApprovalStatus, Asset, AutoApprovalRule, CadenceError, CadenceResult, Checkpoint, Resolution,
    RuleCondition, RuleTarget,
};
use regex::Regex;

/// Compile an agent-type pattern (`*` matches any run of characters) into
/// an anchored regex.
pub fn compile_pattern(pattern: &str) -> CadenceResult<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$"))
        .map_err(|e| CadenceError::Validation(format!("bad agent_type pattern '{pattern}': {e}")))
}

/// A project's auto-approval rules, compiled. First matching rule wins.
pub struct RuleMatcher {
    rules: Vec<(AutoApprovalRule, Regex)>,
}

impl RuleMatcher {
    /// Validate and compile `rules`, keeping their order.
    pub fn compile(rules: &[AutoApprovalRule]) -> CadenceResult<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                rule.validate()?;
                Ok((rule.clone(), compile_pattern(&rule.agent_type)?))
            })
            .collect::<CadenceResult<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Whether the project has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rule that resolves `checkpoint`, produced by an agent of `agent_type`.
    pub fn for_checkpoint(&self, agent_type: &str, checkpoint: &Checkpoint) -> Option<&AutoApprovalRule> {
        self.rules
            .iter()
            .filter(|(rule, re)| rule.target != RuleTarget::Asset && re.is_match(agent_type))
            .find(|(rule, _)| match &rule.condition {
                RuleCondition::Always => true,
                RuleCondition::CheckpointKind { kind } => checkpoint.kind == *kind,
                RuleCondition::TitleContains { text } => contains_ci(&checkpoint.title, text),
                RuleCondition::AssetKind { .. } => false,
            })
            .map(|(rule, _)| rule)
    }

    /// Rule that reviews `asset`, plus the approval status it assigns.
    pub fn for_asset(&self, agent_type: &str, asset: &Asset) -> Option<(&AutoApprovalRule, ApprovalStatus)> {
        self.rules
            .iter()
            .filter(|(rule, re)| rule.target != RuleTarget::Checkpoint && re.is_match(agent_type))
            .find(|(rule, _)| match &rule.condition {
                RuleCondition::Always => true,
                RuleCondition::AssetKind { kind } => asset.kind == *kind,
                RuleCondition::TitleContains { text } => contains_ci(&asset.name, text),
                RuleCondition::CheckpointKind { .. } => false,
            })
            .and_then(|(rule, _)| {
                let status = match rule.resolution {
                    Resolution::Approved => ApprovalStatus::Approved,
                    Resolution::Rejected => ApprovalStatus::Rejected,
                    Resolution::RevisionRequested => return None,
                };
                Some((rule, status))
            })
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}
