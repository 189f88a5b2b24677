use cadence_core::{Agent, CadenceError, CadenceResult};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Static agent-type -> prerequisite agent-types table defining the workflow DAG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowDependencyMap {
    deps: BTreeMap<String, Vec<String>>,
}

impl WorkflowDependencyMap {
    /// Build and validate a map. Fails on unknown prerequisites or cycles.
    pub fn new(deps: BTreeMap<String, Vec<String>>) -> CadenceResult<Self> {
        let map = Self { deps };
        map.validate()?;
        Ok(map)
    }

    /// The built-in generation pipeline.
    ///
    /// ```text
    /// concept -> script -> voice ------------\
    ///        \-> design -> storyboard(+script) -> assembly
    /// ```
    pub fn default_pipeline() -> Self {
        let edges: [(&str, &[&str]); 6] = [
            ("concept_leader", &[]),
            ("script_leader", &["concept_leader"]),
            ("design_leader", &["concept_leader"]),
            ("voice_leader", &["script_leader"]),
            ("storyboard_leader", &["script_leader", "design_leader"]),
            ("assembly_leader", &["storyboard_leader", "voice_leader"]),
        ];
        let deps = edges
            .iter()
            .map(|(ty, pre)| (ty.to_string(), pre.iter().map(|p| p.to_string()).collect()))
            .collect();
        Self { deps }
    }

    /// Prerequisites of `agent_type`; unknown types have none.
    pub fn prerequisites(&self, agent_type: &str) -> &[String] {
        self.deps.get(agent_type).map_or(&[], Vec::as_slice)
    }

    /// Whether `agent_type` is declared.
    pub fn contains(&self, agent_type: &str) -> bool {
        self.deps.contains_key(agent_type)
    }

    /// Declared agent types, sorted.
    pub fn agent_types(&self) -> impl Iterator<Item = &str> {
        self.deps.keys().map(String::as_str)
    }

    /// Number of declared agent types.
    pub fn len(&self) -> usize {
        self.deps.len()
    }

    /// Whether no agent type is declared.
    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    /// Types that list `agent_type` as a prerequisite.
    pub fn dependents(&self, agent_type: &str) -> Vec<&str> {
        self.deps
            .iter()
            .filter(|(_, pre)| pre.iter().any(|p| p == agent_type))
            .map(|(ty, _)| ty.as_str())
            .collect()
    }

    /// Reject empty types, unknown prerequisites and cycles.
    pub fn validate(&self) -> CadenceResult<()> {
        for (ty, pre) in &self.deps {
            if ty.trim().is_empty() {
                return Err(CadenceError::Config("workflow has an empty agent type".into()));
            }
            for p in pre {
                if !self.deps.contains_key(p) {
                    return Err(CadenceError::Config(format!(
                        "workflow: '{ty}' depends on unknown agent type '{p}'"
                    )));
                }
            }
        }
        if let Some(ty) = self.find_cycle() {
            return Err(CadenceError::Config(format!(
                "workflow: dependency cycle through '{ty}'"
            )));
        }
        Ok(())
    }

    /// First type found on a cycle, if any.
    fn find_cycle(&self) -> Option<&str> {
        let mut visited = HashMap::new();
        self.deps
            .keys()
            .find(|ty| self.dfs_cycle(ty, &mut visited))
            .map(String::as_str)
    }

    fn dfs_cycle<'a>(&'a self, ty: &'a str, visited: &mut HashMap<&'a str, u8>) -> bool {
        match visited.get(ty) {
            Some(1) => return true,  // back edge
            Some(2) => return false, // done
            _ => {}
        }
        visited.insert(ty, 1);
        for dep in self.prerequisites(ty) {
            if self.dfs_cycle(dep, visited) {
                return true;
            }
        }
        visited.insert(ty, 2);
        false
    }

    /// Topological level of `agent_type`: 0 for roots, else one more than
    /// its deepest prerequisite. Unknown types are phase 0.
    pub fn phase_of(&self, agent_type: &str) -> u32 {
        let mut memo = HashMap::new();
        self.phase_memo(agent_type, &mut memo, 0)
    }

    fn phase_memo<'a>(&'a self, ty: &'a str, memo: &mut HashMap<&'a str, u32>, depth: usize) -> u32 {
        if let Some(&phase) = memo.get(ty) {
            return phase;
        }
        // Guard against maps that skipped validation.
        if depth > self.deps.len() {
            return 0;
        }
        let phase = self
            .prerequisites(ty)
            .iter()
            .map(|p| self.phase_memo(p, memo, depth + 1) + 1)
            .max()
            .unwrap_or(0);
        memo.insert(ty, phase);
        phase
    }

    /// Agent types grouped by phase, in phase order.
    pub fn phases(&self) -> Vec<Vec<&str>> {
        let mut phases: Vec<Vec<&str>> = Vec::new();
        for ty in self.agent_types() {
            let phase = self.phase_of(ty) as usize;
            if phases.len() <= phase {
                phases.resize_with(phase + 1, Vec::new);
            }
            phases[phase].push(ty);
        }
        phases
    }

    /// The raw map: agent type to prerequisites.
    pub fn as_map(&self) -> &BTreeMap<String, Vec<String>> {
        &self.deps
    }
}

impl Default for WorkflowDependencyMap {
    fn default() -> Self {
        Self::default_pipeline()
    }
}

/// Phase of an agent. Workers inherit the phase of their leader.
pub fn phase_of_agent(map: &WorkflowDependencyMap, agent: &Agent, agents: &HashMap<Uuid, Agent>) -> u32 {
    let ty = agent
        .parent_agent_id
        .and_then(|parent| agents.get(&parent))
        .map_or(agent.agent_type.as_str(), |parent| parent.agent_type.as_str());
    map.phase_of(ty)
}

/// Shared, reloadable handle on the current dependency map.
///
/// Readers take a cheap `Arc` snapshot; [`reload`](Self::reload) swaps the
/// whole map at once, so a tick never sees a half-applied update.
pub struct WorkflowHandle {
    current: RwLock<Arc<WorkflowDependencyMap>>,
}

impl WorkflowHandle {
    /// Handle holding `map`.
    pub fn new(map: WorkflowDependencyMap) -> Self {
        Self {
            current: RwLock::new(Arc::new(map)),
        }
    }

    /// Snapshot of the current map.
    pub fn current(&self) -> Arc<WorkflowDependencyMap> {
        self.current.read().clone()
    }

    /// Replace the map after validating it.
    pub fn reload(&self, map: WorkflowDependencyMap) -> CadenceResult<()> {
        map.validate()?;
        let types = map.len();
        *self.current.write() = Arc::new(map);
        info!(agent_types = types, "Workflow dependency map reloaded");
        Ok(())
    }
}

impl Default for WorkflowHandle {
    fn default() -> Self {
        Self::new(WorkflowDependencyMap::default_pipeline())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn map(edges: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        edges
            .iter()
            .map(|(ty, pre)| (ty.to_string(), pre.iter().map(|p| p.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_default_pipeline_is_valid() {
        let wf = WorkflowDependencyMap::default_pipeline();
        assert!(wf.validate().is_ok());
        assert!(wf.prerequisites("concept_leader").is_empty());
        assert_eq!(wf.prerequisites("design_leader"), ["concept_leader".to_string()]);
        assert!(wf.prerequisites("design_worker").is_empty());
    }

    #[test]
    fn test_phases() {
        let wf = WorkflowDependencyMap::default_pipeline();
        assert_eq!(wf.phase_of("concept_leader"), 0);
        assert_eq!(wf.phase_of("design_leader"), 1);
        assert_eq!(wf.phase_of("storyboard_leader"), 2);
        assert_eq!(wf.phase_of("assembly_leader"), 3);
        let phases = wf.phases();
        assert_eq!(phases.len(), 4);
        assert_eq!(phases[1], vec!["design_leader", "script_leader"]);
    }

    #[test]
    fn test_cycle_detected() {
        let err = WorkflowDependencyMap::new(map(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]))
            .unwrap_err();
        assert!(matches!(err, CadenceError::Config(ref m) if m.contains("cycle")));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        assert!(WorkflowDependencyMap::new(map(&[("a", &["a"])])).is_err());
    }

    #[test]
    fn test_unknown_prerequisite_rejected() {
        let err = WorkflowDependencyMap::new(map(&[("a", &["ghost"])])).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_dependents() {
        let wf = WorkflowDependencyMap::default_pipeline();
        assert_eq!(wf.dependents("concept_leader"), vec!["design_leader", "script_leader"]);
    }

    #[test]
    fn test_worker_inherits_leader_phase() {
        let wf = WorkflowDependencyMap::default_pipeline();
        let leader = Agent::leader(Uuid::new_v4(), "design_leader");
        let worker = Agent::worker(&leader, "design_worker");
        let agents: HashMap<Uuid, Agent> = [(leader.id, leader.clone())].into_iter().collect();
        assert_eq!(phase_of_agent(&wf, &worker, &agents), 1);
    }

    #[test]
    fn test_handle_reload_swaps_map() {
        let handle = WorkflowHandle::default();
        let before = handle.current();
        handle
            .reload(WorkflowDependencyMap::new(map(&[("solo", &[])])).unwrap())
            .unwrap();
        assert!(before.contains("concept_leader"));
        assert!(handle.current().contains("solo"));
        assert!(!handle.current().contains("concept_leader"));
    }
}
