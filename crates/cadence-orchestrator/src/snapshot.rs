use cadence_core::{
    notify_or_log, Agent, AgentStatus, CadenceError, CadenceResult, DomainEvent, EventKind,
    LogLevel, Notifier, Store, WorkerTaskSnapshot, WorkflowSnapshot,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::audit;

/// In-flight statuses cannot survive a restore; the work has to run again.
fn restorable(status: AgentStatus) -> AgentStatus {
    if status.is_in_flight() {
        AgentStatus::Pending
    } else {
        status
    }
}

/// Captures and restores leader state together with its workers.
///
/// Capturing a snapshot invalidates earlier snapshots of the same agent and
/// run, so at most one valid snapshot exists per (agent, run).
pub struct SnapshotManager {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
}

impl SnapshotManager {
    /// Manager over `store`.
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    async fn load_agent(&self, agent_id: Uuid) -> CadenceResult<Agent> {
        self.store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| CadenceError::not_found("agent", agent_id))
    }

    /// Capture `agent_id` and its workers for `run_id`.
    pub async fn capture(&self, agent_id: Uuid, run_id: Uuid) -> CadenceResult<WorkflowSnapshot> {
        let agent = self.load_agent(agent_id).await?;
        let workers = self
            .store
            .get_agents_by_project(agent.project_id)
            .await?
            .into_iter()
            .filter(|a| a.parent_agent_id == Some(agent_id))
            .map(|w| WorkerTaskSnapshot {
                agent_id: w.id,
                agent_type: w.agent_type,
                status: w.status,
                progress: w.progress,
                current_task: w.current_task,
            })
            .collect();

        for mut previous in self.store.get_snapshots_by_agent(agent_id).await? {
            if previous.run_id == run_id && !previous.invalidated {
                previous.invalidated = true;
                self.store.update_snapshot(&previous).await?;
            }
        }

        let snapshot = WorkflowSnapshot {
            id: Uuid::new_v4(),
            project_id: agent.project_id,
            agent_id,
            run_id,
            agent,
            workers,
            invalidated: false,
            created_at: Utc::now(),
        };
        self.store.insert_snapshot(&snapshot).await?;
        info!(
            snapshot_id = %snapshot.id,
            agent_id = %agent_id,
            workers = snapshot.workers.len(),
            "Snapshot captured"
        );
        notify_or_log(
            self.notifier.as_ref(),
            DomainEvent::new(
                EventKind::SnapshotCaptured,
                serde_json::json!({
                    "snapshot_id": snapshot.id,
                    "agent_id": agent_id,
                    "run_id": run_id,
                }),
            )
            .scoped(snapshot.project_id),
        );
        Ok(snapshot)
    }

    /// Newest valid snapshot of the agent, if any.
    pub async fn latest_valid(&self, agent_id: Uuid) -> CadenceResult<Option<WorkflowSnapshot>> {
        Ok(self
            .store
            .get_snapshots_by_agent(agent_id)
            .await?
            .into_iter()
            .filter(|s| !s.invalidated)
            .max_by_key(|s| s.created_at))
    }

    /// Write the captured leader and worker state back. Workers deleted
    /// since the capture are skipped. Returns the restored leader.
    pub async fn restore(&self, snapshot_id: Uuid) -> CadenceResult<Agent> {
        let snapshot = self
            .store
            .get_snapshot(snapshot_id)
            .await?
            .ok_or_else(|| CadenceError::not_found("snapshot", snapshot_id))?;
        if snapshot.invalidated {
            return Err(CadenceError::Validation(format!(
                "snapshot {snapshot_id} has been superseded"
            )));
        }

        let mut agent = self.load_agent(snapshot.agent_id).await?;
        let saved = &snapshot.agent;
        agent.status = restorable(saved.status);
        agent.progress = saved.progress;
        agent.current_task = saved.current_task.clone();
        agent.input_tokens = saved.input_tokens;
        agent.output_tokens = saved.output_tokens;
        agent.revision_feedback = saved.revision_feedback.clone();
        agent.error_message = saved.error_message.clone();
        agent.completed_at = saved.completed_at;
        agent.touch();
        self.store.update_agent(&agent).await?;

        let mut restored_workers = 0usize;
        for saved in &snapshot.workers {
            let Some(mut worker) = self.store.get_agent(saved.agent_id).await? else {
                continue;
            };
            worker.status = restorable(saved.status);
            worker.progress = saved.progress;
            worker.current_task = saved.current_task.clone();
            worker.touch();
            self.store.update_agent(&worker).await?;
            restored_workers += 1;
        }

        info!(snapshot_id = %snapshot_id, agent_id = %agent.id, restored_workers, "Snapshot restored");
        audit::agent_log(
            self.store.as_ref(),
            &agent,
            LogLevel::Info,
            format!("Restored from snapshot {snapshot_id} ({restored_workers} workers)"),
        )
        .await?;
        Ok(agent)
    }
}
