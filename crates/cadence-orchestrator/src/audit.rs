//! Shared write paths for status changes and the persisted logs.

use cadence_core::{
    notify_or_log, Agent, AgentLog, AgentStatus, CadenceError, CadenceResult, DomainEvent,
    EventKind, LogLevel, Notifier, Store, SystemLog,
};
use tracing::{debug, info};
use uuid::Uuid;

/// Move `agent` to `next` in memory, enforcing the status state machine.
/// Returns the previous status.
fn transition(agent: &mut Agent, next: AgentStatus) -> CadenceResult<AgentStatus> {
    let from = agent.status;
    if !from.can_transition_to(next) {
        return Err(CadenceError::invalid_transition("agent", from, next));
    }
    agent.status = next;
    agent.touch();
    Ok(from)
}

/// Move `agent` to `next` and persist it with a compare-and-set on the
/// status it was read with, then publish the change. A concurrent writer
/// that changed the status first makes this fail with `InvalidTransition`.
pub(crate) async fn commit(
    store: &dyn Store,
    notifier: &dyn Notifier,
    mut agent: Agent,
    next: AgentStatus,
) -> CadenceResult<Agent> {
    let from = transition(&mut agent, next)?;
    if !store.update_agent_if_status(&agent, from).await? {
        let current = store
            .get_agent(agent.id)
            .await?
            .map_or_else(|| "deleted".to_string(), |a| a.status.to_string());
        debug!(agent_id = %agent.id, expected = %from, %current, "Status changed concurrently");
        return Err(CadenceError::invalid_transition("agent", current, next));
    }
    status_changed(notifier, &agent, from);
    Ok(agent)
}

/// Re-arm the agents an intervention parked behind `activated`, now that
/// it has completed. Returns the re-armed agent ids.
pub(crate) async fn release_parked(
    store: &dyn Store,
    notifier: &dyn Notifier,
    activated: &Agent,
) -> CadenceResult<Vec<Uuid>> {
    let parked: Vec<Agent> = store
        .get_agents_by_project(activated.project_id)
        .await?
        .into_iter()
        .filter(|a| a.paused_for == Some(activated.id) && a.status == AgentStatus::WaitingApproval)
        .collect();

    let mut released = Vec::with_capacity(parked.len());
    for mut agent in parked {
        agent.paused_for = None;
        agent.progress = 0;
        agent.current_task = None;
        agent.completed_at = None;
        let agent = match commit(store, notifier, agent, AgentStatus::Pending).await {
            Ok(agent) => agent,
            Err(CadenceError::InvalidTransition { .. }) => continue,
            Err(e) => return Err(e),
        };
        agent_log(
            store,
            &agent,
            LogLevel::Info,
            format!("Re-armed after intervention on {} completed", activated.agent_type),
        )
        .await?;
        notify_or_log(
            notifier,
            DomainEvent::new(
                EventKind::AgentRearmed,
                serde_json::json!({
                    "agent_id": agent.id,
                    "agent_type": agent.agent_type,
                    "released_by": activated.id,
                }),
            )
            .scoped(agent.project_id),
        );
        released.push(agent.id);
    }
    if !released.is_empty() {
        info!(agent_id = %activated.id, count = released.len(), "Released agents parked for intervention");
    }
    Ok(released)
}

/// Publish an `agent_status_changed` event scoped to the agent's project.
fn status_changed(notifier: &dyn Notifier, agent: &Agent, from: AgentStatus) {
    notify_or_log(
        notifier,
        DomainEvent::new(
            EventKind::AgentStatusChanged,
            serde_json::json!({
                "agent_id": agent.id,
                "agent_type": agent.agent_type,
                "from": from.to_string(),
                "to": agent.status.to_string(),
            }),
        )
        .scoped(agent.project_id),
    );
}

pub(crate) async fn system_log(
    store: &dyn Store,
    project_id: Option<Uuid>,
    level: LogLevel,
    message: impl Into<String>,
) -> CadenceResult<()> {
    store
        .add_system_log(&SystemLog::new(project_id, level, message))
        .await
}

pub(crate) async fn agent_log(
    store: &dyn Store,
    agent: &Agent,
    level: LogLevel,
    message: impl Into<String>,
) -> CadenceResult<()> {
    store.add_agent_log(&AgentLog::new(agent, level, message)).await
}
