use cadence_core::*;
use cadence_store::MemoryStore;
use uuid::Uuid;

/// Helper: a store seeded with one project, a leader and a worker.
async fn seeded() -> (MemoryStore, Project, Agent, Agent) {
    let store = MemoryStore::new();
    let project = Project::new("storyboard").with_status(ProjectStatus::Running);
    let leader = Agent::leader(project.id, "design_leader");
    let worker = Agent::worker(&leader, "design_worker");
    store.insert_project(&project).await.unwrap();
    store.insert_agent(&leader).await.unwrap();
    store.insert_agent(&worker).await.unwrap();
    (store, project, leader, worker)
}

#[tokio::test]
async fn test_agents_by_project_and_status() {
    let (store, project, leader, worker) = seeded().await;
    let other = Agent::leader(Uuid::new_v4(), "concept_leader").with_status(AgentStatus::Running);
    store.insert_agent(&other).await.unwrap();

    let agents = store.get_agents_by_project(project.id).await.unwrap();
    let ids: Vec<Uuid> = agents.iter().map(|a| a.id).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&leader.id) && ids.contains(&worker.id));

    let in_flight = store
        .get_agents_by_status(&[AgentStatus::Running, AgentStatus::WaitingProvider])
        .await
        .unwrap();
    assert_eq!(in_flight.len(), 1);
    assert_eq!(in_flight[0].id, other.id);
}

#[tokio::test]
async fn test_pending_assets_filter() {
    let (store, project, leader, _) = seeded().await;
    let pending = Asset::new(project.id, leader.id, "moodboard.png", AssetKind::Image);
    let mut approved = Asset::new(project.id, leader.id, "logo.png", AssetKind::Image);
    approved.approval_status = ApprovalStatus::Approved;
    store.insert_asset(&pending).await.unwrap();
    store.insert_asset(&approved).await.unwrap();

    let result = store.get_pending_assets_by_agent(leader.id).await.unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].id, pending.id);
    assert_eq!(store.get_assets_by_project(project.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_checkpoint_queries() {
    let (store, project, leader, worker) = seeded().await;
    let cp1 = Checkpoint::new(project.id, leader.id, "design_review", "Designs");
    let cp2 = Checkpoint::new(project.id, worker.id, "sketch_review", "Sketches");
    store.insert_checkpoint(&cp1).await.unwrap();
    store.insert_checkpoint(&cp2).await.unwrap();

    let by_agent = store.get_checkpoints_by_agent(leader.id).await.unwrap();
    assert_eq!(by_agent.len(), 1);
    assert_eq!(by_agent[0].kind, "design_review");
    assert_eq!(
        store.get_checkpoints_by_project(project.id).await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn test_logs_scoped_by_project() {
    let (store, project, leader, _) = seeded().await;
    store
        .add_system_log(&SystemLog::new(Some(project.id), LogLevel::Info, "started"))
        .await
        .unwrap();
    store
        .add_system_log(&SystemLog::new(None, LogLevel::Warn, "global"))
        .await
        .unwrap();
    store
        .add_agent_log(&AgentLog::new(&leader, LogLevel::Info, "Starting design_leader"))
        .await
        .unwrap();

    assert_eq!(store.get_system_logs(Some(project.id)).await.unwrap().len(), 1);
    assert_eq!(store.get_system_logs(None).await.unwrap().len(), 2);
    assert_eq!(store.get_agent_logs(leader.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_save_and_load_roundtrip() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("state").join("cadence.json");
    let (store, project, leader, _) = seeded().await;
    let iv = Intervention::new(
        project.id,
        InterventionTarget::All,
        InterventionPriority::Normal,
        "more contrast please",
    );
    store.insert_intervention(&iv).await.unwrap();
    store.save_to(&path).await.unwrap();

    let loaded = MemoryStore::load_from(&path).await.unwrap();
    let p = loaded.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(p.status, ProjectStatus::Running);
    assert_eq!(
        loaded.get_agent(leader.id).await.unwrap().unwrap().agent_type,
        "design_leader"
    );
    assert_eq!(
        loaded.get_intervention(iv.id).await.unwrap().unwrap().message,
        "more contrast please"
    );
}

#[tokio::test]
async fn test_load_rejects_garbage() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("broken.json");
    tokio::fs::write(&path, "{ not json").await.unwrap();
    assert!(matches!(
        MemoryStore::load_from(&path).await,
        Err(CadenceError::Store(_))
    ));
}
