use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use supervaize_controller::config::DispatchConfig;
use supervaize_controller::dispatch::Dispatcher;
use supervaize_controller::identity::generate_keypair;
use supervaize_controller::ledger::JobState;
use supervaize_controller::registry::{AgentStatus, CapabilitySet};
use supervaize_controller::store::{Snapshot, Store};

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");

    let (agent_id, job_id, key) = {
        let store = Store::open(&path, 100, LOCK_TIMEOUT).await.unwrap();
        assert!(store.is_persistent());
        let d = Dispatcher::new(store, DispatchConfig::default());

        let key = generate_keypair().public();
        let agent_id = d
            .register_agent(key, CapabilitySet::parse(["ocr"]).unwrap())
            .await
            .unwrap()
            .agent_id;
        d.heartbeat(agent_id).await.unwrap();
        let job_id = d
            .submit_job("ocr", json!({"page": 3}), Some("k".into()))
            .await
            .unwrap()
            .job_id;
        d.dispatch_pass().await.unwrap();
        (agent_id, job_id, key)
    };
    assert!(path.exists());

    let store = Store::open(&path, 100, LOCK_TIMEOUT).await.unwrap();
    let d = Dispatcher::new(store, DispatchConfig::default());

    let agent = d.agent(agent_id).await.unwrap();
    assert_eq!(agent.status, AgentStatus::Active);
    assert!(agent.outstanding_jobs.contains(&job_id));

    let job = d.job(job_id).await.unwrap();
    assert_eq!(job.state, JobState::Assigned);
    assert_eq!(job.assigned_agent, Some(agent_id));
    assert_eq!(job.payload, json!({"page": 3}));

    // idempotency keys and key ownership come back too
    let dup = d
        .submit_job("ocr", json!(null), Some("k".into()))
        .await
        .unwrap();
    assert!(dup.duplicate);
    assert_eq!(dup.job_id, job_id);
    let again = d
        .register_agent(key, CapabilitySet::parse(["ocr"]).unwrap())
        .await
        .unwrap();
    assert!(again.existing);
    assert_eq!(again.agent_id, agent_id);
}

#[tokio::test]
async fn test_missing_snapshot_starts_empty() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path().join("none.json"), 100, LOCK_TIMEOUT)
        .await
        .unwrap();
    let state = store.read().await.unwrap();
    assert!(state.registry.is_empty());
    assert!(state.ledger.is_empty());
}

#[tokio::test]
async fn test_unreadable_records_are_skipped() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");

    {
        let store = Store::open(&path, 100, LOCK_TIMEOUT).await.unwrap();
        let d = Dispatcher::new(store, DispatchConfig::default());
        d.submit_job("ocr", json!(1), None).await.unwrap();
        d.submit_job("ocr", json!(2), None).await.unwrap();
    }

    let mut snapshot: Snapshot =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    snapshot.jobs.push(json!({"id": "not-a-job"}));
    snapshot.agents.push(json!(42));
    std::fs::write(&path, serde_json::to_vec(&snapshot).unwrap()).unwrap();

    let store = Store::open(&path, 100, LOCK_TIMEOUT).await.unwrap();
    let state = store.read().await.unwrap();
    assert_eq!(state.ledger.len(), 2);
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn test_corrupt_snapshot_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, "{ truncated").unwrap();

    assert!(Store::open(&path, 100, LOCK_TIMEOUT).await.is_err());
}

#[tokio::test]
async fn test_unknown_snapshot_format_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    {
        let store = Store::open(&path, 100, LOCK_TIMEOUT).await.unwrap();
        let d = Dispatcher::new(store, DispatchConfig::default());
        d.submit_job("ocr", json!(1), None).await.unwrap();
    }

    let mut snapshot: Snapshot =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    snapshot.format = 99;
    std::fs::write(&path, serde_json::to_vec(&snapshot).unwrap()).unwrap();

    assert!(Store::open(&path, 100, LOCK_TIMEOUT).await.is_err());
}

#[tokio::test]
async fn test_failed_transaction_is_not_persisted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");

    {
        let store = Store::open(&path, 1, LOCK_TIMEOUT).await.unwrap();
        let d = Dispatcher::new(store, DispatchConfig::default());
        d.submit_job("ocr", json!(1), None).await.unwrap();
        assert!(d.submit_job("ocr", json!(2), None).await.is_err());
    }

    let store = Store::open(&path, 1, LOCK_TIMEOUT).await.unwrap();
    assert_eq!(store.read().await.unwrap().ledger.len(), 1);
}

#[tokio::test]
async fn test_list_by_status() {
    let store = Store::in_memory(100, LOCK_TIMEOUT);
    let d = Dispatcher::new(store.clone(), DispatchConfig::default());
    let agent = d
        .register_agent(
            generate_keypair().public(),
            CapabilitySet::parse(["ocr"]).unwrap(),
        )
        .await
        .unwrap()
        .agent_id;
    d.submit_job("ocr", json!(null), None).await.unwrap();

    assert_eq!(store.agents_by_status(AgentStatus::Pending).await.unwrap().len(), 1);
    assert!(store.agents_by_status(AgentStatus::Active).await.unwrap().is_empty());
    assert_eq!(store.jobs_by_state(JobState::Queued).await.unwrap().len(), 1);
    assert_eq!(store.get_agent(agent).await.unwrap().id, agent);
    assert!(!store.is_persistent());
}

/// One active agent holding one assigned job, persisted to `path`.
async fn persisted_assignment(path: &std::path::Path) -> (uuid::Uuid, uuid::Uuid) {
    let store = Store::open(path, 100, LOCK_TIMEOUT).await.unwrap();
    let d = Dispatcher::new(store, DispatchConfig::default());
    let agent_id = d
        .register_agent(
            generate_keypair().public(),
            CapabilitySet::parse(["ocr"]).unwrap(),
        )
        .await
        .unwrap()
        .agent_id;
    d.heartbeat(agent_id).await.unwrap();
    let job_id = d.submit_job("ocr", json!(null), None).await.unwrap().job_id;
    d.dispatch_pass().await.unwrap();
    (agent_id, job_id)
}

fn edit_snapshot(path: &std::path::Path, edit: impl FnOnce(&mut Snapshot)) {
    let mut snapshot: Snapshot = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
    edit(&mut snapshot);
    std::fs::write(path, serde_json::to_vec(&snapshot).unwrap()).unwrap();
}

#[tokio::test]
async fn test_job_of_unreadable_agent_is_requeued_on_restore() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    let (agent_id, job_id) = persisted_assignment(&path).await;

    edit_snapshot(&path, |s| {
        s.agents = vec![json!({"id": agent_id, "garbled": true})];
    });

    let store = Store::open(&path, 100, LOCK_TIMEOUT).await.unwrap();
    let job = store.get_job(job_id).await.unwrap();
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.assigned_agent, None);
    // not the job's fault, no attempt charged
    assert_eq!(job.attempts, 0);
    assert_eq!(
        store.read().await.unwrap().ledger.queued_fifo().len(),
        1
    );
}

#[tokio::test]
async fn test_job_of_inactive_agent_is_requeued_on_restore() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    let (agent_id, job_id) = persisted_assignment(&path).await;

    edit_snapshot(&path, |s| {
        s.agents[0]["status"] = json!("unreachable");
    });

    let store = Store::open(&path, 100, LOCK_TIMEOUT).await.unwrap();
    assert_eq!(store.get_job(job_id).await.unwrap().state, JobState::Queued);
    assert!(store
        .get_agent(agent_id)
        .await
        .unwrap()
        .outstanding_jobs
        .is_empty());
}

#[tokio::test]
async fn test_agent_slot_of_unreadable_job_is_freed_on_restore() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    let (agent_id, job_id) = persisted_assignment(&path).await;

    edit_snapshot(&path, |s| {
        s.jobs = vec![json!({"id": job_id, "state": "assigned"})];
    });

    let store = Store::open(&path, 100, LOCK_TIMEOUT).await.unwrap();
    let agent = store.get_agent(agent_id).await.unwrap();
    assert!(agent.outstanding_jobs.is_empty());

    // with its slot back the agent takes new work
    let d = Dispatcher::new(store, DispatchConfig::default());
    let next = d.submit_job("ocr", json!(null), None).await.unwrap().job_id;
    let report = d.dispatch_pass().await.unwrap();
    assert_eq!(report.assigned, vec![(next, agent_id)]);
}

#[tokio::test]
async fn test_concurrent_commits_leave_latest_snapshot() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    let store = Store::open(&path, 100, LOCK_TIMEOUT).await.unwrap();
    let d = Dispatcher::new(store, DispatchConfig::default());

    let mut handles = Vec::new();
    for i in 0..20 {
        let d = d.clone();
        handles.push(tokio::spawn(async move {
            d.submit_job("ocr", json!(i), None).await.unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let bytes = std::fs::read(&path).unwrap();
    // compact encoding
    assert!(!bytes.contains(&b'\n'));
    let snapshot: Snapshot = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(snapshot.jobs.len(), 20);

    let reopened = Store::open(&path, 100, LOCK_TIMEOUT).await.unwrap();
    assert_eq!(reopened.read().await.unwrap().ledger.len(), 20);
}
