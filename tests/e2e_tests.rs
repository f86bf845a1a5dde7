//! Full controller over TCP, driven by the signed HTTP client.

use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use supervaize_controller::client::ControllerClient;
use supervaize_controller::config::ControllerConfig;
use supervaize_controller::error::Result;
use supervaize_controller::gateway::wire::{IdentityResponse, SubmitJobResponse};
use supervaize_controller::identity::{generate_keypair, KeyPair, PublicKey, SignedEnvelope};
use supervaize_controller::ledger::{JobOutcome, JobState};
use supervaize_controller::node::ControllerNode;
use supervaize_controller::registry::AgentStatus;
use supervaize_controller::ControllerError;

struct Running {
    base_url: String,
    controller_key: PublicKey,
    client_keys: KeyPair,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

async fn start() -> Running {
    let client_keys = generate_keypair();
    let mut config = ControllerConfig::default().with_authorized_client(client_keys.public());
    config.sweep.dispatch_interval_ms = 20;
    config.sweep.liveness_interval_ms = 50;

    let node = ControllerNode::with_keys(config, generate_keypair())
        .await
        .unwrap();
    let controller_key = node.public_key();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(node.run_with_listener(listener, shutdown.clone()));

    Running {
        base_url,
        controller_key,
        client_keys,
        shutdown,
        handle,
    }
}

impl Running {
    fn client(&self) -> ControllerClient {
        ControllerClient::new(&self.base_url, self.client_keys.clone())
            .with_controller_key(self.controller_key)
    }

    fn agent(&self) -> ControllerClient {
        ControllerClient::new(&self.base_url, generate_keypair())
            .with_controller_key(self.controller_key)
    }

    async fn stop(self) {
        self.shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("controller did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}

#[tokio::test]
async fn test_job_round_trip_over_tcp() {
    let server = start().await;
    let client = server.client();
    let mut agent = server.agent();

    assert!(client.health().await.unwrap());
    assert_eq!(client.identity().await.unwrap(), server.controller_key);

    let registered = agent.register(vec!["ocr".into()]).await.unwrap();
    assert_eq!(registered.status, AgentStatus::Pending);
    agent.heartbeat().await.unwrap();

    let job_id = client
        .submit_job("ocr", json!({"page": 1}), "page-1")
        .await
        .unwrap()
        .job_id;

    // the background dispatch loop hands the job out
    let mut assigned = Vec::new();
    for _ in 0..50 {
        assigned = agent.heartbeat().await.unwrap().assignments;
        if !assigned.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(assigned.len(), 1);
    assert_eq!(assigned[0].id, job_id);

    agent.start_job(job_id).await.unwrap();
    let done = agent
        .report_result(
            job_id,
            JobOutcome::Succeeded {
                result: json!({"text": "hello"}),
            },
        )
        .await
        .unwrap();
    assert_eq!(done.state, JobState::Succeeded);

    let status = client.job_status(job_id).await.unwrap();
    assert_eq!(status.result, Some(json!({"text": "hello"})));

    let listed = client.list_jobs(Some(JobState::Succeeded), 0, 10).await.unwrap();
    assert_eq!(listed.total, 1);

    server.stop().await;
}

#[tokio::test]
async fn test_unlisted_client_is_refused() {
    let server = start().await;
    let stranger = server.agent();

    let err = stranger
        .submit_job("ocr", json!(null), "stranger-1")
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::Remote { status: 403, .. }));

    server.stop().await;
}

#[tokio::test]
async fn test_wrong_pinned_key_is_refused() {
    let server = start().await;
    let client = ControllerClient::new(&server.base_url, server.client_keys.clone())
        .with_controller_key(generate_keypair().public());

    assert!(client.identity().await.is_err());
    assert!(client.list_jobs(None, 0, 10).await.is_err());

    server.stop().await;
}

#[tokio::test]
async fn test_revoked_agent_loses_access() {
    let server = start().await;
    let client = server.client();
    let mut agent = server.agent();

    let agent_id = agent.register(vec!["ocr".into()]).await.unwrap().agent_id;
    let revoked = client.revoke_agent(agent_id).await.unwrap();
    assert_eq!(revoked.status, AgentStatus::Revoked);

    let err = agent.heartbeat().await.unwrap_err();
    assert!(matches!(err, ControllerError::Remote { status: 403, .. }));

    server.stop().await;
}

/// A stand-in controller whose identity is honestly self-signed by
/// `controller` but whose submit responses are signed by `responder`.
async fn fake_controller(controller: KeyPair, responder: KeyPair, zero_signature: bool) -> String {
    let claimed = controller.public().to_hex();
    let app = axum::Router::new()
        .route(
            "/api/v1/identity",
            axum::routing::get(move || {
                let keys = controller.clone();
                async move {
                    let identity = IdentityResponse {
                        public_key: keys.public(),
                    };
                    axum::Json(SignedEnvelope::seal(keys.public().to_hex(), &identity, &keys).unwrap())
                }
            }),
        )
        .route(
            "/api/v1/jobs/submit",
            axum::routing::post(move || {
                let keys = responder.clone();
                let signer = claimed.clone();
                async move {
                    let response = SubmitJobResponse {
                        job_id: uuid::Uuid::new_v4(),
                        state: Some(JobState::Queued),
                        duplicate: false,
                    };
                    let mut envelope = SignedEnvelope::seal(signer, &response, &keys).unwrap();
                    if zero_signature {
                        envelope.signature = serde_json::from_value(json!("00".repeat(64))).unwrap();
                    }
                    axum::Json(envelope)
                }
            }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    base_url
}

#[tokio::test]
async fn test_unpinned_client_refuses_response_signed_by_other_key() {
    let controller = generate_keypair();
    let url = fake_controller(controller, generate_keypair(), false).await;
    let client = ControllerClient::new(url, generate_keypair());

    let err = client.submit_job("ocr", json!(null), "k").await.unwrap_err();
    assert!(matches!(err, ControllerError::InvalidSignature), "{:?}", err);
}

#[tokio::test]
async fn test_unpinned_client_refuses_zero_signature() {
    let controller = generate_keypair();
    let url = fake_controller(controller.clone(), controller, true).await;
    let client = ControllerClient::new(url, generate_keypair());

    let err = client.submit_job("ocr", json!(null), "k").await.unwrap_err();
    assert!(matches!(err, ControllerError::InvalidSignature), "{:?}", err);
}

#[tokio::test]
async fn test_unpinned_client_trusts_first_identity() {
    let controller = generate_keypair();
    let url = fake_controller(controller.clone(), controller.clone(), false).await;
    let client = ControllerClient::new(url, generate_keypair());

    assert!(client.submit_job("ocr", json!(null), "k").await.is_ok());
    assert_eq!(client.identity().await.unwrap(), controller.public());
}

#[tokio::test]
async fn test_case_limit_stops_job_over_tcp() {
    let server = start().await;
    let client = server.client();
    let mut agent = server.agent();
    agent.register(vec!["ocr".into()]).await.unwrap();
    agent.heartbeat().await.unwrap();

    let conditions = supervaize_controller::ledger::JobConditions {
        max_cases: Some(1),
        ..Default::default()
    };
    let job_id = client
        .submit_job_with("ocr", json!(null), "one-case", conditions)
        .await
        .unwrap()
        .job_id;

    let mut assigned = Vec::new();
    for _ in 0..50 {
        assigned = agent.heartbeat().await.unwrap().assignments;
        if !assigned.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(assigned.len(), 1);
    agent.start_job(job_id).await.unwrap();

    let first = agent.start_case(job_id, "only", None).await.unwrap();
    let case_id = first.case.unwrap().id;
    let closed = agent
        .close_case(job_id, case_id, json!({"ok": true}), Some(0.5))
        .await
        .unwrap();
    assert!(closed.stopped.is_none());

    // a second case is over the limit and stops the job
    let second = agent.start_case(job_id, "extra", None).await.unwrap();
    assert!(second.case.is_none());
    assert_eq!(second.stopped.as_deref(), Some("max cases 1 reached"));

    let job = client.job_status(job_id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.cases.len(), 1);
    assert_eq!(job.total_cost(), 0.5);

    server.stop().await;
}
