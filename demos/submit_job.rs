//! Submit a job to a controller and serve it with a simulated agent.
//!
//! Without `--addr` an in-process controller is started on an ephemeral
//! port (open client mode), so the demo runs on its own:
//!
//! ```text
//! cargo run --example submit_job -- --capability translate.fr --payload '{"text":"hello"}'
//! ```

use std::time::Duration;

use clap::Parser;
use supervaize_controller::client::ControllerClient;
use supervaize_controller::config::ControllerConfig;
use supervaize_controller::gateway::wire::UpdateCaseRequest;
use supervaize_controller::identity::generate_keypair;
use supervaize_controller::ledger::{JobOutcome, JobState};
use supervaize_controller::node::ControllerNode;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "submit-job")]
#[command(about = "Submit a job and serve it with a simulated agent")]
struct Args {
    /// Controller base URL. An in-process controller is started when omitted.
    #[arg(long)]
    addr: Option<String>,

    /// Capability the job requires
    #[arg(long, default_value = "translate.fr")]
    capability: String,

    /// Job payload as JSON
    #[arg(long, default_value = "{\"text\":\"hello\"}")]
    payload: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let shutdown = CancellationToken::new();

    let addr = match args.addr {
        Some(addr) => addr,
        None => {
            let mut config = ControllerConfig::default();
            config.auth.allow_any_client = true;
            config.sweep.dispatch_interval_ms = 100;
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
            let addr = format!("http://{}", listener.local_addr()?);
            let node = ControllerNode::with_keys(config, generate_keypair()).await?;
            let token = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = node.run_with_listener(listener, token).await {
                    eprintln!("controller failed: {}", e);
                }
            });
            println!("Started controller at {}", addr);
            addr
        }
    };

    let submitter = ControllerClient::new(addr.clone(), generate_keypair());
    let controller_key = submitter.identity().await?;
    println!("Controller key: {}", controller_key);
    let submitter = submitter.with_controller_key(controller_key);

    let mut agent =
        ControllerClient::new(addr, generate_keypair()).with_controller_key(controller_key);
    let registration = agent.register(vec![args.capability.clone()]).await?;
    println!("Registered agent {}", registration.agent_id);

    let payload: serde_json::Value = serde_json::from_str(&args.payload)?;
    let submitted = submitter
        .submit_job(args.capability, payload, Uuid::new_v4().to_string())
        .await?;
    println!("Submitted job {}", submitted.job_id);

    // Agent: heartbeat until the job shows up, then run it.
    let job = loop {
        let beat = agent.heartbeat().await?;
        if let Some(job) = beat
            .assignments
            .into_iter()
            .find(|j| j.id == submitted.job_id)
        {
            break job;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };
    agent.start_job(job.id).await?;

    // one case per job, with a single progress step
    let case = agent
        .start_case(job.id, "echo", None)
        .await?
        .case
        .ok_or("job stopped before its case could open")?;
    agent
        .update_case(&UpdateCaseRequest {
            job_id: job.id,
            case_id: case.id,
            cost: 0.01,
            payload: job.payload.clone(),
            ..Default::default()
        })
        .await?;
    agent
        .close_case(job.id, case.id, job.payload.clone(), None)
        .await?;

    let result = serde_json::json!({ "echo": job.payload });
    agent
        .report_result(job.id, JobOutcome::Succeeded { result })
        .await?;

    let job = submitter.job_status(submitted.job_id).await?;
    println!("Job {} is {}", job.id, job.state);
    if job.state == JobState::Succeeded {
        println!("Result: {}", job.result.unwrap_or_default());
    }

    shutdown.cancel();
    Ok(())
}
