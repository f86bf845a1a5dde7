use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use supervaize_controller::client::ControllerClient;
use supervaize_controller::config::ControllerConfig;
use supervaize_controller::identity::{generate_keypair, KeyPair, PublicKey};
use supervaize_controller::ledger::{Job, JobConditions, JobState};
use supervaize_controller::node::ControllerNode;
use supervaize_controller::registry::Agent;
use supervaize_controller::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "supervaize-controller")]
#[command(version)]
#[command(about = "Registers agents and dispatches signed jobs to them")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the controller
    Server(ServerArgs),

    /// Generate a signing key file
    Keygen {
        /// Where to write the hex secret key
        #[arg(long, short = 'o', default_value = "client.key")]
        out: PathBuf,
    },

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Agent management commands
    Agent {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: AgentCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8040")]
    listen: SocketAddr,

    /// Controller signing key (created if missing)
    #[arg(long, default_value = "controller.key")]
    key: PathBuf,

    /// Snapshot file for agents and jobs (in-memory only when omitted)
    #[arg(long)]
    state: Option<PathBuf>,

    /// Client public key (hex) allowed to submit and manage jobs. Repeatable.
    #[arg(long = "authorized-client")]
    authorized_clients: Vec<PublicKey>,

    /// Accept any client key. Development only.
    #[arg(long)]
    allow_any_client: bool,

    /// Jobs an agent may hold at once
    #[arg(long, default_value = "1")]
    max_concurrent_jobs: usize,

    /// Requeues allowed before a job expires
    #[arg(long, default_value = "3")]
    max_attempts: u32,

    /// Heartbeat age after which an agent is considered unreachable
    #[arg(long, default_value = "15000")]
    heartbeat_timeout_ms: u64,

    /// Expire jobs queued for longer than this (never when omitted)
    #[arg(long)]
    job_ttl_ms: Option<u64>,

    /// Keep idempotency keys of finished jobs at least this long
    #[arg(long, default_value = "86400000")]
    idempotency_retention_ms: u64,

    /// Maximum number of jobs kept in the ledger
    #[arg(long, default_value = "10000")]
    max_jobs: usize,
}

// =============================================================================
// Client Arguments (shared by job and agent commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Controller base URL
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8040")]
    addr: String,

    /// Client signing key (see `keygen`)
    #[arg(long, short = 'k', default_value = "client.key")]
    key: PathBuf,

    /// Expected controller public key (hex). When omitted, the key from the
    /// controller's first identity response is trusted. Responses signed by
    /// any other key are refused either way.
    #[arg(long)]
    controller_key: Option<PublicKey>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a new job
    Submit {
        /// Required capability tag (e.g., "translate.fr")
        capability: String,

        /// Job payload as JSON
        #[arg(long, default_value = "null")]
        payload: String,

        /// Resubmitting with the same key returns the original job.
        /// A random key is used when omitted.
        #[arg(long)]
        idempotency_key: Option<String>,

        /// Stop the job once it has opened this many cases
        #[arg(long)]
        max_cases: Option<u32>,

        /// Stop the job once it has been running this long
        #[arg(long)]
        max_duration_secs: Option<u64>,

        /// Stop the job once its cases have cost this much
        #[arg(long)]
        max_cost: Option<f64>,
    },

    /// Get status of a specific job
    Status {
        /// The job ID (UUID)
        job_id: Uuid,
    },

    /// List jobs
    List {
        /// Only jobs in this state
        #[arg(long)]
        state: Option<JobState>,

        /// Number of jobs per page (max: 1000)
        #[arg(long, default_value = "100")]
        page_size: usize,

        /// Fetch all pages automatically
        #[arg(long)]
        all: bool,
    },

    /// Remove a finished job from the ledger
    Archive {
        /// The job ID (UUID)
        job_id: Uuid,
    },
}

// =============================================================================
// Agent Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum AgentCommands {
    /// List registered agents
    List {
        #[arg(long, default_value = "100")]
        page_size: usize,
    },

    /// Revoke an agent and requeue its jobs
    Revoke {
        /// The agent ID (UUID)
        agent_id: Uuid,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobListOutput {
    jobs: Vec<Job>,
    total_count: usize,
    has_more: bool,
}

#[derive(Serialize)]
struct KeygenOutput {
    path: String,
    public_key: String,
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = ControllerConfig::new(args.listen);
    config.key_path = args.key;
    config.state_path = args.state;
    config.max_jobs = args.max_jobs;
    config.auth.authorized_clients = args.authorized_clients;
    config.auth.allow_any_client = args.allow_any_client;
    config.dispatch.max_concurrent_jobs_per_agent = args.max_concurrent_jobs.max(1);
    config.dispatch.max_attempts = args.max_attempts;
    config.sweep.heartbeat_timeout_ms = args.heartbeat_timeout_ms;
    config.sweep.job_ttl_ms = args.job_ttl_ms;
    config.sweep.idempotency_retention_ms = args.idempotency_retention_ms;

    tracing::info!(
        listen_addr = %config.listen_addr,
        state_path = ?config.state_path,
        authorized_clients = config.auth.authorized_clients.len(),
        "Starting supervaize controller"
    );

    let shutdown = install_shutdown_handler();
    let node = ControllerNode::new(config).await?;
    node.run(shutdown).await?;
    Ok(())
}

async fn run_keygen(out: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    if out.exists() {
        return Err(format!("{} already exists, refusing to overwrite", out.display()).into());
    }
    let keys = generate_keypair();
    keys.save(&out).await?;
    let output = KeygenOutput {
        path: out.display().to_string(),
        public_key: keys.public().to_hex(),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn connect(args: &ClientArgs) -> Result<ControllerClient, Box<dyn std::error::Error>> {
    let keys = KeyPair::load(&args.key).await?;
    let mut client = ControllerClient::new(args.addr.clone(), keys);
    if let Some(key) = args.controller_key {
        client = client.with_controller_key(key);
    }
    Ok(client)
}

// =============================================================================
// Client Command Handlers
// =============================================================================

fn print_job(job: &Job) {
    println!("Job ID:      {}", job.id);
    println!("Capability:  {}", job.capability);
    println!("State:       {}", job.state);
    println!(
        "Agent:       {}",
        job.assigned_agent
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("Attempts:    {}", job.attempts);
    println!("Created:     {}", job.created_at.to_rfc3339());
    if let Some(finished) = job.finished_at {
        println!("Finished:    {}", finished.to_rfc3339());
    }
    if let Some(result) = &job.result {
        println!("Result:      {}", result);
    }
    if let Some(error) = &job.error {
        println!("Error:       {}", error);
    }
    if !job.cases.is_empty() {
        println!("Cases:       {} (cost {})", job.cases.len(), job.total_cost());
        for case in &job.cases {
            println!("  {}  {:<14} {}", case.id, case.status, case.name);
        }
    }
}

async fn handle_job_command(
    client: &ControllerClient,
    command: JobCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        JobCommands::Submit {
            capability,
            payload,
            idempotency_key,
            max_cases,
            max_duration_secs,
            max_cost,
        } => {
            let payload: serde_json::Value = serde_json::from_str(&payload)
                .map_err(|e| format!("--payload is not valid JSON: {}", e))?;
            let idempotency_key =
                idempotency_key.unwrap_or_else(|| Uuid::new_v4().to_string());
            let conditions = JobConditions {
                max_cases,
                max_duration_secs,
                max_cost,
            };
            let response = client
                .submit_job_with(capability, payload, idempotency_key, conditions)
                .await?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response)?),
                OutputFormat::Table => {
                    if response.duplicate {
                        println!("Job already submitted with this key: {}", response.job_id);
                    } else {
                        println!("Job submitted: {}", response.job_id);
                    }
                }
            }
        }
        JobCommands::Status { job_id } => {
            let job = client.job_status(job_id).await?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
                OutputFormat::Table => print_job(&job),
            }
        }
        JobCommands::List {
            state,
            page_size,
            all,
        } => {
            let mut jobs = Vec::new();
            let mut total_count = 0;
            let mut skip = 0;
            loop {
                let page = client.list_jobs(state, skip, page_size).await?;
                total_count = page.total;
                skip += page.jobs.len();
                let empty = page.jobs.is_empty();
                jobs.extend(page.jobs);
                if !all || empty || skip >= total_count {
                    break;
                }
            }
            let has_more = jobs.len() < total_count;

            match output_format {
                OutputFormat::Json => {
                    let output = JobListOutput {
                        jobs,
                        total_count,
                        has_more,
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Table => {
                    if jobs.is_empty() {
                        println!("No jobs found.");
                    } else {
                        println!("{:<38} {:<10} {:<38} CAPABILITY", "JOB ID", "STATE", "AGENT");
                        println!("{}", "-".repeat(100));
                        for job in &jobs {
                            let agent = job
                                .assigned_agent
                                .map(|a| a.to_string())
                                .unwrap_or_else(|| "-".to_string());
                            println!(
                                "{:<38} {:<10} {:<38} {}",
                                job.id, job.state, agent, job.capability
                            );
                        }
                        println!();
                        println!("Showing {} of {} jobs", jobs.len(), total_count);
                        if has_more {
                            println!("(Use --all to fetch all pages)");
                        }
                    }
                }
            }
        }
        JobCommands::Archive { job_id } => {
            let job = client.archive_job(job_id).await?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
                OutputFormat::Table => println!("Archived job {} ({})", job.id, job.state),
            }
        }
    }
    Ok(())
}

fn print_agents(agents: &[Agent], total: usize) {
    if agents.is_empty() {
        println!("No agents registered.");
        return;
    }
    println!("{:<38} {:<12} {:<8} CAPABILITIES", "AGENT ID", "STATUS", "JOBS");
    println!("{}", "-".repeat(80));
    for agent in agents {
        println!(
            "{:<38} {:<12} {:<8} {}",
            agent.id,
            agent.status,
            agent.pending_count(),
            agent.capabilities.to_strings().join(",")
        );
    }
    println!();
    println!("Showing {} of {} agents", agents.len(), total);
}

async fn handle_agent_command(
    client: &ControllerClient,
    command: AgentCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        AgentCommands::List { page_size } => {
            let page = client.list_agents(0, page_size).await?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&page)?),
                OutputFormat::Table => print_agents(&page.agents, page.total),
            }
        }
        AgentCommands::Revoke { agent_id } => {
            let response = client.revoke_agent(agent_id).await?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response)?),
                OutputFormat::Table => {
                    println!("Agent {} is {}", response.agent_id, response.status);
                    for job_id in &response.released_jobs {
                        println!("  released job {}", job_id);
                    }
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Keygen { out } => {
            run_keygen(out).await?;
        }
        Commands::Job { client, command } => {
            let controller = connect(&client).await?;
            handle_job_command(&controller, command, &client.output).await?;
        }
        Commands::Agent { client, command } => {
            let controller = connect(&client).await?;
            handle_agent_command(&controller, command, &client.output).await?;
        }
    }

    Ok(())
}
