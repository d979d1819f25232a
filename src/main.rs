use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;

use job_worker::config::{IsolationBackend, IsolationConfig, TlsConfig, WorkerConfig};
use job_worker::grpc::GrpcServer;
use job_worker::proto::worker_service_client::WorkerServiceClient;
use job_worker::proto::{
    QueryRequest, QueryResponse, ResourceSpec, StartRequest, StopRequest, StreamRequest,
};
use job_worker::shutdown::install_shutdown_handler;
use job_worker::tls::TlsIdentity;
use job_worker::worker::JobRegistry;

#[derive(Parser, Debug)]
#[command(name = "job-worker")]
#[command(version)]
#[command(about = "Run, isolate, and stream Linux processes behind an mTLS API")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the worker server
    Server(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to listen on for gRPC
    #[arg(long, default_value = "127.0.0.1:50051")]
    listen: SocketAddr,

    /// Directory for per-job output logs
    #[arg(long, default_value = "/var/lib/job-worker/logs")]
    log_dir: PathBuf,

    /// How jobs are isolated
    #[arg(long, default_value = "cgroup")]
    isolation: Isolation,

    /// Parent cgroup for job groups (cgroup2 only)
    #[arg(long, default_value = "/sys/fs/cgroup/job-worker")]
    cgroup_root: PathBuf,

    /// Milliseconds to wait after SIGTERM before SIGKILL
    #[arg(long, default_value = "5000")]
    grace_period_ms: u64,

    /// Live output chunks buffered per stream before it is dropped
    #[arg(long, default_value = "256")]
    stream_queue: usize,

    // === TLS Options ===
    /// Enable mTLS for the API
    #[arg(long)]
    tls: bool,

    /// Path to CA certificate that signs client certificates (PEM format)
    #[arg(long, requires = "tls")]
    ca_cert: Option<PathBuf>,

    /// Path to server certificate (PEM format)
    #[arg(long, requires = "tls")]
    cert: Option<PathBuf>,

    /// Path to server private key (PEM format)
    #[arg(long, requires = "tls")]
    key: Option<PathBuf>,

    /// Keep running without TLS when certificates are missing.
    /// Every call is rejected in that mode. NOT for production.
    #[arg(long)]
    allow_insecure: bool,
}

#[derive(Debug, Clone, ValueEnum)]
enum Isolation {
    Cgroup,
    None,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Worker address (use https:// for TLS)
    #[arg(long, short = 'a', default_value = "https://127.0.0.1:50051")]
    addr: String,

    /// Path to CA certificate (PEM format) that signs the worker certificate
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Path to role-bearing client certificate (PEM format)
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Path to client private key (PEM format)
    #[arg(long)]
    key: Option<PathBuf>,

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
    /// Start a new job
    Start {
        /// Relative CPU share (1-10000)
        #[arg(long)]
        cpu_weight: Option<u32>,

        /// CPU ceiling in millicores (1000 = one CPU)
        #[arg(long)]
        cpu_millis: Option<u32>,

        /// Memory ceiling in bytes
        #[arg(long)]
        memory_bytes: Option<u64>,

        /// Relative IO share (1-10000)
        #[arg(long)]
        io_weight: Option<u32>,

        /// Program to run
        name: String,

        /// Arguments passed to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Stop a running job
    Stop {
        /// The job ID (UUID)
        job_id: String,
    },
    /// Get status of a job
    Status {
        /// The job ID (UUID)
        job_id: String,
    },
    /// Print a job's output from the beginning, following it until it ends
    Logs {
        /// The job ID (UUID)
        job_id: String,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobStartOutput {
    job_id: String,
}

#[derive(Serialize)]
struct JobStatusOutput {
    job_id: String,
    state: String,
    pid: u32,
    exit_code: Option<i32>,
    signal: Option<i32>,
    exited: bool,
    signaled: bool,
    started_at_ms: i64,
    finished_at_ms: Option<i64>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn job_state(status: &QueryResponse) -> String {
    match (status.exited, status.signaled, status.signal) {
        (false, _, _) => "RUNNING".to_string(),
        (true, true, Some(sig)) => format!("SIGNALED({})", sig),
        (true, true, None) => "SIGNALED".to_string(),
        (true, false, _) => format!("EXITED({})", status.exit_code),
    }
}

async fn create_client_channel(args: &ClientArgs) -> Result<Channel, Box<dyn std::error::Error>> {
    let endpoint = Channel::from_shared(args.addr.clone())?;

    let tls_config = TlsConfig {
        enabled: true,
        ca_cert_path: args.ca_cert.clone(),
        cert_path: args.cert.clone(),
        key_path: args.key.clone(),
        allow_insecure: false,
    };

    if tls_config.is_complete() {
        let identity = TlsIdentity::load(&tls_config).await?;
        Ok(endpoint
            .tls_config(identity.client_tls_config())?
            .connect()
            .await?)
    } else if args.addr.starts_with("https://") {
        Err("https requires --ca-cert, --cert and --key".into())
    } else {
        Ok(endpoint.connect().await?)
    }
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

    let tls_config = TlsConfig {
        enabled: args.tls,
        ca_cert_path: args.ca_cert,
        cert_path: args.cert,
        key_path: args.key,
        allow_insecure: args.allow_insecure,
    };

    let tls_identity = if tls_config.is_complete() {
        match TlsIdentity::load(&tls_config).await {
            Ok(identity) => Some(identity),
            Err(e) => {
                if tls_config.allow_insecure {
                    tracing::warn!(
                        error = %e,
                        "TLS certificate loading failed, running in insecure mode"
                    );
                    None
                } else {
                    return Err(format!("TLS certificate loading failed: {}", e).into());
                }
            }
        }
    } else if tls_config.enabled {
        if tls_config.allow_insecure {
            tracing::warn!(
                "TLS enabled but certificate paths incomplete, running in insecure mode"
            );
            None
        } else {
            return Err("TLS enabled but missing required paths (--ca-cert, --cert, --key)".into());
        }
    } else if tls_config.allow_insecure {
        None
    } else {
        return Err("Refusing to start without TLS; pass --tls or --allow-insecure".into());
    };

    let isolation = IsolationConfig {
        backend: match args.isolation {
            Isolation::Cgroup => IsolationBackend::Cgroup,
            Isolation::None => IsolationBackend::Noop,
        },
        cgroup_root: args.cgroup_root,
    };

    let mut config = WorkerConfig::new(args.listen, args.log_dir)
        .with_isolation(isolation)
        .with_grace_period_ms(args.grace_period_ms)
        .with_subscriber_queue_capacity(args.stream_queue);
    config.tls = tls_config;

    tracing::info!(
        listen_addr = %config.listen_addr,
        log_dir = %config.log_dir.display(),
        isolation = ?config.isolation.backend,
        tls_enabled = tls_identity.is_some(),
        "Starting job-worker"
    );

    let shutdown = install_shutdown_handler()?;
    let registry = Arc::new(JobRegistry::from_config(config.clone())?);
    let server = GrpcServer::new(config.listen_addr, registry.clone(), tls_identity);

    let result = server.run(shutdown.clone()).await;
    shutdown.cancel();
    registry.shutdown().await;
    tracing::info!("Worker stopped");

    result
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_start(
    client: &mut WorkerServiceClient<Channel>,
    request: StartRequest,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client.start(request).await?.into_inner();

    match output_format {
        OutputFormat::Json => {
            let output = JobStartOutput {
                job_id: response.job_id,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job started.");
            println!("Job ID: {}", response.job_id);
        }
    }
    Ok(())
}

async fn handle_job_stop(
    client: &mut WorkerServiceClient<Channel>,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    client
        .stop(StopRequest {
            job_id: job_id.clone(),
        })
        .await?;

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "job_id": job_id, "stopped": true }));
        }
        OutputFormat::Table => println!("Job {} stopped.", job_id),
    }
    Ok(())
}

async fn handle_job_status(
    client: &mut WorkerServiceClient<Channel>,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .query(QueryRequest { job_id })
        .await?
        .into_inner();
    let state = job_state(&response);

    match output_format {
        OutputFormat::Json => {
            let output = JobStatusOutput {
                exit_code: (response.exited && !response.signaled).then_some(response.exit_code),
                job_id: response.job_id,
                state,
                pid: response.pid,
                signal: response.signal,
                exited: response.exited,
                signaled: response.signaled,
                started_at_ms: response.started_at_ms,
                finished_at_ms: response.finished_at_ms,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job ID:   {}", response.job_id);
            println!("State:    {}", state);
            println!("PID:      {}", response.pid);
            if let Some(finished) = response.finished_at_ms {
                println!(
                    "Runtime:  {} ms",
                    finished.saturating_sub(response.started_at_ms)
                );
            }
        }
    }
    Ok(())
}

async fn handle_job_logs(
    client: &mut WorkerServiceClient<Channel>,
    job_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut output = client
        .stream(StreamRequest { job_id })
        .await?
        .into_inner();

    let mut stdout = tokio::io::stdout();
    while let Some(item) = output.next().await {
        let chunk = item?.chunk;
        stdout.write_all(&chunk).await?;
        stdout.flush().await?;
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
        Commands::Job { client, command } => {
            let channel = create_client_channel(&client).await?;
            let mut grpc_client = WorkerServiceClient::new(channel);

            match command {
                JobCommands::Start {
                    cpu_weight,
                    cpu_millis,
                    memory_bytes,
                    io_weight,
                    name,
                    args,
                } => {
                    let limits = ResourceSpec {
                        cpu_weight,
                        cpu_millis,
                        memory_bytes,
                        io_weight,
                    };
                    let any_limit = cpu_weight.is_some()
                        || cpu_millis.is_some()
                        || memory_bytes.is_some()
                        || io_weight.is_some();
                    let request = StartRequest {
                        name,
                        args,
                        resources: any_limit.then_some(limits),
                    };
                    handle_job_start(&mut grpc_client, request, &client.output).await?;
                }
                JobCommands::Stop { job_id } => {
                    handle_job_stop(&mut grpc_client, job_id, &client.output).await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&mut grpc_client, job_id, &client.output).await?;
                }
                JobCommands::Logs { job_id } => {
                    handle_job_logs(&mut grpc_client, job_id).await?;
                }
            }
        }
    }

    Ok(())
}
