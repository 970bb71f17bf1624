use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use nomad_orch::agent::{dev_node, DevAgent, NodeEndpoint};
use nomad_orch::api::ApiClient;
use nomad_orch::config::ServerConfig;
use nomad_orch::error::OrchError;
use nomad_orch::model::Job;
use nomad_orch::server::Server;
use nomad_orch::shutdown::install_shutdown_handler;
use nomad_orch::status::{self, StatusOptions};

#[derive(Parser, Debug)]
#[command(name = "nomad-orch")]
#[command(version)]
#[command(about = "Evaluation-driven job scheduler with rolling deployments across regions")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a region server, optionally with in-process dev nodes
    Agent(AgentArgs),

    /// Job commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Deployment commands
    Deployment {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: DeploymentCommands,
    },

    /// Node commands
    Node {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: NodeCommands,
    },
}

#[derive(Parser, Debug)]
struct AgentArgs {
    #[arg(long, env = "NOMAD_ORCH_REGION", default_value = "global")]
    region: String,

    #[arg(long, env = "NOMAD_ORCH_DATACENTER", default_value = "dc1")]
    datacenter: String,

    /// Address for the HTTP API
    #[arg(long, default_value = "127.0.0.1:4646")]
    http_addr: SocketAddr,

    /// Peer regions (comma-separated, format: "region=http://host:port")
    #[arg(long, default_value = "")]
    peers: String,

    /// Scheduler workers
    #[arg(long, default_value = "2")]
    schedulers: usize,

    /// Nodes without a heartbeat for this long are marked down (0 disables)
    #[arg(long, default_value = "10000")]
    heartbeat_ttl_ms: u64,

    /// Number of in-process nodes running the mock driver
    #[arg(long, default_value = "0")]
    dev_nodes: usize,
}

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', env = "NOMAD_ORCH_ADDR", default_value = "http://127.0.0.1:4646")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Register a job from a JSON file
    Run { file: PathBuf },
    /// Show one job by id or unique prefix, or list all jobs
    Status {
        prefix: Option<String>,

        /// Only the job header
        #[arg(long)]
        short: bool,

        /// Full identifiers and times, plus evaluations
        #[arg(long)]
        verbose: bool,

        /// Include evaluations
        #[arg(long)]
        evals: bool,
    },
    /// Stop a job
    Stop { job_id: String },
    /// Per-region deployment status of a job
    Deployments {
        job_id: String,
        #[arg(long)]
        region: Option<String>,
    },
}

#[derive(clap::Subcommand, Debug)]
enum DeploymentCommands {
    Pause { id: String },
    Resume { id: String },
    Promote {
        id: String,
        /// Promote only these groups
        #[arg(long = "group")]
        groups: Vec<String>,
    },
    Fail { id: String },
    Cancel { id: String },
    /// Promote a multiregion job's deployment in every region
    PromoteAll { job_id: String },
    /// Fail a multiregion job's deployment in every region
    FailAll { job_id: String },
}

#[derive(clap::Subcommand, Debug)]
enum NodeCommands {
    /// List nodes
    Status,
    /// Enable or disable drain on a node
    Drain {
        node_id: String,
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        #[arg(long)]
        disable: bool,
    },
}

#[derive(Serialize)]
struct IndexOutput {
    index: u64,
}

fn parse_peers(peers_str: &str) -> Vec<(String, String)> {
    if peers_str.is_empty() {
        return Vec::new();
    }
    peers_str
        .split(',')
        .filter_map(|peer| match peer.trim().split_once('=') {
            Some((region, addr)) if !region.is_empty() && !addr.is_empty() => {
                Some((region.to_string(), addr.to_string()))
            }
            _ => {
                tracing::warn!(peer, "Invalid peer format, expected region=address");
                None
            }
        })
        .collect()
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_agent(args: AgentArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ServerConfig::new(args.region, args.datacenter).with_http_addr(args.http_addr);
    config.num_schedulers = args.schedulers;
    config.node_heartbeat_ttl_ms = args.heartbeat_ttl_ms;
    for (region, addr) in parse_peers(&args.peers) {
        config = config.with_peer(region, addr);
    }

    tracing::info!(
        region = %config.region,
        datacenter = %config.datacenter,
        http_addr = %args.http_addr,
        peers = ?config.peers.iter().map(|p| format!("{}={}", p.region, p.addr)).collect::<Vec<_>>(),
        "Starting nomad-orch agent"
    );

    let shutdown = install_shutdown_handler()?;
    let datacenter = config.datacenter.clone();
    let heartbeat_every = config
        .node_heartbeat_ttl()
        .map(|ttl| ttl / 3)
        .unwrap_or(Duration::from_secs(1));
    let (server, plan_rx) = Server::new(config)?;

    for i in 0..args.dev_nodes {
        let node = dev_node(&format!("dev-{i}"), &datacenter);
        let endpoint: Arc<dyn NodeEndpoint> = server.clone();
        let agent = DevAgent::new(node, endpoint, heartbeat_every);
        tokio::spawn(agent.run(shutdown.clone()));
    }

    server.run(plan_rx, shutdown).await?;
    Ok(())
}

async fn handle_job(
    api: &ApiClient,
    command: JobCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        JobCommands::Run { file } => {
            let job = Job::from_json_file(&file)?;
            let resp = api.register_job(&job).await?;
            match output {
                OutputFormat::Json => print_json(&resp)?,
                OutputFormat::Table => {
                    println!("Job registered: {}", job.id);
                    println!("Evaluation ID: {}", resp.eval_id);
                    println!("Index: {}", resp.index);
                }
            }
        }
        JobCommands::Status {
            prefix: None,
            ..
        } => {
            let jobs = api.list_jobs().await?;
            match output {
                OutputFormat::Json => print_json(&jobs)?,
                OutputFormat::Table => println!("{}", status::format_job_list(&jobs)),
            }
        }
        JobCommands::Status {
            prefix: Some(prefix),
            short,
            verbose,
            evals,
        } => {
            let report = match api.job_status(&prefix, 0).await {
                Ok(report) => report,
                Err(OrchError::AmbiguousPrefix { prefix, matches }) => {
                    eprintln!("{}", status::format_ambiguous(&prefix, &matches));
                    std::process::exit(1);
                }
                Err(err) => return Err(err.into()),
            };
            match output {
                OutputFormat::Json => print_json(&report)?,
                OutputFormat::Table => {
                    let opts = StatusOptions {
                        short,
                        verbose,
                        evals,
                    };
                    println!("{}", status::format_job_status(&report, &opts, Utc::now()));
                }
            }
        }
        JobCommands::Stop { job_id } => {
            let resp = api.deregister_job(&job_id).await?;
            match output {
                OutputFormat::Json => print_json(&resp)?,
                OutputFormat::Table => println!("Job stopped, evaluation ID: {}", resp.eval_id),
            }
        }
        JobCommands::Deployments { job_id, region } => {
            let statuses = api.deployment_status(&job_id, region.as_deref()).await?;
            match output {
                OutputFormat::Json => print_json(&statuses)?,
                OutputFormat::Table => println!(
                    "{}",
                    status::format_region_statuses(&statuses, &StatusOptions::default())
                ),
            }
        }
    }
    Ok(())
}

async fn handle_deployment(
    api: &ApiClient,
    command: DeploymentCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let index = match command {
        DeploymentCommands::Pause { id } => api.pause_deployment(&id, true).await?,
        DeploymentCommands::Resume { id } => api.pause_deployment(&id, false).await?,
        DeploymentCommands::Promote { id, groups } => {
            let groups = (!groups.is_empty()).then_some(groups);
            api.promote_deployment(&id, groups).await?
        }
        DeploymentCommands::Fail { id } => api.fail_deployment(&id).await?,
        DeploymentCommands::Cancel { id } => api.cancel_deployment(&id).await?,
        DeploymentCommands::PromoteAll { job_id } => {
            let results = api.multiregion_promote(&job_id).await?;
            return print_region_actions(&results, output);
        }
        DeploymentCommands::FailAll { job_id } => {
            let results = api.multiregion_fail(&job_id).await?;
            return print_region_actions(&results, output);
        }
    };
    match output {
        OutputFormat::Json => print_json(&IndexOutput { index })?,
        OutputFormat::Table => println!("Deployment updated at index {index}"),
    }
    Ok(())
}

fn print_region_actions(
    results: &[nomad_orch::multiregion::RegionActionResult],
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => print_json(&results)?,
        OutputFormat::Table => println!("{}", status::format_region_actions(results)),
    }
    if results.iter().any(|r| !r.ok()) {
        std::process::exit(1);
    }
    Ok(())
}

async fn handle_node(
    api: &ApiClient,
    command: NodeCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        NodeCommands::Status => {
            let nodes = api.list_nodes().await?;
            match output {
                OutputFormat::Json => print_json(&nodes)?,
                OutputFormat::Table => {
                    let mut rows = vec![["ID", "DC", "Name", "Class", "Drain", "Eligible", "Status"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect::<Vec<_>>()];
                    for n in &nodes {
                        rows.push(vec![
                            nomad_orch::model::short_id(&n.id).to_string(),
                            n.datacenter.clone(),
                            n.name.clone(),
                            if n.node_class.is_empty() {
                                "-".to_string()
                            } else {
                                n.node_class.clone()
                            },
                            n.drain.to_string(),
                            n.eligible.to_string(),
                            n.status.to_string(),
                        ]);
                    }
                    println!("{}", status::columnize(&rows));
                }
            }
        }
        NodeCommands::Drain {
            node_id,
            enable,
            disable,
        } => {
            if enable == disable {
                return Err("exactly one of --enable or --disable is required".into());
            }
            let evals = api.update_node_drain(&node_id, enable).await?;
            match output {
                OutputFormat::Json => print_json(&evals)?,
                OutputFormat::Table => println!("Node drain updated, {} evaluation(s) created", evals.len()),
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Agent(agent_args) => run_agent(agent_args).await?,
        Commands::Job { client, command } => {
            let api = ApiClient::new(&client.addr, Duration::from_secs(30))?;
            handle_job(&api, command, &client.output).await?;
        }
        Commands::Deployment { client, command } => {
            let api = ApiClient::new(&client.addr, Duration::from_secs(30))?;
            handle_deployment(&api, command, &client.output).await?;
        }
        Commands::Node { client, command } => {
            let api = ApiClient::new(&client.addr, Duration::from_secs(30))?;
            handle_node(&api, command, &client.output).await?;
        }
    }

    Ok(())
}
