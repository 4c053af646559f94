//! parkour drives a cluster for autoscaling experiments: it boots the
//! utilization server, applies sample workloads, migrates pods between nodes
//! and reports live usage.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use kube::ResourceExt;
use tracing::{info, warn};

use parkour_engine::{
    actuator::Actuator,
    monitor::Monitor,
    routing::{HttpRoutingClient, RoutingClient},
    session::{
        client_for, workload_pod, workload_service, ClusterSession, SessionConfig,
        UTILIZATION_NODE_PORT, UTILIZATION_SERVER_APP,
    },
    utils::{Context, PollConfig},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Available Subcommands
#[derive(Subcommand, Debug)]
enum Command {
    /// Bootstrap the utilization server and apply a sample workload
    Up(UpOpts),
    /// Migrate a workload pod to another node
    Migrate(MigrateOpts),
    /// Report node and pod usage
    Status(ClusterOpts),
    /// Tear down managed namespaces
    Clean(CleanOpts),
}

#[derive(Args, Debug, Clone)]
struct ClusterOpts {
    /// Path to a kubeconfig file; inferred from the environment when unset
    #[arg(long, env = "PARKOUR_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Namespace the engine works in
    #[arg(long, env = "PARKOUR_NAMESPACE", default_value = "vpa")]
    namespace: String,

    /// Node port of the utilization server on the control node
    #[arg(long, env = "PARKOUR_CONTROL_PORT", default_value_t = UTILIZATION_NODE_PORT as u16)]
    control_port: u16,
}

#[derive(Args, Debug)]
struct UpOpts {
    #[command(flatten)]
    cluster: ClusterOpts,

    /// Local workload payload staged into the utilization server
    #[arg(
        long,
        env = "PARKOUR_WORKLOADS",
        default_value = "./data/workloads.pickle"
    )]
    workloads: PathBuf,

    /// Image of the utilization server
    #[arg(
        long,
        env = "PARKOUR_UTILIZATION_IMAGE",
        default_value = "r0ot/utilization-server"
    )]
    utilization_image: String,

    /// Image of the sample stress workload
    #[arg(long, env = "PARKOUR_STRESS_IMAGE", default_value = "r0ot/stress")]
    stress_image: String,

    /// Name shared by the sample pod and its service
    #[arg(long, default_value = "sample-vpa")]
    name: String,
}

#[derive(Args, Debug)]
struct MigrateOpts {
    #[command(flatten)]
    cluster: ClusterOpts,

    /// Workload payload, staged again when the session bootstraps
    #[arg(
        long,
        env = "PARKOUR_WORKLOADS",
        default_value = "./data/workloads.pickle"
    )]
    workloads: PathBuf,

    /// Image of the utilization server
    #[arg(
        long,
        env = "PARKOUR_UTILIZATION_IMAGE",
        default_value = "r0ot/utilization-server"
    )]
    utilization_image: String,

    /// Pod to migrate
    #[arg(long)]
    pod: String,

    /// Service routing to the pod; defaults to the pod name
    #[arg(long)]
    service: Option<String>,

    /// Target node
    #[arg(long)]
    node: String,
}

#[derive(Args, Debug)]
struct CleanOpts {
    #[command(flatten)]
    cluster: ClusterOpts,

    /// Clean every managed namespace instead of just the configured one
    #[arg(long)]
    all: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    parkour_common::telemetry::init()?;

    let args = Cli::parse();
    match args.command {
        Command::Up(opts) => up(opts).await,
        Command::Migrate(opts) => migrate(opts).await,
        Command::Status(opts) => status(opts).await,
        Command::Clean(opts) => clean(opts).await,
    }
}

fn session_config(cluster: &ClusterOpts, workloads: PathBuf, image: String) -> SessionConfig {
    SessionConfig {
        kubeconfig: cluster.kubeconfig.clone(),
        namespace: cluster.namespace.clone(),
        workloads_path: workloads,
        utilization_server_image: image,
        control_port: cluster.control_port,
        polling: PollConfig::default(),
    }
}

async fn up(opts: UpOpts) -> Result<()> {
    let config = session_config(&opts.cluster, opts.workloads, opts.utilization_image);
    let session = ClusterSession::connect(config).await?;

    session
        .action
        .create_pod(workload_pod(&opts.name, &opts.stress_image), None)
        .await?;
    session
        .action
        .create_service(workload_service(&opts.name), None)
        .await?;

    info!(workload = %opts.name, "workload applied, press Ctrl-C to tear down");
    tokio::signal::ctrl_c().await?;
    session.shutdown().await?;
    Ok(())
}

async fn migrate(opts: MigrateOpts) -> Result<()> {
    let config = session_config(&opts.cluster, opts.workloads, opts.utilization_image);
    let session = ClusterSession::connect(config).await?;

    let pod = session
        .monitor
        .pod(&opts.pod, None)
        .await?
        .with_context(|| format!("pod '{}' not found", opts.pod))?;
    let service_name = opts.service.unwrap_or_else(|| opts.pod.clone());
    let service = session
        .monitor
        .service(&service_name, None)
        .await?
        .with_context(|| format!("service '{service_name}' not found"))?;

    let outcome = session
        .action
        .move_pod(&pod, &service, &opts.node, None)
        .await?;
    if outcome.moved {
        info!(
            pod = %outcome.pod.name_any(),
            node = %opts.node,
            "migration complete"
        );
    } else {
        info!(pod = %outcome.pod.name_any(), "pod was already on the target node");
    }
    Ok(())
}

async fn status(opts: ClusterOpts) -> Result<()> {
    let client = client_for(opts.kubeconfig.as_deref()).await?;
    let cx = Arc::new(Context::new(client, HttpRoutingClient::new()?)?);
    let monitor = Monitor::new(cx.clone(), &opts.namespace);

    for (node, usage) in monitor.nodes_usage().await? {
        info!(node, cpu = %usage.cpu.0, memory = %usage.memory.0, "node usage");
    }
    for (pod, usage) in monitor.pods_usage(None).await? {
        info!(pod, cpu = %usage.cpu.0, memory = %usage.memory.0, "pod usage");
    }

    // The utilization server's own view of the synthetic load.
    let nodes = monitor.nodes().await?;
    if let Some(control_node) = nodes.into_iter().next() {
        let actuator = Actuator::new(
            cx.clone(),
            &opts.namespace,
            control_node,
            opts.control_port,
        );
        match actuator.control_endpoint() {
            Ok(endpoint) => match cx
                .routing_client
                .load_profile(endpoint, UTILIZATION_SERVER_APP.to_owned())
                .await
            {
                Ok(profile) => {
                    info!(ram = profile.ram, cpu = profile.cpu, "assigned load profile")
                }
                Err(err) => warn!(%err, "utilization server did not report a load profile"),
            },
            Err(err) => warn!(%err, "control node has no external address"),
        }
    }
    Ok(())
}

async fn clean(opts: CleanOpts) -> Result<()> {
    let client = client_for(opts.cluster.kubeconfig.as_deref()).await?;
    let cx = Arc::new(Context::new(client, HttpRoutingClient::new()?)?);
    let monitor = Monitor::new(cx.clone(), &opts.cluster.namespace);

    let control_node = monitor
        .nodes()
        .await?
        .into_iter()
        .next()
        .context("no schedulable nodes in cluster")?;
    let actuator = Actuator::new(
        cx,
        &opts.cluster.namespace,
        control_node,
        opts.cluster.control_port,
    );

    if opts.all {
        let cleaned = actuator.clean_all().await?;
        info!(cleaned, "managed namespaces removed");
    } else {
        actuator.clean(None).await?;
        info!(namespace = %opts.cluster.namespace, "namespace removed");
    }
    Ok(())
}
