use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};
use kube::api::{Api, ListParams};
use node_detacher::{
    config::{ControllerConfig, Integrations, WellKnownKeys},
    controller::{self, ControllerState, DaemonSetRef},
    crd::Attachment,
    leader,
    registry::{AwsTargetRegistry, DryRunRegistry, TargetRegistry},
    store::KubeNodeStore,
    telemetry::{self, LogFormat},
    Error,
};
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller
    Run(Box<RunArgs>),
    /// Show version and build information
    Version,
    /// List cached attachment records
    Info(InfoArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Name of this node-detacher instance, used as the repel taint value
    #[arg(long, env = "NODE_DETACHER_NAME", default_value = "node-detacher")]
    name: String,

    /// Namespace holding Attachment records and the leader lease
    #[arg(long)]
    namespace: Option<String>,

    /// Period between forced resyncs of every node
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    sync_period: Duration,

    /// Delay before retrying a failed reconciliation
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    retry_delay: Duration,

    /// Address serving /health and /metrics
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Ensure there is only one active controller
    #[arg(long, env = "ENABLE_LEADER_ELECTION")]
    enable_leader_election: bool,

    /// Manage cloud attachments at all; when false nodes are only marked
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    enable_aws: bool,

    /// Target groups managed by aws-alb-ingress-controller
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    enable_alb_ingress_integration: bool,

    /// Classic load balancers managed by `type: LoadBalancer` services
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    enable_dynamic_clb_integration: bool,

    /// Network load balancers managed by `type: LoadBalancer` services
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    enable_dynamic_nlb_integration: bool,

    /// Classic load balancers managed outside the cluster
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    enable_static_clb_integration: bool,

    /// Target groups of ALBs and NLBs managed outside the cluster
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    enable_static_tg_integration: bool,

    /// Detach instances from their auto-scaling groups too
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    enable_asg_integration: bool,

    /// Daemonset whose terminating pods trigger detachment, as `[NAMESPACE/]NAME`. Repeatable.
    #[arg(long = "daemonset")]
    daemonsets: Vec<String>,

    /// Label carrying the node's cloud instance id
    #[arg(long, env = "INSTANCE_ID_LABEL")]
    instance_id_label: Option<String>,

    /// Default log level, overridden by RUST_LOG
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Log registry calls instead of performing them
    #[arg(long, env = "DRY_RUN")]
    dry_run: bool,
}

#[derive(Parser, Debug)]
struct InfoArgs {
    #[arg(long)]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("node-detacher v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_detacher(*run_args).await,
    }
}

/// `--namespace`, else `WATCH_NAMESPACE`, else `POD_NAMESPACE`, else `default`
fn resolve_namespace(flag: Option<String>) -> String {
    flag.filter(|ns| !ns.is_empty())
        .or_else(|| std::env::var("WATCH_NAMESPACE").ok().filter(|ns| !ns.is_empty()))
        .or_else(|| std::env::var("POD_NAMESPACE").ok().filter(|ns| !ns.is_empty()))
        .unwrap_or_else(|| "default".to_string())
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    let api: Api<Attachment> = Api::namespaced(client, &resolve_namespace(args.namespace));
    let records = api.list(&ListParams::default()).await?;

    println!("Cached attachments: {}", records.items.len());
    for record in records.items {
        let phase = record.status.map(|s| s.phase).unwrap_or_default();
        let detached = record.spec.targets.iter().filter(|t| t.detached).count();
        println!(
            "  {} {} ({}/{} detached)",
            record.spec.node_name,
            phase,
            detached,
            record.spec.targets.len()
        );
    }
    Ok(())
}

fn controller_config(args: &RunArgs, namespace: String) -> ControllerConfig {
    let integrations = Integrations {
        alb_ingress: args.enable_alb_ingress_integration,
        dynamic_clb: args.enable_dynamic_clb_integration,
        dynamic_nlb: args.enable_dynamic_nlb_integration,
        static_clb: args.enable_static_clb_integration,
        static_tg: args.enable_static_tg_integration,
        asg: args.enable_asg_integration,
    };

    let mut keys = WellKnownKeys::default();
    if let Some(label) = &args.instance_id_label {
        keys = keys.with_instance_id_label(label);
    }

    ControllerConfig {
        name: args.name.clone(),
        namespace,
        keys,
        manage_attachments: args.enable_aws,
        target_kinds: integrations.target_kinds(),
        discovery: integrations.discovery_mode(),
        sync_period: args.sync_period,
        retry_delay: args.retry_delay,
        daemonsets: args.daemonsets.clone(),
    }
}

async fn run_detacher(args: RunArgs) -> Result<(), Error> {
    telemetry::init_tracing(args.log_level, args.log_format);

    info!("Starting node-detacher v{}", env!("CARGO_PKG_VERSION"));

    let namespace = resolve_namespace(args.namespace.clone());
    let config = controller_config(&args, namespace.clone());
    info!(
        namespace = %config.namespace,
        discovery = ?config.discovery,
        target_kinds = ?config.target_kinds,
        manage_attachments = config.manage_attachments,
        "Loaded configuration"
    );
    if config.manage_attachments && config.target_kinds.none() {
        warn!("Every integration is disabled, nodes will only be marked");
    }

    let daemonsets = args
        .daemonsets
        .iter()
        .map(|ds| DaemonSetRef::parse(ds, &namespace))
        .collect::<Result<Vec<_>, _>>()?;

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    let mut registry: Arc<dyn TargetRegistry> = Arc::new(AwsTargetRegistry::from_env().await);
    if args.dry_run {
        info!("Dry-run enabled, registry changes are only logged");
        registry = Arc::new(DryRunRegistry::new(registry));
    }
    let store = Arc::new(KubeNodeStore::new(client.clone(), namespace.clone()));

    let is_leader = Arc::new(AtomicBool::new(!args.enable_leader_election));
    if args.enable_leader_election {
        let identity = leader::holder_identity();
        info!("Leader election using holder ID: {}", identity);

        let lease_client = client.clone();
        let lease_ns = namespace.clone();
        let is_leader_bg = Arc::clone(&is_leader);
        tokio::spawn(async move {
            leader::run_leader_election(lease_client, &lease_ns, &identity, is_leader_bg).await;
        });
    }

    let state = Arc::new(ControllerState::new(
        store,
        registry,
        config,
        Arc::clone(&is_leader),
    ));

    if !daemonsets.is_empty() {
        let pod_client = client.clone();
        let pod_state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = controller::run_pod_trigger(pod_client, pod_state, daemonsets).await {
                tracing::error!("Daemonset pod trigger error: {:?}", e);
            }
        });
    }

    #[cfg(feature = "rest-api")]
    {
        let api_state = state.clone();
        let addr = args.metrics_addr;
        tokio::spawn(async move {
            if let Err(e) = node_detacher::rest_api::run_server(api_state, addr).await {
                tracing::error!("HTTP server error: {:?}", e);
            }
        });
    }

    let result = controller::run_controller(client, state).await;

    telemetry::shutdown_telemetry();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(extra: &[&str]) -> Result<RunArgs, clap::Error> {
        let argv = ["node-detacher", "run"].into_iter().chain(extra.iter().copied());
        match Args::try_parse_from(argv)?.command {
            Commands::Run(args) => Ok(*args),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_duration_flags() {
        let args = run_args(&[]).unwrap();
        assert_eq!(args.sync_period, Duration::from_secs(10));
        assert_eq!(args.retry_delay, Duration::from_secs(5));

        let args = run_args(&["--sync-period", "2m", "--retry-delay", "1m 30s"]).unwrap();
        assert_eq!(args.sync_period, Duration::from_secs(120));
        assert_eq!(args.retry_delay, Duration::from_secs(90));
    }

    #[test]
    fn test_invalid_duration_flags_are_rejected() {
        for value in ["18446744073709551h", "9999999999999999999h", "5 fortnights", "s"] {
            assert!(
                run_args(&["--sync-period", value]).is_err(),
                "{value} should be rejected"
            );
        }
    }

    #[test]
    fn test_integration_flags_map_to_config() {
        let args = run_args(&[
            "--enable-alb-ingress-integration=false",
            "--enable-dynamic-clb-integration=false",
            "--enable-dynamic-nlb-integration=false",
            "--enable-asg-integration=true",
        ])
        .unwrap();
        let config = controller_config(&args, "ops".to_string());
        assert_eq!(config.namespace, "ops");
        assert_eq!(
            config.discovery,
            node_detacher::config::DiscoveryMode::Eager
        );
        assert!(config.target_kinds.target_groups);
        assert!(config.target_kinds.scaling_groups);
    }
}
