use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use azure_lb_reconciler::cloud::InMemoryCloud;
use azure_lb_reconciler::controller::events::KubeEventRecorder;
use azure_lb_reconciler::controller::{
    self, ControllerState, KubeClusterLister, LoadBalancerReconciler, ReconcileContext,
};
use azure_lb_reconciler::{telemetry, CloudConfig, Error};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const FIELD_MANAGER: &str = "azure-lb-reconciler";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the load balancer controller
    Run(RunArgs),
    /// Show version information
    Version,
    /// Show the effective cloud configuration
    Info(InfoArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Cloud configuration file (YAML, or TOML by extension)
    #[arg(long, env = "CLOUD_CONFIG", default_value = "/etc/kubernetes/cloud-config.yaml")]
    config: PathBuf,

    /// Namespace holding the leader election lease
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "kube-system")]
    namespace: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Address of the health and metrics endpoints
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: std::net::SocketAddr,

    /// JSON file persisting the in-memory cloud between runs
    #[arg(long, env = "STATE_FILE")]
    state_file: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Cloud configuration file (YAML, or TOML by extension)
    #[arg(long, env = "CLOUD_CONFIG", default_value = "/etc/kubernetes/cloud-config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("azure-lb-reconciler v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args),
        Commands::Run(run_args) => {
            let result = run_operator(run_args).await;
            telemetry::shutdown_telemetry();
            result
        }
    }
}

fn run_info(args: InfoArgs) -> Result<(), Error> {
    let config = CloudConfig::from_file(&args.config)?;

    println!("Cluster: {}", config.cluster_name);
    println!("Location: {}", config.location);
    println!("Resource group: {}", config.resource_group);
    println!("Load balancer SKU: {}", config.load_balancer_sku);
    println!("Load balancer base name: {}", config.load_balancer_base_name());
    println!("Backend pool type: {}", config.backend_pool_type().as_str());
    for slb in &config.multiple_standard_load_balancer_configurations {
        println!("Multi-SLB configuration: {} (primary VM set {:?})", slb.name, slb.primary_vm_set);
    }
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    // Only export traces when a collector endpoint is configured
    let endpoint = telemetry::otlp_endpoint();
    let (otel_layer, otel_error) = match endpoint.as_deref().map(telemetry::init_telemetry) {
        Some(Ok(layer)) => (Some(layer), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };
    let otel_enabled = otel_layer.is_some();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
    }

    if let Some(e) = otel_error {
        warn!("OpenTelemetry tracing disabled: {}", e);
    } else if otel_enabled {
        info!("OpenTelemetry tracing initialized");
    } else {
        info!(
            "OpenTelemetry tracing disabled ({} not set)",
            telemetry::OTLP_ENDPOINT_ENV
        );
    }
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_format);

    info!(
        "Starting azure-lb-reconciler v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = CloudConfig::from_file(&args.config)?;
    info!(cluster = %config.cluster_name, sku = %config.load_balancer_sku, "Loaded cloud configuration");

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    let cloud = Arc::new(match &args.state_file {
        Some(path) => InMemoryCloud::load(&config.subscription_id, path)?,
        None => InMemoryCloud::new(&config.subscription_id),
    });

    let ctx = Arc::new(ReconcileContext::new(
        Arc::new(config),
        cloud.clients(),
        Arc::new(KubeClusterLister::new(client.clone())),
        Arc::new(KubeEventRecorder::new(client.clone())),
    ));
    let (reconciler, route_worker) = LoadBalancerReconciler::new(ctx);

    // Leader election configuration
    let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    });

    info!("Leader election using holder ID: {}", holder_identity);

    let is_leader = Arc::new(AtomicBool::new(false));

    {
        let lease_client = client.clone();
        let lease_ns = args.namespace.clone();
        let identity = holder_identity.clone();
        let is_leader_bg = Arc::clone(&is_leader);

        tokio::spawn(async move {
            run_leader_election(lease_client, &lease_ns, &identity, is_leader_bg).await;
        });
    }

    let state = Arc::new(ControllerState {
        client: client.clone(),
        reconciler: Arc::new(reconciler),
        is_leader: Arc::clone(&is_leader),
        field_manager: FIELD_MANAGER.to_string(),
    });

    #[cfg(feature = "rest-api")]
    {
        let api_state = state.clone();
        let addr = args.metrics_addr;
        tokio::spawn(async move {
            if let Err(e) = azure_lb_reconciler::rest_api::run_server(api_state, addr).await {
                tracing::error!("REST API server error: {:?}", e);
            }
        });
    }

    // Run the main controller loop
    let result = controller::run_controller(state).await;

    if let Err(e) = route_worker.await {
        warn!("Route updater ended abnormally: {:?}", e);
    }
    if let Some(path) = &args.state_file {
        cloud.save(path)?;
        info!(path = %path.display(), "Saved cloud state");
    }

    result
}

const LEASE_NAME: &str = "azure-lb-reconciler-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);
const RETRY_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

async fn run_leader_election(
    client: kube::Client,
    namespace: &str,
    identity: &str,
    is_leader: Arc<AtomicBool>,
) {
    let leases: Api<Lease> = Api::namespaced(client, namespace);

    loop {
        match try_acquire_or_renew(&leases, namespace, identity).await {
            Ok(true) => {
                if !is_leader.load(Ordering::Relaxed) {
                    info!("Acquired leadership for lease {}", LEASE_NAME);
                }
                is_leader.store(true, Ordering::Relaxed);
                tokio::time::sleep(RENEW_INTERVAL).await;
            }
            Ok(false) => {
                if is_leader.load(Ordering::Relaxed) {
                    warn!("Lost leadership for lease {}", LEASE_NAME);
                }
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => {
                warn!("Leader election error: {:?}", e);
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    match leases.get_opt(LEASE_NAME).await? {
        Some(existing) => {
            let spec = existing.spec.as_ref();
            let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

            if current_holder == Some(identity) {
                let patch = serde_json::json!({
                    "spec": {
                        "renewTime": MicroTime(now),
                        "leaseDurationSeconds": LEASE_DURATION_SECS,
                    }
                });
                leases
                    .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                return Ok(true);
            }

            let expired = spec
                .and_then(|s| s.renew_time.as_ref())
                .map(|renew| {
                    let duration = spec
                        .and_then(|s| s.lease_duration_seconds)
                        .unwrap_or(LEASE_DURATION_SECS);
                    let expiry = renew.0 + chrono::Duration::seconds(duration as i64);
                    now > expiry
                })
                .unwrap_or(true);

            if !expired {
                return Ok(false);
            }
            info!(
                "Lease held by {:?} has expired, taking over",
                current_holder
            );
            let patch = serde_json::json!({
                "spec": {
                    "holderIdentity": identity,
                    "acquireTime": MicroTime(now),
                    "renewTime": MicroTime(now),
                    "leaseDurationSeconds": LEASE_DURATION_SECS,
                }
            });
            leases
                .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(true)
        }
        None => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec: Some(k8s_openapi::api::coordination::v1::LeaseSpec {
                    holder_identity: Some(identity.to_string()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_duration_seconds: Some(LEASE_DURATION_SECS),
                    ..Default::default()
                }),
            };
            leases.create(&PostParams::default(), &lease).await?;
            info!("Created lease {} with holder {}", LEASE_NAME, identity);
            Ok(true)
        }
    }
}
