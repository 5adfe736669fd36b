//! CStor Pool Operator
//!
//! Watches CStorPoolCluster resources in the operator namespace and
//! reconciles them into per-node cStor pools.

use clap::Parser;
use kube::{Client, CustomResourceExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cstor_pool_operator::config::{DEFAULT_POOL_IMAGE, DEFAULT_POOL_MGMT_IMAGE};
use cstor_pool_operator::controller::{self, Context};
use cstor_pool_operator::{
    CStorPool, CStorPoolCluster, Error, KubeCluster, KubeEventPublisher, Metrics, OperatorConfig,
    PoolReconciler, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// CStor Pool Operator - reconciles CStorPoolClusters into cStor pools
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace the operator runs in and writes to
    #[arg(long, env = "OPENEBS_NAMESPACE")]
    namespace: Option<String>,

    /// Name of this operator pod, used as the lease holder identity
    #[arg(long, env = "OPENEBS_MAYA_POD_NAME", default_value = "cstor-pool-operator")]
    pod_name: String,

    /// Concurrent reconciles across clusters
    #[arg(long, env = "WORKERS", default_value = "2")]
    workers: u16,

    /// Periodic resync interval in seconds
    #[arg(long, env = "RESYNC_SECS", default_value = "30")]
    resync_secs: u64,

    /// Deadline for each API call in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "30")]
    request_timeout_secs: u64,

    /// Longest a reconcile pass waits on one event publish, in seconds
    #[arg(long, env = "EVENT_TIMEOUT_SECS", default_value = "5")]
    event_timeout_secs: u64,

    /// Requeue delay while another replica holds a cluster lease
    #[arg(long, env = "LEASE_BUSY_REQUEUE_SECS", default_value = "10")]
    lease_busy_requeue_secs: u64,

    /// First retry delay after a failed pass, in seconds
    #[arg(long, env = "BACKOFF_BASE_SECS", default_value = "5")]
    backoff_base_secs: u64,

    /// Retry delay ceiling, in seconds
    #[arg(long, env = "BACKOFF_MAX_SECS", default_value = "300")]
    backoff_max_secs: u64,

    /// Image of the cstor-pool container
    #[arg(long, env = "CSTOR_POOL_IMAGE", default_value = DEFAULT_POOL_IMAGE)]
    pool_image: String,

    /// Image of the cstor-pool-mgmt container
    #[arg(long, env = "CSTOR_POOL_MGMT_IMAGE", default_value = DEFAULT_POOL_MGMT_IMAGE)]
    pool_mgmt_image: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print the CRD manifests and exit
    #[arg(long)]
    print_crds: bool,
}

impl Args {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            namespace: self.namespace.clone(),
            pod_name: self.pod_name.clone(),
            workers: self.workers.max(1),
            resync: Duration::from_secs(self.resync_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            event_timeout: Duration::from_secs(self.event_timeout_secs),
            lease_busy_requeue: Duration::from_secs(self.lease_busy_requeue_secs),
            backoff_base: Duration::from_secs(self.backoff_base_secs),
            backoff_max: Duration::from_secs(self.backoff_max_secs),
            pool_image: self.pool_image.clone(),
            pool_mgmt_image: self.pool_mgmt_image.clone(),
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_crds {
        for crd in [CStorPoolCluster::crd(), CStorPool::crd()] {
            println!("---");
            print!("{}", serde_yaml::to_string(&crd)?);
        }
        return Ok(());
    }

    init_logging(&args)?;

    let config = args.operator_config();
    info!("Starting CStor Pool Operator");
    info!("  Version: {}", cstor_pool_operator::VERSION);
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("<unset>"));
    info!("  Pod: {}", config.pod_name);
    info!("  Workers: {}", config.workers);

    let metrics = Metrics::new()?;

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let served = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, served).await {
            error!("Metrics server error: {}", e);
        }
    });

    let client = Client::try_default().await?;
    let api = Arc::new(KubeCluster::new(client.clone(), config.request_timeout));
    let events = Arc::new(KubeEventPublisher::new(
        client.clone(),
        cstor_pool_operator::NAME,
        Some(config.pod_name.clone()),
        config.request_timeout,
    ));

    let reconciler = PoolReconciler::new(api, events, config, metrics);
    controller::run(client, Arc::new(Context::new(reconciler))).await;

    info!("Operator shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("kube=info".parse()?)
        .add_directive("tower=warn".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => text_response(StatusCode::OK, "ok"),
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: Metrics) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            let encoder = TextEncoder::new();
                            let mut buffer = Vec::new();
                            match encoder.encode(&metrics.registry().gather(), &mut buffer) {
                                Ok(()) => {
                                    let mut response = Response::new(Body::from(buffer));
                                    response.headers_mut().insert(
                                        CONTENT_TYPE,
                                        HeaderValue::from_static(prometheus::TEXT_FORMAT),
                                    );
                                    response
                                }
                                Err(e) => {
                                    error!("Failed to encode metrics: {}", e);
                                    text_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
                                }
                            }
                        }
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
