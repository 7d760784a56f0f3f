//! kube-tunnel - CLI Entry Point

use clap::Parser;
use kube_tunnel::cluster::KubeGateway;
use kube_tunnel::common::event::log_events;
use kube_tunnel::config::{parse_labels, ConnectMethod, TransportKind};
use kube_tunnel::system::SystemHooks;
use kube_tunnel::transport::backend_for;
use kube_tunnel::{
    Config, ErrorKind, EventBus, SessionDeps, SessionLock, SessionSupervisor, VERSION,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "kube-tunnel")]
#[command(author = "Tsang")]
#[command(version = VERSION)]
#[command(about = "Reach a Kubernetes cluster network through a shadow pod")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Namespace of the shadow
    #[arg(short = 'n', long = "namespace")]
    namespace: Option<String>,

    /// Connect method: proxy, full-tunnel or mesh
    #[arg(short = 'm', long = "method")]
    method: Option<ConnectMethod>,

    /// Kubeconfig context
    #[arg(long = "context")]
    context: Option<String>,

    /// Local port of the tunnel
    #[arg(short = 'p', long = "local-port")]
    local_port: Option<u16>,

    /// Tunnel transport: direct or kubectl
    #[arg(long = "transport")]
    transport: Option<TransportKind>,

    /// Register the tunnel as the proxy of this process (proxy method)
    #[arg(long = "global-proxy")]
    global_proxy: bool,

    /// Extra range to route (repeatable)
    #[arg(long = "include")]
    include: Vec<String>,

    /// Range never routed (repeatable)
    #[arg(long = "exclude")]
    exclude: Vec<String>,

    /// Extra shadow labels, `k1=v1,k2=v2`
    #[arg(long = "labels")]
    labels: Option<String>,

    /// Keep the shadow after exit
    #[arg(long = "persist")]
    persist: bool,

    /// Log as JSON lines
    #[arg(long = "log-json")]
    log_json: bool,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("kube-tunnel-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(args.log_json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!args.log_json).then(tracing_subscriber::fmt::layer))
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("kube_tunnel=info".parse()?))
        .init();

    info!("kube-tunnel v{}", VERSION);

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            match Config::load_async(path).await {
                Ok(c) => c,
                Err(e) => {
                    error!("Failed to load configuration: {}", e);
                    std::process::exit(1);
                }
            }
        }
        None => Config::default(),
    };
    if let Err(e) = apply_overrides(&mut config, &args).and_then(|()| config.validate()) {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    if args.test {
        info!("Configuration test passed");
        return Ok(());
    }

    let gateway = match KubeGateway::connect(config.context.as_deref()).await {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to connect to cluster: {}", e);
            std::process::exit(1);
        }
    };
    let backend = backend_for(&config.transport, config.context.as_deref(), gateway.client().clone());
    let hooks = SystemHooks::native(&config);

    let session_id = format!("kt-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
    let events = EventBus::new(session_id);
    tokio::spawn(log_events(events.subscribe(), args.log_json));

    let supervisor = SessionSupervisor::new(
        config,
        SessionDeps {
            gateway: Arc::new(gateway),
            backend,
            hooks,
            lock: SessionLock::global(),
        },
        events,
    );

    let signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    };

    match supervisor.run(signal).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::Cancelled => {
            info!("Session cancelled");
            Ok(())
        }
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}

fn apply_overrides(config: &mut Config, args: &Args) -> kube_tunnel::Result<()> {
    if let Some(namespace) = &args.namespace {
        config.namespace = namespace.clone();
    }
    if let Some(method) = args.method {
        config.method = method;
    }
    if let Some(context) = &args.context {
        config.context = Some(context.clone());
    }
    if let Some(port) = args.local_port {
        config.transport.local_port = port;
    }
    if let Some(kind) = args.transport {
        config.transport.kind = kind;
    }
    if args.global_proxy {
        config.proxy.global = true;
    }
    if args.persist {
        config.shadow.persist = true;
    }
    config.cidr.include.extend(args.include.iter().cloned());
    config.cidr.exclude.extend(args.exclude.iter().cloned());
    if let Some(labels) = &args.labels {
        config.shadow.labels.extend(parse_labels(labels)?);
    }
    Ok(())
}
