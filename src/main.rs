//! swarmgate - Main entry point
//!
//! A self-coordinating HTTPS gateway for Docker Swarm clusters

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use swarmgate::{
    certificate, docker, election, AcmeConfig, AcmeManager, AuthGate, CertificateCache,
    HttpServer, HttpsServer, LeaderElection, ServiceReconciler, ServiceSource, Store, StoreRead,
    StoreWrite, SwarmClient, VhostRegistry,
};
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// swarmgate - Self-coordinating HTTPS gateway for Docker Swarm
#[derive(Parser, Debug)]
#[command(name = "swarmgate")]
#[command(version = "1.0.0")]
#[command(about = "Leader-elected HTTPS gateway with automatic certificates")]
struct Args {
    /// Node name used in the leader election
    #[arg(long, env = "NODE_ID", default_value_t = default_node_id())]
    node_id: String,

    /// HTTP port to listen on
    #[arg(long, env = "HTTP_PORT", default_value = "80")]
    http_port: u16,

    /// HTTPS port to listen on
    #[arg(long, env = "HTTPS_PORT", default_value = "443")]
    https_port: u16,

    /// etcd endpoints, comma separated
    #[arg(
        long,
        env = "ETCD_ENDPOINTS",
        value_delimiter = ',',
        default_value = "http://localhost:2379"
    )]
    etcd_endpoints: Vec<String>,

    /// Private key shared by every node, used for all issued certificates
    #[arg(long, env = "DEFAULT_KEY_PATH", default_value = "./certs/default.key")]
    default_key: PathBuf,

    /// Certificate matching the default key, used to validate the pair
    #[arg(long, env = "DEFAULT_CERT_PATH", default_value = "./certs/default.pem")]
    default_cert: PathBuf,

    /// Where ACME account credentials are persisted
    #[arg(
        long,
        env = "ACME_CREDENTIALS_PATH",
        default_value = "./certs/acme-account.json"
    )]
    acme_credentials: PathBuf,

    /// Contact email for the ACME account
    #[arg(long, env = "ACME_EMAIL")]
    email: String,

    /// Use the staging CA instead of production
    #[arg(long, env = "ACME_STAGING", default_value = "false")]
    staging: bool,

    /// Explicit ACME directory URL (private CA), overriding the staging flag
    #[arg(long, env = "ACME_DIRECTORY_URL")]
    acme_directory: Option<String>,

    /// Store namespace for challenge records
    #[arg(long, env = "CHALLENGE_ROOT", default_value = "/swarmgate/challenges")]
    challenge_root: String,

    /// Store namespace for issued certificates
    #[arg(long, env = "CERT_ROOT", default_value = "/swarmgate/certs")]
    cert_root: String,

    /// Store namespace for virtual hosts
    #[arg(long, env = "VHOST_ROOT", default_value = "/swarmgate/virtual-hosts")]
    vhost_root: String,

    /// Store key for the leader election
    #[arg(long, env = "ELECTION_ROOT", default_value = "/swarmgate/leader")]
    election_root: String,

    /// Realm announced in Basic Auth challenges
    #[arg(long, env = "AUTH_REALM", default_value = "swarmgate")]
    realm: String,

    /// Hours between renewal sweeps
    #[arg(long, env = "RENEW_INTERVAL_HOURS", default_value = "6")]
    renew_interval_hours: u64,

    /// Seconds between full service listings
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value = "60")]
    poll_interval_secs: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn default_node_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "swarmgate".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting swarmgate v1.0.0 as node {}", args.node_id);

    // Key material every node must hold; refusing to start beats serving
    // certificates that cannot pair with our key
    let default_key_pem = std::fs::read_to_string(&args.default_key)
        .with_context(|| format!("read default key {}", args.default_key.display()))?;
    let default_cert_pem = std::fs::read_to_string(&args.default_cert)
        .with_context(|| format!("read default certificate {}", args.default_cert.display()))?;
    certificate::build_server_config(&default_cert_pem, &default_key_pem)
        .context("default certificate and key do not form a working TLS identity")?;
    info!("Default TLS identity loaded from {}", args.default_key.display());

    let store = Store::connect(&args.etcd_endpoints, Duration::from_secs(5))
        .await
        .context("connect to etcd")?;
    info!("Connected to etcd at {}", args.etcd_endpoints.join(","));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (election, role_rx) = LeaderElection::new(store.clone(), &args.election_root, &args.node_id);

    // Caches are primed from the store before anything is served
    let store_read: Arc<dyn StoreRead> = Arc::new(store.clone());
    let store_write: Arc<dyn StoreWrite> = Arc::new(store.clone());
    let certs = Arc::new(CertificateCache::new(
        store_read.clone(),
        &args.cert_root,
        &default_key_pem,
    ));
    let vhosts = Arc::new(VhostRegistry::new(store_read.clone(), &args.vhost_root));
    certs.prime().await.context("load certificates from the store")?;
    vhosts.prime().await.context("load virtual hosts from the store")?;

    let acme = Arc::new(AcmeManager::new(
        store_write.clone(),
        role_rx.clone(),
        AcmeConfig {
            challenge_root: args.challenge_root.clone(),
            cert_root: args.cert_root.clone(),
            vhost_root: args.vhost_root.clone(),
            contact_email: args.email.clone(),
            staging: args.staging,
            directory_url: args.acme_directory.clone(),
            credentials_path: args.acme_credentials.clone(),
            default_key_pem: default_key_pem.clone(),
        },
    ));

    let swarm = Arc::new(SwarmClient::connect()?);
    let source: Arc<dyn ServiceSource> = swarm.clone();
    let reconciler = Arc::new(ServiceReconciler::new(
        source,
        store_write.clone(),
        acme.clone(),
        role_rx.clone(),
        &args.vhost_root,
        &args.cert_root,
    ));
    reconciler.prime(&vhosts);

    let auth = Arc::new(AuthGate::new(&args.realm));

    // Background tasks: election, watchers, discovery, renewal
    let election_task = tokio::spawn(election.run(shutdown_rx.clone()));
    tokio::spawn(election::run_observer(
        store.clone(),
        args.election_root.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(vhosts.clone().run_watcher(store.clone(), shutdown_rx.clone()));
    tokio::spawn(certs.clone().run_watcher(store.clone(), shutdown_rx.clone()));
    tokio::spawn(acme.clone().run_challenge_watcher(store.clone(), shutdown_rx.clone()));
    tokio::spawn(acme.clone().run_on_election(shutdown_rx.clone()));
    tokio::spawn(acme.clone().run_renewal_sweep(
        Duration::from_secs(args.renew_interval_hours * 3600),
        shutdown_rx.clone(),
    ));
    tokio::spawn(docker::run_event_listener(
        swarm.docker(),
        reconciler.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(
        reconciler
            .clone()
            .run_poll(Duration::from_secs(args.poll_interval_secs), shutdown_rx.clone()),
    );

    // Front doors
    let http_addr: SocketAddr = format!("0.0.0.0:{}", args.http_port).parse()?;
    let https_addr: SocketAddr = format!("0.0.0.0:{}", args.https_port).parse()?;

    let http_server = Arc::new(HttpServer::new(store_read.clone(), &args.challenge_root));
    let https_server = Arc::new(HttpsServer::new(certs.clone(), vhosts.clone(), auth));

    let mut http_task = tokio::spawn(http_server.run(http_addr, shutdown_rx.clone()));
    let mut https_task = tokio::spawn(https_server.run(https_addr, shutdown_rx.clone()));

    info!("swarmgate node {} ready", args.node_id);

    tokio::select! {
        result = &mut http_task => {
            return match result {
                Ok(server) => server.context("HTTP server failed"),
                Err(e) => Err(anyhow!("HTTP server task failed: {}", e)),
            };
        }
        result = &mut https_task => {
            return match result {
                Ok(server) => server.context("HTTPS server failed"),
                Err(e) => Err(anyhow!("HTTPS server task failed: {}", e)),
            };
        }
        _ = shutdown_signal() => {}
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    // listeners drain and the election resigns before we exit
    let drain = async {
        let _ = http_task.await;
        let _ = https_task.await;
        let _ = election_task.await;
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        warn!("Timed out waiting for tasks to stop");
    }

    info!("swarmgate stopped");
    Ok(())
}

/// Resolve on SIGTERM or Ctrl-C
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("Could not install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
