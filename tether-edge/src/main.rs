//! Edge (server) binary.
//!
//! Mounts `tether_session::edge::EdgeService` on a multi-threaded tonic
//! server, sized from `num_cpus::get()` (overridable via `WORKER_THREADS`)
//! as the teacher's server binary sizes its own runtime.

mod config;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tether_credential::CredentialEngine;
use tether_proto::rpc::rpc_server::RpcServer;
use tether_session::edge::{EdgeInfo, EdgeService, ModelStore, PipelineFactory};
use tether_session::pipeline::{NullPipelineEngine, PipelineEngine};
use tonic::transport::{Identity, Server, ServerTlsConfig};

/// Command line arguments for the Edge binary (§4.12).
#[derive(Parser, Debug)]
#[command(name = "tether-edge")]
#[command(about = "Secured Peer Session server offloading inference for connected Devices")]
struct Args {
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind the gRPC server to, e.g. `0.0.0.0:50100`.
    #[arg(long)]
    bind: Option<String>,

    #[arg(long)]
    uuid: Option<String>,

    /// TLS certificate chain presented to connecting devices.
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Private key matching `--cert`.
    #[arg(long)]
    key: Option<PathBuf>,

    /// Authenticator CA certificate (and its private key, same path
    /// basename with a `.key` suffix) used to decrypt `ExchangeKey`
    /// payloads sealed by devices against a shared CA.
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Directory uploaded model files are persisted under.
    #[arg(long)]
    storage_path: Option<PathBuf>,

    #[arg(long)]
    async_credential_engine: bool,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

struct NullFactory;

impl PipelineFactory for NullFactory {
    fn build_engine(&self) -> Box<dyn PipelineEngine> {
        Box::new(NullPipelineEngine::default())
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut cfg = config::load(args.config.as_deref()).context("failed to load edge configuration")?;

    if let Some(bind) = args.bind {
        cfg.bind = bind;
    }
    if let Some(uuid) = args.uuid {
        cfg.uuid = uuid;
    }
    if let Some(cert) = &args.cert {
        cfg.cert_path = Some(cert.clone());
    }
    if let Some(key) = &args.key {
        cfg.key_path = Some(key.clone());
    }
    if let Some(ca_cert) = &args.ca_cert {
        cfg.ca_cert_path = Some(ca_cert.clone());
    }
    if let Some(storage_path) = args.storage_path {
        cfg.storage_path = storage_path;
    }
    cfg.async_credential_engine |= args.async_credential_engine;

    let filter = match args.verbose {
        0 => cfg.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&filter)).init();

    let worker_threads = std::env::var("WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(num_cpus::get);

    log::info!("starting tether-edge on {} with {worker_threads} worker threads", cfg.bind);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .thread_name("tether-edge-worker")
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(run(cfg))
}

async fn run(cfg: config::EdgeConfig) -> anyhow::Result<()> {
    let addr = cfg.bind.parse().with_context(|| format!("invalid bind address {}", cfg.bind))?;

    let authenticator = match (&cfg.cert_path, &cfg.key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert_pem = std::fs::read_to_string(cert_path)
                .with_context(|| format!("failed to read certificate at {}", cert_path.display()))?;
            let key_pem = std::fs::read_to_string(key_path)
                .with_context(|| format!("failed to read private key at {}", key_path.display()))?;
            let mut engine = CredentialEngine::new();
            engine.key_material_mut().set_private_key(&key_pem)?;
            engine.key_material_mut().set_certificate(&cert_pem)?;
            Some(engine)
        }
        _ => {
            log::warn!("no --cert/--key configured; ExchangeKey will accept the insecure literal payload only");
            None
        }
    };

    let tls_identity = match (&cfg.cert_path, &cfg.key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert_pem = std::fs::read_to_string(cert_path)?;
            let key_pem = std::fs::read_to_string(key_path)?;
            Some(Identity::from_pem(cert_pem, key_pem))
        }
        _ => None,
    };

    let storage_path = cfg.storage_path.clone();
    std::fs::create_dir_all(&storage_path)
        .with_context(|| format!("failed to create storage path {}", storage_path.display()))?;

    let service = EdgeService::new(
        cfg.uuid.clone(),
        authenticator,
        ModelStore::new(storage_path),
        EdgeInfo::default(),
        NullFactory,
        addr.ip().to_string(),
    );

    let mut server = Server::builder();
    if let Some(identity) = tls_identity {
        server = server
            .tls_config(ServerTlsConfig::new().identity(identity))
            .context("invalid TLS identity")?;
    } else {
        log::warn!("no TLS identity configured; the server will listen in plaintext");
    }

    server
        .add_service(RpcServer::new(service))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("received shutdown signal");
        })
        .await
        .context("gRPC server error")?;

    log::info!("tether-edge shutdown complete");
    Ok(())
}
