//! Device (client) binary.
//!
//! Wires a `CredentialEngine` and a `PeerSession` together and drives the
//! full Device lifecycle: configure, activate, load a model, read tensor
//! info, prepare the pipeline legs, invoke, and stop.

mod config;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tether_credential::CredentialEngine;
use tether_session::pipeline::NullPipelineEngine;
use tether_session::session::{InputConfig, PeerSession, PipelineConfig};

/// Command line arguments for the Device binary (§4.12).
#[derive(Parser, Debug)]
#[command(name = "tether-device")]
#[command(about = "Secured Peer Session client offloading inference to an Edge")]
struct Args {
    /// Layered configuration file (TOML or JSON).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Edge gRPC endpoint, e.g. `edge.local:50100`.
    #[arg(long)]
    server: Option<String>,

    /// This device's uuid, presented during the handshake.
    #[arg(long)]
    uuid: Option<String>,

    /// Root CA certificate PEM the device verifies the edge's TLS
    /// identity against (also used to seal the handshake `Credential`
    /// when no separate authenticator certificate is configured).
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Path to a model file on the device, uploaded to the edge if it
    /// does not already have one at that path.
    #[arg(long)]
    model: Option<PathBuf>,

    /// Toggle the Credential Engine's async worker-thread facade.
    #[arg(long)]
    async_credential_engine: bool,

    /// Increase log verbosity (`-v` = debug, `-vv` = trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut cfg = config::load(args.config.as_deref()).context("failed to load device configuration")?;

    if let Some(server) = args.server {
        cfg.server = server;
    }
    if let Some(uuid) = args.uuid {
        cfg.uuid = uuid;
    }
    if let Some(ca_cert) = &args.ca_cert {
        cfg.ca_cert_path = Some(ca_cert.clone());
    }
    cfg.async_credential_engine |= args.async_credential_engine;

    let filter = match args.verbose {
        0 => cfg.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&filter)).init();

    log::info!("starting tether-device, uuid={}, server={}", cfg.uuid, cfg.server);
    if cfg.async_credential_engine {
        log::info!("async credential engine mode requested; background crypto operations will run on a dedicated worker thread when used directly");
    }

    let root_ca_pem = match &cfg.ca_cert_path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read CA certificate at {}", path.display()))?,
        None => anyhow::bail!("a --ca-cert root CA certificate is required to activate a session"),
    };

    let credential_engine = CredentialEngine::new();
    let mut session = PeerSession::new(cfg.uuid.clone(), credential_engine);

    let input_config = match cfg.input_type.as_str() {
        "Image" => InputConfig::Image,
        "Video" => InputConfig::Video,
        _ => InputConfig::Opaque,
    };
    session.configure_input(input_config)?;
    session.configure_pipeline(PipelineConfig {
        framework: cfg.framework.clone(),
        accel: cfg.accel,
        ..Default::default()
    })?;
    // The same CA certificate that anchors the TLS connection also seals
    // the handshake's Credential (§4.7 step 4); without this the device
    // always falls back to the "insecure" literal payload.
    session.configure_ca_authenticator(root_ca_pem.clone())?;

    let endpoint = format!("https://{}", cfg.server);
    session.activate(&endpoint, &root_ca_pem).await.context("activate failed")?;
    log::info!("session activated");

    if let Some(model_path) = &args.model {
        let bytes = tokio::fs::read(model_path)
            .await
            .with_context(|| format!("failed to read model file at {}", model_path.display()))?;
        let remote_path = model_path.to_string_lossy().to_string();
        session.load_model(&remote_path, Some(&bytes)).await.context("load_model failed")?;
        log::info!("model loaded: {remote_path}");
    }

    let input_info = session.get_input_tensor_info().await.context("get_input_tensor_info failed")?;
    let output_info = session.get_output_tensor_info().await.context("get_output_tensor_info failed")?;
    log::info!("input tensors: {}, output tensors: {}", input_info.len(), output_info.len());

    session
        .prepare(
            cfg.server.split(':').next().unwrap_or("127.0.0.1"),
            Box::new(NullPipelineEngine::default()),
            Box::new(NullPipelineEngine::default()),
        )
        .await
        .context("prepare failed")?;
    log::info!("pipelines prepared");

    session.stop().await.context("stop failed")?;
    session.destroy();
    log::info!("session stopped and destroyed");

    Ok(())
}
