//! Layered configuration (§4.11), edge-side: hardcoded defaults, an
//! optional `--config` file, then `TETHER_*` environment overrides.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// `host:port` to bind the gRPC server to.
    pub bind: String,
    /// This edge's uuid, checked against the handshake's `Credential`.
    pub uuid: String,
    /// TLS server credentials presented to connecting devices.
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    /// Authenticator CA the edge decrypts `ExchangeKey` payloads with,
    /// when a device seals against a CA rather than the edge's own cert.
    pub ca_cert_path: Option<PathBuf>,
    pub storage_path: PathBuf,
    pub async_credential_engine: bool,
    pub log_level: String,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:50100".to_string(),
            uuid: "00000000-0000-0000-0000-000000000000".to_string(),
            cert_path: None,
            key_path: None,
            ca_cert_path: None,
            storage_path: PathBuf::from("./models"),
            async_credential_engine: false,
            log_level: "info".to_string(),
        }
    }
}

pub fn load(config_path: Option<&std::path::Path>) -> anyhow::Result<EdgeConfig> {
    let defaults = EdgeConfig::default();
    let mut builder = config::Config::builder()
        .set_default("bind", defaults.bind.clone())?
        .set_default("uuid", defaults.uuid.clone())?
        .set_default("storage_path", defaults.storage_path.to_string_lossy().to_string())?
        .set_default("async_credential_engine", defaults.async_credential_engine)?
        .set_default("log_level", defaults.log_level.clone())?;

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path).required(true));
    }
    builder = builder.add_source(config::Environment::with_prefix("TETHER"));

    let settings = builder.build()?;
    let config = settings.try_deserialize()?;
    Ok(config)
}
