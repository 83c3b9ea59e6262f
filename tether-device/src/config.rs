//! Layered configuration (§4.11): hardcoded defaults, an optional
//! `--config` file, then `TETHER_*` environment overrides. CLI flags are
//! applied last, directly against the deserialized struct, in `main`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Device-side configuration, mirroring the layering the teacher's
/// `ClientConfig` describes but scoped to the fields `tether-device`
/// actually drives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// `host:port` of the edge's gRPC endpoint.
    pub server: String,
    /// This device's uuid, presented during the handshake.
    pub uuid: String,
    /// Root CA certificate the device verifies the edge's TLS identity
    /// against. A separate authenticator certificate, if configured,
    /// seals the handshake's `Credential` instead.
    pub ca_cert_path: Option<PathBuf>,
    pub input_type: String,
    pub framework: String,
    pub accel: bool,
    /// Toggle the Credential Engine's async (worker-thread) facade.
    pub async_credential_engine: bool,
    pub log_level: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:50100".to_string(),
            uuid: "00000000-0000-0000-0000-000000000000".to_string(),
            ca_cert_path: None,
            input_type: "Opaque".to_string(),
            framework: "tensorflow-lite".to_string(),
            accel: false,
            async_credential_engine: false,
            log_level: "info".to_string(),
        }
    }
}

/// Load the layered configuration: defaults, then `config_path` if
/// present, then `TETHER_*` environment variables. Invalid files surface
/// as `anyhow::Error` rather than a panic, per §7's `ConfigError` intent.
pub fn load(config_path: Option<&Path>) -> anyhow::Result<DeviceConfig> {
    let defaults = DeviceConfig::default();
    let mut builder = config::Config::builder()
        .set_default("server", defaults.server.clone())?
        .set_default("uuid", defaults.uuid.clone())?
        .set_default("input_type", defaults.input_type.clone())?
        .set_default("framework", defaults.framework.clone())?
        .set_default("accel", defaults.accel)?
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
