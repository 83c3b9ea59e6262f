//! Peer Session (§4.9) — the Device-side state machine that drives a
//! `tether-proto` RPC channel through configure → key-exchange →
//! prepare → invoke/stream → stop → destroy.

use crate::auth::{self, ClientNonce};
use crate::error::{Error, Result};
use crate::handshake;
use crate::pipeline::{
    MediaKind, PipelineBridge, PipelineBridgeBuilder, PipelineEngine, PipelineOutput, Transport,
};
use crate::tensor::{self, TensorInfo};
use std::time::Duration;
use tether_credential::CredentialEngine;
use tether_proto::rpc::rpc_client::RpcClient;
use tether_proto::rpc::{
    ConfigureRequest, Empty, ExchangeKeyRequest, GetInfoResponse, LoadModelRequest, RuntimeInfo,
    UploadModelChunk,
};
use tether_proto::UPLOAD_CHUNK_SIZE;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::Request;

/// States of the Device↔Edge Peer Session (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Configured,
    Activated,
    Prepared,
    Streaming,
    Stopped,
    Destroyed,
}

/// How the request leg is configured — determines plain-TCP vs.
/// media+SRTP pipeline construction (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputConfig {
    #[default]
    Opaque,
    Image,
    Video,
}

impl From<InputConfig> for MediaKind {
    fn from(value: InputConfig) -> Self {
        match value {
            InputConfig::Opaque => MediaKind::Opaque,
            InputConfig::Image => MediaKind::Image,
            InputConfig::Video => MediaKind::Video,
        }
    }
}

/// Server-side pipeline parameters passed through `Configure` (§6).
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub preprocessing: String,
    pub postprocessing: String,
    pub framework: String,
    pub accel: bool,
}

/// A completed `invoke` result, paired with the caller's opaque context
/// by the pipeline bridge's FIFO (§4.9).
#[derive(Debug, Clone)]
pub struct InvokeOutput {
    pub tensor: Vec<u8>,
    pub user_context: u64,
}

impl From<PipelineOutput> for InvokeOutput {
    fn from(value: PipelineOutput) -> Self {
        Self { tensor: value.tensor, user_context: value.user_context }
    }
}

/// Device-side Peer Session: the state machine described in §4.9.
pub struct PeerSession {
    state: SessionState,
    uuid: String,
    credential_engine: CredentialEngine,
    ca_authenticator_cert_pem: Option<String>,
    input_config: InputConfig,
    pipeline_config: PipelineConfig,
    rpc: Option<RpcClient<Channel>>,
    peer_id: Option<String>,
    client_nonce: Option<ClientNonce>,
    input_tensor_info: Option<Vec<TensorInfo>>,
    output_tensor_info: Option<Vec<TensorInfo>>,
    request_bridge: Option<PipelineBridge>,
    response_bridge: Option<PipelineBridge>,
    next_user_context: u64,
}

impl PeerSession {
    /// A fresh session in `Idle`, identified by the uuid this engine's
    /// certificate/authenticator will present during `ExchangeKey`.
    pub fn new(uuid: impl Into<String>, credential_engine: CredentialEngine) -> Self {
        Self {
            state: SessionState::Idle,
            uuid: uuid.into(),
            credential_engine,
            ca_authenticator_cert_pem: None,
            input_config: InputConfig::default(),
            pipeline_config: PipelineConfig::default(),
            rpc: None,
            peer_id: None,
            client_nonce: None,
            input_tensor_info: None,
            output_tensor_info: None,
            request_bridge: None,
            response_bridge: None,
            next_user_context: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn require_state(&self, allowed: &[SessionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::SequenceError(format!(
                "operation not permitted in state {:?} (expected one of {:?})",
                self.state, allowed
            )))
        }
    }

    /// `configure(input_config|pipeline_config|...)` — accepted in
    /// `Idle` or `Activated` (§4.9).
    pub fn configure_input(&mut self, input: InputConfig) -> Result<()> {
        self.require_state(&[SessionState::Idle, SessionState::Configured, SessionState::Activated])?;
        self.input_config = input;
        if self.state == SessionState::Idle {
            self.state = SessionState::Configured;
        }
        Ok(())
    }

    pub fn configure_pipeline(&mut self, pipeline: PipelineConfig) -> Result<()> {
        self.require_state(&[SessionState::Idle, SessionState::Configured, SessionState::Activated])?;
        self.pipeline_config = pipeline;
        if self.state == SessionState::Idle {
            self.state = SessionState::Configured;
        }
        Ok(())
    }

    /// Configure the root CA certificate this session seals its session
    /// key against during `ExchangeKey` (§4.7 step 4).
    pub fn configure_ca_authenticator(&mut self, ca_certificate_pem: impl Into<String>) -> Result<()> {
        self.require_state(&[SessionState::Idle, SessionState::Configured, SessionState::Activated])?;
        self.ca_authenticator_cert_pem = Some(ca_certificate_pem.into());
        if self.state == SessionState::Idle {
            self.state = SessionState::Configured;
        }
        Ok(())
    }

    /// `activate` — opens a TLS channel to `endpoint`, performs the
    /// `Configure` and `ExchangeKey` RPCs. TLS handshake failure returns
    /// `AuthFault` (§4.9 failure semantics).
    pub async fn activate(&mut self, endpoint: &str, root_ca_pem: &str) -> Result<()> {
        self.require_state(&[SessionState::Idle, SessionState::Configured])?;

        let tls = ClientTlsConfig::new().ca_certificate(tonic::transport::Certificate::from_pem(root_ca_pem));
        let channel = Endpoint::from_shared(endpoint.to_string())
            .map_err(|e| Error::InvalidArgument(format!("invalid endpoint {endpoint}: {e}")))?
            .tls_config(tls)
            .map_err(|e| Error::AuthFault(format!("invalid TLS configuration: {e}")))?
            .connect()
            .await
            .map_err(|e| Error::AuthFault(format!("TLS handshake with {endpoint} failed: {e}")))?;

        let mut rpc = RpcClient::new(channel);

        rpc.configure(ConfigureRequest {
            input_type: format!("{:?}", self.input_config),
            preprocessing: self.pipeline_config.preprocessing.clone(),
            postprocessing: self.pipeline_config.postprocessing.clone(),
            framework: self.pipeline_config.framework.clone(),
            accel: self.pipeline_config.accel,
        })
        .await?;

        let (nonce, sealed) = handshake::client_seal(
            &mut self.credential_engine,
            &self.uuid,
            self.ca_authenticator_cert_pem.as_deref(),
        )?;

        let response = rpc
            .exchange_key(ExchangeKeyRequest { key: sealed })
            .await?
            .into_inner();

        if response.status != 0 {
            self.state = SessionState::Stopped;
            log::warn!("ExchangeKey rejected with status {} for {endpoint}", response.status);
            return Err(Error::AuthFault(format!(
                "ExchangeKey rejected with status {}",
                response.status
            )));
        }

        self.peer_id = Some(response.id);
        self.client_nonce = Some(ClientNonce::starting_at(nonce));
        self.rpc = Some(rpc);
        self.state = SessionState::Activated;
        log::info!("session activated against {endpoint}, assigned peer id {}", response.id);
        Ok(())
    }

    fn rpc_mut(&mut self) -> Result<&mut RpcClient<Channel>> {
        self.rpc
            .as_mut()
            .ok_or_else(|| Error::SequenceError("session has not been activated".to_string()))
    }

    fn authenticate<T>(&mut self, method_name: &str, message: T) -> Result<Request<T>> {
        let peer_id = self
            .peer_id
            .clone()
            .ok_or_else(|| Error::SequenceError("session has no assigned peer id".to_string()))?;
        let nonce_cursor = self
            .client_nonce
            .as_mut()
            .ok_or_else(|| Error::SequenceError("session has no nonce cursor".to_string()))?;
        let nonce = nonce_cursor.next_value()?;
        let request = auth::attach(Request::new(message), method_name, &peer_id, nonce);
        nonce_cursor.advance()?;
        Ok(request)
    }

    /// `load_model(path)` — falls back to streaming `UploadModel` in
    /// 4 KiB chunks when the server reports `NotFound` (§4.9).
    pub async fn load_model(&mut self, path: &str, file_bytes: Option<&[u8]>) -> Result<()> {
        self.require_state(&[SessionState::Activated, SessionState::Prepared])?;

        let request = self.authenticate("LoadModel", LoadModelRequest { filename: path.to_string() })?;
        let response = self.rpc_mut()?.load_model(request).await;

        let needs_upload = match response {
            Ok(resp) => {
                let status = resp.into_inner().status;
                match status {
                    0 => false,
                    s if s == -libc_enoent() => true,
                    s => return Err(Error::TransportFault(format!("LoadModel failed with status {s}"))),
                }
            }
            Err(status) if status.code() == tonic::Code::NotFound => true,
            Err(status) => return Err(status.into()),
        };

        if needs_upload {
            let bytes = file_bytes.ok_or_else(|| {
                Error::InvalidArgument("server has no model at that path and no upload bytes were supplied".to_string())
            })?;
            self.upload_model(bytes).await?;
        }
        Ok(())
    }

    async fn upload_model(&mut self, bytes: &[u8]) -> Result<()> {
        let chunks: Vec<UploadModelChunk> = bytes
            .chunks(UPLOAD_CHUNK_SIZE)
            .map(|chunk| UploadModelChunk { content: chunk.to_vec() })
            .collect();
        let stream = tokio_stream::iter(chunks);
        let upload_request = self.authenticate("UploadModel", stream)?;

        let response = self.rpc_mut()?.upload_model(upload_request).await?.into_inner();
        if response.status != 0 {
            return Err(Error::TransportFault(format!("UploadModel failed with status {}", response.status)));
        }
        Ok(())
    }

    /// `get_input_tensor_info` — cached value or roundtrip (§4.9).
    pub async fn get_input_tensor_info(&mut self) -> Result<Vec<TensorInfo>> {
        if let Some(cached) = &self.input_tensor_info {
            return Ok(cached.clone());
        }
        let request = self.authenticate("GetInputTensorInfo", Empty {})?;
        let response = self.rpc_mut()?.get_input_tensor_info(request).await?.into_inner();
        let infos = tensor::decode_list(response)?;
        self.input_tensor_info = Some(infos.clone());
        Ok(infos)
    }

    /// `get_output_tensor_info` — cached value or roundtrip (§4.9).
    pub async fn get_output_tensor_info(&mut self) -> Result<Vec<TensorInfo>> {
        if let Some(cached) = &self.output_tensor_info {
            return Ok(cached.clone());
        }
        let request = self.authenticate("GetOutputTensorInfo", Empty {})?;
        let response = self.rpc_mut()?.get_output_tensor_info(request).await?.into_inner();
        let infos = tensor::decode_list(response)?;
        self.output_tensor_info = Some(infos.clone());
        Ok(infos)
    }

    /// `prepare` — asks the server to build its pipeline, then builds
    /// the local request/response pipelines pointing at the returned
    /// ports (§4.9, §4.10).
    pub async fn prepare(
        &mut self,
        server_host: &str,
        request_engine: Box<dyn PipelineEngine>,
        response_engine: Box<dyn PipelineEngine>,
    ) -> Result<()> {
        self.require_state(&[SessionState::Activated])?;

        let request = self.authenticate("Prepare", Empty {})?;
        let response = self.rpc_mut()?.prepare(request).await?.into_inner();
        if response.status != 0 {
            return Err(Error::TransportFault(format!("Prepare failed with status {}", response.status)));
        }

        let peer_id = self.peer_id.clone().unwrap_or_default();
        let srtp_key = self.srtp_key()?;

        let transport = match self.input_config {
            InputConfig::Opaque => Transport::Tcp { host: server_host.to_string(), port: response.request_port as u16 },
            _ => Transport::Udp {
                host: server_host.to_string(),
                port: response.request_port as u16,
                srtp_key: Some(srtp_key),
                ssrc: peer_id,
            },
        };
        let request_description = crate::pipeline::PipelineBuilder::client_request_leg(self.input_config.into(), &transport)?;
        let response_description = crate::pipeline::PipelineBuilder::client_response_leg(server_host, response.response_port as u16);

        let request_bridge = PipelineBridgeBuilder::build(request_engine)?.start()?;
        request_bridge.prepare(request_description)?;
        let response_bridge = PipelineBridgeBuilder::build(response_engine)?.start()?;
        response_bridge.prepare(response_description)?;

        self.request_bridge = Some(request_bridge);
        self.response_bridge = Some(response_bridge);
        self.state = SessionState::Prepared;
        Ok(())
    }

    fn srtp_key(&self) -> Result<[u8; 30]> {
        let key = self.credential_engine.key_material().get_symmetric_key(false)?;
        if key.len() < 30 {
            return Err(Error::InvalidArgument("session key shorter than the 30-byte SRTP master key".to_string()));
        }
        let mut out = [0u8; 30];
        out.copy_from_slice(&key[..30]);
        Ok(out)
    }

    /// `invoke(tensor, user_context)` — enqueues at the head of the
    /// request pipeline's FIFO (§4.9). Non-blocking.
    pub fn invoke(&mut self, tensor: Vec<u8>, user_context: Option<u64>) -> Result<u64> {
        self.require_state(&[SessionState::Prepared, SessionState::Streaming])?;
        let context = user_context.unwrap_or_else(|| {
            let c = self.next_user_context;
            self.next_user_context += 1;
            c
        });
        let bridge = self
            .request_bridge
            .as_ref()
            .ok_or_else(|| Error::SequenceError("no request pipeline is prepared".to_string()))?;
        bridge.invoke(tensor, context)?;
        self.state = SessionState::Streaming;
        Ok(context)
    }

    /// `get_output` — synchronous if a response has already been queued,
    /// otherwise cooperatively polls the response pipeline.
    pub async fn get_output(&mut self) -> Result<InvokeOutput> {
        self.require_state(&[SessionState::Streaming, SessionState::Prepared])?;
        loop {
            let output = {
                let bridge = self
                    .response_bridge
                    .as_ref()
                    .ok_or_else(|| Error::SequenceError("no response pipeline is prepared".to_string()))?;
                bridge.poll_output()?
            };
            if let Some(output) = output {
                return Ok(output.into());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// `stop` — halts both pipelines; the server-side `SessionContext`
    /// is freed only on `deactivate`/`destroy` (§4.9).
    pub async fn stop(&mut self) -> Result<()> {
        self.require_state(&[SessionState::Prepared, SessionState::Streaming])?;
        if let Some(bridge) = self.request_bridge.take() {
            bridge.stop()?;
        }
        if let Some(bridge) = self.response_bridge.take() {
            bridge.stop()?;
        }
        let request = self.authenticate("Stop", Empty {})?;
        self.rpc_mut()?.stop(request).await?;
        self.state = SessionState::Stopped;
        log::info!("session {} stopped", self.uuid);
        Ok(())
    }

    /// `GetInfo` — runtimes, free memory/storage the edge currently
    /// reports (§6).
    pub async fn get_info(&mut self) -> Result<GetInfoResponseOwned> {
        let request = self.authenticate("GetInfo", Empty {})?;
        let response = self.rpc_mut()?.get_info(request).await?.into_inner();
        Ok(GetInfoResponseOwned::from_wire(response))
    }

    /// `destroy` — terminal state transition; no further RPCs are legal.
    pub fn destroy(&mut self) {
        self.state = SessionState::Destroyed;
    }
}

/// Owned, non-wire representation of `GetInfoResponse`.
#[derive(Debug, Clone)]
pub struct GetInfoResponseOwned {
    pub runtimes: Vec<RuntimeInfo>,
    pub free_memory: u64,
    pub free_storage: u64,
}

impl GetInfoResponseOwned {
    fn from_wire(resp: GetInfoResponse) -> Self {
        Self {
            runtimes: resp.runtimes,
            free_memory: resp.free_memory,
            free_storage: resp.free_storage,
        }
    }
}

const fn libc_enoent() -> i32 {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_session_starts_idle() {
        let engine = CredentialEngine::new();
        let session = PeerSession::new("uuid", engine);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn configure_before_activate_is_permitted() {
        let engine = CredentialEngine::new();
        let mut session = PeerSession::new("uuid", engine);
        session.configure_input(InputConfig::Image).unwrap();
        assert_eq!(session.state(), SessionState::Configured);
    }

    #[test]
    fn invoke_before_prepare_is_sequence_error() {
        let engine = CredentialEngine::new();
        let mut session = PeerSession::new("uuid", engine);
        assert!(matches!(session.invoke(vec![1], None), Err(Error::SequenceError(_))));
    }
}
