//! Server-side (Edge) RPC handlers (§4.7 step 2 onward, §4.8, §6) —
//! the `Rpc` trait implementation that `tether-edge` mounts on a tonic
//! `Server`.
//!
//! Model file persistence, tensor-info storage, and pipeline
//! construction are delegated to the [`ModelStore`] and
//! [`PipelineFactory`] collaborators so this module stays focused on
//! protocol sequencing; a binary wires real filesystem/pipeline-engine
//! implementations.

use crate::auth::NonceTracker;
use crate::handshake::{self, PeerIdAllocator};
use crate::peer_info::{SessionContext, SessionMap};
use crate::pipeline::{MediaKind, PipelineBridge, PipelineBridgeBuilder, PipelineEngine, PipelineBuilder};
use crate::tensor::{self, TensorInfo};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tether_credential::CredentialEngine;
use tether_proto::rpc::rpc_server::Rpc;
use tether_proto::rpc::{
    ConfigureRequest, Empty, ExchangeKeyRequest, ExchangeKeyResponse, GetInfoResponse,
    LoadModelRequest, PrepareResponse, StatusResponse, TensorInfoList, UploadModelChunk,
};
use tonic::{Request, Response, Status, Streaming};

/// Persists uploaded model files and answers `LoadModel` existence
/// checks. §6: "server saves uploaded model files under a configured
/// storage path as `<storage>/<basename(requested_path)>`".
pub struct ModelStore {
    storage_path: PathBuf,
}

impl ModelStore {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self { storage_path: storage_path.into() }
    }

    fn resolved(&self, requested_path: &str) -> PathBuf {
        let basename = Path::new(requested_path)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(requested_path));
        self.storage_path.join(basename)
    }

    pub fn exists(&self, requested_path: &str) -> bool {
        self.resolved(requested_path).is_file()
    }

    pub async fn save(&self, requested_path: &str, content: &[u8]) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.storage_path).await?;
        tokio::fs::write(self.resolved(requested_path), content).await
    }

    pub fn resolved_path(&self, requested_path: &str) -> PathBuf {
        self.resolved(requested_path)
    }
}

/// Edge-side configuration applied through `Configure` (§6), cached for
/// `Prepare`'s pipeline construction.
#[derive(Debug, Clone, Default)]
pub struct EdgeConfig {
    pub input_type: String,
    pub framework: String,
    pub accel: bool,
}

/// Runtime info this edge reports through `GetInfo`.
#[derive(Debug, Clone, Default)]
pub struct EdgeInfo {
    pub runtimes: Vec<crate::peer_info::RuntimeInfo>,
    pub free_memory: u64,
    pub free_storage: u64,
}

/// Factory for the server-side pipeline bridge, invoked from `Prepare`
/// once the client's media kind and bound ports are known.
pub trait PipelineFactory: Send + Sync {
    fn build_engine(&self) -> Box<dyn PipelineEngine>;
}

/// The `Rpc` service implementation. One instance is shared (via `Arc`)
/// across all connections; per-client state lives in `sessions`.
pub struct EdgeService<F: PipelineFactory> {
    uuid: String,
    authenticator: Option<CredentialEngine>,
    sessions: SessionMap,
    nonces: NonceTracker,
    peer_ids: Mutex<PeerIdAllocator>,
    models: ModelStore,
    info: EdgeInfo,
    config: Mutex<EdgeConfig>,
    pipeline_factory: F,
    bind_host: String,
}

impl<F: PipelineFactory> EdgeService<F> {
    pub fn new(
        uuid: impl Into<String>,
        authenticator: Option<CredentialEngine>,
        models: ModelStore,
        info: EdgeInfo,
        pipeline_factory: F,
        bind_host: impl Into<String>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            authenticator,
            sessions: SessionMap::new(),
            nonces: NonceTracker::new(),
            peer_ids: Mutex::new(PeerIdAllocator::new()),
            models,
            info,
            config: Mutex::new(EdgeConfig::default()),
            pipeline_factory,
            bind_host: bind_host.into(),
        }
    }

    /// Every session, whether its handshake was RSA-sealed or sent the
    /// `"insecure"` literal, still gets a nonce on `ExchangeKey`; the
    /// per-RPC nonce check (§4.8) is therefore always enforced once a
    /// session exists, independent of whether an authenticator is
    /// configured.
    fn authenticate_or_reject<T>(&self, request: &Request<T>) -> Result<String, Status> {
        self.nonces
            .validate_and_advance(request)
            .map_err(|e| e.grpc_status())
    }

    fn media_kind(&self) -> MediaKind {
        match self.config.lock().unwrap().input_type.as_str() {
            "Image" => MediaKind::Image,
            "Video" => MediaKind::Video,
            _ => MediaKind::Opaque,
        }
    }
}

#[tonic::async_trait]
impl<F: PipelineFactory + 'static> Rpc for EdgeService<F> {
    async fn configure(&self, request: Request<ConfigureRequest>) -> Result<Response<StatusResponse>, Status> {
        let req = request.into_inner();
        let mut config = self.config.lock().unwrap();
        config.input_type = req.input_type;
        config.framework = req.framework;
        config.accel = req.accel;
        Ok(Response::new(StatusResponse { status: 0 }))
    }

    async fn exchange_key(
        &self,
        request: Request<ExchangeKeyRequest>,
    ) -> Result<Response<ExchangeKeyResponse>, Status> {
        let req = request.into_inner();
        let exchange = handshake::server_unseal(self.authenticator.as_ref(), &req.key, &self.uuid).map_err(|e| {
            log::warn!("ExchangeKey rejected: {e}");
            e.grpc_status()
        })?;

        let peer_id = self.peer_ids.lock().unwrap().allocate();
        let context = SessionContext::new(peer_id.clone(), exchange.nonce, &exchange.session_key)
            .map_err(|e| e.grpc_status())?;
        self.sessions.insert(context);
        self.nonces.register(&peer_id, exchange.nonce);

        log::info!("peer {peer_id} admitted via ExchangeKey");
        Ok(Response::new(ExchangeKeyResponse { status: 0, id: peer_id }))
    }

    async fn load_model(&self, request: Request<LoadModelRequest>) -> Result<Response<StatusResponse>, Status> {
        let peer_id = self.authenticate_or_reject(&request)?;
        let filename = request.into_inner().filename;
        if !self.models.exists(&filename) {
            return Ok(Response::new(StatusResponse { status: -2 })); // -ENOENT
        }
        self.sessions.with_mut(&peer_id, |ctx| {
            ctx.model_path = Some(self.models.resolved_path(&filename).to_string_lossy().to_string());
        });
        Ok(Response::new(StatusResponse { status: 0 }))
    }

    async fn upload_model(
        &self,
        request: Request<Streaming<UploadModelChunk>>,
    ) -> Result<Response<StatusResponse>, Status> {
        let peer_id = self.authenticate_or_reject(&request)?;
        let mut stream = request.into_inner();
        let mut content = Vec::new();
        while let Some(chunk) = stream.message().await? {
            content.extend_from_slice(&chunk.content);
        }

        let path = self
            .sessions
            .with_mut(&peer_id, |ctx| ctx.model_path.clone())
            .flatten()
            .unwrap_or_else(|| "uploaded.model".to_string());

        self.models
            .save(&path, &content)
            .await
            .map_err(|e| Status::internal(format!("failed to persist uploaded model: {e}")))?;

        self.sessions.with_mut(&peer_id, |ctx| {
            ctx.model_path = Some(self.models.resolved_path(&path).to_string_lossy().to_string());
        });

        Ok(Response::new(StatusResponse { status: 0 }))
    }

    async fn get_input_tensor_info(&self, request: Request<Empty>) -> Result<Response<TensorInfoList>, Status> {
        let peer_id = self.authenticate_or_reject(&request)?;
        let infos = self
            .sessions
            .with_mut(&peer_id, |ctx| ctx.input_tensor_info.clone())
            .unwrap_or_default();
        Ok(Response::new(tensor::encode_list(&infos, 0)))
    }

    async fn get_output_tensor_info(&self, request: Request<Empty>) -> Result<Response<TensorInfoList>, Status> {
        let peer_id = self.authenticate_or_reject(&request)?;
        let infos = self
            .sessions
            .with_mut(&peer_id, |ctx| ctx.output_tensor_info.clone())
            .unwrap_or_default();
        Ok(Response::new(tensor::encode_list(&infos, 0)))
    }

    async fn set_input_tensor_info(
        &self,
        request: Request<TensorInfoList>,
    ) -> Result<Response<StatusResponse>, Status> {
        let peer_id = self.authenticate_or_reject(&request)?;
        let infos: Vec<TensorInfo> = tensor::decode_list(request.into_inner()).map_err(|e| e.grpc_status())?;
        self.sessions.with_mut(&peer_id, |ctx| ctx.input_tensor_info = infos);
        Ok(Response::new(StatusResponse { status: 0 }))
    }

    async fn set_output_tensor_info(
        &self,
        request: Request<TensorInfoList>,
    ) -> Result<Response<StatusResponse>, Status> {
        let peer_id = self.authenticate_or_reject(&request)?;
        let infos: Vec<TensorInfo> = tensor::decode_list(request.into_inner()).map_err(|e| e.grpc_status())?;
        self.sessions.with_mut(&peer_id, |ctx| ctx.output_tensor_info = infos);
        Ok(Response::new(StatusResponse { status: 0 }))
    }

    async fn prepare(&self, request: Request<Empty>) -> Result<Response<PrepareResponse>, Status> {
        let peer_id = self.authenticate_or_reject(&request)?;

        let request_listener = tokio::net::TcpListener::bind((self.bind_host.as_str(), 0))
            .await
            .map_err(|e| Status::internal(format!("failed to bind request port: {e}")))?;
        let response_listener = tokio::net::TcpListener::bind((self.bind_host.as_str(), 0))
            .await
            .map_err(|e| Status::internal(format!("failed to bind response port: {e}")))?;
        let request_port = request_listener
            .local_addr()
            .map_err(|e| Status::internal(e.to_string()))?
            .port();
        let response_port = response_listener
            .local_addr()
            .map_err(|e| Status::internal(e.to_string()))?
            .port();
        drop(request_listener);
        drop(response_listener);

        let media = self.media_kind();
        let config = self.config.lock().unwrap().clone();
        let model_path = self
            .sessions
            .with_mut(&peer_id, |ctx| ctx.model_path.clone())
            .flatten()
            .unwrap_or_default();

        let description = match media {
            MediaKind::Opaque => PipelineBuilder::server_plain(request_port),
            _ => {
                let srtp_key = self
                    .sessions
                    .with_mut(&peer_id, |ctx| *ctx.srtp_master_key())
                    .ok_or_else(|| Status::failed_precondition("session has no srtp key"))?;
                let accel = if config.accel { "true:gpu0" } else { "false:cpu" };
                PipelineBuilder::server_media(media, request_port, &srtp_key, &peer_id, &config.framework, &model_path, Some(accel))
                    .map_err(|e| e.grpc_status())?
            }
        };

        let engine = self.pipeline_factory.build_engine();
        let bridge: PipelineBridge = PipelineBridgeBuilder::build(engine)
            .map_err(|e| e.grpc_status())?
            .start()
            .map_err(|e| e.grpc_status())?;
        let handle = bridge.prepare(description).map_err(|e| e.grpc_status())?;

        self.sessions.with_mut(&peer_id, |ctx| ctx.pipeline_handle = Some(handle));

        Ok(Response::new(PrepareResponse {
            status: 0,
            request_port: request_port as u32,
            response_port: response_port as u32,
        }))
    }

    async fn stop(&self, request: Request<Empty>) -> Result<Response<StatusResponse>, Status> {
        let peer_id = self.authenticate_or_reject(&request)?;
        self.nonces.forget(&peer_id);
        Ok(Response::new(StatusResponse { status: 0 }))
    }

    async fn get_info(&self, request: Request<Empty>) -> Result<Response<GetInfoResponse>, Status> {
        let _peer_id = self.authenticate_or_reject(&request)?;
        Ok(Response::new(GetInfoResponse {
            status: 0,
            runtimes: self
                .info
                .runtimes
                .iter()
                .map(|r| tether_proto::rpc::RuntimeInfo { name: r.name.clone(), devices: r.devices.clone() })
                .collect(),
            free_memory: self.info.free_memory,
            free_storage: self.info.free_storage,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::NullPipelineEngine;

    struct NullFactory;
    impl PipelineFactory for NullFactory {
        fn build_engine(&self) -> Box<dyn PipelineEngine> {
            Box::new(NullPipelineEngine::default())
        }
    }

    fn service() -> EdgeService<NullFactory> {
        EdgeService::new(
            "11111111-2222-3333-4444-555555555555",
            None,
            ModelStore::new(std::env::temp_dir().join("tether-test-models")),
            EdgeInfo::default(),
            NullFactory,
            "127.0.0.1",
        )
    }

    #[tokio::test]
    async fn exchange_key_assigns_distinct_peer_ids() {
        let service = service();
        let uuid = "11111111-2222-3333-4444-555555555555";

        let credential = handshake::Credential {
            nonce: 1,
            uuid: uuid.to_string(),
            session_key: vec![1u8; 32],
        };
        let payload = credential.encode().unwrap();

        let first = service
            .exchange_key(Request::new(ExchangeKeyRequest { key: payload.clone() }))
            .await
            .unwrap()
            .into_inner();
        let second = service
            .exchange_key(Request::new(ExchangeKeyRequest { key: payload }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(first.status, 0);
        assert_eq!(second.status, 0);
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn exchange_key_rejects_uuid_mismatch() {
        let service = service();
        let credential = handshake::Credential {
            nonce: 1,
            uuid: "00000000-0000-0000-0000-000000000000".to_string(),
            session_key: vec![1u8; 32],
        };
        let payload = credential.encode().unwrap();
        let result = service
            .exchange_key(Request::new(ExchangeKeyRequest { key: payload }))
            .await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().code(), tonic::Code::Unauthenticated);
    }

    #[tokio::test]
    async fn load_model_missing_path_returns_enoent_status() {
        let service = service();
        let uuid = "11111111-2222-3333-4444-555555555555";
        let credential = handshake::Credential {
            nonce: 1,
            uuid: uuid.to_string(),
            session_key: vec![1u8; 32],
        };
        let payload = credential.encode().unwrap();
        let exchange = service
            .exchange_key(Request::new(ExchangeKeyRequest { key: payload }))
            .await
            .unwrap()
            .into_inner();

        let mut request = Request::new(LoadModelRequest { filename: "missing.tflite".to_string() });
        request.metadata_mut().insert("method_name", "LoadModel".parse().unwrap());
        request.metadata_mut().insert("id", exchange.id.parse().unwrap());
        request.metadata_mut().insert("nonce", "2".parse().unwrap());

        let response = service.load_model(request).await.unwrap().into_inner();
        assert_eq!(response.status, -2);
    }
}
