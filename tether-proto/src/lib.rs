//! Generated gRPC service definitions for the Device/Edge RPC channel.
//!
//! This crate contains nothing but the wire contract: message types and
//! the `Rpc` client/server traits produced by `tonic-build` from
//! `proto/rpc.proto`. All behavior lives in `tether-credential` and
//! `tether-session`.

pub mod rpc {
    tonic::include_proto!("tether.rpc");
}

pub use rpc::{
    rpc_client::RpcClient,
    rpc_server::{Rpc, RpcServer},
    ConfigureRequest, Empty, ExchangeKeyRequest, ExchangeKeyResponse, GetInfoResponse,
    LoadModelRequest, PrepareResponse, RuntimeInfo, StatusResponse, TensorInfo, TensorInfoList,
    TensorType, UploadModelChunk,
};

/// Chunk size used by `UploadModel` streaming, per the external interface spec.
pub const UPLOAD_CHUNK_SIZE: usize = 4096;
