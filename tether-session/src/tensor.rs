//! Tensor-info wire encoding (§3 `TensorInfo`, §9 design note on the
//! dimension vector).
//!
//! The original source encoded `dims` with a `switch` over the rank,
//! duplicating the copy loop for each of 1..4 dimensions. Here the
//! dimension vector is a first-class `Vec<u32>` of length 1..=MAX_RANK;
//! [`TensorInfo::padded_dims`] is the one place that pads it out to the
//! pipeline engine's fixed-rank representation, so there is exactly one
//! rank-handling routine instead of one per call site.

use crate::error::Error;
use tether_proto::rpc;

/// The pipeline engine (NNStreamer in the source) represents tensor
/// shapes as a fixed-rank array; this is that rank.
pub const PIPELINE_ENGINE_RANK: usize = 4;

/// Element type of a tensor, mirroring the wire enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float16,
    Float32,
}

impl TensorType {
    fn from_wire(value: i32) -> Result<Self, Error> {
        match rpc::TensorType::try_from(value) {
            Ok(rpc::TensorType::Int8) => Ok(TensorType::Int8),
            Ok(rpc::TensorType::Uint8) => Ok(TensorType::Uint8),
            Ok(rpc::TensorType::Int16) => Ok(TensorType::Int16),
            Ok(rpc::TensorType::Uint16) => Ok(TensorType::Uint16),
            Ok(rpc::TensorType::Int32) => Ok(TensorType::Int32),
            Ok(rpc::TensorType::Uint32) => Ok(TensorType::Uint32),
            Ok(rpc::TensorType::Int64) => Ok(TensorType::Int64),
            Ok(rpc::TensorType::Uint64) => Ok(TensorType::Uint64),
            Ok(rpc::TensorType::Float16) => Ok(TensorType::Float16),
            Ok(rpc::TensorType::Float32) => Ok(TensorType::Float32),
            _ => Err(Error::InvalidArgument(format!(
                "unrecognized tensor type tag {value}"
            ))),
        }
    }

    fn to_wire(self) -> rpc::TensorType {
        match self {
            TensorType::Int8 => rpc::TensorType::Int8,
            TensorType::Uint8 => rpc::TensorType::Uint8,
            TensorType::Int16 => rpc::TensorType::Int16,
            TensorType::Uint16 => rpc::TensorType::Uint16,
            TensorType::Int32 => rpc::TensorType::Int32,
            TensorType::Uint32 => rpc::TensorType::Uint32,
            TensorType::Int64 => rpc::TensorType::Int64,
            TensorType::Uint64 => rpc::TensorType::Uint64,
            TensorType::Float16 => rpc::TensorType::Float16,
            TensorType::Float32 => rpc::TensorType::Float32,
        }
    }
}

/// A single tensor's shape/type/name, wire-level (§3 `TensorInfo`).
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub kind: TensorType,
    pub size: u32,
    pub name: String,
    pub dims: Vec<u32>,
}

impl TensorInfo {
    /// Construct and validate the rank invariant (length 1..=4, all
    /// dimensions positive).
    pub fn new(kind: TensorType, size: u32, name: impl Into<String>, dims: Vec<u32>) -> Result<Self, Error> {
        if dims.is_empty() || dims.len() > PIPELINE_ENGINE_RANK {
            return Err(Error::InvalidArgument(format!(
                "tensor dims length {} is outside the 1..={} range",
                dims.len(),
                PIPELINE_ENGINE_RANK
            )));
        }
        if dims.iter().any(|&d| d == 0) {
            return Err(Error::InvalidArgument(
                "tensor dims must all be positive".to_string(),
            ));
        }
        Ok(Self {
            kind,
            size,
            name: name.into(),
            dims,
        })
    }

    /// Dimensions padded to the pipeline engine's fixed rank with `1`s,
    /// the representation the pipeline engine's tensor-filter element
    /// expects (trailing dimensions of size 1 are the identity for
    /// broadcasting/stride purposes).
    pub fn padded_dims(&self) -> [u32; PIPELINE_ENGINE_RANK] {
        let mut out = [1u32; PIPELINE_ENGINE_RANK];
        for (slot, dim) in out.iter_mut().zip(self.dims.iter()) {
            *slot = *dim;
        }
        out
    }

    pub(crate) fn from_wire(info: rpc::TensorInfo) -> Result<Self, Error> {
        let kind = TensorType::from_wire(info.r#type)?;
        TensorInfo::new(kind, info.size, info.name, info.dims)
    }

    pub(crate) fn to_wire(&self) -> rpc::TensorInfo {
        rpc::TensorInfo {
            r#type: self.kind.to_wire() as i32,
            size: self.size,
            name: self.name.clone(),
            dims: self.dims.clone(),
        }
    }
}

/// Decode a wire `TensorInfoList` into the session's owned representation.
pub fn decode_list(list: rpc::TensorInfoList) -> Result<Vec<TensorInfo>, Error> {
    list.info.into_iter().map(TensorInfo::from_wire).collect()
}

/// Encode owned tensor infos into the wire list shape.
pub fn encode_list(infos: &[TensorInfo], status: i32) -> rpc::TensorInfoList {
    rpc::TensorInfoList {
        info: infos.iter().map(TensorInfo::to_wire).collect(),
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_dims_fills_trailing_ones() {
        let info = TensorInfo::new(TensorType::Float32, 4, "input", vec![3, 224, 224]).unwrap();
        assert_eq!(info.padded_dims(), [3, 224, 224, 1]);
    }

    #[test]
    fn rank_zero_is_rejected() {
        assert!(TensorInfo::new(TensorType::Int8, 1, "x", vec![]).is_err());
    }

    #[test]
    fn rank_above_limit_is_rejected() {
        assert!(TensorInfo::new(TensorType::Int8, 1, "x", vec![1, 1, 1, 1, 1]).is_err());
    }

    #[test]
    fn zero_dimension_is_rejected() {
        assert!(TensorInfo::new(TensorType::Int8, 1, "x", vec![1, 0]).is_err());
    }

    #[test]
    fn wire_round_trip_preserves_shape() {
        let info = TensorInfo::new(TensorType::Uint8, 1, "frame", vec![1, 3, 640, 480]).unwrap();
        let wire = info.to_wire();
        let back = TensorInfo::from_wire(wire).unwrap();
        assert_eq!(info, back);
    }
}
