/// Precision helpers for merge compute and output casting
pub use candle_core::DType;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Helper trait for dtype operations
pub trait DTypeExt {
    /// Check if dtype is BF16
    fn is_bf16(&self) -> bool;

    /// Check if dtype is FP16
    fn is_f16(&self) -> bool;

    /// Precision the low-rank factors are multiplied in.
    ///
    /// Half-precision storage is lifted to FP32; FP64 stays FP64.
    fn compute_dtype(&self) -> DType;

    /// Wider of two float dtypes, used for accumulation
    fn widest(&self, other: DType) -> DType;
}

impl DTypeExt for DType {
    fn is_bf16(&self) -> bool {
        matches!(self, DType::BF16)
    }

    fn is_f16(&self) -> bool {
        matches!(self, DType::F16)
    }

    fn compute_dtype(&self) -> DType {
        match self {
            DType::F64 => DType::F64,
            _ => DType::F32,
        }
    }

    fn widest(&self, other: DType) -> DType {
        if float_rank(other) > float_rank(*self) {
            other
        } else {
            *self
        }
    }
}

// bf16 and f16 carry the same width; neither is promoted to the other.
fn float_rank(dtype: DType) -> u8 {
    match dtype {
        DType::F64 => 3,
        DType::F32 => 2,
        DType::BF16 | DType::F16 => 1,
        _ => 0,
    }
}

/// Compact precision written by the finalizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputPrecision {
    #[default]
    Bf16,
    F16,
    F32,
}

impl OutputPrecision {
    pub fn dtype(self) -> DType {
        match self {
            OutputPrecision::Bf16 => DType::BF16,
            OutputPrecision::F16 => DType::F16,
            OutputPrecision::F32 => DType::F32,
        }
    }
}

impl FromStr for OutputPrecision {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bf16" => Ok(Self::Bf16),
            "f16" | "fp16" => Ok(Self::F16),
            "f32" | "fp32" => Ok(Self::F32),
            _ => Err(format!("Unknown precision: {}. Use: bf16, f16, f32", s)),
        }
    }
}

impl fmt::Display for OutputPrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dtype().as_str())
    }
}
