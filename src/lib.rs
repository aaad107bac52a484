//! lora-bake: bake LoRA adapter deltas permanently into a base checkpoint
//!
//! Produces one self-contained weight file per variant so inference does not
//! pay for composing a base model with several adapters at load time.
//!
//! # Pipeline
//! - [`keys`]: adapter group id → base parameter name
//! - [`adapter`]: down/up (A/B) factor pair extraction
//! - [`algorithms::lora`]: full-rank ΔW reconstruction, linear and conv
//! - [`merge`]: sequential accumulation with per-pair skip reporting
//! - [`finalize`]: FP32 → compact precision cast
//!
//! Factors are read in whatever precision they are stored in (usually BF16)
//! and multiplied in FP32.

pub mod adapter;
pub mod algorithms;
pub mod dtype;
pub mod error;
pub mod finalize;
pub mod job;
pub mod keys;
pub mod merge;
pub mod ops;
pub mod store;
pub mod tensor_utils;

pub use algorithms::LoraPair;
pub use dtype::{DType, OutputPrecision};
pub use error::{Error, Result};
pub use finalize::Finalizer;
pub use job::{run_plan, MergePlan, MergeRunner, PlanSummary};
pub use keys::{KeyResolver, NamingConvention};
pub use merge::{Accumulator, AdapterReport, PairOutcome, SkipReason};
pub use store::{SafetensorsStore, WeightStore};

// Re-export core candle types
pub use candle_core::{Device, Tensor};

/// Parameter name → tensor
pub type WeightSet = std::collections::HashMap<String, Tensor>;

/// A low-rank factorization that can be expanded into a full-rank update
pub trait LowRankDelta {
    /// Scaling applied on top of the raw factor product
    fn scale(&self) -> f64;

    /// Get the differential weight ΔW, multiplied by `strength`
    fn diff_weight(&self, strength: f64) -> Result<Tensor>;

    /// Return `base + strength * ΔW`, leaving `base` untouched
    fn merge_into(&self, base: &Tensor, strength: f64) -> Result<Tensor>;
}
