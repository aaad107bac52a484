/// Output precision normalization
///
/// Everything still in training precision (FP32) is cast to the compact
/// inference precision. Tensors already stored in any other dtype pass
/// through untouched, which makes finalization idempotent.

use crate::dtype::{DType, OutputPrecision};
use crate::{Result, WeightSet};
use candle_core::Tensor;

#[derive(Debug, Clone, Copy)]
pub struct Finalizer {
    /// Precision that gets cast
    pub training: DType,
    /// Precision it is cast to
    pub compact: DType,
}

impl Default for Finalizer {
    fn default() -> Self {
        Self::new(OutputPrecision::default())
    }
}

impl Finalizer {
    pub fn new(precision: OutputPrecision) -> Self {
        Self {
            training: DType::F32,
            compact: precision.dtype(),
        }
    }

    /// Cast every training-precision tensor to the compact precision
    ///
    /// Float-to-float casts on the CPU backend do not fail in practice; the
    /// `Result` only carries backend errors through.
    pub fn finalize(&self, weights: WeightSet) -> Result<WeightSet> {
        weights
            .into_iter()
            .map(|(name, tensor)| -> Result<(String, Tensor)> {
                let tensor = if tensor.dtype() == self.training && self.compact != self.training {
                    tensor.to_dtype(self.compact)?
                } else {
                    tensor
                };
                Ok((name, tensor))
            })
            .collect()
    }
}
