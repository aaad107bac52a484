/// LoRA factor pair and full-rank delta reconstruction
///
/// Standard LoRA decomposition: ΔW = up @ down * (alpha / rank) * strength
/// Works for both Linear and Conv layers
///
/// Weight layouts follow the safetensors/PyTorch contract:
/// - Linear: down [RANK, IN], up [OUT, RANK], ΔW [OUT, IN]
/// - Conv2d: down [RANK, IC, KH, KW], up [OC, RANK, 1, 1], ΔW [OC, IC, KH, KW]
///
/// Factors may be stored in BF16/F16; the product is always computed in FP32
/// (or FP64 when a factor is FP64).

use crate::adapter::FactorConvention;
use crate::dtype::DTypeExt;
use crate::{ops, tensor_utils, Error, LowRankDelta, Result};
use candle_core::Tensor;

#[derive(Debug, Clone)]
pub struct LoraPair {
    /// Adapter group id the pair was found under
    pub group: String,

    /// Naming convention the factors were stored with
    pub convention: FactorConvention,

    /// Down projection ("A")
    /// Linear: [RANK, IN]
    /// Conv: [RANK, IC, KH, KW]
    pub down: Tensor,

    /// Up projection ("B")
    /// Linear: [OUT, RANK]
    /// Conv: [OC, RANK, 1, 1]
    pub up: Tensor,

    /// Alpha parameter for scaling (default: rank)
    pub alpha: Option<f64>,
}

impl LoraPair {
    pub fn new(
        group: impl Into<String>,
        convention: FactorConvention,
        down: Tensor,
        up: Tensor,
        alpha: Option<f64>,
    ) -> Self {
        Self {
            group: group.into(),
            convention,
            down,
            up,
            alpha,
        }
    }

    /// Rank = leading dimension of the down factor
    pub fn rank(&self) -> usize {
        self.down.dims().first().copied().unwrap_or(0)
    }

    /// Alpha, falling back to the rank when the adapter stores none
    pub fn alpha(&self) -> f64 {
        self.alpha.unwrap_or(self.rank() as f64)
    }

    /// Whether both factors are 4D conv kernels
    pub fn is_conv(&self) -> bool {
        self.down.rank() == 4 && self.up.rank() == 4
    }

    fn unsupported(&self) -> Error {
        Error::UnsupportedShape {
            down: self.down.dims().to_vec(),
            up: self.up.dims().to_vec(),
        }
    }

    /// Unscaled product of the factors, in compute precision
    fn product(&self) -> Result<Tensor> {
        let (down, up) = tensor_utils::to_compute_pair(&self.down, &self.up)?;

        match (down.rank(), up.rank()) {
            (2, 2) => {
                // Linear: ΔW = up @ down → [OUT, IN]
                let (rank, _) = down.dims2()?;
                let (_, up_rank) = up.dims2()?;
                if up_rank != rank {
                    return Err(Error::RankMismatch {
                        down: rank,
                        up: up_rank,
                    });
                }
                Ok(up.matmul(&down)?)
            }
            (4, 4) => ops::conv::contract_kernel(&up, &down),
            _ => Err(self.unsupported()),
        }
    }

    /// ΔW fitted to a target parameter shape
    ///
    /// Conv kernels may be reshaped when only the layout differs; linear
    /// deltas must match exactly.
    pub fn diff_weight_for(&self, target: &[usize], strength: f64) -> Result<Tensor> {
        let delta = self.diff_weight(strength)?;

        let delta = if self.is_conv() {
            ops::conv::fit_kernel(delta, target)?
        } else {
            delta
        };

        if delta.dims() != target {
            return Err(Error::ShapeMismatch {
                expected: target.to_vec(),
                got: delta.dims().to_vec(),
            });
        }
        Ok(delta)
    }
}

impl LowRankDelta for LoraPair {
    /// Scaling factor alpha / rank, 1.0 when the rank is zero
    fn scale(&self) -> f64 {
        let rank = self.rank();
        if rank == 0 {
            1.0
        } else {
            self.alpha() / rank as f64
        }
    }

    fn diff_weight(&self, strength: f64) -> Result<Tensor> {
        let product = self.product()?;
        Ok(product.affine(self.scale() * strength, 0.0)?)
    }

    /// Sums in the wider of the base and delta dtypes; an F64 base stays F64
    fn merge_into(&self, base: &Tensor, strength: f64) -> Result<Tensor> {
        let delta = self.diff_weight_for(base.dims(), strength)?;

        // Accumulate in the wider precision so neither side is truncated
        let dtype = base.dtype().widest(delta.dtype());
        let base = tensor_utils::cast_if_needed(base, dtype)?;
        let delta = tensor_utils::cast_if_needed(&delta, dtype)?;
        Ok(base.add(&delta)?)
    }
}
