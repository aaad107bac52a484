/// Convolution kernel contraction for LoRA factor pairs
///
/// Kernel layout follows the PyTorch/safetensors contract:
/// - down: [RANK, IC, KH, KW]
/// - up:   [OC, RANK, 1, 1]
/// - ΔW:   [OC, IC, KH, KW]

use crate::{Error, Result};
use candle_core::Tensor;
use tracing::warn;

/// Contract conv factors into a full kernel
///
/// ΔW[o, i, h, w] = Σ_r up[o, r] · down[r, i, h, w]
///
/// Computed as a single matmul: [OC, R] @ [R, IC*KH*KW] then viewed back
/// as [OC, IC, KH, KW]. Both factors must already share a dtype.
pub fn contract_kernel(up: &Tensor, down: &Tensor) -> Result<Tensor> {
    let (rank, ic, kh, kw) = down.dims4()?;
    let (oc, up_rank, uh, uw) = up.dims4()?;

    if uh != 1 || uw != 1 {
        return Err(Error::UnsupportedShape {
            down: down.dims().to_vec(),
            up: up.dims().to_vec(),
        });
    }
    if up_rank != rank {
        return Err(Error::RankMismatch {
            down: rank,
            up: up_rank,
        });
    }

    if rank == 0 {
        return Ok(Tensor::zeros((oc, ic, kh, kw), down.dtype(), down.device())?);
    }

    let up_2d = up.reshape((oc, rank))?;
    let down_2d = down.reshape((rank, ic * kh * kw))?;
    let kernel = up_2d.matmul(&down_2d)?;
    Ok(kernel.reshape((oc, ic, kh, kw))?)
}

/// Make a contracted kernel match the target parameter shape
///
/// Same element count → reshape (logged, the layout may be wrong);
/// otherwise the pair cannot be merged.
pub fn fit_kernel(kernel: Tensor, target: &[usize]) -> Result<Tensor> {
    if kernel.dims() == target {
        return Ok(kernel);
    }

    let target_elems: usize = target.iter().product();
    if kernel.elem_count() != target_elems {
        return Err(Error::ShapeMismatch {
            expected: target.to_vec(),
            got: kernel.dims().to_vec(),
        });
    }

    warn!(
        from = ?kernel.dims(),
        to = ?target,
        "Reshaping conv delta to target shape"
    );
    Ok(kernel.reshape(target)?)
}
