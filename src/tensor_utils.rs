/// Tensor utility functions for merge compute
///
/// Helpers to move candle tensors between storage and compute precision

use crate::dtype::DTypeExt;
use crate::{Error, Result};
use candle_core::{DType, Device, Shape, Tensor};

/// Create tensor from vec with BF16 dtype
pub fn from_vec_bf16(data: Vec<f32>, shape: impl Into<Shape>, device: &Device) -> Result<Tensor> {
    let tensor_f32 = Tensor::from_vec(data, shape, device)?;
    Ok(tensor_f32.to_dtype(DType::BF16)?)
}

/// Cast to `dtype` only when the tensor is stored in something else
pub fn cast_if_needed(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        Ok(tensor.to_dtype(dtype)?)
    }
}

/// Lift a pair of factors to a shared compute precision
pub fn to_compute_pair(a: &Tensor, b: &Tensor) -> Result<(Tensor, Tensor)> {
    let dtype = a.dtype().compute_dtype().widest(b.dtype().compute_dtype());
    Ok((cast_if_needed(a, dtype)?, cast_if_needed(b, dtype)?))
}

/// Read a single scalar (0-d or one-element tensor) as f64
pub fn scalar_f64(tensor: &Tensor) -> Result<f64> {
    if tensor.elem_count() != 1 {
        return Err(Error::InvalidOperation(format!(
            "expected a scalar tensor, got shape {:?}",
            tensor.dims()
        )));
    }

    let values = tensor.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    Ok(values[0])
}

/// Flatten any tensor into an f32 vec (test and inspection helper)
pub fn to_f32_vec(tensor: &Tensor) -> Result<Vec<f32>> {
    Ok(tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
}
