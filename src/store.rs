/// Weight-set storage seam
///
/// The merge engine only needs three things from storage: an existence
/// probe, a loader and a writer. `SafetensorsStore` backs them with
/// candle's safetensors reader/writer on the CPU.

use crate::{Error, Result, WeightSet};
use candle_core::Device;
use std::path::Path;

pub trait WeightStore {
    /// Whether a weight file exists at `path`
    fn exists(&self, path: &Path) -> bool;

    /// Load every tensor stored at `path`
    fn load(&self, path: &Path) -> Result<WeightSet>;

    /// Write `weights` to `path`, replacing any existing file
    fn save(&self, weights: &WeightSet, path: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SafetensorsStore {
    device: Device,
}

impl Default for SafetensorsStore {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
        }
    }
}

impl WeightStore for SafetensorsStore {
    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn load(&self, path: &Path) -> Result<WeightSet> {
        candle_core::safetensors::load(path, &self.device).map_err(|source| Error::Load {
            path: path.to_path_buf(),
            source,
        })
    }

    fn save(&self, weights: &WeightSet, path: &Path) -> Result<()> {
        candle_core::safetensors::save(weights, path).map_err(|source| Error::Save {
            path: path.to_path_buf(),
            source,
        })
    }
}
