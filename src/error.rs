use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Base weights not found at {}", path.display())]
    BaseNotFound { path: PathBuf },

    #[error("Failed to load weights from {}: {source}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: candle_core::Error,
    },

    #[error("Failed to save weights to {}: {source}", path.display())]
    Save {
        path: PathBuf,
        #[source]
        source: candle_core::Error,
    },

    #[error("Unsupported factor shapes: down {down:?}, up {up:?}")]
    UnsupportedShape { down: Vec<usize>, up: Vec<usize> },

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("Rank mismatch: down has rank {down}, up has rank {up}")]
    RankMismatch { down: usize, up: usize },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid merge plan: {0}")]
    Config(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
