/// Tensor contractions used to rebuild full-rank deltas
pub mod conv;

pub use conv::*;
