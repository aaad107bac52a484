/// Low-rank delta reconstruction
pub mod lora;

pub use lora::LoraPair;
