//! Low-rank adapters for dense layers.

pub mod adapted;
pub mod lora;
