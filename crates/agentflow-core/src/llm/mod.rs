//! Model capability consumed by prompt nodes.

pub mod box_provider;
pub mod provider;
