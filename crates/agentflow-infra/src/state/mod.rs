//! Process-local session state.

pub mod memory;
