//! Session state storage trait.

pub mod state_backend;
