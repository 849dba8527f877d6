//! Built-in declarative operations.

pub mod builtin;

pub use builtin::{builtin_registry, register_builtins};
