//! Error types for the acquisition and streaming core.

pub mod runtime_error;

pub use runtime_error::{RuntimeError, RuntimeResult};
