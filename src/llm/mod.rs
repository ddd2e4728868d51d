//! Reference [`ModelAdapter`](crate::ModelAdapter) for the Anthropic Messages API.

pub mod client;
pub mod types;

pub use client::*;
pub use types::*;
