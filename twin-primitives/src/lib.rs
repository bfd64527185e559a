//! Core shared types for the TwinOps runtime.

#![warn(missing_docs, clippy::pedantic)]

mod call;
pub mod canon;
mod error;
mod ids;
mod risk;

/// Tool call and catalog schema types exchanged between components.
pub use call::{ToolCall, ToolSchema};
/// Error type and result alias shared across the runtime.
pub use error::{Error, Result};
/// Unique identifier for pending approval tasks.
pub use ids::TaskId;
/// Operation risk classification.
pub use risk::RiskLevel;
