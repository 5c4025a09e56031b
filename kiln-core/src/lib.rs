//! Shared domain types for the kiln build cluster client.

pub mod error;
pub mod mark;
pub mod types;

pub use error::AppError;
pub use mark::Mark;
pub use types::{Architecture, MasterState, NodeState, Package};
