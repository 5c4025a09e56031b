//! Kiln error abstractions.

use thiserror::Error;

/// Application error variants.
///
/// These are raised only for in-process misuse of the client API. Errors
/// reported by peers travel through the observer channels instead and never
/// surface as `Result`s.
#[derive(Debug, Error)]
pub enum AppError {
    /// A command requires a concrete architecture.
    #[error("the invalid architecture cannot be sent to a build master")]
    InvalidArchitecture,
    /// The overlay hub address could not be understood.
    #[error("invalid hub address: {0}")]
    InvalidHubAddress(String),
}
