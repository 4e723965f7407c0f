//! Shared foundation for the prism workspace: configuration, the
//! process-wide error taxonomy, and secret masking.

pub mod config;
pub mod error;
pub mod mask;

pub use config::PrismConfig;
pub use error::{PrismError, Result};
