//! The `utils` module provides the pieces shared across `pathcast`: the error
//! taxonomy, logging setup and process signal handling.

pub mod error;
pub mod logging;
pub mod signals;

pub use error::{GivenUp, RelayError, Result};
