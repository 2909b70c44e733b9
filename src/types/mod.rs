//! Shared types for CareLink

mod error;

pub use error::{CarelinkError, Result};
