//! Result type aliases for Ferry.

use crate::FerryError;

/// A specialized `Result` type for Ferry operations.
pub type FerryResult<T> = Result<T, FerryError>;
