//! Timeout wrapper for async operations.

use ferry_core::FerryError;
use std::time::Duration;

/// Wraps an async operation with a timeout.
///
/// Elapsing is reported as [`FerryError::Timeout`] converted into the
/// caller's error type.
pub async fn with_timeout<F, Fut, T, E>(duration: Duration, f: F) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: From<FerryError>,
{
    tokio::time::timeout(duration, f())
        .await
        .map_err(|_| E::from(FerryError::Timeout(format!("Operation timed out after {:?}", duration))))?
}
