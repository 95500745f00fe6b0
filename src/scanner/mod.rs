//! Wireless medium abstraction.
//!
//! A [`Scanner`] performs one bounded scan window and reports the raw
//! manufacturer data it observed. Decoding happens in [`crate::codec`];
//! the ingestion loop lives in [`source`].

#[cfg(feature = "bluer")]
pub mod bluer;
pub mod source;

pub use source::{Ingest, ScanSettings, ScanSource};

use crate::reading::Advertisement;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error type for scanner operations. Always recoverable: the scan loop
/// backs off and retries.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// Backend not available (not compiled in)
    #[error("Scanner backend '{0}' not available (not compiled in)")]
    BackendNotAvailable(&'static str),
}

/// Boxed future returned by [`Scanner::scan`].
pub type ScanFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<Advertisement>, ScanError>> + Send + 'a>>;

/// Scanner abstraction to enable deterministic tests without Bluetooth hardware.
pub trait Scanner: Send + Sync {
    /// Observe the medium for `window` and return every advertisement seen.
    fn scan(&self, window: Duration) -> ScanFuture<'_>;
}

/// The scanner compiled into this build.
pub fn default_scanner() -> Result<Arc<dyn Scanner>, ScanError> {
    #[cfg(feature = "bluer")]
    return Ok(Arc::new(bluer::BluerScanner::new()));
    #[cfg(not(feature = "bluer"))]
    return Err(ScanError::BackendNotAvailable("bluer"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_error_display() {
        let err = ScanError::Bluetooth("adapter not powered".to_string());
        assert_eq!(format!("{}", err), "Bluetooth error: adapter not powered");

        let err = ScanError::BackendNotAvailable("bluer");
        assert_eq!(
            format!("{}", err),
            "Scanner backend 'bluer' not available (not compiled in)"
        );
    }
}
