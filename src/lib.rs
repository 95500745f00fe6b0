//! `iaq-gateway` library.
//!
//! The binary (`src/main.rs`) is responsible for logging setup, signal
//! handling and process exit codes. The gateway itself lives in
//! [`crate::app`] where it can be tested deterministically with an injected
//! scanner and broker.

pub mod app;
pub mod broker;
pub mod codec;
pub mod config;
pub mod drainer;
pub mod health;
pub mod mac_address;
pub mod payload;
pub mod publisher;
pub mod reading;
pub mod registry;
pub mod scanner;
pub mod shutdown;
pub mod store;
pub mod time;
pub mod topics;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use app::{Gateway, RunError};
pub use broker::{Broker, ConnectionState, TransportError};
pub use codec::{FrameError, decode_frame, encode_frame};
pub use config::{ConfigError, Options, parse_duration};
pub use mac_address::MacAddress;
pub use reading::{Advertisement, BufferedRecord, Reading};
pub use scanner::{ScanError, Scanner};
pub use store::{StorageError, TelemetryStore};
