pub mod bridge;
pub mod commands;
pub mod config;
pub mod error;
pub mod segment;
pub mod tokens;

pub use bridge::RemoteBridge;
pub use commands::*;
pub use config::{BridgeConfig, ScanConfig, SpiceConfig, SslConfig};
pub use error::BridgeError;
pub use segment::{Image, ShmSegment, BYTES_PER_PIXEL};
pub use tokens::{ReleaseToken, TokenTable};
