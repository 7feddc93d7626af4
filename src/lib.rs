pub mod client;
pub mod config;
pub mod errors;
pub mod server;
pub mod telemetry;

pub use commsync_common as common;
