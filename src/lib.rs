// lib.rs

pub use std::net;

pub use chrono::*;
pub use log::*;
pub use serde::{Deserialize, Serialize};

pub const FW_VERSION: &str = env!("CARGO_PKG_VERSION");

mod error;
pub use error::*;

mod settings;
pub use settings::*;

mod store;
pub use store::*;

mod attiny;
pub use attiny::*;

mod measure;
pub use measure::*;

mod telemetry;
pub use telemetry::*;

mod http;
pub use http::*;

mod remote_config;
pub use remote_config::*;

mod live_settings;
pub use live_settings::*;

mod mqtt;
pub use mqtt::*;

mod sender;
pub use sender::*;

mod time_sync;
pub use time_sync::*;

mod session;
pub use session::*;

#[cfg(target_os = "espidf")]
pub mod platform;

#[cfg(test)]
mod sim;

// EOF
