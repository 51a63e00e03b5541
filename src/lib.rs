// lib.rs
#![warn(clippy::large_futures)]

mod config;
pub use config::*;

mod measure;
pub use measure::*;

mod dht;
pub use dht::*;

mod message;
pub use message::*;

mod mqtt;
pub use mqtt::*;

mod wifi;
pub use wifi::*;

mod power;
pub use power::*;

mod station;
pub use station::*;

pub mod testing;

pub const FW_VERSION: &str = env!("CARGO_PKG_VERSION");

// EOF
