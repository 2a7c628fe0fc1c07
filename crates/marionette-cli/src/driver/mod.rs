//! Client side of the automation peer: process, transport and facade.

pub mod client;
pub mod config;
pub mod correlator;
pub mod process;
pub mod reader;
pub mod session;

// Public API - used by main.rs
pub use config::DriverConfig;
pub use session::Session;
