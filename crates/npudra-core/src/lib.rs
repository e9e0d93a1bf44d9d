pub mod config;
pub mod types;

pub use config::DriverConfig;
pub use types::*;
