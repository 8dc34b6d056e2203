//! Configuration
//!
//! Environment-variable configuration and target/application layout

pub mod app;
pub mod env;
pub mod target;

pub use app::{AppConfig, BindAddress, TlsConfig};
pub use env::{EnvConfig, HealthConfig};
pub use target::TargetConfig;
