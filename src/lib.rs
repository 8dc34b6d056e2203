//! medplat-deploy - provisioning and deployment orchestrator
//!
//! Drives a Django application host over SSH: backup, code update,
//! dependencies, environment file, migrations, static assets, service reload
//! and a two-vantage health check with rollback.

pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod services;
pub mod state;

pub use config::EnvConfig;
pub use error::{DeployError, DeployResult};
