//! Service layer
//!
//! Pipeline orchestration plus the generators and probes it drives

pub mod backup;
pub mod container;
pub mod deploy;
pub mod environment;
pub mod health;
pub mod proxy;
pub mod supervisor;
