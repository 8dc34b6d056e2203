//! Local run state
//!
//! Deployment history and the run lock, both kept in the data directory

pub mod record_store;

pub use record_store::{DeployLock, RecordStore};
