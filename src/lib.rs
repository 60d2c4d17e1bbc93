//! FYP stage engine
//!
//! Drives final-year project groups through their lifecycle:
//! - Group formation and the status machine (forming to completed)
//! - Time-gated proposal forms and stage documents
//! - Weekly supervision meetings and monthly reports
//! - Proposal, mid-term and final defenses with evaluation panels
//! - Weighted result compilation and one-way publication
//!
//! [`engine::Engine`] is the entry point; persistence sits behind
//! [`store::Store`] with in-memory and Postgres implementations.

pub mod authz;
pub mod config;
pub mod defense;
pub mod engine;
pub mod error;
pub mod import;
pub mod lifecycle;
pub mod meetings;
pub mod models;
pub mod notify;
pub mod report;
pub mod results;
pub mod seed;
pub mod store;
pub mod submissions;


// Re-export commonly used types
pub use authz::{Principal, Role};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, Result};
