//! CareLink - identity and linking reconciliation engine
//!
//! Keeps application accounts consistent with an external credential
//! provider for a patient/therapist routine tracker.
//!
//! ## Services
//!
//! - **Credential Gateway**: password and federated sign-in, credential refresh
//! - **Email Claim Ledger**: one account per normalized email
//! - **Account Reconciler**: exactly-once account creation for both signup paths
//! - **Linking Code Service**: single-use, expiring dependent → manager codes
//! - **Assignment Progress Tracker**: session history and lost-update-free progress

pub mod auth;
pub mod config;
pub mod db;
pub mod gateway;
pub mod routes;
pub mod server;
pub mod services;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use services::{Engine, EngineConfig};
pub use types::{CarelinkError, Result};
