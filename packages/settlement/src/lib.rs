//! FXRP Settlement - Library interface
//!
//! Re-exports internal modules for use in integration tests.

pub mod admission;
pub mod amounts;
pub mod api;
pub mod attestation;
pub mod bridge;
pub mod cancellation;
pub mod config;
pub mod db;
pub mod error;
pub mod evm;
pub mod metrics;
pub mod payment;
pub mod recovery;
pub mod redemption;
pub mod retry;
pub mod strategy;
pub mod testing;
pub mod types;
pub mod vaults;
pub mod worker;
pub mod xrpl;
