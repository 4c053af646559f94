//! Provides types and functions common to the engine library and its driver binary.
#![deny(missing_docs)]
pub mod load_profile;
#[cfg(feature = "telemetry")]
pub mod telemetry;
