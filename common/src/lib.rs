//! Provides functions common to the kangal binaries.
#![deny(missing_docs)]
pub mod telemetry;
