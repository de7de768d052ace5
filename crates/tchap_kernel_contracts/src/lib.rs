#![forbid(unsafe_code)]

pub mod common;
pub mod utd;

pub use common::{ContractViolation, SchemaVersion, UnixTimeMs, Validate};
