#![forbid(unsafe_code)]

pub mod clock;
pub mod utd_service;
