#![forbid(unsafe_code)]

pub mod analytics;
pub mod time;
pub mod utd_tracker;
