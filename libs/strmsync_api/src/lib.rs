#![deny(unsafe_code)]

/// Public API types
pub mod models;

pub const DEFAULT_API_HOST: &str = "0.0.0.0";
pub const DEFAULT_API_PORT: u16 = 9001;
