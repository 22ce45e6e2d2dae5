//! `utils` is intended to be a place to put code that is shared
//! between the other crates in this repository.

/// Retry helpers with capped exponential backoff.
pub mod backoff;

/// HTTP server scaffolding: router construction, typed errors, JSON bodies.
pub mod http;

/// Tracing setup for stdout or day-rotated log files.
pub mod logging;

/// Process shutdown signals.
pub mod signals;
