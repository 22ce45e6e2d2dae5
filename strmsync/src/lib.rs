//! strmsync mirrors a remote cloud filesystem (exposed by an Alist-style
//! HTTP API) into a local tree of `.strm` locator files that media players
//! dereference at playback time, optionally downloading auxiliary assets
//! such as subtitles and artwork next to them.
//!
//! Synchronizations are driven by three triggers: per-source cron schedules,
//! the control API, and a webhook fed by external media managers. All three
//! funnel into the task supervisor, which admits at most one mirror run at a
//! time.

pub mod alist;
pub mod config;
pub mod fetch;
pub mod http;
pub mod mirror;
pub mod notify;
pub mod plan;
pub mod scheduler;
pub mod supervisor;

pub const PRODUCT_NAME: &str = "strmsync";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
