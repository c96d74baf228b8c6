//! Proctor-side coordinator for live exam sessions.
//!
//! Watches several candidates at once: keeps each session's recorded segment playlist and a
//! small blob cache, infers feed liveness from segment capture times, polls the chat/warning
//! feed with dedup, and reconciles a per-session dashboard view on a fixed tick.

pub mod api;
pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod server;
pub mod source;
