// Engine: per-session playlists, segment cache, liveness, message polling and the coordinator loop.

pub mod alerts;
pub mod cache;
pub mod coordinator;
pub mod events;
pub mod fetcher;
pub mod liveness;
pub mod playlist;
pub mod poller;
pub mod session;
pub mod stats;
pub mod view;
