//! Observer core: seen-set deduplication, the geo-diverse peer pool,
//! node discovery and per-peer sessions.
//!
//! The supervisor binary wires these together: discovery fills the pool,
//! the slot-maintenance loop keeps one session per region alive, and every
//! session records what it hears through the storage contract.

pub mod config;
pub mod dedup;
pub mod discovery;
pub mod pool;
pub mod session;

pub use config::ObserverConfig;
pub use dedup::{spawn_sweeper, SeenCaches, SeenSet, SEEN_EXPIRY, SWEEP_INTERVAL};
pub use discovery::{spawn_refresh_loop, Discovery, DiscoveryError};
pub use pool::{PeerEndpoint, PeerPool, PoolPolicy};
pub use session::{
    frame_stream, observe_peer, perform_handshake, run_message_loop, spawn_slot_maintenance,
    spawn_status_reporter, SessionError, SessionHandles,
};
