//! Persistence contract for the observer core.
//!
//! The core records peers, first-seen observations, propagation timing,
//! transactions, blocks and double-spend conflicts through the narrow
//! [`ObserverStore`] trait; everything else about the relational engine is
//! somebody else's problem. Two backends are provided: [`MemoryStore`]
//! reproduces the relational semantics in-process (tests, dry runs) and
//! [`PostgresStore`] speaks to the production database.

pub mod error;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::NaiveDateTime;

use chainwatch_protocol::{Block, Hash256, Transaction, VersionMessage};

pub use error::{StorageError, StorageResult};
pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Geolocation attributes attached to a peer after the handshake.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoInfo {
    pub country_code: String,
    pub city: String,
    /// Region tag the pool manages this peer under.
    pub region: String,
    pub latitude: f64,
    pub longitude: f64,
    pub asn: String,
    pub org_name: String,
}

/// Aggregate totals used to seed metric counters at startup, so process
/// restarts do not reset the exported series.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreTotals {
    pub observations: u64,
    pub transactions: u64,
    pub conflicts: u64,
    pub blocks: u64,
    pub best_height: Option<i64>,
    pub tx_announcements: u64,
    pub block_announcements: u64,
}

/// The persistence operations the observer core depends on.
///
/// Multi-row writes are atomic per call. Implementations must be safe for
/// concurrent use from every peer session.
#[async_trait]
pub trait ObserverStore: Send + Sync {
    /// Upserts a peer row: created with connection-count 1, otherwise
    /// refreshed (last-seen, version fields) with the count incremented.
    async fn record_peer_connection(
        &self,
        peer_addr: &str,
        version: &VersionMessage,
    ) -> StorageResult<()>;

    /// Overwrites the peer's geolocation columns.
    async fn update_peer_geo_info(&self, peer_addr: &str, geo: &GeoInfo) -> StorageResult<()>;

    /// Atomically adds to the announcement counters and refreshes
    /// last-seen.
    async fn increment_peer_announcements(
        &self,
        peer_addr: &str,
        tx_count: i64,
        block_count: i64,
    ) -> StorageResult<()>;

    /// First sample sets the latency; later samples store the running
    /// mean of previous and new.
    async fn update_peer_latency(&self, peer_addr: &str, latency_ms: i64) -> StorageResult<()>;

    /// Upserts the observation row for `tx_hash` and appends a propagation
    /// event whose delay is measured from the observation's first-seen
    /// time (zero when this call created the row).
    async fn record_observation(&self, tx_hash: &Hash256, peer_addr: &str) -> StorageResult<()>;

    /// Inserts the transaction with its inputs and outputs, denormalizing
    /// referenced output values, marking spent outputs and computing the
    /// fee when every input resolved.
    async fn record_transaction(&self, tx: &Transaction) -> StorageResult<()>;

    /// Inserts the block header with first-seen attribution.
    async fn record_block(&self, block: &Block, peer_addr: &str) -> StorageResult<()>;

    /// Marks the listed transactions and their observations as confirmed
    /// by `block_hash`, only where not already confirmed.
    async fn confirm_transactions(
        &self,
        block_hash: &Hash256,
        height: i32,
        block_time: NaiveDateTime,
        tx_hashes: &[Hash256],
    ) -> StorageResult<()>;

    /// Finds unconfirmed transactions spending any of `tx`'s outpoints and
    /// flags both sides as a double-spend, recording which transaction
    /// superseded which. Coinbase inputs are skipped. Returns the number
    /// of conflicting transactions flagged.
    async fn detect_input_conflicts(&self, tx: &Transaction) -> StorageResult<usize>;

    /// Aggregate totals for metric seeding.
    async fn totals(&self) -> StorageResult<StoreTotals>;

    /// Releases the backend.
    async fn close(&self) -> StorageResult<()>;
}
