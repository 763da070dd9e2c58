//! In-memory store backend.
//!
//! Reproduces the relational semantics of the production schema in process
//! memory: upserts, spent-output marking, fee resolution, double-spend
//! flagging and confirmation idempotence. The test suites run against it,
//! and it doubles as a backend for database-less dry runs.

use std::collections::HashMap;

use chrono::{NaiveDateTime, Utc};
use parking_lot::Mutex;

use async_trait::async_trait;
use chainwatch_protocol::{extract_address, Block, Hash256, Transaction, VersionMessage};

use crate::{GeoInfo, ObserverStore, StorageResult, StoreTotals};

/// Peer bookkeeping row.
#[derive(Debug, Clone)]
pub struct PeerRow {
    pub first_connected: NaiveDateTime,
    pub last_seen: NaiveDateTime,
    pub protocol_version: i32,
    pub user_agent: String,
    pub services: u64,
    pub connection_count: u64,
    pub geo: Option<GeoInfo>,
    pub tx_announcements: i64,
    pub block_announcements: i64,
    pub avg_latency_ms: Option<i64>,
}

/// First-seen observation of a transaction hash.
#[derive(Debug, Clone)]
pub struct ObservationRow {
    pub first_seen: NaiveDateTime,
    pub first_peer: String,
    pub peer_count: u64,
    pub in_block: Option<Hash256>,
    pub confirmed_at: Option<NaiveDateTime>,
    pub replaced_by: Option<Hash256>,
    pub double_spend: bool,
}

/// One per-peer announcement of a transaction.
#[derive(Debug, Clone)]
pub struct PropagationEvent {
    pub tx_hash: Hash256,
    pub peer_addr: String,
    pub announced_at: NaiveDateTime,
    pub delay_from_first_ms: i64,
}

/// Stored transaction attributes.
#[derive(Debug, Clone)]
pub struct TransactionRow {
    pub size_bytes: usize,
    pub weight: usize,
    pub input_count: usize,
    pub output_count: usize,
    pub total_output: i64,
    pub total_input: Option<i64>,
    pub fee: Option<i64>,
    pub block_hash: Option<Hash256>,
    pub block_height: Option<i32>,
}

/// Stored output; spent-markers make the UTXO view queryable.
#[derive(Debug, Clone)]
pub struct OutputRow {
    pub value: i64,
    pub address: Option<String>,
    pub spent_in: Option<Hash256>,
    pub spent_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone)]
struct InputRow {
    prev_hash: Hash256,
    prev_index: u32,
    address: Option<String>,
    value: Option<i64>,
}

/// Stored block header attributes.
#[derive(Debug, Clone)]
pub struct BlockRow {
    pub height: i32,
    pub prev_block_hash: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: NaiveDateTime,
    pub difficulty: f64,
    pub nonce: u32,
    pub tx_count: usize,
    pub first_seen: NaiveDateTime,
    pub first_peer: String,
}

#[derive(Default)]
struct Inner {
    peers: HashMap<String, PeerRow>,
    observations: HashMap<Hash256, ObservationRow>,
    propagation: Vec<PropagationEvent>,
    transactions: HashMap<Hash256, TransactionRow>,
    inputs: HashMap<(Hash256, usize), InputRow>,
    outputs: HashMap<(Hash256, u32), OutputRow>,
    /// Outpoint -> distinct transactions claiming it.
    spenders: HashMap<(Hash256, u32), Vec<Hash256>>,
    blocks: HashMap<Hash256, BlockRow>,
}

/// In-memory [`ObserverStore`] backend.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    // Inspection helpers for tests and tooling.

    pub fn peer(&self, addr: &str) -> Option<PeerRow> {
        self.inner.lock().peers.get(addr).cloned()
    }

    pub fn observation(&self, tx_hash: &Hash256) -> Option<ObservationRow> {
        self.inner.lock().observations.get(tx_hash).cloned()
    }

    pub fn propagation_events(&self, tx_hash: &Hash256) -> Vec<PropagationEvent> {
        self.inner
            .lock()
            .propagation
            .iter()
            .filter(|event| event.tx_hash == *tx_hash)
            .cloned()
            .collect()
    }

    pub fn transaction_row(&self, txid: &Hash256) -> Option<TransactionRow> {
        self.inner.lock().transactions.get(txid).cloned()
    }

    pub fn output(&self, txid: &Hash256, index: u32) -> Option<OutputRow> {
        self.inner.lock().outputs.get(&(*txid, index)).cloned()
    }

    pub fn block_row(&self, hash: &Hash256) -> Option<BlockRow> {
        self.inner.lock().blocks.get(hash).cloned()
    }
}

#[async_trait]
impl ObserverStore for MemoryStore {
    async fn record_peer_connection(
        &self,
        peer_addr: &str,
        version: &VersionMessage,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let at = now();
        inner
            .peers
            .entry(peer_addr.to_string())
            .and_modify(|row| {
                row.last_seen = at;
                row.protocol_version = version.version;
                row.user_agent = version.user_agent.clone();
                row.services = version.services;
                row.connection_count += 1;
            })
            .or_insert_with(|| PeerRow {
                first_connected: at,
                last_seen: at,
                protocol_version: version.version,
                user_agent: version.user_agent.clone(),
                services: version.services,
                connection_count: 1,
                geo: None,
                tx_announcements: 0,
                block_announcements: 0,
                avg_latency_ms: None,
            });
        Ok(())
    }

    async fn update_peer_geo_info(&self, peer_addr: &str, geo: &GeoInfo) -> StorageResult<()> {
        if let Some(row) = self.inner.lock().peers.get_mut(peer_addr) {
            row.geo = Some(geo.clone());
        }
        Ok(())
    }

    async fn increment_peer_announcements(
        &self,
        peer_addr: &str,
        tx_count: i64,
        block_count: i64,
    ) -> StorageResult<()> {
        if let Some(row) = self.inner.lock().peers.get_mut(peer_addr) {
            row.tx_announcements += tx_count;
            row.block_announcements += block_count;
            row.last_seen = now();
        }
        Ok(())
    }

    async fn update_peer_latency(&self, peer_addr: &str, latency_ms: i64) -> StorageResult<()> {
        if let Some(row) = self.inner.lock().peers.get_mut(peer_addr) {
            row.avg_latency_ms = Some(match row.avg_latency_ms {
                None => latency_ms,
                Some(previous) => (previous + latency_ms) / 2,
            });
            row.last_seen = now();
        }
        Ok(())
    }

    async fn record_observation(&self, tx_hash: &Hash256, peer_addr: &str) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let at = now();

        let delay_ms = match inner.observations.get_mut(tx_hash) {
            Some(row) => {
                row.peer_count += 1;
                (at - row.first_seen).num_milliseconds().max(0)
            }
            None => {
                inner.observations.insert(
                    *tx_hash,
                    ObservationRow {
                        first_seen: at,
                        first_peer: peer_addr.to_string(),
                        peer_count: 1,
                        in_block: None,
                        confirmed_at: None,
                        replaced_by: None,
                        double_spend: false,
                    },
                );
                0
            }
        };

        inner.propagation.push(PropagationEvent {
            tx_hash: *tx_hash,
            peer_addr: peer_addr.to_string(),
            announced_at: at,
            delay_from_first_ms: delay_ms,
        });
        Ok(())
    }

    async fn record_transaction(&self, tx: &Transaction) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let at = now();

        inner
            .transactions
            .entry(tx.txid)
            .or_insert_with(|| TransactionRow {
                size_bytes: tx.size_bytes,
                weight: tx.weight(),
                input_count: tx.inputs.len(),
                output_count: tx.outputs.len(),
                total_output: tx.total_output(),
                total_input: None,
                fee: None,
                block_hash: None,
                block_height: None,
            });

        let mut total_input = 0i64;
        let mut inputs_found = 0usize;

        for (index, input) in tx.inputs.iter().enumerate() {
            let outpoint = (input.prev_hash, input.prev_index);

            let (address, value) = match inner.outputs.get(&outpoint) {
                Some(out) => (out.address.clone(), Some(out.value)),
                None => (None, None),
            };
            if let Some(v) = value {
                total_input += v;
                inputs_found += 1;
            }

            inner.inputs.entry((tx.txid, index)).or_insert(InputRow {
                prev_hash: input.prev_hash,
                prev_index: input.prev_index,
                address,
                value,
            });

            let claimants = inner.spenders.entry(outpoint).or_default();
            if !claimants.contains(&tx.txid) {
                claimants.push(tx.txid);
            }

            if let Some(out) = inner.outputs.get_mut(&outpoint) {
                if out.spent_in.is_none() {
                    out.spent_in = Some(tx.txid);
                    out.spent_at = Some(at);
                }
            }
        }

        if inputs_found == tx.inputs.len() && total_input > 0 {
            if let Some(row) = inner.transactions.get_mut(&tx.txid) {
                row.total_input = Some(total_input);
                row.fee = Some(total_input - tx.total_output());
            }
        }

        for (index, output) in tx.outputs.iter().enumerate() {
            inner
                .outputs
                .entry((tx.txid, index as u32))
                .or_insert_with(|| OutputRow {
                    value: output.value,
                    address: extract_address(&output.script_pubkey),
                    spent_in: None,
                    spent_at: None,
                });
        }

        Ok(())
    }

    async fn record_block(&self, block: &Block, peer_addr: &str) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let timestamp = chrono::DateTime::from_timestamp(i64::from(block.header.timestamp), 0)
            .map(|dt| dt.naive_utc())
            .unwrap_or_else(now);
        inner.blocks.entry(block.hash).or_insert_with(|| BlockRow {
            height: block.height,
            prev_block_hash: block.header.prev_block_hash,
            merkle_root: block.header.merkle_root,
            timestamp,
            difficulty: block.difficulty,
            nonce: block.header.nonce,
            tx_count: block.transactions.len(),
            first_seen: now(),
            first_peer: peer_addr.to_string(),
        });
        Ok(())
    }

    async fn confirm_transactions(
        &self,
        block_hash: &Hash256,
        height: i32,
        block_time: NaiveDateTime,
        tx_hashes: &[Hash256],
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        for tx_hash in tx_hashes {
            if let Some(row) = inner.transactions.get_mut(tx_hash) {
                if row.block_hash.is_none() {
                    row.block_hash = Some(*block_hash);
                    row.block_height = Some(height);
                }
            }
            if let Some(row) = inner.observations.get_mut(tx_hash) {
                if row.in_block.is_none() {
                    row.in_block = Some(*block_hash);
                    row.confirmed_at = Some(block_time);
                }
            }
        }
        Ok(())
    }

    async fn detect_input_conflicts(&self, tx: &Transaction) -> StorageResult<usize> {
        let mut inner = self.inner.lock();

        let mut conflicting: Vec<Hash256> = Vec::new();
        for input in &tx.inputs {
            if input.is_coinbase() {
                continue;
            }
            let outpoint = (input.prev_hash, input.prev_index);
            let Some(claimants) = inner.spenders.get(&outpoint) else {
                continue;
            };
            for claimant in claimants {
                if *claimant == tx.txid || conflicting.contains(claimant) {
                    continue;
                }
                let unconfirmed = inner
                    .transactions
                    .get(claimant)
                    .map(|row| row.block_hash.is_none())
                    .unwrap_or(false);
                if unconfirmed {
                    conflicting.push(*claimant);
                }
            }
        }

        if conflicting.is_empty() {
            return Ok(0);
        }

        for old_txid in &conflicting {
            if let Some(row) = inner.observations.get_mut(old_txid) {
                if row.replaced_by.is_none() {
                    row.replaced_by = Some(tx.txid);
                    row.double_spend = true;
                }
            }
        }
        if let Some(row) = inner.observations.get_mut(&tx.txid) {
            row.double_spend = true;
        }

        Ok(conflicting.len())
    }

    async fn totals(&self) -> StorageResult<StoreTotals> {
        let inner = self.inner.lock();
        Ok(StoreTotals {
            observations: inner.observations.len() as u64,
            transactions: inner.transactions.len() as u64,
            conflicts: inner
                .observations
                .values()
                .filter(|row| row.double_spend)
                .count() as u64,
            blocks: inner.blocks.len() as u64,
            best_height: inner
                .blocks
                .values()
                .map(|row| i64::from(row.height))
                .max(),
            tx_announcements: inner
                .peers
                .values()
                .map(|row| row.tx_announcements.max(0) as u64)
                .sum(),
            block_announcements: inner
                .peers
                .values()
                .map(|row| row.block_announcements.max(0) as u64)
                .sum(),
        })
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}
