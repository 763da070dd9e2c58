//! PostgreSQL store backend.
//!
//! A single client guarded by an async mutex; multi-statement operations
//! run inside database transactions so partial writes never become
//! visible. The connection driver runs on its own task.

use chrono::NaiveDateTime;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error};

use async_trait::async_trait;
use chainwatch_protocol::{extract_address, Block, Hash256, Transaction, VersionMessage};

use crate::{GeoInfo, ObserverStore, StorageResult, StoreTotals};

const SCHEMA: &str = include_str!("../schema.sql");

/// PostgreSQL-backed [`ObserverStore`].
pub struct PostgresStore {
    client: Mutex<Client>,
}

impl PostgresStore {
    /// Connects and spawns the connection driver task. Fails fast when the
    /// database is unreachable; the caller treats that as fatal.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        dbname: &str,
    ) -> StorageResult<Self> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(host)
            .port(port)
            .user(user)
            .password(password)
            .dbname(dbname);

        let (client, connection) = config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!(error = %err, "database connection terminated");
            }
        });

        Ok(PostgresStore {
            client: Mutex::new(client),
        })
    }

    /// Creates tables and indexes if they do not exist yet.
    pub async fn ensure_schema(&self) -> StorageResult<()> {
        self.client.lock().await.batch_execute(SCHEMA).await?;
        debug!("schema ensured");
        Ok(())
    }
}

#[async_trait]
impl ObserverStore for PostgresStore {
    async fn record_peer_connection(
        &self,
        peer_addr: &str,
        version: &VersionMessage,
    ) -> StorageResult<()> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO peer_connections \
                     (peer_addr, first_connected_at, last_seen_at, protocol_version, \
                      user_agent, services, connection_count) \
                 VALUES ($1, NOW(), NOW(), $2, $3, $4, 1) \
                 ON CONFLICT (peer_addr) DO UPDATE SET \
                     last_seen_at = NOW(), \
                     protocol_version = $2, \
                     user_agent = $3, \
                     services = $4, \
                     connection_count = peer_connections.connection_count + 1",
                &[
                    &peer_addr,
                    &version.version,
                    &version.user_agent,
                    &(version.services as i64),
                ],
            )
            .await?;
        Ok(())
    }

    async fn update_peer_geo_info(&self, peer_addr: &str, geo: &GeoInfo) -> StorageResult<()> {
        let client = self.client.lock().await;
        client
            .execute(
                "UPDATE peer_connections SET \
                     country_code = $2, \
                     city = $3, \
                     region = $4, \
                     latitude = $5, \
                     longitude = $6, \
                     asn = $7, \
                     org_name = $8 \
                 WHERE peer_addr = $1",
                &[
                    &peer_addr,
                    &geo.country_code,
                    &geo.city,
                    &geo.region,
                    &geo.latitude,
                    &geo.longitude,
                    &geo.asn,
                    &geo.org_name,
                ],
            )
            .await?;
        Ok(())
    }

    async fn increment_peer_announcements(
        &self,
        peer_addr: &str,
        tx_count: i64,
        block_count: i64,
    ) -> StorageResult<()> {
        let client = self.client.lock().await;
        client
            .execute(
                "UPDATE peer_connections SET \
                     tx_announcements = COALESCE(tx_announcements, 0) + $2, \
                     block_announcements = COALESCE(block_announcements, 0) + $3, \
                     last_seen_at = NOW() \
                 WHERE peer_addr = $1",
                &[&peer_addr, &tx_count, &block_count],
            )
            .await?;
        Ok(())
    }

    async fn update_peer_latency(&self, peer_addr: &str, latency_ms: i64) -> StorageResult<()> {
        let client = self.client.lock().await;
        client
            .execute(
                "UPDATE peer_connections SET \
                     avg_latency_ms = CASE \
                         WHEN avg_latency_ms IS NULL THEN $2 \
                         ELSE (avg_latency_ms + $2) / 2 \
                     END, \
                     last_seen_at = NOW() \
                 WHERE peer_addr = $1",
                &[&peer_addr, &latency_ms],
            )
            .await?;
        Ok(())
    }

    async fn record_observation(&self, tx_hash: &Hash256, peer_addr: &str) -> StorageResult<()> {
        let hash: &[u8] = tx_hash.as_bytes();
        let mut client = self.client.lock().await;
        let db_tx = client.transaction().await?;

        db_tx
            .execute(
                "INSERT INTO transaction_observations (tx_hash, first_seen_at, first_peer_addr) \
                 VALUES ($1, NOW(), $2) \
                 ON CONFLICT (tx_hash) DO UPDATE SET \
                     peer_count = transaction_observations.peer_count + 1",
                &[&hash, &peer_addr],
            )
            .await?;

        db_tx
            .execute(
                "INSERT INTO propagation_events \
                     (tx_hash, peer_addr, announcement_time, delay_from_first_ms) \
                 VALUES ($1, $2, NOW(), \
                     COALESCE( \
                         EXTRACT(EPOCH FROM (NOW() - (SELECT first_seen_at \
                             FROM transaction_observations WHERE tx_hash = $1))) * 1000, \
                         0 \
                     )::INT \
                 )",
                &[&hash, &peer_addr],
            )
            .await?;

        db_tx.commit().await?;
        Ok(())
    }

    async fn record_transaction(&self, tx: &Transaction) -> StorageResult<()> {
        let txid: &[u8] = tx.txid.as_bytes();
        let total_output = tx.total_output();

        let mut client = self.client.lock().await;
        let db_tx = client.transaction().await?;

        db_tx
            .execute(
                "INSERT INTO transactions \
                     (tx_hash, size_bytes, weight, input_count, output_count, total_output) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT DO NOTHING",
                &[
                    &txid,
                    &(tx.size_bytes as i32),
                    &(tx.weight() as i32),
                    &(tx.inputs.len() as i32),
                    &(tx.outputs.len() as i32),
                    &total_output,
                ],
            )
            .await?;

        let mut total_input = 0i64;
        let mut inputs_found = 0usize;

        for (index, input) in tx.inputs.iter().enumerate() {
            let prev_hash: &[u8] = input.prev_hash.as_bytes();
            let prev_index = i64::from(input.prev_index);

            let referenced = db_tx
                .query_opt(
                    "SELECT address, value_satoshis FROM transaction_outputs \
                     WHERE tx_hash = $1 AND output_index = $2",
                    &[&prev_hash, &prev_index],
                )
                .await?;
            let (address, value): (Option<String>, Option<i64>) = match referenced {
                Some(row) => (row.get(0), row.get(1)),
                None => (None, None),
            };
            if let Some(v) = value {
                total_input += v;
                inputs_found += 1;
            }

            db_tx
                .execute(
                    "INSERT INTO transaction_inputs \
                         (tx_hash, input_index, prev_tx_hash, prev_output_idx, script_sig, \
                          address, value_satoshis) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7) \
                     ON CONFLICT DO NOTHING",
                    &[
                        &txid,
                        &(index as i32),
                        &prev_hash,
                        &prev_index,
                        &input.script_sig.as_slice(),
                        &address,
                        &value,
                    ],
                )
                .await?;

            db_tx
                .execute(
                    "UPDATE transaction_outputs \
                     SET spent_in_tx = $1, spent_at = NOW() \
                     WHERE tx_hash = $2 AND output_index = $3 AND spent_in_tx IS NULL",
                    &[&txid, &prev_hash, &prev_index],
                )
                .await?;
        }

        if inputs_found == tx.inputs.len() && total_input > 0 {
            let fee = total_input - total_output;
            db_tx
                .execute(
                    "UPDATE transactions SET total_input = $2, fee_satoshis = $3 \
                     WHERE tx_hash = $1",
                    &[&txid, &total_input, &fee],
                )
                .await?;
        }

        for (index, output) in tx.outputs.iter().enumerate() {
            let address = extract_address(&output.script_pubkey);
            db_tx
                .execute(
                    "INSERT INTO transaction_outputs \
                         (tx_hash, output_index, value_satoshis, script_pubkey, address) \
                     VALUES ($1, $2, $3, $4, $5) \
                     ON CONFLICT DO NOTHING",
                    &[
                        &txid,
                        &(index as i64),
                        &output.value,
                        &output.script_pubkey.as_slice(),
                        &address,
                    ],
                )
                .await?;
        }

        db_tx.commit().await?;
        Ok(())
    }

    async fn record_block(&self, block: &Block, peer_addr: &str) -> StorageResult<()> {
        let block_hash: &[u8] = block.hash.as_bytes();
        let prev_hash: &[u8] = block.header.prev_block_hash.as_bytes();
        let merkle_root: &[u8] = block.header.merkle_root.as_bytes();
        let timestamp = chrono::DateTime::from_timestamp(i64::from(block.header.timestamp), 0)
            .map(|dt| dt.naive_utc())
            .unwrap_or_else(|| chrono::Utc::now().naive_utc());

        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO blocks \
                     (block_hash, height, prev_block_hash, merkle_root, timestamp, difficulty, \
                      nonce, tx_count, first_seen_at, first_peer_addr) \
                 VALUES ($1, $2, $3, $4, $5, CAST($6 AS NUMERIC), $7, $8, NOW(), $9) \
                 ON CONFLICT DO NOTHING",
                &[
                    &block_hash,
                    &block.height,
                    &prev_hash,
                    &merkle_root,
                    &timestamp,
                    &block.difficulty,
                    &i64::from(block.header.nonce),
                    &(block.transactions.len() as i32),
                    &peer_addr,
                ],
            )
            .await?;
        Ok(())
    }

    async fn confirm_transactions(
        &self,
        block_hash: &Hash256,
        height: i32,
        block_time: NaiveDateTime,
        tx_hashes: &[Hash256],
    ) -> StorageResult<()> {
        let block: &[u8] = block_hash.as_bytes();
        let mut client = self.client.lock().await;
        let db_tx = client.transaction().await?;

        for tx_hash in tx_hashes {
            let hash: &[u8] = tx_hash.as_bytes();
            db_tx
                .execute(
                    "UPDATE transactions SET block_hash = $1, block_height = $2 \
                     WHERE tx_hash = $3 AND block_hash IS NULL",
                    &[&block, &height, &hash],
                )
                .await?;

            db_tx
                .execute(
                    "UPDATE transaction_observations \
                     SET in_block_hash = $1, confirmed_at = $2 \
                     WHERE tx_hash = $3 AND in_block_hash IS NULL",
                    &[&block, &block_time, &hash],
                )
                .await?;
        }

        db_tx.commit().await?;
        Ok(())
    }

    async fn detect_input_conflicts(&self, tx: &Transaction) -> StorageResult<usize> {
        let txid: &[u8] = tx.txid.as_bytes();
        let mut client = self.client.lock().await;

        let mut conflicting: Vec<Vec<u8>> = Vec::new();
        for input in &tx.inputs {
            if input.is_coinbase() {
                continue;
            }
            let prev_hash: &[u8] = input.prev_hash.as_bytes();
            let prev_index = i64::from(input.prev_index);

            let rows = client
                .query(
                    "SELECT DISTINCT ti.tx_hash \
                     FROM transaction_inputs ti \
                     JOIN transactions t ON ti.tx_hash = t.tx_hash \
                     WHERE ti.prev_tx_hash = $1 AND ti.prev_output_idx = $2 \
                       AND t.block_hash IS NULL \
                       AND ti.tx_hash != $3",
                    &[&prev_hash, &prev_index, &txid],
                )
                .await?;
            for row in rows {
                let hash: Vec<u8> = row.get(0);
                if !conflicting.contains(&hash) {
                    conflicting.push(hash);
                }
            }
        }

        if conflicting.is_empty() {
            return Ok(0);
        }

        let db_tx = client.transaction().await?;
        for old_hash in &conflicting {
            db_tx
                .execute(
                    "UPDATE transaction_observations \
                     SET replaced_by_tx = $1, double_spend_flag = TRUE \
                     WHERE tx_hash = $2 AND replaced_by_tx IS NULL",
                    &[&txid, &old_hash.as_slice()],
                )
                .await?;
        }
        db_tx
            .execute(
                "UPDATE transaction_observations \
                 SET double_spend_flag = TRUE \
                 WHERE tx_hash = $1",
                &[&txid],
            )
            .await?;
        db_tx.commit().await?;

        Ok(conflicting.len())
    }

    async fn totals(&self) -> StorageResult<StoreTotals> {
        let client = self.client.lock().await;
        let row = client
            .query_one(
                "SELECT \
                     COALESCE((SELECT COUNT(*) FROM transaction_observations), 0), \
                     COALESCE((SELECT COUNT(*) FROM transactions), 0), \
                     COALESCE((SELECT COUNT(*) FROM transaction_observations \
                         WHERE double_spend_flag = TRUE), 0), \
                     COALESCE((SELECT COUNT(*) FROM blocks), 0), \
                     (SELECT MAX(height)::BIGINT FROM blocks), \
                     COALESCE((SELECT SUM(COALESCE(tx_announcements, 0))::BIGINT \
                         FROM peer_connections), 0), \
                     COALESCE((SELECT SUM(COALESCE(block_announcements, 0))::BIGINT \
                         FROM peer_connections), 0)",
                &[],
            )
            .await?;

        let observations: i64 = row.get(0);
        let transactions: i64 = row.get(1);
        let conflicts: i64 = row.get(2);
        let blocks: i64 = row.get(3);
        let best_height: Option<i64> = row.get(4);
        let tx_announcements: i64 = row.get(5);
        let block_announcements: i64 = row.get(6);

        Ok(StoreTotals {
            observations: observations.max(0) as u64,
            transactions: transactions.max(0) as u64,
            conflicts: conflicts.max(0) as u64,
            blocks: blocks.max(0) as u64,
            best_height,
            tx_announcements: tx_announcements.max(0) as u64,
            block_announcements: block_announcements.max(0) as u64,
        })
    }

    async fn close(&self) -> StorageResult<()> {
        // Dropping the client tears the connection down; nothing to flush.
        debug!("closing database client");
        Ok(())
    }
}
