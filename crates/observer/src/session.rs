//! Per-peer session: dial, handshake, message loop, keepalive.
//!
//! A session exclusively owns its connection. Failures never cross the
//! session boundary: dial and handshake failures mark the endpoint in the
//! pool, store errors are logged and the loop keeps reading, malformed
//! `tx`/`block` payloads are skipped. Only framing-level errors, timeouts,
//! EOF and cancellation end the loop.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use rand::RngCore;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use chainwatch_monitoring as metrics;
use chainwatch_protocol::{
    encode_inv_payload, parse_inv_payload, Block, FrameCodec, InvSummary, InvVector,
    ProtocolError, RawMessage, Transaction, VersionMessage,
};
use chainwatch_storage::{ObserverStore, StorageResult};

use crate::dedup::SeenCaches;
use crate::pool::{PeerEndpoint, PeerPool};

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(15);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-read deadline in the active loop.
pub const READ_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Status line and keepalive ping cadence.
pub const STATUS_INTERVAL: Duration = Duration::from_secs(60);
/// Sessions shorter than this count as suspicious disconnects.
pub const SHORT_SESSION: Duration = Duration::from_secs(60);
/// Supervisor poll for under-provisioned regions.
pub const SLOT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Errors that end a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("peer closed the connection")]
    PeerClosed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Shared handles a session needs; cheap to clone per spawned task.
#[derive(Clone)]
pub struct SessionHandles {
    pub pool: Arc<PeerPool>,
    pub seen: Arc<SeenCaches>,
    pub store: Arc<dyn ObserverStore>,
    pub token: CancellationToken,
}

/// Times a store call and counts failures, per operation label.
async fn timed<T, F>(op: &'static str, fut: F) -> StorageResult<T>
where
    F: Future<Output = StorageResult<T>>,
{
    let timer = metrics::STORE_QUERY_DURATION
        .with_label_values(&[op])
        .start_timer();
    let result = fut.await;
    drop(timer);
    if result.is_err() {
        metrics::STORE_ERRORS.with_label_values(&[op]).inc();
    }
    result
}

/// Dials the endpoint and runs the full session lifecycle.
pub async fn observe_peer(handles: SessionHandles, region: String, endpoint: Arc<PeerEndpoint>) {
    let addr = endpoint.addr();
    info!(
        region = %region,
        peer = %addr,
        city = %endpoint.city,
        country = %endpoint.country_code,
        "connecting"
    );
    metrics::PEER_CONNECTIONS.inc();

    let stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            warn!(region = %region, peer = %addr, error = %err, "connection failed");
            handles.pool.mark_failed(&addr);
            return;
        }
        Err(_) => {
            warn!(region = %region, peer = %addr, "connection timed out");
            handles.pool.mark_failed(&addr);
            return;
        }
    };

    let mut framed = Framed::new(stream, FrameCodec::new());
    match timeout(
        HANDSHAKE_TIMEOUT,
        perform_handshake(&mut framed, &endpoint, &handles.store),
    )
    .await
    {
        Ok(Ok(version)) => {
            debug!(peer = %addr, agent = %version.user_agent, "handshake complete");
        }
        Ok(Err(err)) => {
            warn!(region = %region, peer = %addr, error = %err, "handshake failed");
            metrics::HANDSHAKE_FAILURES.inc();
            handles.pool.mark_failed(&addr);
            return;
        }
        Err(_) => {
            warn!(region = %region, peer = %addr, "handshake timed out");
            metrics::HANDSHAKE_FAILURES.inc();
            handles.pool.mark_failed(&addr);
            return;
        }
    }

    if let Err(err) = timed(
        "update_peer_geo_info",
        handles
            .store
            .update_peer_geo_info(&addr, &endpoint.geo_info(&region)),
    )
    .await
    {
        error!(peer = %addr, error = %err, "store update_peer_geo_info failed");
    }

    handles.pool.set_active(&region, &addr);
    metrics::PEERS_ACTIVE.inc();
    metrics::PEERS_BY_REGION.with_label_values(&[&region]).inc();
    info!(
        region = %region,
        peer = %addr,
        city = %endpoint.city,
        country = %endpoint.country_code,
        "connected"
    );
    let connected_at = Instant::now();

    run_message_loop(framed, &addr, &region, &handles).await;

    handles.pool.remove_active(&region, &addr);
    metrics::PEERS_ACTIVE.dec();
    metrics::PEERS_BY_REGION.with_label_values(&[&region]).dec();
    metrics::PEER_DISCONNECTIONS.inc();

    if connected_at.elapsed() < SHORT_SESSION {
        handles.pool.mark_disconnect(&addr);
        warn!(region = %region, peer = %addr, "disconnected (short-lived)");
    } else {
        info!(region = %region, peer = %addr, "disconnected");
    }
}

/// Version/verack exchange. Records the peer's version row as soon as it
/// arrives; a store error does not fail the handshake.
pub async fn perform_handshake<S>(
    framed: &mut Framed<S, FrameCodec>,
    endpoint: &PeerEndpoint,
    store: &Arc<dyn ObserverStore>,
) -> Result<VersionMessage, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote_ip: IpAddr = endpoint
        .host
        .parse()
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let local = VersionMessage::for_peer(remote_ip, endpoint.port, chrono::Utc::now().timestamp());
    framed
        .send(RawMessage::new("version", local.encode()))
        .await?;

    let msg = framed.next().await.ok_or(SessionError::PeerClosed)??;
    let peer_version = VersionMessage::parse(&msg.payload)?;
    if let Err(err) = timed(
        "record_peer_connection",
        store.record_peer_connection(&endpoint.addr(), &peer_version),
    )
    .await
    {
        error!(peer = %endpoint.addr(), error = %err, "store record_peer_connection failed");
    }

    framed.send(RawMessage::new("verack", Vec::new())).await?;

    // The peer's verack; any message completes the exchange.
    framed.next().await.ok_or(SessionError::PeerClosed)??;

    Ok(peer_version)
}

#[derive(Default)]
struct TickCounters {
    txs: u64,
    blocks: u64,
}

/// Reads and dispatches messages until error, timeout, EOF or
/// cancellation.
pub async fn run_message_loop<S>(
    framed: Framed<S, FrameCodec>,
    peer_addr: &str,
    region: &str,
    handles: &SessionHandles,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut sink, mut stream) = framed.split();
    let mut counters = TickCounters::default();
    let mut pending_ping: Option<Instant> = None;

    let mut status_ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + STATUS_INTERVAL,
        STATUS_INTERVAL,
    );
    status_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = handles.token.cancelled() => {
                info!(region = %region, peer = %peer_addr, "shutting down");
                return;
            }

            _ = status_ticker.tick() => {
                info!(
                    region = %region,
                    peer = %peer_addr,
                    txs = counters.txs,
                    blocks = counters.blocks,
                    "status"
                );
                counters = TickCounters::default();

                // Keepalive doubles as the latency probe.
                let mut nonce = [0u8; 8];
                rand::thread_rng().fill_bytes(&mut nonce);
                if sink.send(RawMessage::new("ping", nonce.to_vec())).await.is_ok() {
                    pending_ping = Some(Instant::now());
                }
            }

            read = timeout(READ_TIMEOUT, stream.next()) => {
                let msg = match read {
                    Err(_) => {
                        warn!(region = %region, peer = %peer_addr, "connection timeout");
                        return;
                    }
                    Ok(None) => {
                        info!(region = %region, peer = %peer_addr, "connection closed by peer");
                        return;
                    }
                    Ok(Some(Err(err))) => {
                        warn!(region = %region, peer = %peer_addr, error = %err, "read error");
                        return;
                    }
                    Ok(Some(Ok(msg))) => msg,
                };

                let outcome = handle_message(
                    &mut sink,
                    &msg,
                    peer_addr,
                    region,
                    handles,
                    &mut counters,
                    &mut pending_ping,
                )
                .await;
                if let Err(err) = outcome {
                    warn!(region = %region, peer = %peer_addr, error = %err, "session error");
                    return;
                }
            }
        }
    }
}

/// Dispatches one message. `Err` ends the session (write failures);
/// store and parse problems are absorbed here.
async fn handle_message<S>(
    sink: &mut SplitSink<Framed<S, FrameCodec>, RawMessage>,
    msg: &RawMessage,
    peer_addr: &str,
    region: &str,
    handles: &SessionHandles,
    counters: &mut TickCounters,
    pending_ping: &mut Option<Instant>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match msg.command() {
        "inv" => {
            let summary = parse_inv_payload(&msg.payload);
            handle_inv(sink, summary, peer_addr, handles).await?;
        }

        "tx" => {
            // Malformed payloads are skipped, not fatal.
            let Ok(tx) = Transaction::parse(&msg.payload) else {
                return Ok(());
            };
            counters.txs += 1;
            metrics::TX_RECEIVED.inc();

            match timed("record_transaction", handles.store.record_transaction(&tx)).await {
                Ok(()) => metrics::TX_RECORDED.inc(),
                Err(err) => {
                    error!(peer = %peer_addr, error = %err, "store record_transaction failed")
                }
            }
            match timed(
                "detect_input_conflicts",
                handles.store.detect_input_conflicts(&tx),
            )
            .await
            {
                Ok(0) => {}
                Ok(conflicts) => {
                    metrics::TX_CONFLICTS.inc_by(conflicts as u64);
                    warn!(
                        peer = %peer_addr,
                        txid = %tx.txid,
                        conflicts,
                        "double-spend conflict observed"
                    );
                }
                Err(err) => {
                    error!(peer = %peer_addr, error = %err, "store detect_input_conflicts failed")
                }
            }
        }

        "block" => {
            let Ok(block) = Block::parse(&msg.payload) else {
                return Ok(());
            };
            info!(
                region = %region,
                peer = %peer_addr,
                hash = %block.hash,
                height = block.height,
                txs = block.transactions.len(),
                "block received"
            );
            counters.blocks += 1;
            metrics::BLOCKS_RECEIVED.inc();
            metrics::BLOCK_HEIGHT.set(i64::from(block.height));
            metrics::BLOCK_TX_COUNT.observe(block.transactions.len() as f64);

            if let Err(err) = timed(
                "record_block",
                handles.store.record_block(&block, peer_addr),
            )
            .await
            {
                error!(peer = %peer_addr, error = %err, "store record_block failed");
            }

            // Best effort per transaction; one bad row must not lose the
            // confirmations below.
            for tx in &block.transactions {
                let _ = timed("record_transaction", handles.store.record_transaction(tx)).await;
            }

            let block_time = chrono::DateTime::from_timestamp(i64::from(block.header.timestamp), 0)
                .map(|dt| dt.naive_utc())
                .unwrap_or_else(|| chrono::Utc::now().naive_utc());
            if let Err(err) = timed(
                "confirm_transactions",
                handles.store.confirm_transactions(
                    &block.hash,
                    block.height,
                    block_time,
                    &block.tx_ids(),
                ),
            )
            .await
            {
                error!(peer = %peer_addr, error = %err, "store confirm_transactions failed");
            }
        }

        "ping" => {
            sink.send(RawMessage::new("pong", msg.payload.clone())).await?;
        }

        "pong" => {
            if let Some(sent_at) = pending_ping.take() {
                let latency_ms = sent_at.elapsed().as_millis() as i64;
                metrics::PEER_LATENCY_MS
                    .with_label_values(&[region])
                    .observe(latency_ms as f64);
                if let Err(err) = timed(
                    "update_peer_latency",
                    handles.store.update_peer_latency(peer_addr, latency_ms),
                )
                .await
                {
                    error!(peer = %peer_addr, error = %err, "store update_peer_latency failed");
                }
            }
        }

        _ => {} // addr, headers, feefilter, ... are noise to an observer
    }

    Ok(())
}

/// Records observations for announced transactions, bumps announcement
/// counters and requests anything not seen within the dedup window.
async fn handle_inv<S>(
    sink: &mut SplitSink<Framed<S, FrameCodec>, RawMessage>,
    summary: InvSummary,
    peer_addr: &str,
    handles: &SessionHandles,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    for vector in &summary.tx {
        if let Err(err) = timed(
            "record_observation",
            handles.store.record_observation(&vector.hash, peer_addr),
        )
        .await
        {
            error!(peer = %peer_addr, error = %err, "store record_observation failed");
        }
    }

    if !summary.tx.is_empty() {
        metrics::INV_TX_ANNOUNCEMENTS.inc_by(summary.tx.len() as u64);
    }
    if !summary.blocks.is_empty() {
        metrics::INV_BLOCK_ANNOUNCEMENTS.inc_by(summary.blocks.len() as u64);
    }
    if !summary.is_empty() {
        if let Err(err) = timed(
            "increment_peer_announcements",
            handles.store.increment_peer_announcements(
                peer_addr,
                summary.tx.len() as i64,
                summary.blocks.len() as i64,
            ),
        )
        .await
        {
            error!(peer = %peer_addr, error = %err, "store increment_peer_announcements failed");
        }
    }

    let fresh_txs: Vec<InvVector> = summary
        .tx
        .iter()
        .filter(|vector| {
            if handles.seen.txs.mark(vector.hash) {
                true
            } else {
                metrics::TX_DEDUPLICATED.inc();
                false
            }
        })
        .copied()
        .collect();
    if !fresh_txs.is_empty() {
        sink.send(RawMessage::new("getdata", encode_inv_payload(&fresh_txs)))
            .await?;
    }

    let fresh_blocks: Vec<InvVector> = summary
        .blocks
        .iter()
        .filter(|vector| handles.seen.blocks.mark(vector.hash))
        .copied()
        .collect();
    if !fresh_blocks.is_empty() {
        sink.send(RawMessage::new("getdata", encode_inv_payload(&fresh_blocks)))
            .await?;
    }

    Ok(())
}

/// Keeps every region at its session target, spawning sessions onto the
/// tracker so shutdown can await them.
pub fn spawn_slot_maintenance(
    handles: SessionHandles,
    regions: Vec<String>,
    tracker: TaskTracker,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if handles.token.is_cancelled() {
                return;
            }

            for region in &regions {
                if handles.pool.active_count(region) < handles.pool.policy().peers_per_region {
                    if let Some(endpoint) = handles.pool.next_for_region(region) {
                        tracker.spawn(observe_peer(
                            handles.clone(),
                            region.clone(),
                            endpoint,
                        ));
                    }
                }
            }

            tokio::select! {
                _ = handles.token.cancelled() => return,
                _ = tokio::time::sleep(SLOT_POLL_INTERVAL) => {}
            }
        }
    })
}

/// Periodic one-line summary of live sessions.
pub fn spawn_status_reporter(
    pool: Arc<PeerPool>,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + STATUS_INTERVAL,
            STATUS_INTERVAL,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    info!(
                        total = pool.total_active(),
                        regions = %pool.status_line(),
                        "peer status"
                    );
                }
            }
        }
    })
}

/// A stream type the session loop accepts; used by the scenario tests to
/// drive sessions over in-memory duplex pipes.
pub type SessionStream<S> = Framed<S, FrameCodec>;

/// Wraps a raw stream in the frame codec.
pub fn frame_stream<S>(stream: S) -> SessionStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Framed::new(stream, FrameCodec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_constants() {
        assert_eq!(DIAL_TIMEOUT, Duration::from_secs(15));
        assert_eq!(HANDSHAKE_TIMEOUT, Duration::from_secs(30));
        assert_eq!(READ_TIMEOUT, Duration::from_secs(600));
        assert_eq!(SHORT_SESSION, Duration::from_secs(60));
        assert_eq!(SLOT_POLL_INTERVAL, Duration::from_secs(5));
    }
}
