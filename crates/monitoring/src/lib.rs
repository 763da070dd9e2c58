//! Prometheus metrics for observer health.
//!
//! Process-wide registry created at startup. Counters are seeded from the
//! store's historical totals so a restart does not reset the exported
//! series; gauges and histograms start cold.

use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, Encoder, Histogram, HistogramVec, IntCounter,
    IntCounterVec, IntGauge, IntGaugeVec, TextEncoder,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use chainwatch_storage::StoreTotals;

lazy_static! {
    // Transaction metrics
    pub static ref TX_RECEIVED: IntCounter = register_int_counter!(
        "chainwatch_transactions_received_total",
        "Total number of transactions received"
    )
    .unwrap();
    pub static ref TX_RECORDED: IntCounter = register_int_counter!(
        "chainwatch_transactions_recorded_total",
        "Total number of transactions recorded to the store"
    )
    .unwrap();
    pub static ref TX_CONFLICTS: IntCounter = register_int_counter!(
        "chainwatch_transaction_conflicts_total",
        "Total number of double-spend conflicts detected"
    )
    .unwrap();

    // Block metrics
    pub static ref BLOCKS_RECEIVED: IntCounter = register_int_counter!(
        "chainwatch_blocks_received_total",
        "Total number of blocks received"
    )
    .unwrap();
    pub static ref BLOCK_HEIGHT: IntGauge = register_int_gauge!(
        "chainwatch_block_height",
        "Latest block height observed"
    )
    .unwrap();
    pub static ref BLOCK_TX_COUNT: Histogram = register_histogram!(
        "chainwatch_block_transaction_count",
        "Number of transactions per block",
        vec![100.0, 500.0, 1000.0, 2000.0, 3000.0, 4000.0, 5000.0, 7500.0, 10000.0]
    )
    .unwrap();

    // Peer metrics
    pub static ref PEERS_ACTIVE: IntGauge = register_int_gauge!(
        "chainwatch_peers_active",
        "Number of currently active peer connections"
    )
    .unwrap();
    pub static ref PEERS_BY_REGION: IntGaugeVec = register_int_gauge_vec!(
        "chainwatch_peers_by_region",
        "Number of active peers by region",
        &["region"]
    )
    .unwrap();
    pub static ref PEER_CONNECTIONS: IntCounter = register_int_counter!(
        "chainwatch_peer_connections_total",
        "Total number of peer connection attempts"
    )
    .unwrap();
    pub static ref PEER_DISCONNECTIONS: IntCounter = register_int_counter!(
        "chainwatch_peer_disconnections_total",
        "Total number of peer disconnections"
    )
    .unwrap();
    pub static ref HANDSHAKE_FAILURES: IntCounter = register_int_counter!(
        "chainwatch_handshake_failures_total",
        "Total number of handshake failures"
    )
    .unwrap();
    pub static ref PEER_LATENCY_MS: HistogramVec = register_histogram_vec!(
        "chainwatch_peer_latency_ms",
        "Peer latency in milliseconds",
        &["region"],
        vec![10.0, 25.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0]
    )
    .unwrap();

    // Store metrics
    pub static ref STORE_QUERY_DURATION: HistogramVec = register_histogram_vec!(
        "chainwatch_store_query_duration_seconds",
        "Store operation duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .unwrap();
    pub static ref STORE_ERRORS: IntCounterVec = register_int_counter_vec!(
        "chainwatch_store_errors_total",
        "Total number of store errors",
        &["operation"]
    )
    .unwrap();

    // Inventory metrics
    pub static ref INV_TX_ANNOUNCEMENTS: IntCounter = register_int_counter!(
        "chainwatch_inv_tx_announcements_total",
        "Total transaction announcements received via inv messages"
    )
    .unwrap();
    pub static ref INV_BLOCK_ANNOUNCEMENTS: IntCounter = register_int_counter!(
        "chainwatch_inv_block_announcements_total",
        "Total block announcements received via inv messages"
    )
    .unwrap();

    // Dedup metrics
    pub static ref TX_DEDUPLICATED: IntCounter = register_int_counter!(
        "chainwatch_tx_deduplicated_total",
        "Total transactions skipped due to deduplication"
    )
    .unwrap();
    pub static ref SEEN_MAP_SIZE: IntGaugeVec = register_int_gauge_vec!(
        "chainwatch_seen_map_size",
        "Current size of the seen maps",
        &["kind"]
    )
    .unwrap();
}

/// Initializes counter metrics from historical store totals.
pub fn seed_from_totals(totals: &StoreTotals) {
    TX_RECEIVED.inc_by(totals.observations);
    TX_RECORDED.inc_by(totals.transactions);
    TX_CONFLICTS.inc_by(totals.conflicts);
    BLOCKS_RECEIVED.inc_by(totals.blocks);
    INV_TX_ANNOUNCEMENTS.inc_by(totals.tx_announcements);
    INV_BLOCK_ANNOUNCEMENTS.inc_by(totals.block_announcements);
    if let Some(height) = totals.best_height {
        BLOCK_HEIGHT.set(height);
    }
    info!(
        observations = totals.observations,
        transactions = totals.transactions,
        blocks = totals.blocks,
        height = totals.best_height.unwrap_or(0),
        "seeded metrics from store totals"
    );
}

/// Renders the registry in the Prometheus text format.
pub fn gather() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer).unwrap_or(());
    buffer
}

async fn handle_request(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let mut response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => Response::new(Body::from(gather())),
        (&Method::OPTIONS, _) => Response::new(Body::empty()),
        _ => {
            let mut not_found = Response::new(Body::from("not found"));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            not_found
        }
    };

    // Permissive CORS so dashboards can scrape from a browser.
    let headers = response.headers_mut();
    headers.insert("Access-Control-Allow-Origin", "*".parse().expect("static"));
    headers.insert(
        "Access-Control-Allow-Methods",
        "GET, OPTIONS".parse().expect("static"),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        "Content-Type".parse().expect("static"),
    );
    Ok(response)
}

/// Serves `/metrics` on `port` until the token is cancelled.
pub async fn serve(port: u16, token: CancellationToken) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc =
        make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle_request)) });

    let server = Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(async move { token.cancelled().await });

    info!(%addr, "metrics server listening");
    if let Err(err) = server.await {
        error!(error = %err, "metrics server failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test only: the registry is process-global and parallel tests
    // would race on counter values.
    #[test]
    fn seeding_and_exposition() {
        let before = TX_RECEIVED.get();
        seed_from_totals(&StoreTotals {
            observations: 5,
            transactions: 3,
            conflicts: 1,
            blocks: 2,
            best_height: Some(840_000),
            tx_announcements: 10,
            block_announcements: 4,
        });
        assert_eq!(TX_RECEIVED.get(), before + 5);
        assert_eq!(BLOCK_HEIGHT.get(), 840_000);

        let body = String::from_utf8(gather()).unwrap();
        assert!(body.contains("chainwatch_transactions_received_total"));
        assert!(body.contains("chainwatch_peer_latency_ms"));
    }
}
