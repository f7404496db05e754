//! End-to-end pipeline behavior against an in-process transport.
//!
//! Every test runs on a paused tokio clock, so backoff, heartbeat and flush
//! timings are exact and the suite runs instantly.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]

use async_trait::async_trait;
use emitwatch_lib::connection::{ConnectionError, ConnectionResult, Transport, TransportEvent};
use emitwatch_lib::persist::PersistError;
use emitwatch_lib::pipeline::PipelineError;
use emitwatch_lib::store::{StoreError, StoreResult};
use emitwatch_lib::{
    Config, ConnectionState, Connector, EmitKind, EventRecord, LogStore, MemoryLogStore, Pipeline,
    PipelineEvent, PipelineHandle, SystemClock,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const NOW: i64 = 1_700_000_000_000;

/// Test side of one open connection.
#[derive(Debug)]
struct Conn {
    tx: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<AtomicBool>,
}

impl Conn {
    fn send(&self, value: &serde_json::Value) {
        self.send_raw(&value.to_string());
    }

    fn send_raw(&self, text: &str) {
        self.tx
            .send(TransportEvent::Message(text.to_owned()))
            .expect("transport alive");
    }

    fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct ChannelTransport {
    events: mpsc::UnboundedReceiver<TransportEvent>,
    closed: Arc<AtomicBool>,
    close_delay: Duration,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn recv(&mut self) -> TransportEvent {
        self.events.recv().await.unwrap_or(TransportEvent::Closed)
    }

    async fn close(&mut self) {
        tokio::time::sleep(self.close_delay).await;
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands every accepted connection to the test; refuses while `refuse` is set.
#[derive(Debug)]
struct ChannelConnector {
    conns: mpsc::UnboundedSender<Conn>,
    refuse: Arc<AtomicBool>,
    close_delay: Duration,
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self, endpoint: &str) -> ConnectionResult<Box<dyn Transport>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ConnectionError::connect(endpoint, "connection refused"));
        }
        let (tx, events) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        self.conns
            .send(Conn {
                tx,
                closed: Arc::clone(&closed),
            })
            .map_err(|_| ConnectionError::connect(endpoint, "test harness gone"))?;
        Ok(Box::new(ChannelTransport {
            events,
            closed,
            close_delay: self.close_delay,
        }))
    }
}

/// Memory store with a slow history query and an optional failing clear.
#[derive(Debug)]
struct TestStore {
    inner: Arc<MemoryLogStore>,
    query_delay: Duration,
    fail_clear: bool,
}

#[async_trait]
impl LogStore for TestStore {
    async fn append(&self, records: &[EventRecord]) -> StoreResult<Vec<u64>> {
        self.inner.append(records).await
    }

    async fn query_since(&self, min_ts_ms: i64) -> StoreResult<Vec<EventRecord>> {
        tokio::time::sleep(self.query_delay).await;
        self.inner.query_since(min_ts_ms).await
    }

    async fn prune_older_than(&self, cutoff_ms: i64) -> StoreResult<usize> {
        self.inner.prune_older_than(cutoff_ms).await
    }

    async fn clear_all(&self) -> StoreResult<()> {
        if self.fail_clear {
            return Err(StoreError::Io(std::io::Error::other("disk unavailable")));
        }
        self.inner.clear_all().await
    }
}

#[derive(Debug)]
struct Setup {
    store: Arc<MemoryLogStore>,
    refuse: bool,
    query_delay: Duration,
    close_delay: Duration,
    fail_clear: bool,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            store: Arc::new(MemoryLogStore::new()),
            refuse: false,
            query_delay: Duration::ZERO,
            close_delay: Duration::ZERO,
            fail_clear: false,
        }
    }
}

struct Harness {
    handle: PipelineHandle,
    task: JoinHandle<()>,
    events: broadcast::Receiver<PipelineEvent>,
    conns: mpsc::UnboundedReceiver<Conn>,
    store: Arc<MemoryLogStore>,
    refuse: Arc<AtomicBool>,
    started: Instant,
}

impl Harness {
    fn start() -> Self {
        Self::launch(Setup::default())
    }

    fn start_with(store: Arc<MemoryLogStore>, refuse: bool) -> Self {
        Self::launch(Setup {
            store,
            refuse,
            ..Setup::default()
        })
    }

    fn launch(setup: Setup) -> Self {
        let (conn_tx, conns) = mpsc::unbounded_channel();
        let refuse = Arc::new(AtomicBool::new(setup.refuse));
        let connector = ChannelConnector {
            conns: conn_tx,
            refuse: Arc::clone(&refuse),
            close_delay: setup.close_delay,
        };
        let store = setup.store;
        let test_store = TestStore {
            inner: Arc::clone(&store),
            query_delay: setup.query_delay,
            fail_clear: setup.fail_clear,
        };
        let started = Instant::now();
        let (handle, task) = Pipeline::spawn(
            &Config::default(),
            Arc::new(connector),
            Arc::new(test_store),
            Arc::new(SystemClock::starting_at(NOW)),
        );
        let events = handle.subscribe();
        Self {
            handle,
            task,
            events,
            conns,
            store,
            refuse,
            started,
        }
    }

    /// Wait for the next accepted connection and its `connected` transition.
    async fn connected(&mut self) -> Conn {
        let conn = self.conns.recv().await.expect("connection");
        assert_eq!(self.next_state().await, (ConnectionState::Connected, 0));
        conn
    }

    /// Wait out a backoff delay, then for the reconnected transport.
    async fn connected_after_backoff(&mut self) -> Conn {
        assert_eq!(self.next_state().await.0, ConnectionState::Connecting);
        self.connected().await
    }

    async fn next_event(&mut self) -> PipelineEvent {
        self.events.recv().await.expect("pipeline event")
    }

    async fn next_state(&mut self) -> (ConnectionState, u32) {
        loop {
            if let PipelineEvent::StateChanged { state, attempt } = self.next_event().await {
                return (state, attempt);
            }
        }
    }

    fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }

    async fn stop(self) -> Arc<MemoryLogStore> {
        self.handle.shutdown().await.expect("shutdown");
        self.task.await.expect("pipeline task");
        self.store
    }
}

/// Let the pipeline drain inbound messages before the next command.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn ocr(text: &str) -> serde_json::Value {
    json!({ "type": "OCR_RAW", "text": text, "track_id": text })
}

#[tokio::test(start_paused = true)]
async fn test_messages_flush_into_one_batch() {
    let mut h = Harness::start();
    let conn = h.connected().await;

    for i in 1..=5 {
        conn.send(&ocr(&format!("P{i}")));
    }

    let summary = loop {
        if let PipelineEvent::BatchFlushed { summary } = h.next_event().await {
            break summary;
        }
    };
    assert_eq!(summary.count, 5);
    assert_eq!(summary.counts.ocr_raw, 5);
    assert_eq!(summary.counts.total(), 5);
    assert_eq!(h.elapsed_ms(), 3_000);

    let snapshot = h.handle.snapshot().await.expect("snapshot");
    let texts: Vec<&str> = snapshot.rows.iter().map(|r| r.record.text()).collect();
    assert_eq!(texts, vec!["P5", "P4", "P3", "P2", "P1"]);
    assert!(snapshot.rows.iter().all(|r| r.flash == Some(summary.token)));
    assert_eq!(snapshot.latest_batch, Some(summary));
    assert_eq!(snapshot.stats.incoming_count, 5);

    let store = h.stop().await;
    assert_eq!(store.len().await, 5);
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_close_reconnects_with_backoff() {
    let mut h = Harness::start();
    let conn = h.connected().await;

    drop(conn);
    assert_eq!(h.next_state().await, (ConnectionState::Reconnecting, 1));
    let closed_at = Instant::now();

    assert_eq!(h.next_state().await, (ConnectionState::Connecting, 1));
    let waited = closed_at.elapsed().as_millis();
    assert!((1_000..1_400).contains(&waited), "waited {waited}ms");

    let _second = h.conns.recv().await.expect("second connection");
    assert_eq!(h.next_state().await, (ConnectionState::Connected, 0));
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_connection_goes_stale() {
    let mut h = Harness::start();
    let conn = h.connected().await;

    assert_eq!(h.next_state().await, (ConnectionState::Stale, 0));
    let at = h.elapsed_ms();
    assert!((15_000..=20_000).contains(&at), "stale at {at}ms");

    assert_eq!(h.next_state().await, (ConnectionState::Reconnecting, 1));
    settle().await;
    assert!(conn.was_closed());
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_traffic_keeps_connection_fresh() {
    let mut h = Harness::start();
    let conn = h.connected().await;

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_secs(5)).await;
        conn.send(&ocr("KEEPALIVE"));
    }
    settle().await;

    let snapshot = h.handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.connection_state, ConnectionState::Connected);
    assert!(!conn.was_closed());
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_malformed_messages_are_counted() {
    let mut h = Harness::start();
    let conn = h.connected().await;

    conn.send_raw("not json");
    conn.send_raw("[1, 2, 3]");
    conn.send(&ocr("OK1"));
    settle().await;

    let snapshot = h.handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.stats.dropped_count, 2);
    assert_eq!(snapshot.stats.incoming_count, 1);
    assert_eq!(snapshot.stats.last_message_ts_ms, Some(NOW));

    let health = h.handle.health().await.expect("health");
    assert_eq!(health.details["dropped_count"], "2");
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_and_closes() {
    let mut h = Harness::start();
    let conn = h.connected().await;

    conn.send(&ocr("A"));
    conn.send(&ocr("B"));
    settle().await;
    h.handle.shutdown().await.expect("shutdown");

    assert!(conn.was_closed());
    let mut flushed = None;
    let mut last_state = None;
    while let Ok(event) = h.events.try_recv() {
        match event {
            PipelineEvent::BatchFlushed { summary } => flushed = Some(summary.count),
            PipelineEvent::StateChanged { state, .. } => last_state = Some(state),
            _ => {}
        }
    }
    assert_eq!(flushed, Some(2));
    assert_eq!(last_state, Some(ConnectionState::Closed));

    h.task.await.expect("pipeline task");
    assert_eq!(h.store.len().await, 2);
    assert!(h.handle.force_refresh().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_hydration_restores_recent_history() {
    let store = Arc::new(MemoryLogStore::new());
    store
        .append(&[
            EventRecord::new(EmitKind::PlateFinal, NOW - 11 * 60_000).with_attribute("text", "OLD"),
            EventRecord::new(EmitKind::PlateFinal, NOW - 60_000).with_attribute("text", "A"),
            EventRecord::new(EmitKind::Speeding, NOW - 30_000).with_attribute("text", "B"),
        ])
        .await
        .expect("seed store");

    let mut h = Harness::start_with(store, false);
    let count = loop {
        if let PipelineEvent::Hydrated { count } = h.next_event().await {
            break count;
        }
    };
    assert_eq!(count, 2);

    let snapshot = h.handle.snapshot().await.expect("snapshot");
    assert!(!snapshot.hydrating);
    let texts: Vec<&str> = snapshot.rows.iter().map(|r| r.record.text()).collect();
    assert_eq!(texts, vec!["B", "A"]);
    assert!(snapshot.rows.iter().all(|r| r.flash.is_none()));

    let charted: u32 = snapshot.series.iter().map(|p| p.counts.total()).sum();
    assert_eq!(charted, 2);

    let kinds = h.handle.available_kinds().await.expect("kinds");
    assert_eq!(kinds.len(), 4);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_clear_cache_empties_store_and_view() {
    let mut h = Harness::start();
    let conn = h.connected().await;

    conn.send(&ocr("X1"));
    conn.send(&ocr("X2"));
    while !matches!(h.next_event().await, PipelineEvent::BatchFlushed { .. }) {}

    h.handle.clear_cache().await.expect("clear cache");
    let mut view_cleared = false;
    while let Ok(event) = h.events.try_recv() {
        view_cleared |= event == PipelineEvent::ViewCleared;
    }
    assert!(view_cleared);
    let snapshot = h.handle.snapshot().await.expect("snapshot");
    assert!(snapshot.rows.is_empty());
    assert!(h.store.is_empty().await);

    let store = h.stop().await;
    assert!(store.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_clear_view_keeps_durable_log() {
    let mut h = Harness::start();
    let conn = h.connected().await;

    conn.send(&ocr("KEEP"));
    while !matches!(h.next_event().await, PipelineEvent::BatchFlushed { .. }) {}

    h.handle.clear_view().expect("clear view");
    let snapshot = h.handle.snapshot().await.expect("snapshot");
    assert!(snapshot.rows.is_empty());

    let store = h.stop().await;
    assert_eq!(store.len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_force_refresh_skips_backoff() {
    let mut h = Harness::start_with(Arc::new(MemoryLogStore::new()), true);
    assert_eq!(h.next_state().await, (ConnectionState::Reconnecting, 1));

    h.refuse.store(false, Ordering::SeqCst);
    h.handle.force_refresh().expect("force refresh");
    assert_eq!(h.next_state().await, (ConnectionState::Connecting, 0));

    let _conn = h.conns.recv().await.expect("connection");
    assert_eq!(h.next_state().await, (ConnectionState::Connected, 0));
    assert!(h.elapsed_ms() < 1_000);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_banner_and_flash_expire() {
    let mut h = Harness::start();
    let conn = h.connected().await;
    conn.send(&ocr("FLASH"));

    let token = loop {
        if let PipelineEvent::BatchFlushed { summary } = h.next_event().await {
            break summary.token;
        }
    };

    let retracted = loop {
        if let PipelineEvent::BatchRetracted { token } = h.next_event().await {
            break token;
        }
    };
    assert_eq!(retracted, token);
    assert_eq!(h.elapsed_ms(), 5_600);
    let snapshot = h.handle.snapshot().await.expect("snapshot");
    assert!(snapshot.latest_batch.is_none());
    assert_eq!(snapshot.rows[0].flash, Some(token));

    let (cleared_token, cleared) = loop {
        if let PipelineEvent::FlashCleared { token, cleared } = h.next_event().await {
            break (token, cleared);
        }
    };
    assert_eq!(cleared_token, token);
    assert_eq!(cleared, 1);
    assert_eq!(h.elapsed_ms(), 6_200);
    let snapshot = h.handle.snapshot().await.expect("snapshot");
    assert!(snapshot.rows[0].flash.is_none());
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_visible_applies_presentation_filter() {
    let mut h = Harness::start();
    let conn = h.connected().await;

    for plate in ["S1", "S2", "S3"] {
        conn.send(&json!({ "type": "SPEEDING", "text": plate, "track_id": plate }));
    }
    for conf in [0.9, 0.95, 0.8] {
        conn.send(&json!({ "type": "WRONG_DIRECTION", "text": "W1", "conf": conf, "track_id": 7 }));
    }
    conn.send(&json!({ "type": "WRONG_DIRECTION", "text": "W2", "conf": 0.1, "track_id": 8 }));
    while !matches!(h.next_event().await, PipelineEvent::BatchFlushed { .. }) {}

    let speeding = h
        .handle
        .visible(vec![EmitKind::Speeding])
        .await
        .expect("visible");
    assert_eq!(speeding.len(), 2);

    let wrong_way = h
        .handle
        .visible(vec![EmitKind::WrongDirection])
        .await
        .expect("visible");
    assert_eq!(wrong_way.len(), 2);
    assert!(wrong_way.iter().all(|row| row.record.text() == "W1"));

    assert!(h.handle.visible(Vec::new()).await.expect("visible").is_empty());
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_clear_cache_keeps_view() {
    let mut h = Harness::launch(Setup {
        fail_clear: true,
        ..Setup::default()
    });
    let conn = h.connected().await;

    conn.send(&ocr("STAYS"));
    while !matches!(h.next_event().await, PipelineEvent::BatchFlushed { .. }) {}
    settle().await;

    let err = h.handle.clear_cache().await.expect_err("clear must fail");
    assert!(matches!(
        err,
        PipelineError::Persist(PersistError::Store(StoreError::Io(_)))
    ));
    while let Ok(event) = h.events.try_recv() {
        assert_ne!(event, PipelineEvent::ViewCleared);
    }

    let snapshot = h.handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.rows.len(), 1);
    assert_eq!(h.store.len().await, 1);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_refresh_during_hydration_keeps_one_connection() {
    let mut h = Harness::launch(Setup {
        query_delay: Duration::from_millis(500),
        ..Setup::default()
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    h.handle.force_refresh().expect("force refresh");
    let first = h.conns.recv().await.expect("connection");

    // Hydration finishes at 500ms
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.conns.try_recv().is_err(), "a second connection was opened");
    assert!(!first.was_closed());

    let mut states = Vec::new();
    let mut hydrated = false;
    while let Ok(event) = h.events.try_recv() {
        match event {
            PipelineEvent::StateChanged { state, .. } => states.push(state),
            PipelineEvent::Hydrated { .. } => hydrated = true,
            _ => {}
        }
    }
    assert!(hydrated);
    assert_eq!(states, vec![ConnectionState::Connected]);

    let snapshot = h.handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.connection_state, ConnectionState::Connected);
    assert!(!snapshot.hydrating);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_close_does_not_stall_the_pipeline() {
    let mut h = Harness::launch(Setup {
        close_delay: Duration::from_secs(10),
        ..Setup::default()
    });
    let _first = h.connected().await;

    assert_eq!(h.next_state().await, (ConnectionState::Stale, 0));
    let stale_at = h.elapsed_ms();
    assert_eq!(h.next_state().await, (ConnectionState::Reconnecting, 1));
    assert_eq!(h.elapsed_ms(), stale_at);

    let _second = h.connected_after_backoff().await;

    let refresh_at = h.elapsed_ms();
    h.handle.force_refresh().expect("force refresh");
    assert_eq!(h.next_state().await, (ConnectionState::Connecting, 0));
    h.handle.snapshot().await.expect("snapshot");
    assert_eq!(h.elapsed_ms(), refresh_at);

    let _third = h.conns.recv().await.expect("third connection");
    assert_eq!(h.elapsed_ms(), refresh_at);
    h.stop().await;
}
