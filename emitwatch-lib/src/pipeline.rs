//! The ingestion pipeline actor.
//!
//! One task owns the connection state machine, the ingestion buffer, the
//! visible log, the metrics series and every timer. All mutation happens on
//! that task, so two flushes can never interleave. Other tasks talk to it
//! through a cloneable [`PipelineHandle`] (commands over a bounded mpsc with
//! oneshot replies) and observe it through broadcast [`PipelineEvent`]s.
//!
//! # Timers
//!
//! - flush tick (`ingest.flush_interval_ms`)
//! - heartbeat check (`connection.heartbeat_check_ms`)
//! - reconnect backoff (one-shot deadline)
//! - flash marker and batch banner expiries (one-shot deadlines per batch)
//!
//! Teardown sets the manual-close flag, cancels every timer and any pending
//! connect, performs a final flush, closes the transport and waits for the
//! persistence worker to drain. Nothing fires afterwards.

use crate::clock::Clock;
use crate::config::Config;
use crate::connection::{
    Backoff, ConnectionMachine, ConnectionResult, ConnectionState, Connector, Transport,
    TransportEvent,
};
use crate::filter::{FilterPolicy, available_kinds};
use crate::ingest::{Ingestor, VisibleRow};
use crate::metrics::{MetricsSeries, SeriesPoint};
use crate::models::{BatchSummary, BatchToken, EmitKind, EventRecord};
use crate::persist::{PersistError, PersistWorker};
use crate::store::{LogStore, StoreResult};
use crate::telemetry::{HealthCheck, IngestStats};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{Instrument, debug, info, info_span, instrument, warn};

/// Capacity of the command channel.
pub const PIPELINE_CHANNEL_CAPACITY: usize = 100;

/// Capacity of the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long teardown waits for queued persistence jobs.
const PERSIST_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long teardown and forced closes wait for the transport to close.
const TRANSPORT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors returned by [`PipelineHandle`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineError {
    /// The command channel is full.
    #[error("Pipeline command channel is full (capacity: {capacity})")]
    ChannelFull { capacity: usize },
    /// The pipeline has stopped.
    #[error("Pipeline command channel is closed")]
    ChannelClosed,
    /// The pipeline dropped the reply.
    #[error("Response channel dropped")]
    ResponseDropped,
    /// A durable store operation failed.
    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),
}

/// Change notifications for presentation layers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    StateChanged {
        state: ConnectionState,
        attempt: u32,
    },
    /// Stored history was loaded into the visible log.
    Hydrated { count: usize },
    BatchFlushed { summary: BatchSummary },
    /// The batch banner window for `token` ended.
    BatchRetracted { token: BatchToken },
    FlashCleared { token: BatchToken, cleared: usize },
    SeriesUpdated { points: Vec<SeriesPoint> },
    ViewCleared,
}

/// Copy of the pipeline's observable state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSnapshot {
    pub connection_state: ConnectionState,
    pub reconnect_attempt: u32,
    pub hydrating: bool,
    pub stats: IngestStats,
    /// Visible log, newest first, with flash markers.
    pub rows: Vec<VisibleRow>,
    /// Latest batch summary until its banner window ends.
    pub latest_batch: Option<BatchSummary>,
    pub series: Vec<SeriesPoint>,
}

/// Commands accepted by the actor.
#[derive(Debug)]
enum PipelineCommand {
    Snapshot {
        respond_to: oneshot::Sender<PipelineSnapshot>,
    },
    Visible {
        selection: Vec<EmitKind>,
        respond_to: oneshot::Sender<Vec<VisibleRow>>,
    },
    AvailableKinds {
        respond_to: oneshot::Sender<Vec<EmitKind>>,
    },
    Health {
        respond_to: oneshot::Sender<HealthCheck>,
    },
    ClearView,
    ClearCache {
        respond_to: oneshot::Sender<Result<(), PersistError>>,
    },
    ForceRefresh,
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running pipeline.
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    sender: mpsc::Sender<PipelineCommand>,
    events: broadcast::Sender<PipelineEvent>,
}

impl PipelineHandle {
    fn send(&self, command: PipelineCommand) -> Result<(), PipelineError> {
        self.sender.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PipelineError::ChannelFull {
                capacity: PIPELINE_CHANNEL_CAPACITY,
            },
            mpsc::error::TrySendError::Closed(_) => PipelineError::ChannelClosed,
        })
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> PipelineCommand,
    ) -> Result<T, PipelineError> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx))?;
        rx.await.map_err(|_recv_err| PipelineError::ResponseDropped)
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Current observable state.
    pub async fn snapshot(&self) -> Result<PipelineSnapshot, PipelineError> {
        self.request(|respond_to| PipelineCommand::Snapshot { respond_to })
            .await
    }

    /// Visible log after the presentation filter for `selection`.
    pub async fn visible(&self, selection: Vec<EmitKind>) -> Result<Vec<VisibleRow>, PipelineError> {
        self.request(|respond_to| PipelineCommand::Visible {
            selection,
            respond_to,
        })
        .await
    }

    /// Known categories followed by any others present in the visible log.
    pub async fn available_kinds(&self) -> Result<Vec<EmitKind>, PipelineError> {
        self.request(|respond_to| PipelineCommand::AvailableKinds { respond_to })
            .await
    }

    /// Health derived from connection state and counters.
    pub async fn health(&self) -> Result<HealthCheck, PipelineError> {
        self.request(|respond_to| PipelineCommand::Health { respond_to })
            .await
    }

    /// Empty the visible log. The durable store is untouched.
    pub fn clear_view(&self) -> Result<(), PipelineError> {
        self.send(PipelineCommand::ClearView)
    }

    /// Clear the durable store, then the visible log.
    ///
    /// The clear is ordered after every batch already handed to persistence.
    /// The visible log is only emptied when the store clear succeeded, and
    /// the reply arrives after both.
    pub async fn clear_cache(&self) -> Result<(), PipelineError> {
        self.request(|respond_to| PipelineCommand::ClearCache { respond_to })
            .await??;
        Ok(())
    }

    /// Reconnect immediately, forgetting any backoff. Ignored after shutdown.
    pub fn force_refresh(&self) -> Result<(), PipelineError> {
        self.send(PipelineCommand::ForceRefresh)
    }

    /// Tear the pipeline down and wait until it has stopped.
    pub async fn shutdown(&self) -> Result<(), PipelineError> {
        self.request(|respond_to| PipelineCommand::Shutdown { respond_to })
            .await
    }
}

type ConnectFuture = Pin<Box<dyn Future<Output = ConnectionResult<Box<dyn Transport>>> + Send>>;
type HydrateFuture = Pin<Box<dyn Future<Output = StoreResult<Vec<EventRecord>>> + Send>>;

/// One-shot presentation timers.
#[derive(Debug, Clone, Copy)]
enum Expiry {
    Flash(BatchToken),
    Banner(BatchToken),
}

type ClearResult = Result<(), PersistError>;

/// A cache clear handed to the persistence worker, awaiting its outcome.
#[derive(Debug)]
struct PendingClear {
    outcome: oneshot::Receiver<ClearResult>,
    respond_to: oneshot::Sender<ClearResult>,
}

/// The pipeline actor. Construct with [`Pipeline::spawn`].
pub struct Pipeline {
    config: Config,
    connector: Arc<dyn Connector>,
    store: Arc<dyn LogStore>,
    clock: Arc<dyn Clock>,
    machine: ConnectionMachine,
    ingestor: Ingestor,
    series: MetricsSeries,
    series_bootstrapped: bool,
    policy: FilterPolicy,
    latest_batch: Option<BatchSummary>,
    persist: Option<PersistWorker>,
    transport: Option<Box<dyn Transport>>,
    connecting: Option<ConnectFuture>,
    hydration: Option<HydrateFuture>,
    clears: VecDeque<PendingClear>,
    reconnect_at: Option<Instant>,
    expiries: BTreeMap<(Instant, u64), Expiry>,
    expiry_serial: u64,
    rng: StdRng,
    commands: mpsc::Receiver<PipelineCommand>,
    events: broadcast::Sender<PipelineEvent>,
    pending_shutdown: Option<oneshot::Sender<()>>,
}

impl Pipeline {
    /// Spawn the pipeline on the current runtime.
    ///
    /// Hydration from `store` starts immediately; the first connection attempt
    /// follows once it has finished.
    pub fn spawn(
        config: &Config,
        connector: Arc<dyn Connector>,
        store: Arc<dyn LogStore>,
        clock: Arc<dyn Clock>,
    ) -> (PipelineHandle, JoinHandle<()>) {
        let (sender, commands) = mpsc::channel(PIPELINE_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let now_ms = clock.now_ms();

        let pipeline = Self {
            machine: ConnectionMachine::new(
                Backoff::from(&config.connection),
                config.connection.stale_after(),
            ),
            ingestor: Ingestor::new(&config.ingest),
            series: MetricsSeries::new(
                config.metrics.series_length,
                config.metrics.bucket_ms,
                now_ms,
            ),
            series_bootstrapped: false,
            policy: FilterPolicy::from(&config.filter),
            latest_batch: None,
            persist: None,
            transport: None,
            connecting: None,
            hydration: None,
            clears: VecDeque::new(),
            reconnect_at: None,
            expiries: BTreeMap::new(),
            expiry_serial: 0,
            rng: StdRng::from_os_rng(),
            commands,
            events: events.clone(),
            pending_shutdown: None,
            config: config.clone(),
            connector,
            store,
            clock,
        };

        let task = tokio::spawn(pipeline.run());
        (PipelineHandle { sender, events }, task)
    }

    /// Actor main loop.
    #[instrument(skip(self), fields(endpoint = %self.config.connection.endpoint))]
    async fn run(mut self) {
        info!("Starting ingestion pipeline");
        self.persist = Some(PersistWorker::spawn(Arc::clone(&self.store)));
        self.start_hydration();

        let start = Instant::now();
        let flush_period = self.config.ingest.flush_interval();
        let heartbeat_period = self.config.connection.heartbeat_check();
        let mut flush_tick = interval_at(start + flush_period, flush_period);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat_tick = interval_at(start + heartbeat_period, heartbeat_period);
        heartbeat_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let next_expiry = self.expiries.keys().next().map(|&(at, _)| at);

            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    let Some(command) = command else {
                        info!("Pipeline command channel closed, shutting down");
                        break;
                    };
                    if self.handle_command(command) {
                        break;
                    }
                }

                outcome = next_clear(&mut self.clears), if !self.clears.is_empty() => {
                    if let Some(clear) = self.clears.pop_front() {
                        self.finish_clear(outcome, clear.respond_to);
                    }
                }

                result = poll_slot(&mut self.hydration), if self.hydration.is_some() => {
                    self.hydration = None;
                    self.finish_hydration(result);
                }

                result = poll_slot(&mut self.connecting), if self.connecting.is_some() => {
                    self.connecting = None;
                    self.on_connect_result(result);
                }

                event = recv_from(&mut self.transport), if self.transport.is_some() => {
                    self.on_transport_event(event);
                }

                () = sleep_until_opt(self.reconnect_at), if self.reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    self.start_connect();
                }

                _ = flush_tick.tick() => {
                    self.flush();
                }

                _ = heartbeat_tick.tick() => {
                    self.heartbeat();
                }

                () = sleep_until_opt(next_expiry), if next_expiry.is_some() => {
                    self.fire_expiries();
                }
            }
        }

        self.teardown().await;
    }

    /// Handle one command. Returns `true` when the loop should exit.
    fn handle_command(&mut self, command: PipelineCommand) -> bool {
        match command {
            PipelineCommand::Snapshot { respond_to } => {
                drop(respond_to.send(self.snapshot()));
            }
            PipelineCommand::Visible {
                selection,
                respond_to,
            } => {
                let entries = self.policy.apply(self.ingestor.log().iter(), &selection);
                drop(respond_to.send(self.ingestor.rows_for(entries)));
            }
            PipelineCommand::AvailableKinds { respond_to } => {
                drop(respond_to.send(available_kinds(self.ingestor.log().records())));
            }
            PipelineCommand::Health { respond_to } => {
                drop(respond_to.send(HealthCheck::from_pipeline(
                    self.machine.state(),
                    self.machine.attempt(),
                    self.ingestor.stats(),
                )));
            }
            PipelineCommand::ClearView => {
                self.ingestor.clear_view();
                info!("Visible log cleared");
                self.emit(PipelineEvent::ViewCleared);
            }
            PipelineCommand::ClearCache { respond_to } => match self.persist {
                Some(ref worker) => {
                    let (tx, outcome) = oneshot::channel();
                    worker.clear(tx);
                    self.clears.push_back(PendingClear {
                        outcome,
                        respond_to,
                    });
                }
                None => drop(respond_to.send(Err(PersistError::WorkerStopped))),
            },
            PipelineCommand::ForceRefresh => self.force_refresh(),
            PipelineCommand::Shutdown { respond_to } => {
                self.pending_shutdown = Some(respond_to);
                return true;
            }
        }
        false
    }

    /// The store clear finished; empty the view only if it succeeded.
    fn finish_clear(&mut self, outcome: ClearResult, respond_to: oneshot::Sender<ClearResult>) {
        match outcome {
            Ok(()) => {
                self.ingestor.clear_view();
                info!("Durable log and visible log cleared");
                self.emit(PipelineEvent::ViewCleared);
            }
            Err(ref e) => warn!(error = %e, "Clearing the durable log failed, keeping the view"),
        }
        drop(respond_to.send(outcome));
    }

    fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            connection_state: self.machine.state(),
            reconnect_attempt: self.machine.attempt(),
            hydrating: self.hydration.is_some(),
            stats: *self.ingestor.stats(),
            rows: self.ingestor.rows(),
            latest_batch: self.latest_batch.clone(),
            series: self.series.points(),
        }
    }

    fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine
        drop(self.events.send(event));
    }

    fn publish_transitions(&mut self) {
        let attempt = self.machine.attempt();
        for state in self.machine.take_transitions() {
            self.emit(PipelineEvent::StateChanged { state, attempt });
        }
    }

    fn start_hydration(&mut self) {
        let store = Arc::clone(&self.store);
        let min_ts = self.ingestor.retention_floor(self.clock.now_ms());
        self.hydration = Some(Box::pin(async move { store.query_since(min_ts).await }));
    }

    fn finish_hydration(&mut self, result: StoreResult<Vec<EventRecord>>) {
        let now_ms = self.clock.now_ms();
        let count = match result {
            Ok(history) => {
                if !self.series_bootstrapped {
                    self.series.backfill(&history, now_ms);
                    self.series_bootstrapped = true;
                    self.emit(PipelineEvent::SeriesUpdated {
                        points: self.series.points(),
                    });
                }
                self.ingestor.hydrate(history, now_ms)
            }
            Err(e) => {
                warn!(error = %e, "Hydration from durable log failed, starting empty");
                0
            }
        };
        info!(count = count, "Hydration complete");
        self.emit(PipelineEvent::Hydrated { count });

        // A force refresh during hydration may already own the connection
        if self.transport.is_none() && self.connecting.is_none() && self.reconnect_at.is_none() {
            self.start_connect();
        }
    }

    fn start_connect(&mut self) {
        if !self.machine.begin_connect() {
            return;
        }
        self.publish_transitions();
        self.spawn_connect();
    }

    fn spawn_connect(&mut self) {
        let connector = Arc::clone(&self.connector);
        let endpoint = self.config.connection.endpoint.clone();
        debug!(endpoint = %endpoint, attempt = self.machine.attempt(), "Connecting");
        self.connecting = Some(Box::pin(async move { connector.connect(&endpoint).await }));
    }

    fn on_connect_result(&mut self, result: ConnectionResult<Box<dyn Transport>>) {
        match result {
            Ok(transport) => {
                self.machine.opened(self.clock.now_ms());
                if let Some(previous) = self.transport.replace(transport) {
                    warn!("Replacing a live transport");
                    close_detached(previous);
                }
                info!("Connected");
            }
            Err(e) => {
                warn!(error = %e, "Connection attempt failed");
                if let Some(delay) = self.machine.open_failed(&mut self.rng) {
                    self.reconnect_at = Some(Instant::now() + delay);
                }
            }
        }
        self.publish_transitions();
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(text) => {
                let now_ms = self.clock.now_ms();
                self.machine.message_observed(now_ms);
                if let Err(e) = self.ingestor.accept(&text, now_ms) {
                    debug!(
                        error = %e,
                        dropped = self.ingestor.stats().dropped_count,
                        "Dropping malformed message"
                    );
                }
            }
            TransportEvent::Error(message) => {
                warn!(error = %message, "Transport error");
                self.machine.transport_error();
                self.publish_transitions();
            }
            TransportEvent::Closed => {
                self.transport = None;
                self.on_closed();
            }
        }
    }

    fn on_closed(&mut self) {
        info!("Connection closed");
        if let Some(delay) = self.machine.transport_closed(&mut self.rng) {
            self.reconnect_at = Some(Instant::now() + delay);
        }
        self.publish_transitions();
    }

    fn heartbeat(&mut self) {
        if !self.machine.heartbeat(self.clock.now_ms()) {
            return;
        }
        self.publish_transitions();
        if let Some(transport) = self.transport.take() {
            close_detached(transport);
        }
        self.on_closed();
    }

    fn force_refresh(&mut self) {
        if self.machine.is_manually_closed() {
            debug!("Ignoring force refresh after shutdown");
            return;
        }
        info!("Force refresh requested");
        self.reconnect_at = None;
        self.connecting = None;
        if let Some(transport) = self.transport.take() {
            close_detached(transport);
        }
        if self.machine.force_refresh() {
            self.publish_transitions();
            self.spawn_connect();
        }
    }

    fn flush(&mut self) {
        let now_ms = self.clock.now_ms();
        let Some(outcome) = self.ingestor.flush(now_ms) else {
            return;
        };
        let token = outcome.summary.token;

        self.series.ingest(SeriesPoint::from(&outcome.summary));
        self.series_bootstrapped = true;
        self.latest_batch = Some(outcome.summary.clone());
        self.schedule(Expiry::Banner(token), self.config.ingest.banner());
        self.schedule(Expiry::Flash(token), self.config.ingest.flash());

        if let Some(ref worker) = self.persist {
            worker.submit(outcome.persist, outcome.prune_cutoff_ms);
        }

        info!(
            token = %token,
            count = outcome.summary.count,
            flashed = outcome.flashed,
            "Batch flushed"
        );
        self.emit(PipelineEvent::BatchFlushed {
            summary: outcome.summary,
        });
        self.emit(PipelineEvent::SeriesUpdated {
            points: self.series.points(),
        });
    }

    fn schedule(&mut self, expiry: Expiry, after: Duration) {
        self.expiry_serial = self.expiry_serial.saturating_add(1);
        self.expiries
            .insert((Instant::now() + after, self.expiry_serial), expiry);
    }

    fn fire_expiries(&mut self) {
        let now = Instant::now();
        while let Some(entry) = self.expiries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            match entry.remove() {
                Expiry::Flash(token) => {
                    let cleared = self.ingestor.clear_flash(token);
                    self.emit(PipelineEvent::FlashCleared { token, cleared });
                }
                Expiry::Banner(token) => {
                    if self.latest_batch.as_ref().is_some_and(|b| b.token == token) {
                        self.latest_batch = None;
                    }
                    self.emit(PipelineEvent::BatchRetracted { token });
                }
            }
        }
    }

    async fn teardown(&mut self) {
        info!("Tearing down ingestion pipeline");
        self.machine.close_manually();
        self.connecting = None;
        self.hydration = None;
        self.reconnect_at = None;

        self.flush();
        self.expiries.clear();

        if let Some(transport) = self.transport.take() {
            close_transport(transport).await;
            self.machine.transport_closed(&mut self.rng);
        }
        self.publish_transitions();

        if let Some(worker) = self.persist.take() {
            worker.shutdown(PERSIST_DRAIN_TIMEOUT).await;
        }
        for mut clear in std::mem::take(&mut self.clears) {
            let outcome = clear
                .outcome
                .try_recv()
                .unwrap_or(Err(PersistError::WorkerStopped));
            self.finish_clear(outcome, clear.respond_to);
        }

        if let Some(respond_to) = self.pending_shutdown.take() {
            drop(respond_to.send(()));
        }
        info!("Ingestion pipeline stopped");
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("endpoint", &self.config.connection.endpoint)
            .field("state", &self.machine.state())
            .field("visible", &self.ingestor.log().len())
            .finish_non_exhaustive()
    }
}

/// Await the future in `slot`, or never resolve if the slot is empty.
///
/// The caller must empty the slot once this resolves.
async fn poll_slot<T>(slot: &mut Option<Pin<Box<dyn Future<Output = T> + Send>>>) -> T {
    match slot.as_mut() {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn recv_from(transport: &mut Option<Box<dyn Transport>>) -> TransportEvent {
    match transport.as_mut() {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Outcome of the oldest pending clear. The worker answers clears in order.
async fn next_clear(clears: &mut VecDeque<PendingClear>) -> ClearResult {
    match clears.front_mut() {
        Some(clear) => (&mut clear.outcome)
            .await
            .unwrap_or(Err(PersistError::WorkerStopped)),
        None => std::future::pending().await,
    }
}

/// Close `transport` off the actor task.
fn close_detached(transport: Box<dyn Transport>) {
    tokio::spawn(close_transport(transport).instrument(info_span!("transport_close")));
}

async fn close_transport(mut transport: Box<dyn Transport>) {
    if tokio::time::timeout(TRANSPORT_CLOSE_TIMEOUT, transport.close())
        .await
        .is_err()
    {
        warn!("Transport did not close in time, dropping it");
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::connection::ConnectionError;
    use crate::store::MemoryLogStore;
    use crate::telemetry::HealthStatus;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn connect(&self, endpoint: &str) -> ConnectionResult<Box<dyn Transport>> {
            Err(ConnectionError::connect(endpoint, "connection refused"))
        }
    }

    fn spawn_refusing() -> (PipelineHandle, JoinHandle<()>) {
        Pipeline::spawn(
            &Config::default(),
            Arc::new(RefusingConnector),
            Arc::new(MemoryLogStore::new()),
            Arc::new(SystemClock::starting_at(1_700_000_000_000)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connection_backs_off() {
        let (handle, task) = spawn_refusing();
        let mut events = handle.subscribe();

        let mut states = Vec::new();
        while states.len() < 4 {
            if let PipelineEvent::StateChanged { state, attempt } =
                events.recv().await.expect("event")
            {
                states.push((state, attempt));
            }
        }
        assert_eq!(
            states,
            vec![
                (ConnectionState::Reconnecting, 1),
                (ConnectionState::Connecting, 1),
                (ConnectionState::Reconnecting, 2),
                (ConnectionState::Connecting, 2),
            ]
        );

        let health = handle.health().await.expect("health");
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(health.details.contains_key("reconnect_attempt"));

        handle.shutdown().await.expect("shutdown");
        task.await.expect("pipeline task");
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_fail_after_shutdown() {
        let (handle, task) = spawn_refusing();
        handle.shutdown().await.expect("shutdown");
        task.await.expect("pipeline task");

        assert!(matches!(
            handle.snapshot().await,
            Err(PipelineError::ChannelClosed)
        ));
        assert!(handle.force_refresh().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_every_handle_stops_pipeline() {
        let (handle, task) = spawn_refusing();
        drop(handle);
        task.await.expect("pipeline task");
    }
}
