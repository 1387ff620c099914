//! The consumer run loop.
//!
//! One [`RunLoop`] task owns all access to the consumer client. Requests
//! arrive on an unbounded queue and are handled one at a time; a periodic
//! ticker enqueues poll requests so the loop makes progress even without
//! user demand.
//!
//! The poll handler is the engine: it recomputes the pause/resume sets from
//! current demand, polls the client (which may re-enter through the
//! [`RebalanceReactor`]), merges new records with buffered ones, completes
//! waiting fetches, and replays commits that were deferred during a
//! rebalance.
//!
//! # Request handling
//!
//! ```text
//! handle ──► queue ──► dispatcher ──► subscribe / assign / unsubscribe
//! ticker ──►                      ──► assignment / fetch / commit / poll
//! ```
//!
//! Requests from a single producer are handled in submission order. Fetch
//! completions always happen before the next request is dequeued.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::client::{ClientGate, CommitCallback, ConsumerClient};
use crate::config::ConsumerConfig;
use crate::error::{ConsumerError, Result};
use crate::metrics::RunLoopMetrics;
use crate::record::CommittableRecord;
use crate::types::{CompletionReason, PartitionStreamId, StreamId, TopicPartition};

pub mod commit;
pub mod request;

pub(crate) mod state;

mod rebalance;

pub use rebalance::RebalanceReactor;

use commit::{CommitRequest, Committer};
use request::{FetchResponse, FetchToken, RebalanceListener, ReplySlot, Request};
use state::StateStore;

/// The single-threaded consumer actor.
///
/// Constructed and started through [`RunLoop::spawn`] or
/// [`RunLoop::spawn_kafka`]; interact with it through the returned
/// [`RunLoopHandle`].
pub struct RunLoop {
    config: ConsumerConfig,
    state: Arc<StateStore>,
    gate: Arc<ClientGate>,
    committer: Committer,
    metrics: Arc<RunLoopMetrics>,
    rx: mpsc::UnboundedReceiver<Request>,
    shutdown: watch::Receiver<bool>,
}

impl RunLoop {
    /// Spawns a run loop over a client produced by `make_client`.
    ///
    /// The factory receives the [`RebalanceReactor`] so the client can wire
    /// its revoke/assign callbacks into it; the callbacks must be invoked
    /// synchronously from inside [`ConsumerClient::poll`].
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Configuration`] for an invalid
    /// configuration, or the factory's error.
    pub fn spawn<F>(config: ConsumerConfig, make_client: F) -> Result<RunLoopHandle>
    where
        F: FnOnce(Arc<RebalanceReactor>) -> Result<Box<dyn ConsumerClient>>,
    {
        config.validate()?;

        let state = Arc::new(StateStore::new());
        let metrics = Arc::new(RunLoopMetrics::new());
        let reactor = Arc::new(RebalanceReactor::new(
            Arc::clone(&state),
            Arc::clone(&metrics),
        ));
        let client = make_client(Arc::clone(&reactor))?;
        let gate = Arc::new(ClientGate::new(client));

        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let committer = Committer::new(tx.clone(), &config);
        let poll_interval = config.poll_interval;

        let run_loop = RunLoop {
            config,
            state,
            gate,
            committer: committer.clone(),
            metrics: Arc::clone(&metrics),
            rx,
            shutdown: shutdown_rx.clone(),
        };
        tokio::spawn(run_loop.run());
        tokio::spawn(poll_ticker(tx.clone(), shutdown_rx, poll_interval));

        Ok(RunLoopHandle {
            tx,
            shutdown: shutdown_tx,
            committer,
            metrics,
        })
    }

    /// Spawns a run loop over a Kafka consumer built from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Configuration`] for an invalid
    /// configuration, or [`ConsumerError::Client`] if the consumer cannot
    /// be created.
    pub fn spawn_kafka(config: ConsumerConfig) -> Result<RunLoopHandle> {
        let client_config = config.clone();
        Self::spawn(config, move |reactor| {
            let client: Box<dyn ConsumerClient> = Box::new(
                crate::client::kafka::KafkaConsumerClient::from_config(&client_config, reactor)?,
            );
            Ok(client)
        })
    }

    async fn run(mut self) {
        debug!("run loop started");
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    match changed {
                        Ok(()) => {
                            if *self.shutdown.borrow() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                request = self.rx.recv() => {
                    match request {
                        Some(request) => self.handle_request(request).await,
                        None => break,
                    }
                }
            }
        }
        info!("run loop stopped");
    }

    async fn handle_request(&self, request: Request) {
        trace!(request = request.name(), "handling request");
        match request {
            Request::Subscribe { topics, reply } => self.handle_subscribe(topics, reply).await,
            Request::SubscribePattern { pattern, reply } => {
                self.handle_subscribe_pattern(pattern, reply).await;
            }
            Request::Assign { partitions, reply } => self.handle_assign(partitions, reply).await,
            Request::Unsubscribe { reply } => self.handle_unsubscribe(reply).await,
            Request::Assignment { listener, reply } => {
                self.handle_assignment(listener, reply).await;
            }
            Request::Fetch {
                partition,
                stream,
                partition_stream,
                token,
            } => {
                self.handle_fetch(partition, stream, partition_stream, token)
                    .await;
            }
            Request::Commit(commit) => self.handle_commit(commit).await,
            Request::Poll => self.handle_poll().await,
        }
    }

    async fn handle_subscribe(&self, topics: Vec<String>, reply: ReplySlot<()>) {
        let result = self.gate.with_client(|client| client.subscribe(&topics)).await;
        match result {
            Ok(()) => {
                self.state.modify(|s| s.subscribed = true);
                info!(?topics, "subscribed to topics");
                let _ = reply.send(Ok(()));
            }
            Err(e) => {
                warn!(error = %e, "subscribe failed");
                let _ = reply.send(Err(e.into()));
            }
        }
    }

    async fn handle_subscribe_pattern(&self, pattern: String, reply: ReplySlot<()>) {
        let result = self
            .gate
            .with_client(|client| client.subscribe_pattern(&pattern))
            .await;
        match result {
            Ok(()) => {
                self.state.modify(|s| s.subscribed = true);
                info!(pattern = %pattern, "subscribed to topic pattern");
                let _ = reply.send(Ok(()));
            }
            Err(e) => {
                warn!(error = %e, "pattern subscribe failed");
                let _ = reply.send(Err(e.into()));
            }
        }
    }

    async fn handle_assign(&self, partitions: BTreeSet<TopicPartition>, reply: ReplySlot<()>) {
        let result = self
            .gate
            .with_client(|client| client.assign(&partitions))
            .await;
        match result {
            Ok(()) => {
                self.state.modify(|s| s.subscribed = true);
                info!(partitions = partitions.len(), "assigned partitions manually");
                let _ = reply.send(Ok(()));
            }
            Err(e) => {
                warn!(error = %e, "assign failed");
                let _ = reply.send(Err(e.into()));
            }
        }
    }

    async fn handle_unsubscribe(&self, reply: ReplySlot<()>) {
        let result = self.gate.with_client(|client| client.unsubscribe()).await;
        match result {
            Ok(()) => {
                // Buffered records and pending fetches for the departing
                // partitions are cleared through the revoke callback the
                // client fires for them.
                self.state.modify(|s| s.subscribed = false);
                info!("unsubscribed");
                let _ = reply.send(Ok(()));
            }
            Err(e) => {
                warn!(error = %e, "unsubscribe failed");
                let _ = reply.send(Err(e.into()));
            }
        }
    }

    async fn handle_assignment(
        &self,
        listener: Option<RebalanceListener>,
        reply: ReplySlot<BTreeSet<TopicPartition>>,
    ) {
        if !self.state.read(|s| s.subscribed) {
            let _ = reply.send(Err(ConsumerError::NotSubscribed));
            return;
        }
        let result = self.gate.with_client(|client| client.assignment()).await;
        match result {
            Ok(assignment) => {
                if let Some(listener) = listener {
                    self.state.modify(|s| {
                        s.listeners.push(listener);
                        s.streaming = true;
                    });
                    debug!("stream registered for rebalance notifications");
                }
                let _ = reply.send(Ok(assignment));
            }
            Err(e) => {
                let _ = reply.send(Err(e.into()));
            }
        }
    }

    async fn handle_fetch(
        &self,
        partition: TopicPartition,
        stream: StreamId,
        partition_stream: PartitionStreamId,
        token: FetchToken,
    ) {
        let in_assignment = match self.gate.with_client(|client| client.assignment()).await {
            Ok(assignment) => assignment.contains(&partition),
            Err(e) => {
                warn!(error = %e, "failed to read assignment for fetch");
                false
            }
        };
        if !in_assignment {
            self.metrics.record_fetch_revoked();
            token.complete(Vec::new(), CompletionReason::PartitionRevoked);
            return;
        }

        let revoked = self
            .state
            .modify(|s| s.install_fetch(partition.clone(), stream, partition_stream, token));
        if let Some(token) = revoked {
            debug!(%partition, %stream, %partition_stream, "fetch superseded");
            self.metrics.record_fetch_revoked();
            token.complete(Vec::new(), CompletionReason::PartitionRevoked);
        }
    }

    async fn handle_commit(&self, commit: CommitRequest) {
        let immediate = self.state.modify(|s| {
            if s.rebalancing {
                s.pending_commits.push(commit);
                None
            } else {
                Some(commit)
            }
        });
        match immediate {
            Some(commit) => self.commit_to_client(commit).await,
            None => {
                self.metrics.record_commit_deferred();
                debug!("commit deferred until rebalance completes");
            }
        }
    }

    /// Issues a commit to the client under the gate, bridging the client's
    /// callback onto the request's result slot.
    async fn commit_to_client(&self, commit: CommitRequest) {
        let CommitRequest { offsets, reply } = commit;
        let metrics = Arc::clone(&self.metrics);
        let done: CommitCallback = Box::new(move |result| match result {
            Ok(()) => {
                metrics.record_commit_completed();
                let _ = reply.send(Ok(()));
            }
            Err(e) => {
                metrics.record_commit_failed();
                let _ = reply.send(Err(ConsumerError::CommitFailed(e)));
            }
        });
        self.gate
            .with_client(|client| client.commit(&offsets, done))
            .await;
    }

    /// One poll cycle. Only runs once the consumer is subscribed and at
    /// least one stream has registered.
    async fn handle_poll(&self) {
        let (subscribed, streaming, initial_rebalancing) = self
            .state
            .read(|s| (s.subscribed, s.streaming, s.rebalancing));
        if !subscribed || !streaming {
            return;
        }

        let poll_timeout = self.config.poll_timeout;
        let polled = self
            .gate
            .with_client(|client| {
                let assigned = client.assignment()?;
                let (requested, available) = self.state.read(|s| {
                    (
                        s.fetches.keys().cloned().collect::<BTreeSet<_>>(),
                        s.records.keys().cloned().collect::<BTreeSet<_>>(),
                    )
                });

                // Resume exactly the partitions with unsatisfied demand;
                // everything else currently assigned is paused, including
                // partitions whose buffer already covers their demand.
                let resume: BTreeSet<TopicPartition> = requested
                    .intersection(&assigned)
                    .filter(|tp| !available.contains(*tp))
                    .cloned()
                    .collect();
                let pause: BTreeSet<TopicPartition> =
                    assigned.difference(&resume).cloned().collect();

                client.pause(&pause)?;
                client.resume(&resume)?;
                client.poll(poll_timeout)
            })
            .await;

        let polled = match polled {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "poll failed");
                return;
            }
        };

        let record_count: usize = polled.values().map(Vec::len).sum();
        self.metrics.record_poll(record_count as u64);

        let new_records: BTreeMap<TopicPartition, Vec<CommittableRecord>> = polled
            .into_iter()
            .map(|(tp, records)| {
                let committables = records
                    .into_iter()
                    .map(|record| CommittableRecord::new(record, self.committer.clone()))
                    .collect();
                (tp, committables)
            })
            .collect();

        let (completions, replays) = self.state.modify(|s| {
            // Flush commits deferred by a rebalance that has since
            // completed, before merging this poll's records.
            let replays = if initial_rebalancing && !s.rebalancing {
                s.take_pending_commits()
            } else {
                Vec::new()
            };
            let completions = s.integrate_poll(new_records);
            (completions, replays)
        });

        let completed = completions.len();
        for completion in completions {
            self.metrics.record_fetch_completed();
            completion
                .token
                .complete(completion.records, CompletionReason::FetchedRecords);
        }

        let replayed = replays.len();
        for commit in replays {
            self.commit_to_client(commit).await;
        }

        if record_count > 0 || completed > 0 || replayed > 0 {
            debug!(
                records = record_count,
                fetches_completed = completed,
                commits_replayed = replayed,
                "poll cycle integrated"
            );
        }
    }
}

/// Enqueues a poll request every `interval` until shutdown.
///
/// Enqueueing never blocks; if a prior poll is still being processed the
/// next one queues behind it.
async fn poll_ticker(
    tx: mpsc::UnboundedSender<Request>,
    mut shutdown: watch::Receiver<bool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if tx.send(Request::Poll).is_err() {
                    break;
                }
            }
            changed = shutdown.changed() => {
                match changed {
                    Ok(()) => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

/// Handle for submitting requests to a running [`RunLoop`].
///
/// Dropping the handle shuts the run loop down; in-flight fetch and commit
/// waits then fail with [`ConsumerError::Shutdown`].
pub struct RunLoopHandle {
    tx: mpsc::UnboundedSender<Request>,
    shutdown: watch::Sender<bool>,
    committer: Committer,
    metrics: Arc<RunLoopMetrics>,
}

impl RunLoopHandle {
    async fn send_request<T>(&self, build: impl FnOnce(ReplySlot<T>) -> Request) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| ConsumerError::Shutdown)?;
        rx.await.map_err(|_| ConsumerError::Shutdown)?
    }

    /// Subscribes to the given topics.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Client`] if the client rejects the
    /// subscription, or [`ConsumerError::Shutdown`].
    pub async fn subscribe(&self, topics: Vec<String>) -> Result<()> {
        self.send_request(|reply| Request::Subscribe { topics, reply })
            .await
    }

    /// Subscribes to all topics matching a regex pattern.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Client`] if the client rejects the
    /// subscription, or [`ConsumerError::Shutdown`].
    pub async fn subscribe_pattern(&self, pattern: impl Into<String>) -> Result<()> {
        let pattern = pattern.into();
        self.send_request(|reply| Request::SubscribePattern { pattern, reply })
            .await
    }

    /// Manually assigns the given partitions. No rebalance callbacks fire
    /// for manual assignments.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Client`] if the client rejects the
    /// assignment, or [`ConsumerError::Shutdown`].
    pub async fn assign(&self, partitions: BTreeSet<TopicPartition>) -> Result<()> {
        self.send_request(|reply| Request::Assign { partitions, reply })
            .await
    }

    /// Drops the current subscription.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Client`] if the operation fails, or
    /// [`ConsumerError::Shutdown`].
    pub async fn unsubscribe(&self) -> Result<()> {
        self.send_request(|reply| Request::Unsubscribe { reply })
            .await
    }

    /// Returns the current assignment.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::NotSubscribed`] before the first successful
    /// subscribe or assign, [`ConsumerError::Client`] if the assignment
    /// cannot be read, or [`ConsumerError::Shutdown`].
    pub async fn assignment(&self) -> Result<BTreeSet<TopicPartition>> {
        self.send_request(|reply| Request::Assignment {
            listener: None,
            reply,
        })
        .await
    }

    /// Returns the current assignment and registers a rebalance listener.
    ///
    /// This is the hook by which a stream starts observing rebalances; the
    /// first registration also enables polling.
    ///
    /// # Errors
    ///
    /// Same as [`RunLoopHandle::assignment`].
    pub async fn assignment_with_listener(
        &self,
        listener: RebalanceListener,
    ) -> Result<BTreeSet<TopicPartition>> {
        self.send_request(|reply| Request::Assignment {
            listener: Some(listener),
            reply,
        })
        .await
    }

    /// Submits a fetch and returns the receiver for its completion.
    ///
    /// At most one fetch is outstanding per `(partition, stream)`;
    /// submitting another completes the prior one with a revocation.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Shutdown`] if the run loop is gone.
    pub fn request_fetch(
        &self,
        partition: TopicPartition,
        stream: StreamId,
        partition_stream: PartitionStreamId,
    ) -> Result<oneshot::Receiver<FetchResponse>> {
        let (token, rx) = FetchToken::new();
        self.tx
            .send(Request::Fetch {
                partition,
                stream,
                partition_stream,
                token,
            })
            .map_err(|_| ConsumerError::Shutdown)?;
        Ok(rx)
    }

    /// Fetches the next chunk of records for a partition.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Shutdown`] if the run loop goes away before
    /// the fetch completes.
    pub async fn fetch(
        &self,
        partition: TopicPartition,
        stream: StreamId,
        partition_stream: PartitionStreamId,
    ) -> Result<FetchResponse> {
        let rx = self.request_fetch(partition, stream, partition_stream)?;
        rx.await.map_err(|_| ConsumerError::Shutdown)
    }

    /// Commits the given offsets, applying the configured commit timeout
    /// and recovery policy.
    ///
    /// # Errors
    ///
    /// Same as [`Committer::commit`].
    pub async fn commit(
        &self,
        offsets: BTreeMap<TopicPartition, crate::types::OffsetAndMetadata>,
    ) -> Result<()> {
        self.committer.commit(offsets).await
    }

    /// Submits a raw commit and returns the receiver for its outcome,
    /// without timeout or recovery.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Shutdown`] if the run loop is gone.
    pub fn request_commit(
        &self,
        offsets: BTreeMap<TopicPartition, crate::types::OffsetAndMetadata>,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        self.committer.request(offsets)
    }

    /// Returns a clone of the committer embedded in delivered records.
    #[must_use]
    pub fn committer(&self) -> Committer {
        self.committer.clone()
    }

    /// Enqueues an immediate poll, in addition to the periodic cadence.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Shutdown`] if the run loop is gone.
    pub fn poll_now(&self) -> Result<()> {
        self.tx
            .send(Request::Poll)
            .map_err(|_| ConsumerError::Shutdown)
    }

    /// Returns the run loop's metrics.
    #[must_use]
    pub fn metrics(&self) -> Arc<RunLoopMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Signals the run loop and its poll ticker to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl std::fmt::Debug for RunLoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLoopHandle").finish_non_exhaustive()
    }
}
