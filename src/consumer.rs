//! Queue consumer: pulls coordinates off the work queue, runs one pipeline per
//! delivery on a bounded worker pool and acknowledges each delivery once its
//! pipeline reached a terminal state.
//!
//! The consumer thread owns the channel. Workers never touch it; they report
//! back over an mpsc channel and the consumer acks on their behalf. When the
//! broker goes away the channel is dropped (its unacked deliveries go back on
//! the queue) and the consumer reconnects after a fixed backoff. Completions
//! from the dropped session are neither acked nor counted, since the redelivered
//! copy will be, but they keep holding a worker until they finish, so the new
//! session only fills the slots the old one has released.

use anyhow::{Context, Result};
use rayon::ThreadPool;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::coordinate::ArtifactCoordinate;
use crate::counters::CountersSnapshot;
use crate::error::{FailureReason, TransportError};
use crate::processor::{ArtifactProcessor, Outcome};
use crate::queue::{Broker, Channel, Delivery, QueueOptions};

pub const DEFAULT_QUEUE: &str = "clientsQueue";

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub queue: String,
    /// Worker threads; also the prefetch window of the channel.
    pub workers: usize,
    pub reconnect_backoff: Duration,
    pub report_interval: Duration,
    pub poll_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            workers: 1,
            reconnect_backoff: Duration::from_millis(1000),
            report_interval: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsumerReport {
    #[serde(flatten)]
    pub counters: CountersSnapshot,
    /// Deliveries acked without processing because they did not decode.
    pub discarded: u64,
    pub acked: u64,
    pub reconnects: u64,
    pub failures: BTreeMap<FailureReason, u64>,
}

struct Completion {
    session: u64,
    tag: u64,
    outcome: Outcome,
}

enum SessionEnd {
    Shutdown,
    Lost(TransportError),
}

pub struct QueueConsumer {
    broker: Arc<dyn Broker>,
    processor: ArtifactProcessor,
    config: ConsumerConfig,
    shutdown: Arc<AtomicBool>,
}

impl QueueConsumer {
    pub fn new(broker: Arc<dyn Broker>, processor: ArtifactProcessor, config: ConsumerConfig) -> Self {
        Self {
            broker,
            processor,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting the flag stops intake; in-flight work is drained and acked
    /// before [`run`](Self::run) returns.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn run(&self) -> Result<ConsumerReport> {
        let workers = self.config.workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("miner-worker-{i}"))
            .build()
            .context("Failed to build worker pool")?;
        let (done_tx, done_rx) = mpsc::channel::<Completion>();

        let mut state = RunState {
            report: ConsumerReport::default(),
            session: 0,
            in_flight: 0,
            stale_in_flight: 0,
            last_report: Instant::now(),
        };

        while !self.stopping() {
            let mut channel = match self.open_channel(workers) {
                Ok(channel) => channel,
                Err(e) => {
                    warn!(
                        queue = %self.config.queue,
                        error = %e,
                        backoff_ms = self.config.reconnect_backoff.as_millis() as u64,
                        "broker unreachable, retrying"
                    );
                    state.report.reconnects += 1;
                    self.pause(self.config.reconnect_backoff);
                    continue;
                }
            };

            state.session += 1;
            info!(queue = %self.config.queue, workers, session = state.session, "consuming");

            match self.consume(channel.as_mut(), &pool, &done_tx, &done_rx, &mut state) {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(e) => {
                    warn!(
                        queue = %self.config.queue,
                        error = %e,
                        in_flight = state.in_flight,
                        "connection lost, unacked deliveries return to the queue"
                    );
                    state.stale_in_flight += state.in_flight;
                    state.in_flight = 0;
                    drop(channel);
                    state.report.reconnects += 1;
                    self.pause(self.config.reconnect_backoff);
                }
            }
        }

        state.report.counters = self.processor.report();
        info!(
            discarded = state.report.discarded,
            acked = state.report.acked,
            "consumer stopped"
        );
        Ok(state.report)
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn open_channel(&self, prefetch: usize) -> Result<Box<dyn Channel>, TransportError> {
        let mut channel = self.broker.connect()?;
        channel.declare(&self.config.queue, QueueOptions::default())?;
        channel.qos(prefetch);
        Ok(channel)
    }

    /// Sleeps in poll-sized steps so a shutdown request is noticed.
    fn pause(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.stopping() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(self.config.poll_interval.min(deadline - now));
        }
    }

    fn consume(
        &self,
        channel: &mut dyn Channel,
        pool: &ThreadPool,
        done_tx: &Sender<Completion>,
        done_rx: &Receiver<Completion>,
        state: &mut RunState,
    ) -> SessionEnd {
        let prefetch = self.config.workers.max(1);
        loop {
            while let Ok(done) = done_rx.try_recv() {
                if let Err(e) = state.complete(channel, &self.processor, done) {
                    return SessionEnd::Lost(e);
                }
            }

            if self.stopping() {
                return match self.drain(channel, done_rx, state) {
                    Ok(()) => SessionEnd::Shutdown,
                    Err(e) => SessionEnd::Lost(e),
                };
            }

            if state.last_report.elapsed() >= self.config.report_interval {
                self.processor.report();
                state.last_report = Instant::now();
            }

            if state.in_flight + state.stale_in_flight >= prefetch {
                match done_rx.recv_timeout(self.config.poll_interval) {
                    Ok(done) => {
                        if let Err(e) = state.complete(channel, &self.processor, done) {
                            return SessionEnd::Lost(e);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
                }
                continue;
            }

            let delivery = match channel.next_delivery(self.config.poll_interval) {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => return SessionEnd::Lost(e),
            };
            if let Err(e) = self.dispatch(channel, pool, done_tx, delivery, state) {
                return SessionEnd::Lost(e);
            }
        }
    }

    fn dispatch(
        &self,
        channel: &mut dyn Channel,
        pool: &ThreadPool,
        done_tx: &Sender<Completion>,
        delivery: Delivery,
        state: &mut RunState,
    ) -> Result<(), TransportError> {
        let coordinate = match ArtifactCoordinate::decode(&delivery.body) {
            Ok(coordinate) => coordinate,
            Err(e) => {
                warn!(tag = delivery.tag, error = %e, "discarding undecodable message");
                channel.ack(delivery.tag)?;
                state.report.discarded += 1;
                state.report.acked += 1;
                return Ok(());
            }
        };

        debug!(
            coordinate = %coordinate,
            tag = delivery.tag,
            redelivered = delivery.redelivered,
            "received"
        );
        state.in_flight += 1;

        let processor = self.processor.clone();
        let done_tx = done_tx.clone();
        let session = state.session;
        let tag = delivery.tag;
        pool.spawn(move || {
            let outcome = processor.run(&coordinate);
            let _ = done_tx.send(Completion {
                session,
                tag,
                outcome,
            });
        });
        Ok(())
    }

    fn drain(
        &self,
        channel: &mut dyn Channel,
        done_rx: &Receiver<Completion>,
        state: &mut RunState,
    ) -> Result<(), TransportError> {
        if state.in_flight > 0 {
            info!(in_flight = state.in_flight, "draining in-flight artifacts");
        }
        while state.in_flight > 0 {
            match done_rx.recv_timeout(self.config.poll_interval) {
                Ok(done) => state.complete(channel, &self.processor, done)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(())
    }
}

struct RunState {
    report: ConsumerReport,
    session: u64,
    in_flight: usize,
    /// Pipelines still running for deliveries of a dropped session.
    stale_in_flight: usize,
    last_report: Instant,
}

impl RunState {
    /// Acks and counts a completion of the current session. Anything else went
    /// back to the queue with its channel and is only released.
    fn complete(
        &mut self,
        channel: &mut dyn Channel,
        processor: &ArtifactProcessor,
        done: Completion,
    ) -> Result<(), TransportError> {
        if done.session != self.session {
            self.stale_in_flight = self.stale_in_flight.saturating_sub(1);
            debug!(tag = done.tag, session = done.session, "completion from a closed session");
            return Ok(());
        }
        self.in_flight = self.in_flight.saturating_sub(1);
        channel.ack(done.tag)?;
        self.report.acked += 1;
        processor.record(&done.outcome);
        if let Some(failure) = done.outcome.failure() {
            *self.report.failures.entry(failure.reason).or_default() += 1;
        }
        Ok(())
    }
}
