//! Work queue with manual acknowledgment.
//!
//! [`Broker`] and [`Channel`] describe what the consumer needs from a message
//! broker. [`DurableQueue`] implements them on an LMDB environment: every
//! message lives on disk (the equivalent of a lazy, durable queue), a delivery
//! stays in an unacknowledged table until acked, and a channel that goes away
//! without acking puts its deliveries back at the head of the queue.

use anyhow::Context;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvFlags, EnvOpenOptions, RwTxn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::TransportError;

const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;
const DEFAULT_MAX_DBS: u32 = 64;
const POLL_INTERVAL: Duration = Duration::from_millis(25);
const NEXT_SEQ: &str = "next_seq";
const NEXT_SESSION: &str = "next_session";
const QUEUE_MODE: &str = "x-queue-mode";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub lazy: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            lazy: true,
        }
    }
}

pub trait Broker: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Channel>, TransportError>;
}

/// One consumer session. Deliveries not acked when the channel is dropped
/// become available again.
pub trait Channel: Send {
    fn declare(&mut self, queue: &str, options: QueueOptions) -> Result<(), TransportError>;

    /// Maximum number of unacknowledged deliveries handed to this channel.
    fn qos(&mut self, prefetch: usize);

    /// Waits up to `wait` for a message. `Ok(None)` when nothing arrived or the
    /// prefetch window is full.
    fn next_delivery(&mut self, wait: Duration) -> Result<Option<Delivery>, TransportError>;

    fn ack(&mut self, tag: u64) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub ready: u64,
    pub unacked: u64,
}

#[derive(Debug, Clone, Copy)]
struct QueueDbs {
    ready: Database<Str, Bytes>,
    unacked: Database<Str, Bytes>,
    redelivered: Database<Str, Str>,
    meta: Database<Str, Str>,
}

struct Inner {
    env: Env,
    path: PathBuf,
    queues: Mutex<HashMap<String, QueueDbs>>,
}

#[derive(Clone)]
pub struct DurableQueue {
    inner: Arc<Inner>,
}

impl DurableQueue {
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create queue directory: {}", parent.display())
            })?;
        }

        let mut options = EnvOpenOptions::new();
        options.map_size(DEFAULT_MAP_SIZE);
        options.max_dbs(DEFAULT_MAX_DBS);
        // SAFETY: Default LMDB locking is kept; NO_SUB_DIR stores the env as a single file.
        let env = unsafe {
            options.flags(EnvFlags::NO_SUB_DIR);
            options
                .open(&path)
                .with_context(|| format!("Failed to open queue: {}", path.display()))?
        };

        Ok(Self {
            inner: Arc::new(Inner {
                env,
                path,
                queues: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn declare(&self, queue: &str, options: QueueOptions) -> Result<(), TransportError> {
        let dbs = self.inner.dbs(queue)?;
        let mode = if options.lazy { "lazy" } else { "default" };
        let mut wtxn = self.inner.env.write_txn()?;
        dbs.meta.put(&mut wtxn, QUEUE_MODE, mode)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn publish(&self, queue: &str, body: &[u8]) -> Result<u64, TransportError> {
        let dbs = self.inner.dbs(queue)?;
        let mut wtxn = self.inner.env.write_txn()?;
        let seq = next_counter(&mut wtxn, &dbs, NEXT_SEQ)?;
        dbs.ready.put(&mut wtxn, &seq_key(seq), body)?;
        wtxn.commit()?;
        Ok(seq)
    }

    pub fn depth(&self, queue: &str) -> Result<QueueDepth, TransportError> {
        let dbs = self.inner.dbs(queue)?;
        let rtxn = self.inner.env.read_txn()?;
        Ok(QueueDepth {
            ready: dbs.ready.len(&rtxn)?,
            unacked: dbs.unacked.len(&rtxn)?,
        })
    }

    /// Puts every unacknowledged delivery back, e.g. after a consumer crashed.
    /// Only safe when no other consumer is attached to `queue`.
    pub fn recover(&self, queue: &str) -> Result<usize, TransportError> {
        let requeued = self.inner.requeue(queue, None)?;
        if requeued > 0 {
            info!(queue, requeued, "recovered unacknowledged messages");
        }
        Ok(requeued)
    }
}

impl Inner {
    fn dbs(&self, queue: &str) -> Result<QueueDbs, TransportError> {
        let mut queues = self.queues.lock();
        if let Some(dbs) = queues.get(queue) {
            return Ok(*dbs);
        }

        let mut wtxn = self.env.write_txn()?;
        let dbs = QueueDbs {
            ready: self
                .env
                .create_database(&mut wtxn, Some(&format!("{queue}.ready")))?,
            unacked: self
                .env
                .create_database(&mut wtxn, Some(&format!("{queue}.unacked")))?,
            redelivered: self
                .env
                .create_database(&mut wtxn, Some(&format!("{queue}.redelivered")))?,
            meta: self
                .env
                .create_database(&mut wtxn, Some(&format!("{queue}.meta")))?,
        };
        wtxn.commit()?;
        queues.insert(queue.to_string(), dbs);
        Ok(dbs)
    }

    fn requeue(&self, queue: &str, session: Option<u64>) -> Result<usize, TransportError> {
        let dbs = self.dbs(queue)?;
        let mut wtxn = self.env.write_txn()?;

        let prefix = session.map(|s| format!("{}/", seq_key(s))).unwrap_or_default();
        let mut pending: Vec<(String, Vec<u8>)> = Vec::new();
        for item in dbs.unacked.prefix_iter(&wtxn, prefix.as_str())? {
            let (key, body) = item?;
            pending.push((key.to_string(), body.to_vec()));
        }

        for (key, body) in &pending {
            let Some((_, seq)) = key.split_once('/') else {
                continue;
            };
            dbs.unacked.delete(&mut wtxn, key.as_str())?;
            dbs.ready.put(&mut wtxn, seq, body.as_slice())?;
            dbs.redelivered.put(&mut wtxn, seq, "1")?;
        }
        wtxn.commit()?;
        Ok(pending.len())
    }
}

fn seq_key(n: u64) -> String {
    format!("{n:020}")
}

fn unacked_key(session: u64, tag: u64) -> String {
    format!("{}/{}", seq_key(session), seq_key(tag))
}

fn next_counter(wtxn: &mut RwTxn<'_>, dbs: &QueueDbs, name: &str) -> Result<u64, TransportError> {
    let current = dbs
        .meta
        .get(&*wtxn, name)?
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(1);
    dbs.meta.put(wtxn, name, &(current + 1).to_string())?;
    Ok(current)
}

impl Broker for DurableQueue {
    fn connect(&self) -> Result<Box<dyn Channel>, TransportError> {
        Ok(Box::new(DurableChannel {
            inner: Arc::clone(&self.inner),
            session: None,
            queue: None,
            prefetch: 1,
            outstanding: HashSet::new(),
        }))
    }
}

struct DurableChannel {
    inner: Arc<Inner>,
    session: Option<u64>,
    queue: Option<(String, QueueDbs)>,
    prefetch: usize,
    outstanding: HashSet<u64>,
}

impl DurableChannel {
    fn bound(&self) -> Result<QueueDbs, TransportError> {
        self.queue
            .as_ref()
            .map(|(_, dbs)| *dbs)
            .ok_or_else(|| TransportError::Undeclared("<none>".to_string()))
    }

    fn try_pop(&mut self) -> Result<Option<Delivery>, TransportError> {
        let dbs = self.bound()?;
        let session = self.session.unwrap_or_default();
        let mut wtxn = self.inner.env.write_txn()?;
        let Some((key, body)) = dbs
            .ready
            .first(&wtxn)?
            .map(|(k, v)| (k.to_string(), v.to_vec()))
        else {
            return Ok(None);
        };
        let tag: u64 = key
            .parse()
            .map_err(|_| TransportError::Unavailable(format!("corrupt queue key {key:?}")))?;

        dbs.ready.delete(&mut wtxn, key.as_str())?;
        dbs.unacked
            .put(&mut wtxn, &unacked_key(session, tag), body.as_slice())?;
        let redelivered = dbs.redelivered.get(&wtxn, key.as_str())?.is_some();
        wtxn.commit()?;

        self.outstanding.insert(tag);
        Ok(Some(Delivery {
            tag,
            body,
            redelivered,
        }))
    }
}

impl Channel for DurableChannel {
    fn declare(&mut self, queue: &str, options: QueueOptions) -> Result<(), TransportError> {
        let broker = DurableQueue {
            inner: Arc::clone(&self.inner),
        };
        broker.declare(queue, options)?;
        let dbs = self.inner.dbs(queue)?;

        let mut wtxn = self.inner.env.write_txn()?;
        let session = next_counter(&mut wtxn, &dbs, NEXT_SESSION)?;
        wtxn.commit()?;

        debug!(queue, session, "channel bound");
        self.session = Some(session);
        self.queue = Some((queue.to_string(), dbs));
        Ok(())
    }

    fn qos(&mut self, prefetch: usize) {
        self.prefetch = prefetch.max(1);
    }

    fn next_delivery(&mut self, wait: Duration) -> Result<Option<Delivery>, TransportError> {
        let deadline = Instant::now() + wait;
        loop {
            if self.outstanding.len() < self.prefetch
                && let Some(delivery) = self.try_pop()?
            {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    fn ack(&mut self, tag: u64) -> Result<(), TransportError> {
        let dbs = self.bound()?;
        if !self.outstanding.remove(&tag) {
            return Err(TransportError::UnknownTag(tag));
        }
        let session = self.session.unwrap_or_default();
        let mut wtxn = self.inner.env.write_txn()?;
        dbs.unacked.delete(&mut wtxn, &unacked_key(session, tag))?;
        dbs.redelivered.delete(&mut wtxn, &seq_key(tag))?;
        wtxn.commit()?;
        Ok(())
    }
}

impl Drop for DurableChannel {
    fn drop(&mut self) {
        let (Some((queue, _)), Some(session)) = (self.queue.as_ref(), self.session) else {
            return;
        };
        if self.outstanding.is_empty() {
            return;
        }
        match self.inner.requeue(queue, Some(session)) {
            Ok(n) => debug!(queue = %queue, session, requeued = n, "channel closed"),
            Err(e) => warn!(queue = %queue, session, error = %e, "failed to requeue on close"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const Q: &str = "clientsQueue";

    fn open() -> (tempfile::TempDir, DurableQueue) {
        let dir = tempfile::tempdir().unwrap();
        let queue = DurableQueue::open(dir.path().join("queue.lmdb")).unwrap();
        queue.declare(Q, QueueOptions::default()).unwrap();
        (dir, queue)
    }

    fn channel(queue: &DurableQueue, prefetch: usize) -> Box<dyn Channel> {
        let mut ch = queue.connect().unwrap();
        ch.declare(Q, QueueOptions::default()).unwrap();
        ch.qos(prefetch);
        ch
    }

    #[test]
    fn delivers_in_publish_order_and_acks() -> anyhow::Result<()> {
        let (_dir, queue) = open();
        queue.publish(Q, b"a:b:1")?;
        queue.publish(Q, b"a:c:1")?;

        let mut ch = channel(&queue, 2);
        let first = ch.next_delivery(Duration::ZERO)?.unwrap();
        let second = ch.next_delivery(Duration::ZERO)?.unwrap();
        assert_eq!(first.body, b"a:b:1");
        assert_eq!(second.body, b"a:c:1");
        assert!(!first.redelivered);
        assert_eq!(queue.depth(Q)?, QueueDepth { ready: 0, unacked: 2 });

        ch.ack(first.tag)?;
        ch.ack(second.tag)?;
        assert_eq!(queue.depth(Q)?, QueueDepth { ready: 0, unacked: 0 });
        assert!(matches!(ch.ack(first.tag), Err(TransportError::UnknownTag(_))));
        Ok(())
    }

    #[test]
    fn prefetch_bounds_outstanding_deliveries() -> anyhow::Result<()> {
        let (_dir, queue) = open();
        queue.publish(Q, b"a:b:1")?;
        queue.publish(Q, b"a:c:1")?;

        let mut ch = channel(&queue, 1);
        let first = ch.next_delivery(Duration::ZERO)?.unwrap();
        assert!(ch.next_delivery(Duration::from_millis(30))?.is_none());
        ch.ack(first.tag)?;
        assert!(ch.next_delivery(Duration::ZERO)?.is_some());
        Ok(())
    }

    #[test]
    fn dropped_channel_requeues_unacked_as_redelivered() -> anyhow::Result<()> {
        let (_dir, queue) = open();
        queue.publish(Q, b"a:b:1")?;
        queue.publish(Q, b"a:c:1")?;

        {
            let mut ch = channel(&queue, 1);
            let d = ch.next_delivery(Duration::ZERO)?.unwrap();
            assert_eq!(d.body, b"a:b:1");
        }
        assert_eq!(queue.depth(Q)?, QueueDepth { ready: 2, unacked: 0 });

        let mut ch = channel(&queue, 1);
        let again = ch.next_delivery(Duration::ZERO)?.unwrap();
        assert_eq!(again.body, b"a:b:1");
        assert!(again.redelivered);
        ch.ack(again.tag)?;
        let next = ch.next_delivery(Duration::ZERO)?.unwrap();
        assert!(!next.redelivered);
        Ok(())
    }

    #[test]
    fn recover_requeues_every_unacked_delivery() -> anyhow::Result<()> {
        let (_dir, queue) = open();
        queue.publish(Q, b"a:b:1")?;
        let mut ch = channel(&queue, 1);
        ch.next_delivery(Duration::ZERO)?.unwrap();
        assert_eq!(queue.depth(Q)?.unacked, 1);

        assert_eq!(queue.recover(Q)?, 1);
        assert_eq!(queue.depth(Q)?, QueueDepth { ready: 1, unacked: 0 });
        Ok(())
    }

    #[test]
    fn messages_survive_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("queue.lmdb");
        {
            let queue = DurableQueue::open(path.clone())?;
            queue.publish(Q, b"a:b:1")?;
        }
        let queue = DurableQueue::open(path)?;
        assert_eq!(queue.depth(Q)?, QueueDepth { ready: 1, unacked: 0 });
        Ok(())
    }

    #[test]
    fn undeclared_channel_refuses_to_consume() {
        let (_dir, queue) = open();
        let mut ch = queue.connect().unwrap();
        assert!(matches!(
            ch.next_delivery(Duration::ZERO),
            Err(TransportError::Undeclared(_))
        ));
    }
}
