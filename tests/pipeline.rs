use maven_miner::consumer::{ConsumerConfig, ConsumerReport, QueueConsumer};
use maven_miner::coordinate::ArtifactCoordinate;
use maven_miner::counters::RunCounters;
use maven_miner::error::{FailureReason, TransportError};
use maven_miner::gateway::{PersistenceGateway, StoreGateway};
use maven_miner::graph::ResolutionStatus;
use maven_miner::graph_store::GraphStore;
use maven_miner::measure::ClassCounter;
use maven_miner::package_store::PackageStore;
use maven_miner::processor::ArtifactProcessor;
use maven_miner::queue::{Broker, Channel, Delivery, DurableQueue, QueueDepth, QueueOptions};
use maven_miner::resolve::MavenRepository;
use maven_miner::visitor::{GraphStoreVisitor, VisitorComposite};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const Q: &str = "clientsQueue";

fn write_jar(path: &Path, entries: &[(&str, &[u8])]) -> anyhow::Result<()> {
    use std::io::Write;
    use zip::write::FileOptions;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (name, content) in entries {
        zip.start_file(*name, options)?;
        zip.write_all(content)?;
    }
    zip.finish()?;
    Ok(())
}

/// Writes Gradle module metadata declaring `deps` as `(coordinate, usage)` pairs.
fn write_module(m2: &Path, coord: &str, deps: &[(&str, &str)]) -> anyhow::Result<()> {
    let coord: ArtifactCoordinate = coord.parse()?;
    let mut variants = Vec::new();
    for usage in ["java-api", "java-runtime"] {
        let mut declared = Vec::new();
        for (dep, dep_usage) in deps {
            if *dep_usage != usage {
                continue;
            }
            let dep: ArtifactCoordinate = dep.parse()?;
            declared.push(serde_json::json!({
                "group": dep.group_id(),
                "module": dep.artifact_id(),
                "version": { "requires": dep.version() }
            }));
        }
        variants.push(serde_json::json!({
            "name": usage,
            "attributes": { "org.gradle.usage": usage },
            "dependencies": declared
        }));
    }
    let doc = serde_json::json!({ "formatVersion": "1.1", "variants": variants });
    let path = m2.join(coord.module_metadata_path());
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(&doc)?)?;
    Ok(())
}

fn seed_repository(m2: &Path) -> anyhow::Result<()> {
    write_module(
        m2,
        "com.acme:app:1.0",
        &[("com.acme:util:1.0", "java-api"), ("com.acme:core:1.0", "java-runtime")],
    )?;
    write_module(m2, "com.acme:util:1.0", &[("com.acme:core:1.0", "java-api")])?;
    write_module(m2, "com.acme:core:1.0", &[])?;
    write_jar(
        &m2.join("com/acme/app/1.0/app-1.0.jar"),
        &[
            ("com/acme/app/Main.class", b"\xCA\xFE\xBA\xBE"),
            ("com/acme/app/Main$Inner.class", b"\xCA\xFE\xBA\xBE"),
        ],
    )?;
    write_jar(
        &m2.join("com/acme/util/1.0/util-1.0.jar"),
        &[
            ("com/acme/util/Strings.class", b"\xCA\xFE\xBA\xBE"),
            ("com/acme/util/text/Lines.class", b"\xCA\xFE\xBA\xBE"),
        ],
    )?;
    Ok(())
}

struct Fixture {
    _dir: tempfile::TempDir,
    queue: DurableQueue,
    gateway: Arc<StoreGateway>,
    counters: Arc<RunCounters>,
    processor: ArtifactProcessor,
}

fn fixture() -> anyhow::Result<Fixture> {
    let dir = tempfile::tempdir()?;
    let m2 = dir.path().join("m2");
    seed_repository(&m2)?;

    let queue = DurableQueue::open(dir.path().join("queue.lmdb"))?;
    queue.declare(Q, QueueOptions::default())?;

    let graph = Arc::new(GraphStore::open(dir.path().join("graph.lmdb"))?);
    let packages = Arc::new(PackageStore::open(&dir.path().join("packages.sqlite"))?);
    let gateway = Arc::new(StoreGateway::new(graph, packages));
    let counters = Arc::new(RunCounters::new());

    let visitors = VisitorComposite::new().with(GraphStoreVisitor::new(
        Arc::clone(&gateway) as Arc<dyn PersistenceGateway>,
    ));
    let processor = ArtifactProcessor::new(
        Arc::new(MavenRepository::local(&m2)),
        Arc::new(visitors),
        Arc::new(ClassCounter::new()),
        Arc::clone(&gateway) as Arc<dyn PersistenceGateway>,
        Arc::clone(&counters),
    )
    .with_timeout(Duration::from_secs(10));

    Ok(Fixture {
        _dir: dir,
        queue,
        gateway,
        counters,
        processor,
    })
}

fn fast_config(workers: usize) -> ConsumerConfig {
    ConsumerConfig {
        queue: Q.to_string(),
        workers,
        reconnect_backoff: Duration::from_millis(20),
        report_interval: Duration::from_secs(3600),
        poll_interval: Duration::from_millis(20),
    }
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn run_until_drained(
    consumer: QueueConsumer,
    queue: &DurableQueue,
    counters: &RunCounters,
    expected: u64,
) -> ConsumerReport {
    let shutdown = consumer.shutdown_flag();
    let handle = std::thread::spawn(move || consumer.run());

    wait_until("queue to drain", || {
        counters.snapshot().completed() >= expected
            && queue.depth(Q).ok() == Some(QueueDepth { ready: 0, unacked: 0 })
    });
    shutdown.store(true, Ordering::SeqCst);
    handle.join().expect("consumer thread panicked").expect("consumer failed")
}

#[test]
fn consumes_measures_and_persists_through_the_durable_queue() -> anyhow::Result<()> {
    let f = fixture()?;
    for body in ["com.acme:app:1.0", "com.acme:util:1.0", "not-a-coordinate", "com.acme:ghost:1.0"] {
        f.queue.publish(Q, body.as_bytes())?;
    }

    let broker: Arc<dyn Broker> = Arc::new(f.queue.clone());
    let consumer = QueueConsumer::new(broker, f.processor.clone(), fast_config(2));
    let report = run_until_drained(consumer, &f.queue, &f.counters, 3);

    assert_eq!(report.discarded, 1);
    assert_eq!(report.acked, 4);
    assert_eq!(report.counters.resolved, 2);
    assert_eq!(report.counters.non_resolved, 1);
    assert_eq!(report.failures.get(&FailureReason::UnresolvablePayload), Some(&1));

    let graph = f.gateway.graph();
    let app: ArtifactCoordinate = "com.acme:app:1.0".parse()?;
    let children: Vec<String> = graph
        .dependencies_of(&app)?
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(children, ["com.acme:core:1.0", "com.acme:util:1.0"]);
    // core is reached from app and from util but stored once.
    let stats = graph.stats()?;
    assert_eq!(stats.nodes, 4);
    assert_eq!(stats.edges, 3);
    let ghost = graph.node(&"com.acme:ghost:1.0".parse()?)?.expect("ghost node stored");
    assert_eq!(ghost.status, ResolutionStatus::Unresolved);

    let packages = f.gateway.packages();
    let app_set = packages.package_set("com.acme:app:1.0")?.expect("app measured");
    assert_eq!(app_set.packages().collect::<Vec<_>>(), ["com.acme.app"]);
    assert_eq!(app_set.class_count(), 1);
    let util_set = packages.package_set("com.acme:util:1.0")?.expect("util measured");
    assert_eq!(util_set.len(), 2);
    assert!(packages.package_set("com.acme:ghost:1.0")?.is_none());
    Ok(())
}

#[test]
fn undecodable_messages_are_acked_without_touching_counters() -> anyhow::Result<()> {
    let f = fixture()?;
    f.queue.publish(Q, b"not-a-coordinate")?;
    f.queue.publish(Q, &[0xff, 0xfe, 0x00])?;

    let broker: Arc<dyn Broker> = Arc::new(f.queue.clone());
    let consumer = QueueConsumer::new(broker, f.processor.clone(), fast_config(1));
    let report = run_until_drained(consumer, &f.queue, &f.counters, 0);

    assert_eq!(report.discarded, 2);
    assert_eq!(report.counters.completed(), 0);
    assert_eq!(f.queue.depth(Q)?, QueueDepth { ready: 0, unacked: 0 });
    Ok(())
}

/// Refuses the first connections and drops the first working channel after
/// one delivery.
struct FlakyBroker {
    inner: DurableQueue,
    refusals: AtomicUsize,
    losses: AtomicUsize,
}

struct FlakyChannel {
    inner: Box<dyn Channel>,
    lose_after: Option<usize>,
    delivered: usize,
}

impl Broker for FlakyBroker {
    fn connect(&self) -> Result<Box<dyn Channel>, TransportError> {
        if self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Unavailable("connection refused".to_string()));
        }
        let lose = self
            .losses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(Box::new(FlakyChannel {
            inner: self.inner.connect()?,
            lose_after: lose.then_some(1),
            delivered: 0,
        }))
    }
}

impl Channel for FlakyChannel {
    fn declare(&mut self, queue: &str, options: QueueOptions) -> Result<(), TransportError> {
        self.inner.declare(queue, options)
    }

    fn qos(&mut self, prefetch: usize) {
        self.inner.qos(prefetch);
    }

    fn next_delivery(&mut self, wait: Duration) -> Result<Option<Delivery>, TransportError> {
        if self.lose_after.is_some_and(|n| self.delivered >= n) {
            return Err(TransportError::Unavailable("connection reset".to_string()));
        }
        let delivery = self.inner.next_delivery(wait)?;
        if delivery.is_some() {
            self.delivered += 1;
        }
        Ok(delivery)
    }

    fn ack(&mut self, tag: u64) -> Result<(), TransportError> {
        self.inner.ack(tag)
    }
}

#[test]
fn reconnects_and_redelivers_after_connection_loss() -> anyhow::Result<()> {
    let f = fixture()?;
    f.queue.publish(Q, b"com.acme:app:1.0")?;
    f.queue.publish(Q, b"com.acme:util:1.0")?;

    let broker: Arc<dyn Broker> = Arc::new(FlakyBroker {
        inner: f.queue.clone(),
        refusals: AtomicUsize::new(2),
        losses: AtomicUsize::new(1),
    });
    let consumer = QueueConsumer::new(broker, f.processor.clone(), fast_config(1));
    let report = run_until_drained(consumer, &f.queue, &f.counters, 2);

    assert!(report.reconnects >= 3, "reconnects = {}", report.reconnects);
    assert!(report.acked >= 2);
    assert_eq!(report.counters.non_resolved, 0);
    let packages = f.gateway.packages();
    assert!(packages.package_set("com.acme:app:1.0")?.is_some());
    assert!(packages.package_set("com.acme:util:1.0")?.is_some());
    Ok(())
}

#[test]
fn connection_loss_does_not_double_count_redelivered_work() -> anyhow::Result<()> {
    let f = fixture()?;
    f.queue.publish(Q, b"com.acme:app:1.0")?;
    f.queue.publish(Q, b"com.acme:util:1.0")?;

    let broker: Arc<dyn Broker> = Arc::new(FlakyBroker {
        inner: f.queue.clone(),
        refusals: AtomicUsize::new(0),
        losses: AtomicUsize::new(1),
    });
    let consumer = QueueConsumer::new(broker, f.processor.clone(), fast_config(2));
    let report = run_until_drained(consumer, &f.queue, &f.counters, 2);

    // Give an abandoned pipeline from the lost session time to finish.
    std::thread::sleep(Duration::from_millis(300));
    assert!(report.reconnects >= 1, "reconnects = {}", report.reconnects);
    assert_eq!(report.counters.completed(), 2);
    assert_eq!(f.counters.snapshot().completed(), 2);
    assert_eq!(f.counters.snapshot().resolved, 2);
    assert_eq!(report.acked, 2);
    assert_eq!(f.queue.depth(Q)?, QueueDepth { ready: 0, unacked: 0 });
    Ok(())
}
