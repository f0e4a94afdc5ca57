use anyhow::{Context, Result};
use clap::Parser;
use maven_miner::cli::{Cli, Commands, ConsumeArgs};
use maven_miner::config::{resolve_data_paths, resolve_m2_repo, resolve_queue_path};
use maven_miner::consumer::{ConsumerConfig, QueueConsumer};
use maven_miner::counters::RunCounters;
use maven_miner::gateway::{PersistenceGateway, StoreGateway};
use maven_miner::graph_store::GraphStore;
use maven_miner::measure::{ClassCounter, MeasureCache};
use maven_miner::package_store::PackageStore;
use maven_miner::processor::ArtifactProcessor;
use maven_miner::queue::{Broker, DurableQueue, QueueOptions};
use maven_miner::resolve::{MavenRepository, RepositorySource};
use maven_miner::scan::{discover_coordinates, parse_coordinate_list};
use maven_miner::visitor::{GraphStoreVisitor, PrettyPrinter, VisitorComposite};
use serde_json::json;
use std::env;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.clone() {
        Commands::Consume(args) => consume(&cli, &args)?,
        Commands::Publish { file, from_m2 } => {
            let queue = DurableQueue::open(resolve_queue_path(&cli)?)?;
            queue.declare(&cli.queue_name, QueueOptions::default())?;

            let (coordinates, rejected) = if from_m2 {
                let m2 = resolve_m2_repo(&cli)?;
                (discover_coordinates(&m2)?, Vec::new())
            } else {
                let path = file.context("Nothing to publish: pass FILE or --from-m2")?;
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                parse_coordinate_list(&text)
            };
            for (line, err) in &rejected {
                warn!(line, error = %err, "skipping malformed coordinate");
            }
            for coordinate in &coordinates {
                queue.publish(&cli.queue_name, coordinate.to_string().as_bytes())?;
            }
            let out = json!({
                "queue": cli.queue_name,
                "published": coordinates.len(),
                "rejected": rejected.len(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::Recover => {
            let queue = DurableQueue::open(resolve_queue_path(&cli)?)?;
            let requeued = queue.recover(&cli.queue_name)?;
            let out = json!({ "queue": cli.queue_name, "requeued": requeued });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::Report => {
            let paths = resolve_data_paths(&cli)?;
            paths.ensure()?;
            let graph = GraphStore::open(paths.graph.clone())?.stats()?;
            let packages = PackageStore::open(&paths.packages)?.stats()?;
            let queue = match cli.queue.clone() {
                Some(p) => Some(DurableQueue::open(p)?.depth(&cli.queue_name)?),
                None => None,
            };
            let out = json!({
                "data_dir": paths.root,
                "graph": graph,
                "packages": packages,
                "queue": queue,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }

    Ok(())
}

fn consume(cli: &Cli, args: &ConsumeArgs) -> Result<()> {
    let queue = DurableQueue::open(resolve_queue_path(cli)?)?;
    if args.recover {
        queue.recover(&cli.queue_name)?;
    }

    let paths = resolve_data_paths(cli)?;
    paths.ensure()?;
    let graph = Arc::new(GraphStore::open(paths.graph.clone())?);
    let packages = Arc::new(PackageStore::open(&paths.packages)?);
    let gateway: Arc<dyn PersistenceGateway> = Arc::new(StoreGateway::new(graph, packages));

    let mut visitors = VisitorComposite::new();
    if let Some(target) = args.pretty_printer.as_deref() {
        visitors = visitors.with(PrettyPrinter::new(open_printer(target)?));
    }
    if !args.no_graph_store {
        visitors = visitors.with(GraphStoreVisitor::new(Arc::clone(&gateway)));
    }

    let timeout = Duration::from_secs(args.timeout_secs.max(1));
    let mut sources = vec![RepositorySource::Local(resolve_m2_repo(cli)?)];
    if let Some(url) = cli.remote.as_deref() {
        sources.push(RepositorySource::remote(url, timeout));
    }
    let engine = MavenRepository::new(sources);

    let counter = if args.no_cache {
        ClassCounter::new()
    } else {
        ClassCounter::with_cache(MeasureCache::open(paths.cache.clone())?)
    };

    info!(
        queue = %queue.path().display(),
        sources = ?engine.sources(),
        visitors = ?visitors.names(),
        data_dir = %paths.root.display(),
        "starting consumer"
    );

    let processor = ArtifactProcessor::new(
        Arc::new(engine),
        Arc::new(visitors),
        Arc::new(counter),
        gateway,
        Arc::new(RunCounters::new()),
    )
    .with_timeout(timeout);

    let config = ConsumerConfig {
        queue: cli.queue_name.clone(),
        workers: args.workers.max(1),
        reconnect_backoff: Duration::from_millis(args.reconnect_ms),
        report_interval: Duration::from_secs(args.report_secs.max(1)),
        ..ConsumerConfig::default()
    };
    let broker: Arc<dyn Broker> = Arc::new(queue);
    let consumer = QueueConsumer::new(broker, processor, config);
    install_shutdown_handler(consumer.shutdown_flag())?;

    let report = consumer.run()?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn open_printer(target: &Path) -> Result<Box<dyn Write + Send>> {
    if target == Path::new("-") {
        return Ok(Box::new(std::io::stdout()));
    }
    let file = std::fs::File::create(target)
        .with_context(|| format!("Failed to create {}", target.display()))?;
    Ok(Box::new(std::io::BufWriter::new(file)))
}

fn install_shutdown_handler(shutdown: Arc<AtomicBool>) -> Result<()> {
    #[cfg(unix)]
    {
        use signal_hook::consts::signal;
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([signal::SIGTERM, signal::SIGINT])
            .context("Failed to register signal handlers")?;
        std::thread::spawn(move || {
            if let Some(sig) = signals.forever().next() {
                info!(signal = sig, "shutdown requested, draining in-flight artifacts");
                shutdown.store(true, Ordering::SeqCst);
            }
        });
    }
    #[cfg(not(unix))]
    let _ = shutdown;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("MAVEN_MINER_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "maven_miner=debug,info"
        } else {
            "maven_miner=info,warn"
        })
    });

    let format = env::var("MAVEN_MINER_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}
