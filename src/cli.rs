use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::consumer::DEFAULT_QUEUE;

#[derive(Debug, Clone, Parser)]
#[command(name = "maven-miner")]
#[command(about = "Mine Maven dependency graphs and package indices from a work queue")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Durable work queue location.
    #[arg(long, value_name = "PATH", global = true)]
    pub queue: Option<PathBuf>,

    #[arg(long, value_name = "NAME", default_value = DEFAULT_QUEUE, global = true)]
    pub queue_name: String,

    /// Directory holding the graph store, package store and measurement cache.
    #[arg(long, value_name = "DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    #[arg(long, value_name = "DIR", global = true)]
    pub m2: Option<PathBuf>,

    /// Remote Maven repository consulted after the local one.
    #[arg(long, value_name = "URL", global = true)]
    pub remote: Option<String>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Process coordinates from the queue until interrupted.
    Consume(ConsumeArgs),
    /// Enqueue coordinates.
    Publish {
        /// File with one coordinate per line.
        #[arg(value_name = "FILE", required_unless_present = "from_m2")]
        file: Option<PathBuf>,

        /// Enqueue every artifact found in the local repository.
        #[arg(long, conflicts_with = "file")]
        from_m2: bool,
    },
    /// Requeue deliveries left unacknowledged by a crashed consumer.
    Recover,
    /// Print store and queue totals.
    Report,
}

#[derive(Debug, Clone, Args)]
pub struct ConsumeArgs {
    /// Print every traversal as a tree to FILE (`-` for stdout).
    #[arg(long, value_name = "FILE")]
    pub pretty_printer: Option<PathBuf>,

    #[arg(long)]
    pub no_graph_store: bool,

    #[arg(long)]
    pub no_cache: bool,

    #[arg(long, value_name = "N", default_value_t = 1)]
    pub workers: usize,

    #[arg(long, value_name = "S", default_value_t = 300)]
    pub timeout_secs: u64,

    #[arg(long, value_name = "S", default_value_t = 60)]
    pub report_secs: u64,

    #[arg(long, value_name = "MS", default_value_t = 1000)]
    pub reconnect_ms: u64,

    /// Run `recover` before consuming. Only safe for a single consumer.
    #[arg(long)]
    pub recover: bool,
}
