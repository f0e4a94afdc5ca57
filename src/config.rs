use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

use crate::cli::Cli;
use crate::scan::default_m2_repository;

pub const HOME_ENV: &str = "MAVEN_MINER_HOME";

const GRAPH_DB: &str = "graph.lmdb";
const PACKAGES_DB: &str = "packages.sqlite";
const CACHE_DB: &str = "cache.lmdb";

/// Store locations under one data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    pub root: PathBuf,
    pub graph: PathBuf,
    pub packages: PathBuf,
    pub cache: PathBuf,
}

impl DataPaths {
    pub fn under(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            graph: root.join(GRAPH_DB),
            packages: root.join(PACKAGES_DB),
            cache: root.join(CACHE_DB),
        }
    }

    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create data directory: {}", self.root.display()))
    }
}

pub fn resolve_queue_path(cli: &Cli) -> Result<PathBuf> {
    cli.queue
        .clone()
        .context("No work queue configured: pass --queue <PATH>")
}

pub fn resolve_m2_repo(cli: &Cli) -> Result<PathBuf> {
    if let Some(p) = cli.m2.clone() {
        return Ok(p);
    }
    default_m2_repository()
}

pub fn resolve_data_paths(cli: &Cli) -> Result<DataPaths> {
    if let Some(p) = cli.data_dir.as_deref() {
        return Ok(DataPaths::under(p));
    }
    Ok(DataPaths::under(&maven_miner_home()?))
}

fn maven_miner_home() -> Result<PathBuf> {
    if let Ok(p) = env::var(HOME_ENV)
        && !p.trim().is_empty()
    {
        return Ok(PathBuf::from(p));
    }

    let base = dirs::data_local_dir()
        .or_else(dirs::cache_dir)
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("Failed to resolve data directory"))?;
    Ok(base.join("maven-miner"))
}
