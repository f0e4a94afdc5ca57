//! Class counting over resolved jars.
//!
//! [`ClassCounter::measure`] groups the top-level classes of an archive by
//! package. Results may be served from a [`MeasureCache`], keyed by the
//! artifact identity and the SHA-256 of the payload, so a republished
//! SNAPSHOT is always measured again.

use anyhow::{Context, Result};
use heed::types::Str;
use heed::{Database, Env, EnvFlags, EnvOpenOptions};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::error::MeasureError;

pub const MEASUREMENTS_DB: &str = "measurements";

const DEFAULT_MAP_SIZE: usize = 256 * 1024 * 1024;

/// Packages observed in one library, with the number of top-level classes in each.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PackageSet {
    classes: BTreeMap<String, u64>,
}

impl PackageSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_class(&mut self, package: &str) {
        self.add_classes(package, 1);
    }

    pub fn add_classes(&mut self, package: &str, count: u64) {
        *self.classes.entry(package.to_string()).or_default() += count;
    }

    pub fn packages(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.classes.iter().map(|(p, n)| (p.as_str(), *n))
    }

    pub fn contains(&self, package: &str) -> bool {
        self.classes.contains_key(package)
    }

    pub fn classes_in(&self, package: &str) -> u64 {
        self.classes.get(package).copied().unwrap_or(0)
    }

    pub fn class_count(&self) -> u64 {
        self.classes.values().sum()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<S> for PackageSet {
    /// Builds a set from class names such as `org.example.A` or `org/example/A.class`.
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = Self::new();
        for name in iter {
            let name = name.as_ref().trim_end_matches(".class").replace('/', ".");
            let package = name.rsplit_once('.').map(|(p, _)| p).unwrap_or("");
            set.insert_class(package);
        }
        set
    }
}

#[derive(Default)]
pub struct ClassCounter {
    cache: Option<MeasureCache>,
}

impl ClassCounter {
    pub fn new() -> Self {
        Self { cache: None }
    }

    pub fn with_cache(cache: MeasureCache) -> Self {
        Self { cache: Some(cache) }
    }

    pub fn measure(&self, identity: &str, payload: &Path) -> Result<PackageSet, MeasureError> {
        let file = File::open(payload).map_err(|source| MeasureError::Io {
            path: payload.to_path_buf(),
            source,
        })?;
        // SAFETY: The payload is a private temporary file opened read-only; nothing
        // truncates it while the map is alive.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|source| MeasureError::Io {
            path: payload.to_path_buf(),
            source,
        })?;

        let Some(cache) = self.cache.as_ref() else {
            return scan_archive(payload, &mmap);
        };

        let key = format!("{identity}@{}", hex::encode(Sha256::digest(&mmap[..])));
        match cache.get(&key) {
            Ok(Some(hit)) => {
                debug!(identity, "measurement served from cache");
                return Ok(hit);
            }
            Ok(None) => {}
            Err(e) => warn!(identity, error = %e, "measurement cache read failed"),
        }

        let measured = scan_archive(payload, &mmap)?;
        if let Err(e) = cache.put(&key, &measured) {
            warn!(identity, error = %e, "measurement cache write failed");
        }
        Ok(measured)
    }
}

fn scan_archive(path: &Path, bytes: &[u8]) -> Result<PackageSet, MeasureError> {
    let malformed = |source| MeasureError::MalformedArchive {
        path: path.to_path_buf(),
        source,
    };
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(malformed)?;

    let mut set = PackageSet::new();
    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(malformed)?;
        let name = entry.name();
        if !is_top_level_class(name) {
            continue;
        }
        let package = name
            .rsplit_once('/')
            .map(|(dir, _)| dir.replace('/', "."))
            .unwrap_or_default();
        set.insert_class(&package);
    }
    Ok(set)
}

fn is_top_level_class(entry_name: &str) -> bool {
    if !entry_name.ends_with(".class") || entry_name.starts_with("META-INF/") {
        return false;
    }
    let simple = entry_name.rsplit('/').next().unwrap_or(entry_name);
    !simple.contains('$') && simple != "module-info.class" && simple != "package-info.class"
}

/// LMDB-backed measurement cache that survives across runs.
#[derive(Debug)]
pub struct MeasureCache {
    env: Env,
    db_path: PathBuf,
    measurements: Database<Str, Str>,
}

impl MeasureCache {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create cache directory: {}", parent.display())
            })?;
        }

        let mut options = EnvOpenOptions::new();
        options.map_size(DEFAULT_MAP_SIZE);
        options.max_dbs(4);
        // SAFETY: Default LMDB locking is kept; NO_SUB_DIR stores the env as a single file.
        let env = unsafe {
            options.flags(EnvFlags::NO_SUB_DIR);
            options
                .open(&db_path)
                .with_context(|| format!("Failed to open cache env: {}", db_path.display()))?
        };

        let mut wtxn = env.write_txn()?;
        let measurements = env.create_database::<Str, Str>(&mut wtxn, Some(MEASUREMENTS_DB))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            db_path,
            measurements,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn get(&self, key: &str) -> Result<Option<PackageSet>> {
        let rtxn = self.env.read_txn()?;
        let Some(raw) = self.measurements.get(&rtxn, key)? else {
            return Ok(None);
        };
        let set = serde_json::from_str(raw)
            .with_context(|| format!("Corrupt cached measurement for {key}"))?;
        Ok(Some(set))
    }

    pub fn put(&self, key: &str, set: &PackageSet) -> Result<()> {
        let json = serde_json::to_string(set)?;
        let mut wtxn = self.env.write_txn()?;
        self.measurements.put(&mut wtxn, key, json.as_str())?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn len(&self) -> Result<u64> {
        let rtxn = self.env.read_txn()?;
        Ok(self.measurements.len(&rtxn)?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
