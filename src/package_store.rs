//! Package/class index persisted in SQLite.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::path::Path;

use crate::error::PersistenceError;
use crate::measure::PackageSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PackageStats {
    pub libraries: u64,
    pub packages: u64,
}

pub struct PackageStore {
    db: Mutex<Connection>,
}

impl PackageStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create package store directory: {}", parent.display())
            })?;
        }
        let db = Connection::open(path)
            .with_context(|| format!("Failed to open package store: {}", path.display()))?;
        Self::with_connection(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(db: Connection) -> Result<Self> {
        ensure_schema(&db)?;
        Ok(Self { db: Mutex::new(db) })
    }

    /// Replaces the stored package set of `library_id`; re-running is a no-op.
    pub fn upsert_package_set(
        &self,
        library_id: &str,
        set: &PackageSet,
    ) -> Result<(), PersistenceError> {
        let mut db = self.db.lock();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO library (coordinates, class_count) VALUES (?1, ?2)
             ON CONFLICT(coordinates) DO UPDATE SET class_count = excluded.class_count",
            params![library_id, set.class_count() as i64],
        )?;
        let id: i64 = tx.query_row(
            "SELECT id FROM library WHERE coordinates = ?1",
            params![library_id],
            |row| row.get(0),
        )?;
        tx.execute("DELETE FROM package WHERE library_id = ?1", params![id])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO package (library_id, name, class_count) VALUES (?1, ?2, ?3)",
            )?;
            for (name, classes) in set.iter() {
                insert.execute(params![id, name, classes as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn package_set(&self, library_id: &str) -> Result<Option<PackageSet>> {
        let db = self.db.lock();
        let id: Option<i64> = db
            .query_row(
                "SELECT id FROM library WHERE coordinates = ?1",
                params![library_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(id) = id else {
            return Ok(None);
        };

        let mut stmt =
            db.prepare("SELECT name, class_count FROM package WHERE library_id = ?1 ORDER BY name")?;
        let rows = stmt.query_map(params![id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut set = PackageSet::new();
        for row in rows {
            let (name, classes) = row?;
            set.add_classes(&name, classes as u64);
        }
        Ok(Some(set))
    }

    /// Libraries whose jar contains `package`.
    pub fn libraries_with_package(&self, package: &str) -> Result<Vec<String>> {
        let db = self.db.lock();
        let mut stmt = db.prepare(
            "SELECT l.coordinates FROM package AS p JOIN library AS l ON l.id = p.library_id
             WHERE p.name = ?1 ORDER BY l.coordinates",
        )?;
        let rows = stmt.query_map(params![package], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn stats(&self) -> Result<PackageStats> {
        let db = self.db.lock();
        let libraries: i64 = db.query_row("SELECT COUNT(*) FROM library", [], |row| row.get(0))?;
        let packages: i64 = db.query_row("SELECT COUNT(*) FROM package", [], |row| row.get(0))?;
        Ok(PackageStats {
            libraries: libraries as u64,
            packages: packages as u64,
        })
    }
}

fn ensure_schema(db: &Connection) -> Result<()> {
    db.execute_batch(
        "CREATE TABLE IF NOT EXISTS library (
             id INTEGER PRIMARY KEY,
             coordinates TEXT NOT NULL UNIQUE,
             class_count INTEGER NOT NULL DEFAULT 0
         );
         CREATE TABLE IF NOT EXISTS package (
             library_id INTEGER NOT NULL REFERENCES library(id),
             name TEXT NOT NULL,
             class_count INTEGER NOT NULL,
             PRIMARY KEY (library_id, name)
         );
         CREATE INDEX IF NOT EXISTS package_name ON package(name);",
    )?;
    Ok(())
}
