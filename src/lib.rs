//! # maven-miner
//!
//! Consumes Maven artifact coordinates from a durable work queue, collects each
//! artifact's transitive dependency graph, measures the root jar's packages and
//! persists topology and package indices into separate stores.
//!
//! ## Architecture
//!
//! - **coordinate**: `group:artifact:version[:classifier]` parsing
//! - **graph**: dependency nodes, edges and traversal events
//! - **resolve**: resolution engine seam and the Maven repository engine
//! - **visitor**: graph visitors and the failure-isolating composite
//! - **measure**: class/package counting with an LMDB measurement cache
//! - **graph_store** / **package_store**: LMDB topology store, SQLite package index
//! - **gateway**: upsert-only write contract over both stores
//! - **processor**: the per-artifact state machine and run counters
//! - **queue** / **consumer**: durable queue with manual acks, bounded worker pool
//! - **scan**: queue seeding from coordinate lists and local repositories

pub mod cli;
pub mod config;
pub mod consumer;
pub mod coordinate;
pub mod counters;
pub mod error;
pub mod gateway;
pub mod graph;
pub mod graph_store;
pub mod measure;
pub mod package_store;
pub mod processor;
pub mod queue;
pub mod resolve;
pub mod scan;
pub mod visitor;
