//! The shared, persistent message bus (C1): append-only ordered streams
//! with consumer groups, plus key/value and hash primitives with TTL.
//!
//! Every component talks to the bus only through the [`Bus`] trait so
//! that [`mock::MockBus`] can stand in for tests without a live Redis
//! instance, mirroring the trait/mock pairing the rest of this crate's
//! client code uses.

mod mock;
mod redis_bus;

pub use mock::MockBus;
pub use redis_bus::RedisBus;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// One entry read back off a stream: its bus-assigned id and field map.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

#[async_trait]
pub trait Bus: Send + Sync {
    /// Append a new entry to `stream`, trimming to `max_len` (approx) if given.
    async fn publish(
        &self,
        stream: &str,
        fields: &[(&str, String)],
        max_len: Option<usize>,
    ) -> Result<String>;

    /// Block up to `block_ms` for up to `count` new entries for `consumer`
    /// in `group`, creating the group (`$`-start, `MKSTREAM`) if absent.
    async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>>;

    /// Acknowledge an entry, removing it from the group's pending list.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()>;

    /// Claim entries idle for at least `min_idle_ms` in `group`, reassigning
    /// them to `consumer` (used by the reclaim ticker, §4.6).
    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: i64,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    /// Atomic `SET key value NX EX ttl_sec`. Returns `true` if the key was
    /// absent and is now set by this call, `false` if it already existed.
    async fn set_if_absent(&self, key: &str, value: &str, ttl_sec: u64) -> Result<bool>;

    /// Plain `GET`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// `HSET` the given fields then `EXPIRE` the key.
    async fn set_hash(&self, key: &str, fields: &[(&str, String)], ttl_sec: u64) -> Result<()>;

    /// Unconditional `SET key value EX ttl_sec` (overwrites any existing
    /// value), used by the cooldown lock (§4.7) which re-arms its TTL on
    /// every `cex`/`hl` route emission rather than only the first.
    async fn set(&self, key: &str, value: &str, ttl_sec: u64) -> Result<()>;

    /// `SISMEMBER key member` against a collector-maintained set, e.g.
    /// `known_pairs:<exchange>` (§4.1) — out-of-core state the router
    /// reads but never writes.
    async fn set_contains(&self, key: &str, member: &str) -> Result<bool>;
}
