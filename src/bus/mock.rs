use super::{Bus, StreamEntry};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct StoredEntry {
    id: String,
    fields: HashMap<String, String>,
    delivered_at: Option<Instant>,
    acked: bool,
}

#[derive(Debug, Clone)]
struct KvEntry {
    value: String,
    expires_at: Instant,
}

impl KvEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Default)]
struct MockState {
    streams: HashMap<String, Vec<StoredEntry>>,
    kv: HashMap<String, KvEntry>,
    sets: HashMap<String, std::collections::HashSet<String>>,
    seq: u64,
}

/// In-memory [`Bus`] for unit and integration tests. Follows the same
/// `Arc<RwLock<State>>` + `with_*` builder shape as the rest of this
/// crate's client mocks.
pub struct MockBus {
    state: Arc<RwLock<MockState>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MockState::default())),
        }
    }

    /// Number of unacknowledged entries currently pending for `stream`.
    pub fn pending_count(&self, stream: &str) -> usize {
        self.state
            .read()
            .streams
            .get(stream)
            .map(|entries| entries.iter().filter(|e| !e.acked).count())
            .unwrap_or(0)
    }

    pub fn stream_len(&self, stream: &str) -> usize {
        self.state.read().streams.get(stream).map(|e| e.len()).unwrap_or(0)
    }

    /// Test helper: seeds a collector-maintained set (e.g. `known_pairs:binance`)
    /// so router tests can exercise `cex_listing_exists` without a real collector.
    pub fn seed_set(&self, key: &str, member: &str) {
        self.state
            .write()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MockBus {
    async fn publish(
        &self,
        stream: &str,
        fields: &[(&str, String)],
        max_len: Option<usize>,
    ) -> Result<String> {
        let mut state = self.state.write();
        state.seq += 1;
        let id = format!("{}-0", state.seq);
        let entry = StoredEntry {
            id: id.clone(),
            fields: fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            delivered_at: None,
            acked: false,
        };
        let entries = state.streams.entry(stream.to_string()).or_default();
        entries.push(entry);
        if let Some(max_len) = max_len {
            let excess = entries.len().saturating_sub(max_len);
            if excess > 0 {
                entries.drain(0..excess);
            }
        }
        Ok(id)
    }

    async fn consume(
        &self,
        stream: &str,
        _group: &str,
        _consumer: &str,
        count: usize,
        _block_ms: u64,
    ) -> Result<Vec<StreamEntry>> {
        let mut state = self.state.write();
        let entries = state.streams.entry(stream.to_string()).or_default();
        let now = Instant::now();
        let mut out = Vec::new();
        for entry in entries.iter_mut() {
            if out.len() >= count {
                break;
            }
            if entry.delivered_at.is_none() {
                entry.delivered_at = Some(now);
                out.push(StreamEntry {
                    id: entry.id.clone(),
                    fields: entry.fields.clone(),
                });
            }
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, _group: &str, id: &str) -> Result<()> {
        let mut state = self.state.write();
        if let Some(entries) = state.streams.get_mut(stream) {
            if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
                entry.acked = true;
            }
        }
        Ok(())
    }

    async fn claim_idle(
        &self,
        stream: &str,
        _group: &str,
        _consumer: &str,
        min_idle_ms: i64,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut state = self.state.write();
        let now = Instant::now();
        let min_idle = Duration::from_millis(min_idle_ms.max(0) as u64);
        let entries = state.streams.entry(stream.to_string()).or_default();
        let mut out = Vec::new();
        for entry in entries.iter_mut() {
            if out.len() >= count {
                break;
            }
            let idle = entry
                .delivered_at
                .map(|t| now.duration_since(t) >= min_idle)
                .unwrap_or(false);
            if !entry.acked && idle {
                entry.delivered_at = Some(now);
                out.push(StreamEntry {
                    id: entry.id.clone(),
                    fields: entry.fields.clone(),
                });
            }
        }
        Ok(out)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl_sec: u64) -> Result<bool> {
        let mut state = self.state.write();
        if let Some(existing) = state.kv.get(key) {
            if !existing.is_expired() {
                return Ok(false);
            }
        }
        state.kv.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: Instant::now() + Duration::from_secs(ttl_sec),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let state = self.state.read();
        Ok(state
            .kv
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.value.clone()))
    }

    async fn set_hash(&self, key: &str, fields: &[(&str, String)], ttl_sec: u64) -> Result<()> {
        let mut state = self.state.write();
        let encoded = serde_json::to_string(
            &fields.iter().map(|(k, v)| (*k, v.clone())).collect::<HashMap<_, _>>(),
        )?;
        state.kv.insert(
            key.to_string(),
            KvEntry {
                value: encoded,
                expires_at: Instant::now() + Duration::from_secs(ttl_sec),
            },
        );
        Ok(())
    }

    async fn set(&self, key: &str, value: &str, ttl_sec: u64) -> Result<()> {
        let mut state = self.state.write();
        state.kv.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: Instant::now() + Duration::from_secs(ttl_sec),
            },
        );
        Ok(())
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let state = self.state.read();
        Ok(state
            .sets
            .get(key)
            .map(|members| members.contains(member))
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_is_idempotent_within_ttl() {
        let bus = MockBus::new();
        assert!(bus.set_if_absent("dedup:abc", "1", 300).await.unwrap());
        assert!(!bus.set_if_absent("dedup:abc", "1", 300).await.unwrap());
    }

    #[tokio::test]
    async fn publish_then_consume_then_ack() {
        let bus = MockBus::new();
        bus.publish("events:raw", &[("source", "ws_binance".to_string())], None)
            .await
            .unwrap();
        let entries = bus
            .consume("events:raw", "fusion_engine_group", "c1", 10, 0)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(bus.pending_count("events:raw"), 1);
        bus.ack("events:raw", "fusion_engine_group", &entries[0].id)
            .await
            .unwrap();
        assert_eq!(bus.pending_count("events:raw"), 0);
    }

    #[tokio::test]
    async fn max_len_trims_oldest() {
        let bus = MockBus::new();
        for i in 0..5 {
            bus.publish("events:fused", &[("n", i.to_string())], Some(3))
                .await
                .unwrap();
        }
        assert_eq!(bus.stream_len("events:fused"), 3);
    }
}
