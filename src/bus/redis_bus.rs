use super::{Bus, StreamEntry};
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;

/// Redis-backed [`Bus`]. Streams map onto `XADD`/`XREADGROUP`/`XACK`/
/// `XAUTOCLAIM`; the TTL primitives map onto `SET ... NX EX` and
/// `HSET`+`EXPIRE`.
pub struct RedisBus {
    conn: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let client = redis::Client::open(endpoint).map_err(CoreError::BusTransient)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(CoreError::BusTransient)?;
        Ok(Self { conn })
    }

    /// Idempotently creates the consumer group at the tail of the stream,
    /// creating the stream itself if it doesn't exist yet.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let res: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match res {
            Ok(()) => Ok(()),
            // BUSYGROUP: the group already exists, which is the common case.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(CoreError::BusTransient(e)),
        }
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(
        &self,
        stream: &str,
        fields: &[(&str, String)],
        max_len: Option<usize>,
    ) -> Result<String> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(len) = max_len {
            cmd.arg("MAXLEN").arg("~").arg(len as i64);
        }
        cmd.arg("*");
        for (k, v) in fields {
            cmd.arg(*k).arg(v);
        }
        let id: String = cmd.query_async(&mut conn).await.map_err(CoreError::BusTransient)?;
        Ok(id)
    }

    async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>> {
        self.ensure_group(stream, group).await?;
        let mut conn = self.conn.clone();

        let opts = redis::streams::StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms as usize);

        let reply: redis::streams::StreamReadReply = conn
            .xread_options(&[stream], &[">"], &opts)
            .await
            .map_err(CoreError::BusTransient)?;

        Ok(flatten_stream_reply(reply))
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(stream, group, &[id])
            .await
            .map_err(CoreError::BusTransient)?;
        Ok(())
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: i64,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let reply: redis::streams::StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(CoreError::BusTransient)?;

        Ok(reply
            .claimed
            .into_iter()
            .map(|entry| StreamEntry {
                id: entry.id,
                fields: fields_from_stream_id(entry.map),
            })
            .collect())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl_sec: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_sec)
            .query_async(&mut conn)
            .await
            .map_err(CoreError::BusTransient)?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = conn.get(key).await.map_err(CoreError::BusTransient)?;
        Ok(reply)
    }

    async fn set_hash(&self, key: &str, fields: &[(&str, String)], ttl_sec: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let pairs: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let _: () = conn.hset_multiple(key, &pairs).await.map_err(CoreError::BusTransient)?;
        let _: bool = conn.expire(key, ttl_sec as i64).await.map_err(CoreError::BusTransient)?;
        Ok(())
    }

    async fn set(&self, key: &str, value: &str, ttl_sec: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl_sec).await.map_err(CoreError::BusTransient)?;
        Ok(())
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: bool = conn.sismember(key, member).await.map_err(CoreError::BusTransient)?;
        Ok(reply)
    }
}

fn fields_from_stream_id(map: HashMap<String, redis::Value>) -> HashMap<String, String> {
    map.into_iter()
        .filter_map(|(k, v)| match v {
            redis::Value::BulkString(bytes) => {
                String::from_utf8(bytes).ok().map(|s| (k, s))
            }
            redis::Value::SimpleString(s) => Some((k, s)),
            _ => None,
        })
        .collect()
}

fn flatten_stream_reply(reply: redis::streams::StreamReadReply) -> Vec<StreamEntry> {
    let mut out = Vec::new();
    for key in reply.keys {
        for id_entry in key.ids {
            out.push(StreamEntry {
                id: id_entry.id,
                fields: fields_from_stream_id(id_entry.map),
            });
        }
    }
    out
}
