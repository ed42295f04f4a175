//! Event Bus Adapter (§4.A): append-only per-topic streams with
//! consumer-group reads and acknowledgment, plus small-state KV ops, over
//! Redis. One trait so every component depends on `EventBus`, not on the
//! `redis` crate directly — the same boundary-by-trait shape as
//! `ExchangeClient` in `exchange_client.rs`.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisResult};
use std::collections::HashMap;

use crate::error::PipelineError;

pub const DEFAULT_MAXLEN: usize = 200_000;

#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub id: String,
    pub fields: HashMap<String, String>,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn append(&mut self, topic: &str, fields: &[(&str, &str)]) -> Result<String, PipelineError>;

    async fn ensure_group(&mut self, topic: &str, group: &str) -> Result<(), PipelineError>;

    async fn read_group(
        &mut self,
        topic: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block_ms: usize,
    ) -> Result<Vec<StreamRecord>, PipelineError>;

    async fn ack(&mut self, topic: &str, group: &str, id: &str) -> Result<(), PipelineError>;

    async fn trim(&mut self, topic: &str, maxlen: usize) -> Result<(), PipelineError>;

    async fn get(&mut self, key: &str) -> Result<Option<String>, PipelineError>;
    async fn set(&mut self, key: &str, value: &str) -> Result<(), PipelineError>;
    async fn set_nx_ex(&mut self, key: &str, value: &str, ttl_sec: u64) -> Result<bool, PipelineError>;
    async fn expire(&mut self, key: &str, ttl_sec: u64) -> Result<(), PipelineError>;
    async fn delete(&mut self, key: &str) -> Result<(), PipelineError>;

    async fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>, PipelineError>;
    async fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<(), PipelineError>;
    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>, PipelineError>;
    async fn hincrbyfloat(&mut self, key: &str, field: &str, amount: f64) -> Result<f64, PipelineError>;
    async fn hlen(&mut self, key: &str) -> Result<usize, PipelineError>;

    async fn sadd(&mut self, key: &str, member: &str) -> Result<(), PipelineError>;
    async fn smembers(&mut self, key: &str) -> Result<Vec<String>, PipelineError>;
    async fn lrange(&mut self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, PipelineError>;
    async fn rpush(&mut self, key: &str, values: &[String]) -> Result<(), PipelineError>;
    async fn scan_prefix(&mut self, prefix: &str) -> Result<Vec<String>, PipelineError>;
}

/// Redis Streams-backed adapter, the sole production implementation.
pub struct RedisEventBus {
    conn: ConnectionManager,
}

impl RedisEventBus {
    pub async fn connect(url: &str) -> Result<Self, PipelineError> {
        let client = redis::Client::open(url).map_err(|e| PipelineError::Terminal(e.to_string()))?;
        let conn = client
            .get_tokio_connection_manager()
            .await
            .map_err(|e| PipelineError::TransientIo(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn append(&mut self, topic: &str, fields: &[(&str, &str)]) -> Result<String, PipelineError> {
        let id: String = self
            .conn
            .xadd_maxlen(topic, redis::streams::StreamMaxlen::Approx(DEFAULT_MAXLEN), "*", fields)
            .await?;
        Ok(id)
    }

    async fn ensure_group(&mut self, topic: &str, group: &str) -> Result<(), PipelineError> {
        let result: RedisResult<String> = self.conn.xgroup_create_mkstream(topic, group, "$").await;
        match result {
            Ok(_) => Ok(()),
            // BUSYGROUP: consumer group name already exists -> idempotent success.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(PipelineError::from(e)),
        }
    }

    async fn read_group(
        &mut self,
        topic: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block_ms: usize,
    ) -> Result<Vec<StreamRecord>, PipelineError> {
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(max_count)
            .block(block_ms);
        let reply: StreamReadReply = self
            .conn
            .xread_options(&[topic], &[">"], &opts)
            .await?;
        let mut out = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let mut fields = HashMap::new();
                for (k, v) in entry.map {
                    if let redis::Value::Data(bytes) = v {
                        fields.insert(k, String::from_utf8_lossy(&bytes).to_string());
                    }
                }
                out.push(StreamRecord { id: entry.id, fields });
            }
        }
        Ok(out)
    }

    async fn ack(&mut self, topic: &str, group: &str, id: &str) -> Result<(), PipelineError> {
        let _: i64 = self.conn.xack(topic, group, &[id]).await?;
        Ok(())
    }

    async fn trim(&mut self, topic: &str, maxlen: usize) -> Result<(), PipelineError> {
        let _: i64 = self
            .conn
            .xtrim(topic, redis::streams::StreamMaxlen::Approx(maxlen))
            .await?;
        Ok(())
    }

    async fn get(&mut self, key: &str) -> Result<Option<String>, PipelineError> {
        Ok(self.conn.get(key).await?)
    }

    async fn set(&mut self, key: &str, value: &str) -> Result<(), PipelineError> {
        let _: () = self.conn.set(key, value).await?;
        Ok(())
    }

    async fn set_nx_ex(&mut self, key: &str, value: &str, ttl_sec: u64) -> Result<bool, PipelineError> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_sec)
            .query_async(&mut self.conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn expire(&mut self, key: &str, ttl_sec: u64) -> Result<(), PipelineError> {
        let _: bool = self.conn.expire(key, ttl_sec as usize).await?;
        Ok(())
    }

    async fn delete(&mut self, key: &str) -> Result<(), PipelineError> {
        let _: i64 = self.conn.del(key).await?;
        Ok(())
    }

    async fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>, PipelineError> {
        Ok(self.conn.hget(key, field).await?)
    }

    async fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<(), PipelineError> {
        let _: i64 = self.conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>, PipelineError> {
        Ok(self.conn.hgetall(key).await?)
    }

    async fn hincrbyfloat(&mut self, key: &str, field: &str, amount: f64) -> Result<f64, PipelineError> {
        Ok(self.conn.hincr(key, field, amount).await?)
    }

    async fn hlen(&mut self, key: &str) -> Result<usize, PipelineError> {
        Ok(self.conn.hlen(key).await?)
    }

    async fn sadd(&mut self, key: &str, member: &str) -> Result<(), PipelineError> {
        let _: i64 = self.conn.sadd(key, member).await?;
        Ok(())
    }

    async fn smembers(&mut self, key: &str) -> Result<Vec<String>, PipelineError> {
        Ok(self.conn.smembers(key).await?)
    }

    async fn lrange(&mut self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, PipelineError> {
        Ok(self.conn.lrange(key, start, stop).await?)
    }

    async fn rpush(&mut self, key: &str, values: &[String]) -> Result<(), PipelineError> {
        if values.is_empty() {
            return Ok(());
        }
        let _: i64 = self.conn.rpush(key, values).await?;
        Ok(())
    }

    async fn scan_prefix(&mut self, prefix: &str) -> Result<Vec<String>, PipelineError> {
        let pattern = format!("{}*", prefix);
        let mut iter: redis::AsyncIter<String> = self.conn.scan_match(pattern).await?;
        let mut out = Vec::new();
        while let Some(key) = futures_util::StreamExt::next(&mut iter).await {
            out.push(key);
        }
        Ok(out)
    }
}

/// In-memory test double, enough for unit tests exercising guard/outbox
/// logic without a live Redis instance.
#[derive(Default)]
pub struct InMemoryEventBus {
    pub streams: HashMap<String, Vec<StreamRecord>>,
    pub groups: HashMap<(String, String), usize>,
    pub kv: HashMap<String, String>,
    pub hashes: HashMap<String, HashMap<String, String>>,
    pub sets: HashMap<String, Vec<String>>,
    pub lists: HashMap<String, Vec<String>>,
    next_id: u64,
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn append(&mut self, topic: &str, fields: &[(&str, &str)]) -> Result<String, PipelineError> {
        self.next_id += 1;
        let id = format!("{}-0", self.next_id);
        let record = StreamRecord {
            id: id.clone(),
            fields: fields.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        };
        self.streams.entry(topic.to_string()).or_default().push(record);
        Ok(id)
    }

    async fn ensure_group(&mut self, topic: &str, group: &str) -> Result<(), PipelineError> {
        let len = self.streams.get(topic).map(|s| s.len()).unwrap_or(0);
        self.groups.entry((topic.to_string(), group.to_string())).or_insert(len);
        Ok(())
    }

    async fn read_group(
        &mut self,
        topic: &str,
        group: &str,
        _consumer: &str,
        max_count: usize,
        _block_ms: usize,
    ) -> Result<Vec<StreamRecord>, PipelineError> {
        let cursor = *self.groups.get(&(topic.to_string(), group.to_string())).unwrap_or(&0);
        let records = self.streams.get(topic).cloned().unwrap_or_default();
        let slice: Vec<StreamRecord> = records.into_iter().skip(cursor).take(max_count).collect();
        if !slice.is_empty() {
            self.groups
                .insert((topic.to_string(), group.to_string()), cursor + slice.len());
        }
        Ok(slice)
    }

    async fn ack(&mut self, _topic: &str, _group: &str, _id: &str) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn trim(&mut self, topic: &str, maxlen: usize) -> Result<(), PipelineError> {
        if let Some(records) = self.streams.get_mut(topic) {
            if records.len() > maxlen {
                let drop_n = records.len() - maxlen;
                records.drain(0..drop_n);
            }
        }
        Ok(())
    }

    async fn get(&mut self, key: &str) -> Result<Option<String>, PipelineError> {
        Ok(self.kv.get(key).cloned())
    }

    async fn set(&mut self, key: &str, value: &str) -> Result<(), PipelineError> {
        self.kv.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_nx_ex(&mut self, key: &str, value: &str, _ttl_sec: u64) -> Result<bool, PipelineError> {
        if self.kv.contains_key(key) {
            Ok(false)
        } else {
            self.kv.insert(key.to_string(), value.to_string());
            Ok(true)
        }
    }

    async fn expire(&mut self, _key: &str, _ttl_sec: u64) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn delete(&mut self, key: &str) -> Result<(), PipelineError> {
        self.kv.remove(key);
        Ok(())
    }

    async fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>, PipelineError> {
        Ok(self.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<(), PipelineError> {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>, PipelineError> {
        Ok(self.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hincrbyfloat(&mut self, key: &str, field: &str, amount: f64) -> Result<f64, PipelineError> {
        let hash = self.hashes.entry(key.to_string()).or_default();
        let cur: f64 = hash.get(field).and_then(|v| v.parse().ok()).unwrap_or(0.0);
        let new = cur + amount;
        hash.insert(field.to_string(), new.to_string());
        Ok(new)
    }

    async fn hlen(&mut self, key: &str) -> Result<usize, PipelineError> {
        Ok(self.hashes.get(key).map(|h| h.len()).unwrap_or(0))
    }

    async fn sadd(&mut self, key: &str, member: &str) -> Result<(), PipelineError> {
        let set = self.sets.entry(key.to_string()).or_default();
        if !set.iter().any(|m| m == member) {
            set.push(member.to_string());
        }
        Ok(())
    }

    async fn smembers(&mut self, key: &str) -> Result<Vec<String>, PipelineError> {
        Ok(self.sets.get(key).cloned().unwrap_or_default())
    }

    async fn lrange(&mut self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, PipelineError> {
        let list = self.lists.get(key).cloned().unwrap_or_default();
        let len = list.len() as isize;
        let norm = |i: isize| -> isize {
            if i < 0 {
                (len + i).max(0)
            } else {
                i.min(len)
            }
        };
        let (s, e) = (norm(start), norm(stop) + 1);
        if s >= e || s >= len {
            return Ok(Vec::new());
        }
        Ok(list[s as usize..(e.min(len)) as usize].to_vec())
    }

    async fn rpush(&mut self, key: &str, values: &[String]) -> Result<(), PipelineError> {
        self.lists.entry(key.to_string()).or_default().extend_from_slice(values);
        Ok(())
    }

    async fn scan_prefix(&mut self, prefix: &str) -> Result<Vec<String>, PipelineError> {
        Ok(self
            .kv
            .keys()
            .chain(self.hashes.keys())
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_then_read_group_delivers_in_order() {
        let mut bus = InMemoryEventBus::default();
        bus.append("topic", &[("a", "1")]).await.unwrap();
        bus.append("topic", &[("a", "2")]).await.unwrap();
        bus.ensure_group("topic", "g").await.unwrap();
        let recs = bus.read_group("topic", "g", "c1", 10, 0).await.unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].fields.get("a"), Some(&"1".to_string()));
    }

    #[tokio::test]
    async fn read_group_does_not_redeliver_after_cursor_advances() {
        let mut bus = InMemoryEventBus::default();
        bus.append("topic", &[("a", "1")]).await.unwrap();
        bus.ensure_group("topic", "g").await.unwrap();
        let first = bus.read_group("topic", "g", "c1", 10, 0).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = bus.read_group("topic", "g", "c1", 10, 0).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn set_nx_ex_only_acquires_once() {
        let mut bus = InMemoryEventBus::default();
        assert!(bus.set_nx_ex("lock:guard:BTC-EUR", "1", 10).await.unwrap());
        assert!(!bus.set_nx_ex("lock:guard:BTC-EUR", "1", 10).await.unwrap());
    }

    #[tokio::test]
    async fn hincrbyfloat_accumulates() {
        let mut bus = InMemoryEventBus::default();
        bus.hincrbyfloat("trading:exposure", "_global", 10.0).await.unwrap();
        let v = bus.hincrbyfloat("trading:exposure", "_global", 5.5).await.unwrap();
        assert_eq!(v, 15.5);
    }
}
