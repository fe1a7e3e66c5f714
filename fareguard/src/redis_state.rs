// fareguard/src/redis_state.rs
//
// Redis-backed StateStore.
//
// One ConnectionManager shared by every call; it reconnects on its own after
// a dropped connection, so a lost link surfaces as a retryable
// StoreError::Connection and the next attempt gets a fresh socket.
//
// `apply` sends each StoreOp as one MULTI/EXEC pipeline: the mutation and its
// TTL refresh land together or not at all, which keeps per-op retry from
// double-applying an increment whose EXPIRE failed.
//
// Dependencies:
//   redis = { version = "0.25", features = ["tokio-comp", "connection-manager"] }

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, FromRedisValue, RedisError};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::StoreError;
use crate::state::{StateStore, StoreOp};

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url:                String,   // redis://127.0.0.1:6379
    pub connect_timeout_ms: u64,
    /// Reported in StoreError::Timeout when the server side times out.
    pub op_timeout_ms:      u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url:                "redis://127.0.0.1:6379".to_string(),
            connect_timeout_ms: 5_000,
            op_timeout_ms:      2_000,
        }
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

pub struct RedisStore {
    conn:       ConnectionManager,
    op_timeout: Duration,
}

impl RedisStore {
    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| StoreError::Connection(format!("invalid redis url {}: {}", config.url, e)))?;
        let op_timeout = Duration::from_millis(config.op_timeout_ms);

        let conn = tokio::time::timeout(
            Duration::from_millis(config.connect_timeout_ms),
            ConnectionManager::new(client),
        )
        .await
        .map_err(|_| StoreError::Connection(format!("connect to {} timed out", config.url)))?
        .map_err(|e| map_err(e, op_timeout))?;

        info!("Connected to Redis: {}", config.url);
        Ok(Self { conn, op_timeout })
    }

    async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, StoreError> {
        let mut conn = self.conn.clone();
        cmd.query_async(&mut conn).await.map_err(|e| map_err(e, self.op_timeout))
    }
}

fn map_err(e: RedisError, op_timeout: Duration) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout(op_timeout)
    } else if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Command(e.to_string())
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.query(redis::cmd("INCRBY").arg(key).arg(delta)).await
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64, StoreError> {
        self.query(redis::cmd("INCRBYFLOAT").arg(key).arg(delta)).await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.query::<i64>(redis::cmd("EXPIRE").arg(key).arg(ttl_secs)).await.map(|_| ())
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (f, v) in fields {
            cmd.arg(f).arg(v);
        }
        self.query::<i64>(&cmd).await.map(|_| ())
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        self.query(redis::cmd("HINCRBY").arg(key).arg(field).arg(delta)).await
    }

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, StoreError> {
        self.query(redis::cmd("HGETALL").arg(key)).await
    }

    async fn zincr_by(&self, key: &str, member: &str, delta: f64) -> Result<f64, StoreError> {
        self.query(redis::cmd("ZINCRBY").arg(key).arg(delta).arg(member)).await
    }

    async fn zrevrange_withscores(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<(String, f64)>, StoreError>
    {
        self.query(redis::cmd("ZREVRANGE").arg(key).arg(start).arg(stop).arg("WITHSCORES")).await
    }

    async fn lpush(&self, key: &str, values: &[String]) -> Result<usize, StoreError> {
        self.query(redis::cmd("LPUSH").arg(key).arg(values)).await
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), StoreError> {
        self.query::<()>(redis::cmd("LTRIM").arg(key).arg(start).arg(stop)).await
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError> {
        self.query(redis::cmd("LRANGE").arg(key).arg(start).arg(stop)).await
    }

    async fn apply(&self, op: &StoreOp) -> Result<(), StoreError> {
        let pipe = pipeline(op);
        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await.map_err(|e| map_err(e, self.op_timeout))
    }

    fn atomic_apply(&self) -> bool {
        true
    }
}

/// MULTI/EXEC pipeline for one op; replies are ignored.
fn pipeline(op: &StoreOp) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic();

    let ttl = match op {
        StoreOp::IncrBy { key, delta, ttl } => {
            pipe.cmd("INCRBY").arg(key).arg(*delta).ignore();
            *ttl
        }
        StoreOp::IncrByFloat { key, delta, ttl } => {
            pipe.cmd("INCRBYFLOAT").arg(key).arg(*delta).ignore();
            *ttl
        }
        StoreOp::HSet { key, fields, ttl } => {
            pipe.cmd("HSET").arg(key);
            for (f, v) in fields {
                pipe.arg(f).arg(v);
            }
            pipe.ignore();
            *ttl
        }
        StoreOp::HIncrBy { key, fields, ttl } => {
            for (f, delta) in fields {
                pipe.cmd("HINCRBY").arg(key).arg(f).arg(*delta).ignore();
            }
            *ttl
        }
        StoreOp::PushCapped { key, values, cap, ttl } => {
            pipe.cmd("LPUSH").arg(key).arg(values.as_slice()).ignore();
            pipe.cmd("LTRIM").arg(key).arg(0).arg(*cap as isize - 1).ignore();
            *ttl
        }
        StoreOp::ZIncrBy { key, members } => {
            for (member, delta) in members {
                pipe.cmd("ZINCRBY").arg(key).arg(*delta).arg(member).ignore();
            }
            None
        }
    };

    if let Some(secs) = ttl {
        pipe.cmd("EXPIRE").arg(op.key()).arg(secs).ignore();
    }
    pipe
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        let t = Duration::from_millis(10);
        let io = RedisError::from(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"));
        assert!(matches!(map_err(io, t), StoreError::Connection(_)));

        let timeout = RedisError::from(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert_eq!(map_err(timeout, t), StoreError::Timeout(t));

        let wrong = RedisError::from((redis::ErrorKind::TypeError, "WRONGTYPE"));
        assert!(matches!(map_err(wrong, t), StoreError::Command(_)));
    }

    #[test]
    fn ops_become_one_atomic_pipeline() {
        let op = StoreOp::PushCapped {
            key:    "fraud:alerts:2024-09-03".into(),
            values: vec!["a".into(), "b".into()],
            cap:    100,
            ttl:    Some(604_800),
        };
        let packed = String::from_utf8_lossy(&pipeline(&op).get_packed_pipeline()).to_string();
        assert!(packed.starts_with("*1\r\n$5\r\nMULTI"));
        assert!(packed.contains("LPUSH"));
        assert!(packed.contains("LTRIM"));
        assert!(packed.contains("EXPIRE"));
        assert!(packed.contains("EXEC"));
    }
}
