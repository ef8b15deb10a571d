//! Redis backend
//!
//! ## Design
//! - **Connection**: `redis::aio::ConnectionManager` (automatic reconnection)
//! - **Batches**: one non-atomic `redis::pipe()` per flush, one reply per op
//! - **TTL**: `SET key blob EX ttl`, `EXPIRE key ttl` for read refreshes
//!
//! Redis executes every queued command of a non-atomic pipeline even when one
//! of them fails. The pipeline is sent with `ignore_errors`, so each server
//! error comes back as a `Value::ServerError` in its own reply slot and is
//! attributed to that op alone. Nothing is re-sent. I/O failures are reported
//! against every op.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{Client, Cmd, Pipeline, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{Backend, BatchOp, OpOutput, OpResult};
use crate::config::BackendOptions;
use crate::types::{CacheError, Result};

/// Redis-backed cache storage
pub struct RedisBackend {
    /// `None` once closed
    manager: Mutex<Option<ConnectionManager>>,
    /// Redis URL, for logging
    url: String,
}

impl RedisBackend {
    /// Connect to Redis, failing fast if the server is unreachable
    pub async fn connect(options: &BackendOptions) -> Result<Self> {
        info!(url = %options.redis_url, "Connecting to Redis");

        let client = Client::open(options.redis_url.as_str())
            .map_err(|e| CacheError::Connection(format!("Invalid Redis URL: {e}")))?;

        let timeout = Duration::from_millis(options.connection_timeout_ms);
        let manager = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                CacheError::Connection(format!(
                    "Connecting to {} timed out after {}ms",
                    options.redis_url, options.connection_timeout_ms
                ))
            })?
            .map_err(|e| CacheError::Connection(format!("Failed to connect: {e}")))?;

        info!(url = %options.redis_url, "Connected to Redis");

        Ok(Self {
            manager: Mutex::new(Some(manager)),
            url: options.redis_url.clone(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        self.manager.lock().await.clone().ok_or(CacheError::Closed)
    }

    /// Translate a batch op into the Redis command that performs it
    fn command(op: &BatchOp) -> Cmd {
        match op {
            BatchOp::Get { key } => {
                let mut cmd = redis::cmd("GET");
                cmd.arg(key);
                cmd
            }
            BatchOp::Set {
                key,
                blob,
                ttl_seconds,
            } => {
                let mut cmd = redis::cmd("SET");
                cmd.arg(key).arg(blob);
                if let Some(ttl) = ttl_seconds {
                    cmd.arg("EX").arg(*ttl);
                }
                cmd
            }
            BatchOp::Del { key } => {
                let mut cmd = redis::cmd("DEL");
                cmd.arg(key);
                cmd
            }
            BatchOp::Expire { key, ttl_seconds } => {
                let mut cmd = redis::cmd("EXPIRE");
                cmd.arg(key).arg(*ttl_seconds);
                cmd
            }
        }
    }

    /// Interpret one reply in the context of the op that produced it
    fn parse_reply(op: &BatchOp, reply: &Value) -> OpResult {
        if let Value::ServerError(err) = reply {
            return Err(CacheError::BackendOperation(format!(
                "{} {} failed: {err:?}",
                op.name(),
                op.key()
            )));
        }

        let parsed = match op {
            BatchOp::Get { .. } => {
                redis::from_redis_value::<Option<Vec<u8>>>(reply).map(OpOutput::Value)
            }
            BatchOp::Set { .. } => redis::from_redis_value::<String>(reply).map(|_| OpOutput::Done),
            BatchOp::Del { .. } | BatchOp::Expire { .. } => {
                redis::from_redis_value::<i64>(reply).map(|_| OpOutput::Done)
            }
        };

        parsed.map_err(|e| {
            CacheError::BackendOperation(format!("{} {} failed: {e}", op.name(), op.key()))
        })
    }

    /// One non-atomic pipeline holding every op, server errors kept per reply
    fn pipeline(ops: &[BatchOp]) -> Pipeline {
        let mut pipe = redis::pipe();
        pipe.ignore_errors();
        for op in ops {
            pipe.add_command(Self::command(op));
        }
        pipe
    }

    /// Match pipeline replies to their ops, one result per op
    fn parse_replies(ops: &[BatchOp], replies: &[Value]) -> Vec<OpResult> {
        if replies.len() != ops.len() {
            let err = CacheError::BackendOperation(format!(
                "Pipeline returned {} replies for {} ops",
                replies.len(),
                ops.len()
            ));
            return vec![Err(err); ops.len()];
        }

        ops.iter()
            .zip(replies)
            .map(|(op, reply)| Self::parse_reply(op, reply))
            .collect()
    }
}

#[async_trait::async_trait]
impl Backend for RedisBackend {
    async fn ready(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Connection(format!("PING to {} failed: {e}", self.url)))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        let op = BatchOp::Get {
            key: key.to_string(),
        };
        let reply: Value = Self::command(&op).query_async(&mut conn).await?;
        match Self::parse_reply(&op, &reply)? {
            OpOutput::Value(value) => Ok(value),
            OpOutput::Done => Ok(None),
        }
    }

    async fn set(&self, key: &str, blob: Vec<u8>, ttl_seconds: Option<u64>) -> Result<()> {
        let mut conn = self.connection().await?;
        let op = BatchOp::Set {
            key: key.to_string(),
            blob,
            ttl_seconds,
        };
        let reply: Value = Self::command(&op).query_async(&mut conn).await?;
        Self::parse_reply(&op, &reply).map(|_| ())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let op = BatchOp::Del {
            key: key.to_string(),
        };
        let reply: Value = Self::command(&op).query_async(&mut conn).await?;
        Self::parse_reply(&op, &reply).map(|_| ())
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.connection().await?;
        let op = BatchOp::Expire {
            key: key.to_string(),
            ttl_seconds,
        };
        let reply: Value = Self::command(&op).query_async(&mut conn).await?;
        Self::parse_reply(&op, &reply).map(|_| ())
    }

    async fn execute_batch(&self, ops: Vec<BatchOp>) -> Vec<OpResult> {
        if ops.is_empty() {
            return Vec::new();
        }

        let mut conn = match self.connection().await {
            Ok(conn) => conn,
            Err(e) => return vec![Err(e); ops.len()],
        };

        let replies: redis::RedisResult<Vec<Value>> =
            Self::pipeline(&ops).query_async(&mut conn).await;
        match replies {
            Ok(replies) => Self::parse_replies(&ops, &replies),
            Err(e) => {
                warn!(url = %self.url, ops = ops.len(), error = %e, "Pipeline failed");
                vec![Err(CacheError::from(e)); ops.len()]
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.manager.lock().await.take().is_some() {
            info!(url = %self.url, "Redis connection released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed(op: &BatchOp) -> Vec<u8> {
        RedisBackend::command(op).get_packed_command()
    }

    #[test]
    fn test_set_with_ttl_packs_ex() {
        let op = BatchOp::Set {
            key: "doc:1".into(),
            blob: b"blob".to_vec(),
            ttl_seconds: Some(90),
        };
        assert_eq!(
            packed(&op),
            b"*5\r\n$3\r\nSET\r\n$5\r\ndoc:1\r\n$4\r\nblob\r\n$2\r\nEX\r\n$2\r\n90\r\n".to_vec()
        );
    }

    #[test]
    fn test_set_without_ttl_has_no_ex() {
        let op = BatchOp::Set {
            key: "k".into(),
            blob: b"v".to_vec(),
            ttl_seconds: None,
        };
        assert_eq!(
            packed(&op),
            b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n".to_vec()
        );
    }

    #[test]
    fn test_get_del_expire_commands() {
        assert_eq!(
            packed(&BatchOp::Get { key: "k".into() }),
            b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n".to_vec()
        );
        assert_eq!(
            packed(&BatchOp::Del { key: "k".into() }),
            b"*2\r\n$3\r\nDEL\r\n$1\r\nk\r\n".to_vec()
        );
        assert_eq!(
            packed(&BatchOp::Expire {
                key: "k".into(),
                ttl_seconds: 30
            }),
            b"*3\r\n$6\r\nEXPIRE\r\n$1\r\nk\r\n$2\r\n30\r\n".to_vec()
        );
    }

    #[test]
    fn test_pipeline_sends_each_op_once() {
        let ops = vec![
            BatchOp::Set {
                key: "a".into(),
                blob: b"1".to_vec(),
                ttl_seconds: None,
            },
            BatchOp::Get { key: "b".into() },
        ];

        let mut expected = packed(&ops[0]);
        expected.extend(packed(&ops[1]));
        assert_eq!(RedisBackend::pipeline(&ops).get_packed_pipeline(), expected);
    }

    #[test]
    fn test_parse_get_replies() {
        let get = BatchOp::Get { key: "k".into() };
        assert_eq!(
            RedisBackend::parse_reply(&get, &Value::Nil),
            Ok(OpOutput::Value(None))
        );
        assert_eq!(
            RedisBackend::parse_reply(&get, &Value::BulkString(b"x".to_vec())),
            Ok(OpOutput::Value(Some(b"x".to_vec())))
        );
    }

    #[test]
    fn test_parse_write_replies() {
        let set = BatchOp::Set {
            key: "k".into(),
            blob: b"v".to_vec(),
            ttl_seconds: None,
        };
        let del = BatchOp::Del { key: "k".into() };
        let expire = BatchOp::Expire {
            key: "k".into(),
            ttl_seconds: 5,
        };

        assert_eq!(RedisBackend::parse_reply(&set, &Value::Okay), Ok(OpOutput::Done));
        assert_eq!(RedisBackend::parse_reply(&del, &Value::Int(1)), Ok(OpOutput::Done));
        assert_eq!(RedisBackend::parse_reply(&del, &Value::Int(0)), Ok(OpOutput::Done));
        assert_eq!(RedisBackend::parse_reply(&expire, &Value::Int(0)), Ok(OpOutput::Done));
    }

    #[test]
    fn test_bad_reply_fails_only_its_op() {
        let ops = vec![
            BatchOp::Set {
                key: "a".into(),
                blob: b"1".to_vec(),
                ttl_seconds: None,
            },
            BatchOp::Set {
                key: "b".into(),
                blob: b"2".to_vec(),
                ttl_seconds: None,
            },
            BatchOp::Get { key: "c".into() },
        ];
        let replies = vec![Value::Okay, Value::Nil, Value::Nil];

        let results = RedisBackend::parse_replies(&ops, &replies);
        assert_eq!(results[0], Ok(OpOutput::Done));
        assert!(matches!(results[1], Err(CacheError::BackendOperation(ref msg)) if msg.contains("set b")));
        assert_eq!(results[2], Ok(OpOutput::Value(None)));
    }

    #[test]
    fn test_reply_count_mismatch_fails_every_op() {
        let ops = vec![BatchOp::Get { key: "a".into() }, BatchOp::Get { key: "b".into() }];

        let results = RedisBackend::parse_replies(&ops, &[Value::Nil]);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| matches!(r, Err(CacheError::BackendOperation(_)))));
    }
}
