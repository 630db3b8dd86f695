//! TCP transport: line protocol over pooled sockets, wrapped in the retry policy.

use tracing::trace;

use tagcache_common::{Command, Reply, Stats};

use crate::config::ClientConfig;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::retry::RetryPolicy;
use crate::transport::{PayloadEntry, Transport, TransportHealth};
use crate::{ClientError, ClientResult};

/// Commands per pipelined write; larger batches are split.
const PIPELINE_CHUNK: usize = 512;

pub struct TcpTransport {
    pool: ConnectionPool,
    retry: RetryPolicy,
}

impl TcpTransport {
    pub fn new(pool_config: PoolConfig, retry: RetryPolicy) -> ClientResult<Self> {
        Ok(TcpTransport {
            pool: ConnectionPool::new(pool_config)?,
            retry,
        })
    }

    pub fn from_config(config: &ClientConfig) -> ClientResult<Self> {
        Self::new(config.pool_config(), config.retry_policy())
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    fn call(&self, op: &'static str, command: Command<'_>) -> ClientResult<Reply> {
        command.validate()?;
        self.retry.execute(op, |attempt| {
            trace!(op, attempt, "tcp call");
            let mut conn = self.pool.acquire()?;
            conn.exec(&command)
        })
    }

    fn call_batch(&self, op: &'static str, commands: &[Command<'_>]) -> ClientResult<Vec<ClientResult<Reply>>> {
        for command in commands {
            command.validate()?;
        }
        let mut replies = Vec::with_capacity(commands.len());
        for chunk in commands.chunks(PIPELINE_CHUNK) {
            let part = self.retry.execute(op, |attempt| {
                trace!(op, attempt, commands = chunk.len(), "tcp pipeline");
                let mut conn = self.pool.acquire()?;
                conn.exec_batch(chunk)
            })?;
            replies.extend(part);
        }
        Ok(replies)
    }

    fn count(&self, op: &'static str, command: Command<'_>) -> ClientResult<u64> {
        match self.call(op, command)? {
            Reply::Count(_, n) => Ok(n),
            other => Err(unexpected(op, &other)),
        }
    }
}

fn unexpected(op: &str, reply: &Reply) -> ClientError {
    ClientError::protocol(format!("unexpected reply to {}: {:?}", op, reply))
}

impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn put(&self, key: &str, payload: &str, tags: &[String], ttl_ms: Option<u64>) -> ClientResult<()> {
        let command = Command::Put {
            key,
            ttl_ms,
            tags,
            payload,
        };
        match self.call("put", command)? {
            Reply::Ok => Ok(()),
            other => Err(unexpected("put", &other)),
        }
    }

    fn get(&self, key: &str) -> ClientResult<Option<String>> {
        match self.call("get", Command::Get(key))? {
            Reply::Value(payload) => Ok(Some(payload)),
            Reply::NotFound => Ok(None),
            other => Err(unexpected("get", &other)),
        }
    }

    fn delete(&self, key: &str) -> ClientResult<bool> {
        match self.call("delete", Command::Del(key))? {
            Reply::Deleted(removed) => Ok(removed),
            other => Err(unexpected("delete", &other)),
        }
    }

    fn bulk_get(&self, keys: &[String]) -> ClientResult<Vec<(String, String)>> {
        let commands: Vec<Command<'_>> = keys.iter().map(|k| Command::Get(k)).collect();
        let replies = self.call_batch("bulk_get", &commands)?;
        let mut found = Vec::with_capacity(keys.len());
        for (key, reply) in keys.iter().zip(replies) {
            match reply? {
                Reply::Value(payload) => found.push((key.clone(), payload)),
                Reply::NotFound => {}
                other => return Err(unexpected("bulk_get", &other)),
            }
        }
        Ok(found)
    }

    fn bulk_put(&self, entries: &[PayloadEntry]) -> ClientResult<usize> {
        let commands: Vec<Command<'_>> = entries
            .iter()
            .map(|e| Command::Put {
                key: &e.key,
                ttl_ms: e.ttl_ms,
                tags: &e.tags,
                payload: &e.payload,
            })
            .collect();
        let replies = self.call_batch("bulk_put", &commands)?;
        let mut stored = 0;
        for reply in replies {
            match reply? {
                Reply::Ok => stored += 1,
                other => return Err(unexpected("bulk_put", &other)),
            }
        }
        Ok(stored)
    }

    fn bulk_delete(&self, keys: &[String]) -> ClientResult<usize> {
        let commands: Vec<Command<'_>> = keys.iter().map(|k| Command::Del(k)).collect();
        let replies = self.call_batch("bulk_delete", &commands)?;
        let mut removed = 0;
        for reply in replies {
            match reply? {
                Reply::Deleted(true) => removed += 1,
                Reply::Deleted(false) => {}
                other => return Err(unexpected("bulk_delete", &other)),
            }
        }
        Ok(removed)
    }

    fn invalidate_tag(&self, tag: &str) -> ClientResult<u64> {
        self.count("invalidate_tag", Command::InvTag(tag))
    }

    fn invalidate_tags_any(&self, tags: &[String]) -> ClientResult<u64> {
        self.count("invalidate_tags_any", Command::InvTagsAny(tags))
    }

    fn invalidate_tags_all(&self, tags: &[String]) -> ClientResult<u64> {
        self.count("invalidate_tags_all", Command::InvTagsAll(tags))
    }

    fn invalidate_keys(&self, keys: &[String]) -> ClientResult<u64> {
        self.count("invalidate_keys", Command::InvKeys(keys))
    }

    fn keys_by_tag(&self, tag: &str, limit: Option<usize>) -> ClientResult<Vec<String>> {
        match self.call("keys_by_tag", Command::KeysByTag(tag))? {
            Reply::Keys(mut keys) => {
                if let Some(limit) = limit {
                    keys.truncate(limit);
                }
                Ok(keys)
            }
            other => Err(unexpected("keys_by_tag", &other)),
        }
    }

    fn stats(&self) -> ClientResult<Stats> {
        match self.call("stats", Command::Stats)? {
            Reply::Stats(stats) => Ok(stats),
            other => Err(unexpected("stats", &other)),
        }
    }

    fn flush(&self) -> ClientResult<u64> {
        self.count("flush", Command::Flush)
    }

    fn health(&self) -> TransportHealth {
        let check = self
            .pool
            .acquire()
            .and_then(|mut conn| conn.exec(&Command::Stats));
        let (reachable, detail) = match check {
            Ok(_) => (true, Some("ok".to_string())),
            Err(err) => (false, Some(err.to_string())),
        };
        TransportHealth {
            transport: self.name(),
            reachable,
            pool: Some(self.pool.health()),
            detail,
        }
    }

    fn close(&self) {
        self.pool.close();
    }
}
