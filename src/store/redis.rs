//! Production [`Store`] binding over the `redis` crate.
//!
//! Plain commands go through a shared [`ConnectionManager`]. Guarded
//! writes need `WATCH`, whose dirty-flag is connection-scoped, so each
//! guarded write runs on a dedicated connection checked out from the
//! client. The binding is also where the client's nil sentinel is
//! classified: absent values become `None` / typed outcomes, everything
//! else becomes [`StoreError::Transport`].

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use snafu::OptionExt as _;
use snafu::ensure;

use super::ContentionSnafu;
use super::GuardedOutcome;
use super::GuardedWrite;
use super::ScoredMember;
use super::Store;
use super::StoreCommand;
use super::StoreError;
use super::StoreReply;
use super::UnexpectedReplySnafu;

/// [`Store`] implementation backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    connection: ConnectionManager,
}

impl RedisStore {
    /// Connect to the server at `url` (e.g. `redis://127.0.0.1/`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(transport)?;
        Self::with_client(client).await
    }

    /// Build a store from an already configured client.
    pub async fn with_client(client: redis::Client) -> Result<Self, StoreError> {
        let connection = ConnectionManager::new(client.clone()).await.map_err(transport)?;
        Ok(Self { client, connection })
    }
}

fn transport(err: redis::RedisError) -> StoreError {
    StoreError::Transport {
        message: err.to_string(),
    }
}

fn command_name(command: &StoreCommand) -> &'static str {
    match command {
        StoreCommand::Del { .. } => "DEL",
        StoreCommand::Expire { .. } => "PEXPIRE",
        StoreCommand::Incr { .. } => "INCR",
        StoreCommand::ZAdd { .. } => "ZADD",
        StoreCommand::ZRem { .. } => "ZREM",
        StoreCommand::ZRank { .. } => "ZRANK",
        StoreCommand::ZRemRangeByScore { .. } => "ZREMRANGEBYSCORE",
        StoreCommand::ZInterStoreMax { .. } => "ZINTERSTORE",
    }
}

fn append(pipe: &mut redis::Pipeline, command: &StoreCommand) {
    match command {
        StoreCommand::Del { key } => {
            pipe.cmd("DEL").arg(key);
        }
        StoreCommand::Expire { key, ttl } => {
            pipe.cmd("PEXPIRE").arg(key).arg(ttl.as_millis() as u64);
        }
        StoreCommand::Incr { key } => {
            pipe.cmd("INCR").arg(key);
        }
        StoreCommand::ZAdd { key, member, score } => {
            pipe.cmd("ZADD").arg(key).arg(*score).arg(member);
        }
        StoreCommand::ZRem { key, member } => {
            pipe.cmd("ZREM").arg(key).arg(member);
        }
        StoreCommand::ZRank { key, member } => {
            pipe.cmd("ZRANK").arg(key).arg(member);
        }
        StoreCommand::ZRemRangeByScore { key, max } => {
            pipe.cmd("ZREMRANGEBYSCORE").arg(key).arg("-inf").arg(*max);
        }
        StoreCommand::ZInterStoreMax { dest, keys, weights } => {
            pipe.cmd("ZINTERSTORE")
                .arg(dest)
                .arg(2)
                .arg(&keys[0])
                .arg(&keys[1])
                .arg("WEIGHTS")
                .arg(weights[0])
                .arg(weights[1])
                .arg("AGGREGATE")
                .arg("MAX");
        }
    }
}

fn interpret(command: &StoreCommand, value: &redis::Value) -> Result<StoreReply, StoreError> {
    match command {
        StoreCommand::Del { .. }
        | StoreCommand::Expire { .. }
        | StoreCommand::ZAdd { .. }
        | StoreCommand::ZRem { .. } => {
            let count: i64 = redis::from_redis_value(value)
                .ok()
                .context(UnexpectedReplySnafu {
                    operation: command_name(command),
                })?;
            Ok(StoreReply::Flag(count > 0))
        }
        StoreCommand::Incr { .. }
        | StoreCommand::ZRemRangeByScore { .. }
        | StoreCommand::ZInterStoreMax { .. } => {
            let count: i64 = redis::from_redis_value(value)
                .ok()
                .context(UnexpectedReplySnafu {
                    operation: command_name(command),
                })?;
            Ok(StoreReply::Int(count))
        }
        StoreCommand::ZRank { .. } => {
            let rank: Option<i64> = redis::from_redis_value(value)
                .ok()
                .context(UnexpectedReplySnafu {
                    operation: command_name(command),
                })?;
            Ok(StoreReply::Rank(rank.map(|rank| rank as u64)))
        }
    }
}

impl RedisStore {
    async fn run_pipeline(
        &self,
        commands: &[StoreCommand],
        atomic: bool,
    ) -> Result<Vec<StoreReply>, StoreError> {
        let mut pipe = redis::pipe();
        if atomic {
            pipe.atomic();
        }
        for command in commands {
            append(&mut pipe, command);
        }

        let mut connection = self.connection.clone();
        let values: Vec<redis::Value> = pipe.query_async(&mut connection).await.map_err(transport)?;
        ensure!(
            values.len() == commands.len(),
            UnexpectedReplySnafu { operation: "pipeline" }
        );

        commands
            .iter()
            .zip(values.iter())
            .map(|(command, value)| interpret(command, value))
            .collect()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut connection = self.connection.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(transport)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let _: () = cmd.query_async(&mut connection).await.map_err(transport)?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .arg("NX")
            .query_async(&mut connection)
            .await
            .map_err(transport)?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(transport)?;
        Ok(removed > 0)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let added: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut connection)
            .await
            .map_err(transport)?;
        Ok(added > 0)
    }

    async fn zadd_xx(&self, key: &str, member: &str, score: f64) -> Result<bool, StoreError> {
        // ZADD .. XX answers 0 both for "updated" and "absent"; probe the
        // member's score in the same transaction to tell them apart.
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("ZADD").arg(key).arg("XX").arg(score).arg(member).ignore();
        pipe.cmd("ZSCORE").arg(key).arg(member);

        let mut connection = self.connection.clone();
        let (probe,): (Option<f64>,) = pipe.query_async(&mut connection).await.map_err(transport)?;
        Ok(probe.is_some())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let removed: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut connection)
            .await
            .map_err(transport)?;
        Ok(removed > 0)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        let mut connection = self.connection.clone();
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(key)
            .arg(member)
            .query_async(&mut connection)
            .await
            .map_err(transport)?;
        Ok(score)
    }

    async fn zrevrange_withscores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<ScoredMember>, StoreError> {
        let mut connection = self.connection.clone();
        let entries: Vec<(String, f64)> = redis::cmd("ZREVRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .arg("WITHSCORES")
            .query_async(&mut connection)
            .await
            .map_err(transport)?;
        Ok(entries
            .into_iter()
            .map(|(member, score)| ScoredMember { member, score })
            .collect())
    }

    async fn pipelined(&self, commands: Vec<StoreCommand>) -> Result<Vec<StoreReply>, StoreError> {
        self.run_pipeline(&commands, false).await
    }

    async fn tx_pipelined(&self, commands: Vec<StoreCommand>) -> Result<Vec<StoreReply>, StoreError> {
        self.run_pipeline(&commands, true).await
    }

    async fn guarded_write(
        &self,
        key: &str,
        expected: &str,
        write: GuardedWrite,
    ) -> Result<GuardedOutcome, StoreError> {
        // WATCH state is per connection; a fresh one keeps concurrent
        // guarded writes from clobbering each other's watch set.
        let mut connection = self.client.get_async_connection().await.map_err(transport)?;

        let _: () = redis::cmd("WATCH")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(transport)?;
        let current: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(transport)?;

        let actual = match current {
            Some(actual) => actual,
            None => {
                let _: () = redis::cmd("UNWATCH").query_async(&mut connection).await.map_err(transport)?;
                return Ok(GuardedOutcome::Missing);
            }
        };
        if actual != expected {
            let _: () = redis::cmd("UNWATCH").query_async(&mut connection).await.map_err(transport)?;
            return Ok(GuardedOutcome::ValueMismatch { actual });
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        match write {
            GuardedWrite::Expire(ttl) => {
                pipe.cmd("PEXPIRE").arg(key).arg(ttl.as_millis() as u64);
            }
            GuardedWrite::Delete => {
                pipe.cmd("DEL").arg(key);
            }
        }

        // A nil EXEC means the watched key changed under us.
        let committed: Option<(i64,)> = pipe.query_async(&mut connection).await.map_err(transport)?;
        match committed {
            Some(_) => Ok(GuardedOutcome::Applied),
            None => ContentionSnafu { key }.fail(),
        }
    }
}
