//! In-memory implementation of [`Store`] for testing.
//!
//! Deterministic and non-persistent: string TTLs are tracked against the
//! process clock and expired lazily, sorted sets are plain maps ranked on
//! demand, and every batch runs under one lock so pipelines are atomic.
//! Guarded writes never contend; there is no window between watch and
//! commit. This mirrors the behavior of the Redis binding without network
//! I/O, which is what the unit tests drive.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::GuardedOutcome;
use super::GuardedWrite;
use super::ScoredMember;
use super::Store;
use super::StoreCommand;
use super::StoreError;
use super::StoreReply;

struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= Instant::now())
    }
}

#[derive(Default)]
struct SharedState {
    strings: HashMap<String, StringEntry>,
    zsets: HashMap<String, BTreeMap<String, f64>>,
}

impl SharedState {
    /// Drop the entry if its TTL elapsed, then return the live value.
    fn live_string(&mut self, key: &str) -> Option<&StringEntry> {
        if self.strings.get(key).is_some_and(StringEntry::is_expired) {
            self.strings.remove(key);
        }
        self.strings.get(key)
    }

    fn apply(&mut self, command: &StoreCommand) -> StoreReply {
        match command {
            StoreCommand::Del { key } => {
                let existed = self.live_string(key).is_some();
                self.strings.remove(key);
                StoreReply::Flag(existed)
            }
            StoreCommand::Expire { key, ttl } => {
                if self.live_string(key).is_none() {
                    return StoreReply::Flag(false);
                }
                let entry = self.strings.get_mut(key).expect("entry checked live above");
                entry.expires_at = Some(Instant::now() + *ttl);
                StoreReply::Flag(true)
            }
            StoreCommand::Incr { key } => {
                let current = self
                    .live_string(key)
                    .and_then(|entry| entry.value.parse::<i64>().ok())
                    .unwrap_or(0);
                let next = current + 1;
                self.strings.insert(
                    key.clone(),
                    StringEntry {
                        value: next.to_string(),
                        expires_at: None,
                    },
                );
                StoreReply::Int(next)
            }
            StoreCommand::ZAdd { key, member, score } => {
                let set = self.zsets.entry(key.clone()).or_default();
                let added = set.insert(member.clone(), *score).is_none();
                StoreReply::Flag(added)
            }
            StoreCommand::ZRem { key, member } => {
                let removed = match self.zsets.get_mut(key) {
                    Some(set) => {
                        let removed = set.remove(member).is_some();
                        if set.is_empty() {
                            self.zsets.remove(key);
                        }
                        removed
                    }
                    None => false,
                };
                StoreReply::Flag(removed)
            }
            StoreCommand::ZRank { key, member } => {
                let rank = self.zsets.get(key).and_then(|set| {
                    set.contains_key(member).then(|| {
                        let mut entries: Vec<_> = set.iter().collect();
                        entries.sort_by(|a, b| {
                            a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(b.0))
                        });
                        entries.iter().position(|(m, _)| m.as_str() == member).expect("member present") as u64
                    })
                });
                StoreReply::Rank(rank)
            }
            StoreCommand::ZRemRangeByScore { key, max } => {
                let removed = match self.zsets.get_mut(key) {
                    Some(set) => {
                        let before = set.len();
                        set.retain(|_, score| *score > *max);
                        let removed = before - set.len();
                        if set.is_empty() {
                            self.zsets.remove(key);
                        }
                        removed as i64
                    }
                    None => 0,
                };
                StoreReply::Int(removed)
            }
            StoreCommand::ZInterStoreMax { dest, keys, weights } => {
                let first = self.zsets.get(&keys[0]).cloned().unwrap_or_default();
                let second = self.zsets.get(&keys[1]).cloned().unwrap_or_default();
                let mut result = BTreeMap::new();
                for (member, score) in first {
                    if let Some(other) = second.get(&member) {
                        let combined = (score * weights[0]).max(other * weights[1]);
                        result.insert(member, combined);
                    }
                }
                let cardinality = result.len() as i64;
                if result.is_empty() {
                    self.zsets.remove(dest);
                } else {
                    self.zsets.insert(dest.clone(), result);
                }
                StoreReply::Int(cardinality)
            }
        }
    }
}

/// In-memory deterministic implementation of [`Store`] for testing.
///
/// The store starts empty and keeps all state in process memory. Clones
/// share the same state.
#[derive(Clone, Default)]
pub struct DeterministicStore {
    state: Arc<Mutex<SharedState>>,
}

impl DeterministicStore {
    /// Create a new in-memory store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Store for DeterministicStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.live_string(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.strings.insert(
            key.to_owned(),
            StringEntry {
                value: value.to_owned(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.live_string(key).is_some() {
            return Ok(false);
        }
        state.strings.insert(
            key.to_owned(),
            StringEntry {
                value: value.to_owned(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let reply = state.apply(&StoreCommand::Del { key: key.to_owned() });
        Ok(reply == StoreReply::Flag(true))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let reply = state.apply(&StoreCommand::ZAdd {
            key: key.to_owned(),
            member: member.to_owned(),
            score,
        });
        Ok(reply == StoreReply::Flag(true))
    }

    async fn zadd_xx(&self, key: &str, member: &str, score: f64) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.zsets.get_mut(key) {
            Some(set) if set.contains_key(member) => {
                set.insert(member.to_owned(), score);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let reply = state.apply(&StoreCommand::ZRem {
            key: key.to_owned(),
            member: member.to_owned(),
        });
        Ok(reply == StoreReply::Flag(true))
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.zsets.get(key).and_then(|set| set.get(member).copied()))
    }

    async fn zrevrange_withscores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<ScoredMember>, StoreError> {
        let state = self.state.lock().await;
        let Some(set) = state.zsets.get(key) else {
            return Ok(Vec::new());
        };

        let mut entries: Vec<ScoredMember> = set
            .iter()
            .map(|(member, score)| ScoredMember {
                member: member.clone(),
                score: *score,
            })
            .collect();
        entries.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.member.cmp(&a.member))
        });

        let len = entries.len() as i64;
        let resolve = |index: i64| if index < 0 { len + index } else { index };
        let start = resolve(start).max(0);
        let stop = resolve(stop).min(len - 1);
        if start > stop || len == 0 {
            return Ok(Vec::new());
        }
        Ok(entries[start as usize..=stop as usize].to_vec())
    }

    async fn pipelined(&self, commands: Vec<StoreCommand>) -> Result<Vec<StoreReply>, StoreError> {
        let mut state = self.state.lock().await;
        Ok(commands.iter().map(|command| state.apply(command)).collect())
    }

    async fn tx_pipelined(&self, commands: Vec<StoreCommand>) -> Result<Vec<StoreReply>, StoreError> {
        // Pipelines already run under one lock here, so the transactional
        // variant is the same exchange.
        self.pipelined(commands).await
    }

    async fn guarded_write(
        &self,
        key: &str,
        expected: &str,
        write: GuardedWrite,
    ) -> Result<GuardedOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let current = state.live_string(key).map(|entry| entry.value.clone());
        match current {
            None => Ok(GuardedOutcome::Missing),
            Some(actual) if actual != expected => Ok(GuardedOutcome::ValueMismatch { actual }),
            Some(_) => {
                match write {
                    GuardedWrite::Expire(ttl) => {
                        let entry = state.strings.get_mut(key).expect("entry checked live above");
                        entry.expires_at = Some(Instant::now() + ttl);
                    }
                    GuardedWrite::Delete => {
                        state.strings.remove(key);
                    }
                }
                Ok(GuardedOutcome::Applied)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_respects_live_keys_and_ttl() {
        let store = DeterministicStore::new();

        assert!(store.set_nx("k", "a", Duration::from_millis(50)).await.unwrap());
        assert!(!store.set_nx("k", "b", Duration::from_millis(50)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_nx("k", "b", Duration::from_secs(5)).await.unwrap());

        assert!(store.del("k").await.unwrap());
        assert!(!store.del("k").await.unwrap());
        store.set("k", "c", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn zadd_xx_only_updates_existing_members() {
        let store = DeterministicStore::new();

        assert!(!store.zadd_xx("z", "m", 1.0).await.unwrap());
        assert_eq!(store.zscore("z", "m").await.unwrap(), None);

        store.zadd("z", "m", 1.0).await.unwrap();
        assert!(store.zadd_xx("z", "m", 9.0).await.unwrap());
        assert_eq!(store.zscore("z", "m").await.unwrap(), Some(9.0));
    }

    #[tokio::test]
    async fn zrank_orders_by_score_then_member() {
        let store = DeterministicStore::new();
        store.zadd("z", "b", 2.0).await.unwrap();
        store.zadd("z", "a", 1.0).await.unwrap();
        store.zadd("z", "c", 2.0).await.unwrap();

        let replies = store
            .pipelined(vec![
                StoreCommand::ZRank {
                    key: "z".into(),
                    member: "a".into(),
                },
                StoreCommand::ZRank {
                    key: "z".into(),
                    member: "b".into(),
                },
                StoreCommand::ZRank {
                    key: "z".into(),
                    member: "c".into(),
                },
                StoreCommand::ZRank {
                    key: "z".into(),
                    member: "missing".into(),
                },
            ])
            .await
            .unwrap();

        assert_eq!(replies[0], StoreReply::Rank(Some(0)));
        assert_eq!(replies[1], StoreReply::Rank(Some(1)));
        assert_eq!(replies[2], StoreReply::Rank(Some(2)));
        assert_eq!(replies[3], StoreReply::Rank(None));
    }

    #[tokio::test]
    async fn zremrangebyscore_purges_up_to_max() {
        let store = DeterministicStore::new();
        store.zadd("z", "old", 10.0).await.unwrap();
        store.zadd("z", "edge", 20.0).await.unwrap();
        store.zadd("z", "new", 30.0).await.unwrap();

        let replies = store
            .pipelined(vec![StoreCommand::ZRemRangeByScore {
                key: "z".into(),
                max: 20.0,
            }])
            .await
            .unwrap();

        assert_eq!(replies[0], StoreReply::Int(2));
        assert_eq!(store.zscore("z", "old").await.unwrap(), None);
        assert_eq!(store.zscore("z", "edge").await.unwrap(), None);
        assert_eq!(store.zscore("z", "new").await.unwrap(), Some(30.0));
    }

    #[tokio::test]
    async fn zinterstore_max_keeps_weighted_intersection() {
        let store = DeterministicStore::new();
        store.zadd("owners", "a", 7.0).await.unwrap();
        store.zadd("owners", "stale", 3.0).await.unwrap();
        store.zadd("ids", "a", 1_000_000.0).await.unwrap();

        let replies = store
            .pipelined(vec![StoreCommand::ZInterStoreMax {
                dest: "owners".into(),
                keys: ["owners".into(), "ids".into()],
                weights: [1.0, 0.0],
            }])
            .await
            .unwrap();

        // Only the member present in both sets survives, and the zero
        // weight keeps its owner score rather than the heartbeat stamp.
        assert_eq!(replies[0], StoreReply::Int(1));
        assert_eq!(store.zscore("owners", "a").await.unwrap(), Some(7.0));
        assert_eq!(store.zscore("owners", "stale").await.unwrap(), None);
    }

    #[tokio::test]
    async fn pipelined_incr_is_monotonic() {
        let store = DeterministicStore::new();
        let incr = |key: &str| StoreCommand::Incr { key: key.into() };

        let first = store.pipelined(vec![incr("c")]).await.unwrap();
        let second = store.pipelined(vec![incr("c"), incr("c")]).await.unwrap();

        assert_eq!(first[0], StoreReply::Int(1));
        assert_eq!(second[0], StoreReply::Int(2));
        assert_eq!(second[1], StoreReply::Int(3));
    }

    #[tokio::test]
    async fn guarded_write_outcomes() {
        let store = DeterministicStore::new();

        assert_eq!(
            store.guarded_write("k", "me", GuardedWrite::Delete).await.unwrap(),
            GuardedOutcome::Missing
        );

        store.set("k", "other", None).await.unwrap();
        assert_eq!(
            store.guarded_write("k", "me", GuardedWrite::Delete).await.unwrap(),
            GuardedOutcome::ValueMismatch {
                actual: "other".into()
            }
        );

        store.set("k", "me", None).await.unwrap();
        assert_eq!(
            store
                .guarded_write("k", "me", GuardedWrite::Expire(Duration::from_millis(40)))
                .await
                .unwrap(),
            GuardedOutcome::Applied
        );
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set("k", "me", None).await.unwrap();
        assert_eq!(
            store.guarded_write("k", "me", GuardedWrite::Delete).await.unwrap(),
            GuardedOutcome::Applied
        );
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
