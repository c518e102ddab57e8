//! `FastStore` over a Redis server.

use crate::consumer::RedisLogConsumer;
use crate::keys;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use shelfmark_core::{
    Cached, CachedCounts, EngagementError, EngagementKind, FastStore, LeaderboardKey, LockKey,
    PendingEvent, Result, SubjectId, UserId,
};
use std::sync::Arc;
use std::time::Duration;

/// Adds a member only if the set carries the warm marker.
const ADD_IF_WARM: &str = r"
    if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
        redis.call('ZADD', KEYS[1], ARGV[3], ARGV[2])
        redis.call('EXPIRE', KEYS[1], ARGV[4])
        return 1
    end
    return 0
";

/// Increments a hash field only if it exists; nil otherwise.
const INCR_IF_PRESENT: &str = r"
    if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 1 then
        local value = redis.call('HINCRBY', KEYS[1], ARGV[1], ARGV[2])
        redis.call('EXPIRE', KEYS[1], ARGV[3])
        return value
    end
    return false
";

/// Increments a leaderboard score only if the board exists.
const INCR_SCORE_IF_EXISTS: &str = r"
    if redis.call('EXISTS', KEYS[1]) == 1 then
        redis.call('ZINCRBY', KEYS[1], ARGV[1], ARGV[2])
        redis.call('EXPIRE', KEYS[1], ARGV[3])
        return 1
    end
    return 0
";

struct Scripts {
    add_if_warm: Script,
    incr_if_present: Script,
    incr_score_if_exists: Script,
}

/// Redis-backed fast store.
///
/// Commands go through a shared `ConnectionManager`; every log consumer
/// opens its own connection so blocking reads do not stall other traffic.
#[derive(Clone)]
pub struct RedisFastStore {
    client: Client,
    conn_manager: ConnectionManager,
    scripts: Arc<Scripts>,
}

fn store_err(action: &'static str) -> impl FnOnce(RedisError) -> EngagementError {
    move |e| EngagementError::FastStore(format!("Failed to {action}: {e}"))
}

/// TTL in whole seconds, at least one.
fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1)
}

#[allow(clippy::cast_possible_truncation)] // Scores are whole epoch milliseconds
fn millis_to_datetime(score: f64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(score as i64).unwrap_or(DateTime::UNIX_EPOCH)
}

impl RedisFastStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    ///
    /// # Errors
    ///
    /// Returns error if the URL is invalid or the server is unreachable.
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).map_err(store_err("create Redis client"))?;
        let conn_manager = ConnectionManager::new(client.clone())
            .await
            .map_err(store_err("create Redis connection manager"))?;

        Ok(Self {
            client,
            conn_manager,
            scripts: Arc::new(Scripts {
                add_if_warm: Script::new(ADD_IF_WARM),
                incr_if_present: Script::new(INCR_IF_PRESENT),
                incr_score_if_exists: Script::new(INCR_SCORE_IF_EXISTS),
            }),
        })
    }

    /// Round-trip a PING.
    ///
    /// # Errors
    ///
    /// Returns error if the server does not answer.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_err("ping Redis"))?;
        Ok(())
    }

    /// Scores of the marker followed by `members`; `None` if the set is cold.
    async fn member_scores(
        &self,
        key: &str,
        members: &[SubjectId],
    ) -> Result<Option<Vec<Option<f64>>>> {
        let mut conn = self.conn_manager.clone();
        let ids: Vec<i64> = members.iter().map(|id| id.0).collect();
        let mut scores: Vec<Option<f64>> = redis::cmd("ZMSCORE")
            .arg(key)
            .arg(keys::WARM_MARKER)
            .arg(&ids)
            .query_async(&mut conn)
            .await
            .map_err(store_err("read membership"))?;

        if scores.first().copied().flatten().is_none() {
            return Ok(None);
        }
        scores.remove(0);
        Ok(Some(scores))
    }
}

impl FastStore for RedisFastStore {
    type Consumer = RedisLogConsumer;

    // ═══════════════════════════════════════════════════════════
    // Locks
    // ═══════════════════════════════════════════════════════════

    async fn try_lock(&self, key: &LockKey, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let lock_key = keys::lock(key);
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let reply: Option<String> = redis::cmd("SET")
            .arg(&lock_key)
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(store_err("acquire lock"))?;

        Ok(reply.is_some())
    }

    async fn unlock(&self, key: &LockKey) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .del(keys::lock(key))
            .await
            .map_err(store_err("release lock"))?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════
    // Membership sets
    // ═══════════════════════════════════════════════════════════

    async fn engaged_since(
        &self,
        user_id: UserId,
        subject_id: SubjectId,
        kind: EngagementKind,
    ) -> Result<Cached<Option<DateTime<Utc>>>> {
        let key = keys::user_set(user_id, kind);
        Ok(match self.member_scores(&key, &[subject_id]).await? {
            Some(scores) => Cached::Hit(scores.first().copied().flatten().map(millis_to_datetime)),
            None => Cached::Miss,
        })
    }

    async fn engaged_batch(
        &self,
        user_id: UserId,
        subjects: &[SubjectId],
        kind: EngagementKind,
    ) -> Result<Cached<Vec<bool>>> {
        let key = keys::user_set(user_id, kind);
        Ok(match self.member_scores(&key, subjects).await? {
            Some(scores) => Cached::Hit(scores.iter().map(Option::is_some).collect()),
            None => Cached::Miss,
        })
    }

    async fn warm_engagements(
        &self,
        user_id: UserId,
        kind: EngagementKind,
        relations: &[(SubjectId, DateTime<Utc>)],
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let key = keys::user_set(user_id, kind);
        let members: Vec<(i64, i64)> = relations
            .iter()
            .map(|(subject_id, created_at)| (created_at.timestamp_millis(), subject_id.0))
            .collect();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(&key)
            .ignore()
            .zadd(&key, keys::WARM_MARKER, 0)
            .ignore();
        if !members.is_empty() {
            pipe.zadd_multiple(&key, &members).ignore();
        }
        pipe.expire(&key, ttl_secs(ttl)).ignore();

        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(store_err("warm membership set"))?;

        tracing::debug!(user_id = %user_id, kind = %kind, members = members.len(), "Warmed membership set");
        Ok(())
    }

    async fn add_engagement(
        &self,
        user_id: UserId,
        subject_id: SubjectId,
        kind: EngagementKind,
        created_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: i64 = self
            .scripts
            .add_if_warm
            .key(keys::user_set(user_id, kind))
            .arg(keys::WARM_MARKER)
            .arg(subject_id.0)
            .arg(created_at.timestamp_millis())
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err("add membership"))?;
        Ok(())
    }

    async fn remove_engagement(
        &self,
        user_id: UserId,
        subject_id: SubjectId,
        kind: EngagementKind,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let key = keys::user_set(user_id, kind);
        let _: () = redis::pipe()
            .atomic()
            .zrem(&key, subject_id.0)
            .ignore()
            .expire(&key, ttl_secs(ttl))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(store_err("remove membership"))?;
        Ok(())
    }

    async fn forget_engagements(&self, user_id: UserId, kind: EngagementKind) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .del(keys::user_set(user_id, kind))
            .await
            .map_err(store_err("drop membership set"))?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════
    // Counters
    // ═══════════════════════════════════════════════════════════

    async fn incr_count(
        &self,
        subject_id: SubjectId,
        kind: EngagementKind,
        delta: i64,
        ttl: Duration,
    ) -> Result<Cached<i64>> {
        let mut conn = self.conn_manager.clone();
        let value: Option<i64> = self
            .scripts
            .incr_if_present
            .key(keys::stats(subject_id))
            .arg(keys::count_field(kind))
            .arg(delta)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err("increment counter"))?;
        Ok(value.map_or(Cached::Miss, Cached::Hit))
    }

    async fn counts(&self, subject_id: SubjectId, ttl: Duration) -> Result<CachedCounts> {
        let mut conn = self.conn_manager.clone();
        let key = keys::stats(subject_id);
        let (values,): (Vec<Option<i64>>,) = redis::pipe()
            .cmd("HMGET")
            .arg(&key)
            .arg(keys::count_field(EngagementKind::Like))
            .arg(keys::count_field(EngagementKind::Favorite))
            .expire(&key, ttl_secs(ttl))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(store_err("read counters"))?;

        Ok(CachedCounts {
            likes: values.first().copied().flatten(),
            favorites: values.get(1).copied().flatten(),
        })
    }

    async fn seed_count(
        &self,
        subject_id: SubjectId,
        kind: EngagementKind,
        value: i64,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let key = keys::stats(subject_id);
        let _: () = redis::pipe()
            .atomic()
            .hset_nx(&key, keys::count_field(kind), value)
            .ignore()
            .expire(&key, ttl_secs(ttl))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(store_err("seed counter"))?;
        Ok(())
    }

    async fn forget_count(&self, subject_id: SubjectId, kind: EngagementKind) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .hdel(keys::stats(subject_id), keys::count_field(kind))
            .await
            .map_err(store_err("drop counter"))?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════
    // Leaderboards
    // ═══════════════════════════════════════════════════════════

    async fn incr_score(
        &self,
        board: &LeaderboardKey,
        subject_id: SubjectId,
        delta: i64,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let updated: i64 = self
            .scripts
            .incr_score_if_exists
            .key(keys::leaderboard(board))
            .arg(delta)
            .arg(subject_id.0)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err("update leaderboard"))?;
        Ok(updated == 1)
    }

    async fn top_scores(
        &self,
        board: &LeaderboardKey,
        limit: usize,
    ) -> Result<Vec<(SubjectId, i64)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn_manager.clone();
        let key = keys::leaderboard(board);

        let mut raw: Vec<(String, f64)> = redis::cmd("ZREVRANGEBYSCORE")
            .arg(&key)
            .arg("+inf")
            .arg(1)
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(store_err("read leaderboard"))?;

        // Redis orders equal scores by member descending; fetch every member
        // tied with the last one so the cut falls on ascending ids.
        if raw.len() == limit {
            if let Some((_, last)) = raw.last().cloned() {
                let tied: Vec<(String, f64)> = conn
                    .zrangebyscore_withscores(&key, last, last)
                    .await
                    .map_err(store_err("read leaderboard ties"))?;
                raw.extend(tied);
            }
        }

        #[allow(clippy::cast_possible_truncation)] // Scores are whole counts
        let mut entries: Vec<(SubjectId, i64)> = raw
            .into_iter()
            .filter_map(|(member, score)| {
                member
                    .parse::<i64>()
                    .ok()
                    .map(|id| (SubjectId(id), score.round() as i64))
            })
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        entries.dedup_by_key(|entry| entry.0);
        entries.truncate(limit);
        Ok(entries)
    }

    async fn replace_leaderboard(
        &self,
        board: &LeaderboardKey,
        entries: &[(SubjectId, i64)],
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let key = keys::leaderboard(board);
        let members: Vec<(i64, i64)> = entries
            .iter()
            .map(|(subject_id, score)| (*score, subject_id.0))
            .collect();

        let mut pipe = redis::pipe();
        pipe.atomic().del(&key).ignore();
        if !members.is_empty() {
            pipe.zadd_multiple(&key, &members)
                .ignore()
                .expire(&key, ttl_secs(ttl))
                .ignore();
        }
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(store_err("replace leaderboard"))?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════
    // Event log
    // ═══════════════════════════════════════════════════════════

    async fn append_event(&self, event: &PendingEvent) -> Result<String> {
        let mut conn = self.conn_manager.clone();
        let fields = event.to_fields();
        let id: String = conn
            .xadd(keys::stream(event.kind), "*", &fields)
            .await
            .map_err(store_err("append event"))?;
        Ok(id)
    }

    async fn ensure_group(&self, kind: EngagementKind, group: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let stream = keys::stream(kind);
        let created: std::result::Result<(), RedisError> =
            conn.xgroup_create_mkstream(&stream, group, "0").await;
        match created {
            Ok(()) => {
                tracing::info!(stream = %stream, group = %group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(store_err("create consumer group")(e)),
        }
    }

    async fn consumer(
        &self,
        kind: EngagementKind,
        group: &str,
        name: &str,
    ) -> Result<RedisLogConsumer> {
        let conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(store_err("open consumer connection"))?;
        Ok(RedisLogConsumer::new(conn, keys::stream(kind), group, name))
    }
}
