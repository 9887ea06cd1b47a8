//! Redis-backed assignment store.
//!
//! Layout under `{prefix}`:
//! - `{prefix}:assignment:{sequence_id}:{lead_id}` — assignment as JSON
//! - `{prefix}:due` — sorted set of live keys scored by next execution (ms)
//! - `{prefix}:sequence:{sequence_id}` — set of live keys per sequence
//! - `{prefix}:lease:{sequence_id}:{lead_id}` — holder token, expiring
//!
//! Every write touches the first three in one MULTI/EXEC pipeline. Leases
//! live outside it and expire on the server.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::AsyncCommands;
use tracing::{debug, info};
use uuid::Uuid;

use nurture_core::config::RedisConfig;
use nurture_core::error::{NurtureError, NurtureResult};
use nurture_engine::store::AssignmentStore;
use nurture_engine::types::{Assignment, AssignmentKey};

pub struct RedisAssignmentStore {
    client: redis::Client,
    prefix: String,
}

impl std::fmt::Debug for RedisAssignmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisAssignmentStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}

/// Connection-level failures are worth retrying; anything else is not.
fn store_error(e: redis::RedisError) -> NurtureError {
    metrics::counter!("nurture.store.redis.errors").increment(1);
    if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal() {
        NurtureError::StoreUnavailable(e.to_string())
    } else {
        NurtureError::Store(e.to_string())
    }
}

/// Deletes the lease only while it still carries the caller's token.
const RELEASE_LEASE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// Parses a `{sequence_id}:{lead_id}` member back into a key.
fn parse_member(member: &str) -> Option<AssignmentKey> {
    let (sequence_id, lead_id) = member.split_once(':')?;
    let sequence_id = Uuid::parse_str(sequence_id).ok()?;
    Some(AssignmentKey::new(sequence_id, lead_id))
}

impl RedisAssignmentStore {
    /// Connects and verifies the server answers.
    pub async fn new(config: &RedisConfig) -> anyhow::Result<Self> {
        info!(url = %config.url, prefix = %config.key_prefix, "Connecting to Redis");

        let client = redis::Client::open(config.url.as_str())?;

        let mut conn = client.get_multiplexed_async_connection().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(response = %pong, "Redis connection established");

        Ok(Self {
            client,
            prefix: config.key_prefix.clone(),
        })
    }

    fn assignment_key(&self, key: &AssignmentKey) -> String {
        format!("{}:assignment:{}:{}", self.prefix, key.sequence_id, key.lead_id)
    }

    fn lease_key(&self, key: &AssignmentKey) -> String {
        format!("{}:lease:{}:{}", self.prefix, key.sequence_id, key.lead_id)
    }

    fn due_key(&self) -> String {
        format!("{}:due", self.prefix)
    }

    fn sequence_key(&self, sequence_id: Uuid) -> String {
        format!("{}:sequence:{}", self.prefix, sequence_id)
    }

    async fn connection(&self) -> NurtureResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(store_error)
    }

    /// Loads the rows for `members`, skipping any removed in the meantime.
    async fn load_members(&self, members: Vec<String>) -> NurtureResult<Vec<Assignment>> {
        let keys: Vec<String> = members
            .iter()
            .filter_map(|m| parse_member(m))
            .map(|k| self.assignment_key(&k))
            .collect();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection().await?;
        let rows: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;

        let mut assignments = Vec::with_capacity(rows.len());
        for json in rows.into_iter().flatten() {
            assignments.push(serde_json::from_str::<Assignment>(&json)?);
        }
        Ok(assignments)
    }
}

#[async_trait]
impl AssignmentStore for RedisAssignmentStore {
    async fn get(&self, key: &AssignmentKey) -> NurtureResult<Option<Assignment>> {
        let mut conn = self.connection().await?;
        let data: Option<String> = conn
            .get(self.assignment_key(key))
            .await
            .map_err(store_error)?;
        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, assignment: &Assignment) -> NurtureResult<()> {
        let json = serde_json::to_string(assignment)?;
        let member = assignment.key.to_string();
        let score = assignment.next_execution_time.timestamp_millis();

        let mut conn = self.connection().await?;
        redis::pipe()
            .atomic()
            .set(self.assignment_key(&assignment.key), json)
            .ignore()
            .zadd(self.due_key(), &member, score)
            .ignore()
            .sadd(self.sequence_key(assignment.key.sequence_id), &member)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(store_error)?;

        metrics::counter!("nurture.store.redis.writes").increment(1);
        debug!(assignment = %assignment.key, score, "Assignment stored");
        Ok(())
    }

    async fn remove(&self, key: &AssignmentKey) -> NurtureResult<bool> {
        let member = key.to_string();
        let mut conn = self.connection().await?;
        let (deleted, _, _): (i64, i64, i64) = redis::pipe()
            .atomic()
            .del(self.assignment_key(key))
            .zrem(self.due_key(), &member)
            .srem(self.sequence_key(key.sequence_id), &member)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(deleted > 0)
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> NurtureResult<Vec<Assignment>> {
        let mut conn = self.connection().await?;
        let members: Vec<String> = conn
            .zrangebyscore_limit(
                self.due_key(),
                "-inf",
                now.timestamp_millis(),
                0,
                limit as isize,
            )
            .await
            .map_err(store_error)?;
        self.load_members(members).await
    }

    async fn list_for_sequence(&self, sequence_id: Uuid) -> NurtureResult<Vec<Assignment>> {
        let mut conn = self.connection().await?;
        let members: Vec<String> = conn
            .smembers(self.sequence_key(sequence_id))
            .await
            .map_err(store_error)?;
        let mut assignments = self.load_members(members).await?;
        assignments.sort_by(|a, b| a.assigned_at.cmp(&b.assigned_at).then_with(|| a.id.cmp(&b.id)));
        Ok(assignments)
    }

    async fn all(&self) -> NurtureResult<Vec<Assignment>> {
        let mut conn = self.connection().await?;
        let members: Vec<String> = conn
            .zrange(self.due_key(), 0, -1)
            .await
            .map_err(store_error)?;
        self.load_members(members).await
    }

    async fn acquire_lease(
        &self,
        key: &AssignmentKey,
        token: Uuid,
        _now: DateTime<Utc>,
        ttl: Duration,
    ) -> NurtureResult<bool> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.lease_key(key))
            .arg(token.to_string())
            .arg("NX")
            .arg("PX")
            .arg(ttl.num_milliseconds().max(1))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(reply.is_some())
    }

    async fn release_lease(&self, key: &AssignmentKey, token: Uuid) -> NurtureResult<()> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(RELEASE_LEASE);
        let _: i64 = script
            .key(self.lease_key(key))
            .arg(token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}
