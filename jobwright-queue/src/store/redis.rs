//! Redis job store
//!
//! Key layout under the prefix (default `jobwright`):
//!
//! - `job:{id}` hash: `record` (JSON) plus location fields that scripts update
//! - `queue:{name}` list of ready ids, `queues` set of queue names
//! - `schedule` zset scored by due time (ms), member `{seq}|{id}`
//! - `claims` zset scored by lease deadline, `dead` zset scored by death time
//! - `batch:{id}` hash, `batch:{id}:members` set, `batch:{id}:resolved` hash
//!
//! Every move between structures runs as one Lua script.

use crate::batch::{BatchId, BatchRecord, BatchState, BatchStatus, MemberOutcome};
use crate::dead::DeadFilter;
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobId, JobState};
use crate::store::JobStore;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use redis::Script;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use tracing::{debug, info, trace, warn};

const KEY_FN: &str = r#"
local prefix = ARGV[1]
local function key(...)
    return prefix .. ':' .. table.concat({...}, ':')
end
"#;

const ENQUEUE: &str = r#"
local now_iso = ARGV[2]
local batch = ARGV[3]
local n = tonumber(ARGV[4])

if batch ~= '' then
    local state = redis.call('HGET', key('batch', batch), 'state')
    if not state then return {-2, batch} end
    if state ~= 'pending' then return {-3, batch} end
end

local seen = {}
for i = 0, n - 1 do
    local id = ARGV[5 + i * 5]
    if seen[id] or redis.call('EXISTS', key('job', id)) == 1 then
        return {-1, id}
    end
    seen[id] = true
end

for i = 0, n - 1 do
    local base = 5 + i * 5
    local id = ARGV[base]
    local queue = ARGV[base + 2]
    local due_ms = ARGV[base + 3]
    local jkey = key('job', id)

    redis.call('HSET', jkey, 'record', ARGV[base + 1], 'queue', queue)
    redis.call('SADD', key('queues'), queue)
    if batch ~= '' then
        redis.call('HSET', jkey, 'batch_id', batch)
        redis.call('SADD', key('batch', batch, 'members'), id)
    end

    if due_ms == '' then
        redis.call('HSET', jkey, 'state', 'ready', 'enqueued_at', now_iso, 'scheduled_at', '')
        redis.call('RPUSH', key('queue', queue), id)
    else
        local seq = redis.call('INCR', key('seq'))
        redis.call('HSET', jkey, 'state', 'scheduled', 'scheduled_at', ARGV[base + 4])
        redis.call('ZADD', key('schedule'), due_ms, string.format('%020d|%s', seq, id))
    end
end
return {n, ''}
"#;

const DEQUEUE: &str = r#"
local qkey = key('queue', ARGV[2])
while true do
    local id = redis.call('LPOP', qkey)
    if not id then return false end
    local jkey = key('job', id)
    if redis.call('HGET', jkey, 'state') == 'ready' then
        redis.call('HSET', jkey, 'state', 'claimed', 'lease_until', ARGV[4])
        redis.call('ZADD', key('claims'), ARGV[3], id)
        return redis.call('HGETALL', jkey)
    end
end
"#;

const REMOVE: &str = r#"
local id = ARGV[2]
if redis.call('ZREM', key('claims'), id) == 0 then return 0 end
redis.call('DEL', key('job', id))
return 1
"#;

const SCHEDULE: &str = r#"
local id = ARGV[2]
if redis.call('ZREM', key('claims'), id) == 0 then return 0 end
local jkey = key('job', id)
redis.call('HSET', jkey, 'record', ARGV[3], 'state', 'scheduled',
    'scheduled_at', ARGV[5], 'lease_until', '')
redis.call('HDEL', jkey, 'retry_count', 'over_limit_count')
local seq = redis.call('INCR', key('seq'))
redis.call('ZADD', key('schedule'), ARGV[4], string.format('%020d|%s', seq, id))
return 1
"#;

const MOVE_TO_DEAD: &str = r#"
local id = ARGV[2]
if redis.call('ZREM', key('claims'), id) == 0 then return 0 end
local jkey = key('job', id)
redis.call('HSET', jkey, 'record', ARGV[3], 'state', 'dead',
    'died_at', ARGV[5], 'lease_until', '', 'scheduled_at', '')
redis.call('HDEL', jkey, 'retry_count', 'over_limit_count')
redis.call('ZADD', key('dead'), ARGV[4], id)
return 1
"#;

const REQUEUE_DEAD: &str = r#"
local id = ARGV[2]
if redis.call('ZREM', key('dead'), id) == 0 then return false end
local jkey = key('job', id)
redis.call('HSET', jkey, 'state', 'ready', 'enqueued_at', ARGV[3], 'died_at', '',
    'retry_count', '0', 'over_limit_count', '0')

local batch = redis.call('HGET', jkey, 'batch_id')
if batch and batch ~= '' then
    local rkey = key('batch', batch, 'resolved')
    if redis.call('HGET', key('batch', batch), 'state') == 'pending'
        and redis.call('HGET', rkey, id) == 'dead' then
        redis.call('HDEL', rkey, id)
    end
end

redis.call('RPUSH', key('queue', redis.call('HGET', jkey, 'queue')), id)
return redis.call('HGETALL', jkey)
"#;

const DELETE_DEAD: &str = r#"
local id = ARGV[2]
if redis.call('ZREM', key('dead'), id) == 0 then return 0 end
redis.call('DEL', key('job', id))
return 1
"#;

const TRIM_DEAD: &str = r#"
local dkey = key('dead')
local excess = redis.call('ZCARD', dkey) - tonumber(ARGV[2])
if excess <= 0 then return 0 end
local ids = redis.call('ZRANGE', dkey, 0, excess - 1)
for _, id in ipairs(ids) do
    redis.call('ZREM', dkey, id)
    redis.call('DEL', key('job', id))
end
return #ids
"#;

const PROMOTE_DUE: &str = r#"
local skey = key('schedule')
local entries = redis.call('ZRANGEBYSCORE', skey, '-inf', ARGV[2], 'LIMIT', 0, tonumber(ARGV[4]))
local promoted = {}
for _, member in ipairs(entries) do
    redis.call('ZREM', skey, member)
    local id = string.match(member, '|(.+)$')
    local jkey = key('job', id)
    local queue = redis.call('HGET', jkey, 'queue')
    if queue then
        redis.call('HSET', jkey, 'state', 'ready', 'enqueued_at', ARGV[3], 'scheduled_at', '')
        redis.call('RPUSH', key('queue', queue), id)
        table.insert(promoted, id)
    end
end
return {#entries, promoted}
"#;

const HEARTBEAT: &str = r#"
local id = ARGV[2]
if not redis.call('ZSCORE', key('claims'), id) then return 0 end
redis.call('ZADD', key('claims'), 'XX', ARGV[3], id)
redis.call('HSET', key('job', id), 'lease_until', ARGV[4])
return 1
"#;

const RECLAIM_STALE: &str = r#"
local ckey = key('claims')
local ids = redis.call('ZRANGEBYSCORE', ckey, '-inf', ARGV[2])
local reclaimed = {}
for _, id in ipairs(ids) do
    redis.call('ZREM', ckey, id)
    local jkey = key('job', id)
    local queue = redis.call('HGET', jkey, 'queue')
    if queue then
        redis.call('HSET', jkey, 'state', 'ready', 'lease_until', '', 'enqueued_at', ARGV[3])
        redis.call('RPUSH', key('queue', queue), id)
        table.insert(reclaimed, id)
    end
end
return reclaimed
"#;

const RECORD_OUTCOME: &str = r#"
local batch = ARGV[2]
local job = ARGV[3]
local bkey = key('batch', batch)
local mkey = key('batch', batch, 'members')
local rkey = key('batch', batch, 'resolved')

local state = redis.call('HGET', bkey, 'state')
if not state then return -2 end
if redis.call('SISMEMBER', mkey, job) == 0 then return -1 end
if state ~= 'pending' then return 0 end
if redis.call('HSETNX', rkey, job, ARGV[4]) == 0 then return 0 end
if redis.call('HLEN', rkey) < redis.call('SCARD', mkey) then return 0 end

local final = 'complete'
for _, outcome in ipairs(redis.call('HVALS', rkey)) do
    if outcome == 'dead' then
        final = 'failed'
        break
    end
end
redis.call('HSET', bkey, 'state', final, 'finished_at', ARGV[5])
return 1
"#;

/// Scheduled entries promoted per script call.
const PROMOTE_CHUNK: usize = 500;

struct Scripts {
    enqueue: Script,
    dequeue: Script,
    remove: Script,
    schedule: Script,
    move_to_dead: Script,
    requeue_dead: Script,
    delete_dead: Script,
    trim_dead: Script,
    promote_due: Script,
    heartbeat: Script,
    reclaim_stale: Script,
    record_outcome: Script,
}

impl Scripts {
    fn load() -> Self {
        let script = |body: &str| Script::new(&format!("{}{}", KEY_FN, body));
        Self {
            enqueue: script(ENQUEUE),
            dequeue: script(DEQUEUE),
            remove: script(REMOVE),
            schedule: script(SCHEDULE),
            move_to_dead: script(MOVE_TO_DEAD),
            requeue_dead: script(REQUEUE_DEAD),
            delete_dead: script(DELETE_DEAD),
            trim_dead: script(TRIM_DEAD),
            promote_due: script(PROMOTE_DUE),
            heartbeat: script(HEARTBEAT),
            reclaim_stale: script(RECLAIM_STALE),
            record_outcome: script(RECORD_OUTCOME),
        }
    }
}

/// Redis-backed job store.
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    scripts: Scripts,
}

impl RedisStore {
    /// Connect to Redis (e.g. "redis://localhost:6379")
    pub async fn new(url: &str) -> QueueResult<Self> {
        Self::with_prefix(url, "jobwright").await
    }

    /// Connect with a custom key prefix
    pub async fn with_prefix(url: &str, prefix: impl Into<String>) -> QueueResult<Self> {
        let prefix = prefix.into();
        info!(url = %url, prefix = %prefix, "Connecting job store to Redis");

        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        Ok(Self {
            conn,
            prefix,
            scripts: Scripts::load(),
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    async fn insert(&self, batch: Option<BatchId>, jobs: Vec<Job>) -> QueueResult<Vec<JobId>> {
        let now = Utc::now();
        let ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();

        let mut invocation = self.scripts.enqueue.prepare_invoke();
        invocation
            .arg(&self.prefix)
            .arg(iso(now))
            .arg(batch.map(|b| b.to_string()).unwrap_or_default())
            .arg(jobs.len());

        for job in jobs {
            let job = match batch {
                Some(batch_id) => job.in_batch(batch_id),
                None => job,
            };
            let due = job.scheduled_at.filter(|at| *at > now);
            invocation
                .arg(job.id.to_string())
                .arg(encode(&job)?)
                .arg(&job.queue)
                .arg(due.map(|d| d.timestamp_millis().to_string()).unwrap_or_default())
                .arg(due.map(iso).unwrap_or_default());
        }

        let mut conn = self.conn.clone();
        let (code, detail): (i64, String) = invocation.invoke_async(&mut conn).await?;
        match code {
            -1 => Err(QueueError::DuplicateJob(detail)),
            -2 => Err(QueueError::BatchNotFound(detail)),
            -3 => Err(QueueError::InvalidBatch(format!(
                "batch {} is already finalized",
                detail
            ))),
            _ => {
                trace!(count = ids.len(), "Jobs stored in Redis");
                Ok(ids)
            }
        }
    }

    async fn fetch(&self, id: JobId) -> QueueResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.key(&format!("job:{}", id)))
            .query_async(&mut conn)
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode(fields).map(Some)
    }

    async fn dead_ids(&self) -> QueueResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("ZREVRANGE")
            .arg(self.key("dead"))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?)
    }

    async fn count(&self, cmd: &str, suffix: &str) -> QueueResult<usize> {
        let mut conn = self.conn.clone();
        let n: i64 = redis::cmd(cmd)
            .arg(self.key(suffix))
            .query_async(&mut conn)
            .await?;
        Ok(n.max(0) as usize)
    }
}

fn iso(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: Option<&String>) -> QueueResult<Option<DateTime<Utc>>> {
    match raw.map(String::as_str) {
        None | Some("") => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| QueueError::Deserialization(format!("bad timestamp '{}': {}", s, e))),
    }
}

fn encode(job: &Job) -> QueueResult<String> {
    serde_json::to_string(job).map_err(|e| QueueError::Serialization(e.to_string()))
}

/// Rebuild a job from its hash: the JSON record overlaid with location fields.
fn decode(fields: HashMap<String, String>) -> QueueResult<Job> {
    let record = fields
        .get("record")
        .ok_or_else(|| QueueError::Deserialization("job hash without record".to_string()))?;
    let mut job: Job =
        serde_json::from_str(record).map_err(|e| QueueError::Deserialization(e.to_string()))?;

    if let Some(state) = fields.get("state") {
        job.state = match state.as_str() {
            "ready" => JobState::Ready,
            "scheduled" => JobState::Scheduled,
            "claimed" => JobState::Claimed,
            "dead" => JobState::Dead,
            other => {
                return Err(QueueError::Deserialization(format!(
                    "unknown job state '{}'",
                    other
                )));
            }
        };
    }
    if fields.contains_key("enqueued_at") {
        job.enqueued_at = parse_time(fields.get("enqueued_at"))?;
    }
    if fields.contains_key("scheduled_at") {
        job.scheduled_at = parse_time(fields.get("scheduled_at"))?;
    }
    if fields.contains_key("lease_until") {
        job.lease_until = parse_time(fields.get("lease_until"))?;
    }
    if fields.contains_key("died_at") {
        job.died_at = parse_time(fields.get("died_at"))?;
    }
    if let Some(n) = fields.get("retry_count").and_then(|v| v.parse().ok()) {
        job.retry_count = n;
    }
    if let Some(n) = fields.get("over_limit_count").and_then(|v| v.parse().ok()) {
        job.over_limit_count = n;
    }
    Ok(job)
}

fn parse_ids(raw: Vec<String>) -> Vec<JobId> {
    raw.iter()
        .filter_map(|s| match s.parse() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(member = %s, "Skipping malformed job id");
                None
            }
        })
        .collect()
}

fn not_claimed(id: JobId) -> QueueError {
    QueueError::JobNotFound(format!("{} is not claimed", id))
}

#[async_trait]
impl JobStore for RedisStore {
    async fn enqueue(&self, job: Job) -> QueueResult<JobId> {
        let id = job.id;
        self.insert(None, vec![job]).await?;
        Ok(id)
    }

    async fn enqueue_all(&self, jobs: Vec<Job>) -> QueueResult<Vec<JobId>> {
        self.insert(None, jobs).await
    }

    async fn dequeue(&self, queue: &str, lease_until: DateTime<Utc>) -> QueueResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let fields: Option<HashMap<String, String>> = self
            .scripts
            .dequeue
            .arg(&self.prefix)
            .arg(queue)
            .arg(lease_until.timestamp_millis())
            .arg(iso(lease_until))
            .invoke_async(&mut conn)
            .await?;
        fields.map(decode).transpose()
    }

    async fn remove(&self, id: JobId) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .scripts
            .remove
            .arg(&self.prefix)
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await?;
        if removed == 0 {
            return Err(not_claimed(id));
        }
        Ok(())
    }

    async fn schedule(&self, job: Job, due_at: DateTime<Utc>) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .scripts
            .schedule
            .arg(&self.prefix)
            .arg(job.id.to_string())
            .arg(encode(&job)?)
            .arg(due_at.timestamp_millis())
            .arg(iso(due_at))
            .invoke_async(&mut conn)
            .await?;
        if moved == 0 {
            return Err(not_claimed(job.id));
        }
        Ok(())
    }

    async fn move_to_dead(&self, job: Job, died_at: DateTime<Utc>) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .scripts
            .move_to_dead
            .arg(&self.prefix)
            .arg(job.id.to_string())
            .arg(encode(&job)?)
            .arg(died_at.timestamp_millis())
            .arg(iso(died_at))
            .invoke_async(&mut conn)
            .await?;
        if moved == 0 {
            return Err(not_claimed(job.id));
        }
        Ok(())
    }

    async fn requeue_dead(&self, id: JobId) -> QueueResult<Job> {
        let mut conn = self.conn.clone();
        let fields: Option<HashMap<String, String>> = self
            .scripts
            .requeue_dead
            .arg(&self.prefix)
            .arg(id.to_string())
            .arg(iso(Utc::now()))
            .invoke_async(&mut conn)
            .await?;
        let fields = fields.ok_or_else(|| QueueError::JobNotFound(format!("{} is not dead", id)))?;
        decode(fields)
    }

    async fn delete_dead(&self, id: JobId) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .scripts
            .delete_dead
            .arg(&self.prefix)
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn list_dead(&self, filter: &DeadFilter) -> QueueResult<Vec<Job>> {
        let limit = filter.limit.unwrap_or(usize::MAX);
        let mut jobs = Vec::new();
        for id in parse_ids(self.dead_ids().await?) {
            if jobs.len() >= limit {
                break;
            }
            if let Some(job) = self.fetch(id).await?
                && job.state == JobState::Dead
                && filter.matches(&job)
            {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn get_dead(&self, id: JobId) -> QueueResult<Option<Job>> {
        Ok(self
            .fetch(id)
            .await?
            .filter(|job| job.state == JobState::Dead))
    }

    async fn purge_dead(&self, filter: &DeadFilter) -> QueueResult<usize> {
        let doomed = self.list_dead(filter).await?;
        let mut purged = 0;
        for job in doomed {
            if self.delete_dead(job.id).await? {
                purged += 1;
            }
        }
        debug!(count = purged, "Purged dead jobs from Redis");
        Ok(purged)
    }

    async fn trim_dead(&self, max_jobs: usize) -> QueueResult<usize> {
        let mut conn = self.conn.clone();
        let trimmed: i64 = self
            .scripts
            .trim_dead
            .arg(&self.prefix)
            .arg(max_jobs)
            .invoke_async(&mut conn)
            .await?;
        Ok(trimmed.max(0) as usize)
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> QueueResult<Vec<JobId>> {
        let mut promoted = Vec::new();
        loop {
            let mut conn = self.conn.clone();
            let (scanned, ids): (usize, Vec<String>) = self
                .scripts
                .promote_due
                .arg(&self.prefix)
                .arg(now.timestamp_millis())
                .arg(iso(now))
                .arg(PROMOTE_CHUNK)
                .invoke_async(&mut conn)
                .await?;
            promoted.extend(parse_ids(ids));
            if scanned < PROMOTE_CHUNK {
                return Ok(promoted);
            }
        }
    }

    async fn heartbeat(&self, id: JobId, lease_until: DateTime<Utc>) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let live: i64 = self
            .scripts
            .heartbeat
            .arg(&self.prefix)
            .arg(id.to_string())
            .arg(lease_until.timestamp_millis())
            .arg(iso(lease_until))
            .invoke_async(&mut conn)
            .await?;
        Ok(live == 1)
    }

    async fn reclaim_stale(&self, now: DateTime<Utc>) -> QueueResult<Vec<JobId>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = self
            .scripts
            .reclaim_stale
            .arg(&self.prefix)
            .arg(now.timestamp_millis())
            .arg(iso(now))
            .invoke_async(&mut conn)
            .await?;
        let reclaimed = parse_ids(ids);
        for id in &reclaimed {
            warn!(job_id = %id, "Reclaimed job with expired lease");
        }
        Ok(reclaimed)
    }

    async fn get_job(&self, id: JobId) -> QueueResult<Option<Job>> {
        self.fetch(id).await
    }

    async fn queue_depth(&self, queue: &str) -> QueueResult<usize> {
        self.count("LLEN", &format!("queue:{}", queue)).await
    }

    async fn queue_names(&self) -> QueueResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut names: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.key("queues"))
            .query_async(&mut conn)
            .await?;
        names.sort();
        Ok(names)
    }

    async fn scheduled_count(&self) -> QueueResult<usize> {
        self.count("ZCARD", "schedule").await
    }

    async fn dead_count(&self) -> QueueResult<usize> {
        self.count("ZCARD", "dead").await
    }

    async fn create_batch(&self, batch: BatchRecord) -> QueueResult<()> {
        let base = format!("batch:{}", batch.id);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(self.key(&base))
            .arg("description")
            .arg(&batch.description)
            .arg("created_at")
            .arg(iso(batch.created_at))
            .arg("state")
            .arg("pending")
            .arg("finished_at")
            .arg("");
        if !batch.members.is_empty() {
            pipe.cmd("SADD")
                .arg(self.key(&format!("{}:members", base)))
                .arg(batch.members.iter().map(|id| id.to_string()).collect::<Vec<_>>());
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_batch(&self, id: BatchId) -> QueueResult<Option<BatchRecord>> {
        let base = format!("batch:{}", id);
        let mut conn = self.conn.clone();
        let (fields, members, resolved): (
            HashMap<String, String>,
            Vec<String>,
            HashMap<String, String>,
        ) = redis::pipe()
            .cmd("HGETALL")
            .arg(self.key(&base))
            .cmd("SMEMBERS")
            .arg(self.key(&format!("{}:members", base)))
            .cmd("HGETALL")
            .arg(self.key(&format!("{}:resolved", base)))
            .query_async(&mut conn)
            .await?;

        if fields.is_empty() {
            return Ok(None);
        }

        let state = match fields.get("state").map(String::as_str) {
            Some("complete") => BatchState::Complete,
            Some("failed") => BatchState::Failed,
            _ => BatchState::Pending,
        };

        let mut resolved_outcomes = HashMap::with_capacity(resolved.len());
        for (job, outcome) in resolved {
            let Ok(job_id) = job.parse::<JobId>() else {
                continue;
            };
            let outcome = if outcome == "dead" {
                MemberOutcome::Dead
            } else {
                MemberOutcome::Completed
            };
            resolved_outcomes.insert(job_id, outcome);
        }

        Ok(Some(BatchRecord {
            id,
            description: fields.get("description").cloned().unwrap_or_default(),
            created_at: parse_time(fields.get("created_at"))?.unwrap_or_else(Utc::now),
            members: parse_ids(members).into_iter().collect(),
            resolved: resolved_outcomes,
            state,
            finished_at: parse_time(fields.get("finished_at"))?,
        }))
    }

    async fn enqueue_batch_members(
        &self,
        batch_id: BatchId,
        jobs: Vec<Job>,
    ) -> QueueResult<Vec<JobId>> {
        self.insert(Some(batch_id), jobs).await
    }

    async fn record_batch_outcome(
        &self,
        batch_id: BatchId,
        job_id: JobId,
        outcome: MemberOutcome,
    ) -> QueueResult<Option<BatchStatus>> {
        let outcome = match outcome {
            MemberOutcome::Completed => "completed",
            MemberOutcome::Dead => "dead",
        };

        let mut conn = self.conn.clone();
        let code: i64 = self
            .scripts
            .record_outcome
            .arg(&self.prefix)
            .arg(batch_id.to_string())
            .arg(job_id.to_string())
            .arg(outcome)
            .arg(iso(Utc::now()))
            .invoke_async(&mut conn)
            .await?;

        match code {
            -2 => Err(QueueError::BatchNotFound(batch_id.to_string())),
            -1 => Err(QueueError::InvalidBatch(format!(
                "job {} is not a member of batch {}",
                job_id, batch_id
            ))),
            1 => Ok(self.get_batch(batch_id).await?.map(|b| b.status())),
            _ => Ok(None),
        }
    }

    fn store_type(&self) -> &'static str {
        "redis"
    }
}
