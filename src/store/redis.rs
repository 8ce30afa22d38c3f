//! Redis store.
//!
//! Multi-key operations run as Lua scripts or `MULTI/EXEC` pipelines on a
//! shared [`ConnectionManager`]. `BLPOP` gets its own connection so a blocked
//! dequeue loop never stalls commands pipelined by callers.

use std::time::Duration;

use ::redis::aio::{ConnectionManager, MultiplexedConnection, PubSub};
use ::redis::{AsyncCommands, Client, Script};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use super::{Completion, Dequeued, EnqueueOutcome, Keys, Lookup, Store, WORK_READY_MARKER};
use crate::error::{Error, Result};

/// Delay between attempts to re-establish a dropped pub/sub connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

// KEYS: queue, in-progress, value key, error key, work-ready list
// ARGV: id, priority, marker
// Returns 0 = queued, 1 = in progress, 2 = resolved.
const ENQUEUE_SCRIPT: &str = r"
if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 1 then
  return 1
end
if redis.call('EXISTS', KEYS[3], KEYS[4]) > 0 then
  return 2
end
local old = redis.call('ZSCORE', KEYS[1], ARGV[1])
if (not old) or tonumber(ARGV[2]) < tonumber(old) then
  redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
  redis.call('RPUSH', KEYS[5], ARGV[3])
end
return 0
";

// KEYS: queue, in-progress
// Returns {} or {id, score, remaining}.
const DEQUEUE_SCRIPT: &str = r"
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
  return {}
end
redis.call('SADD', KEYS[2], popped[1])
return {popped[1], popped[2], tostring(redis.call('ZCARD', KEYS[1]))}
";

/// Store backed by a Redis server.
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    blocking: Mutex<Option<MultiplexedConnection>>,
    enqueue_script: Script,
    dequeue_script: Script,
}

impl RedisStore {
    /// Connect to Redis at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(None),
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            dequeue_script: Script::new(DEQUEUE_SCRIPT),
        })
    }

    /// Simple health check: PING.
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn enqueue(&self, keys: &Keys, id: &str, priority: i64) -> Result<EnqueueOutcome> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .enqueue_script
            .key(&keys.queue)
            .key(&keys.in_progress)
            .key(keys.value(id))
            .key(keys.error(id))
            .key(&keys.work_ready)
            .arg(id)
            .arg(priority)
            .arg(WORK_READY_MARKER)
            .invoke_async(&mut conn)
            .await?;

        match code {
            0 => Ok(EnqueueOutcome::Queued),
            1 => Ok(EnqueueOutcome::InProgress),
            2 => Ok(EnqueueOutcome::Resolved),
            other => Err(Error::Other(format!(
                "unexpected enqueue reply {other} for {id}"
            ))),
        }
    }

    async fn dequeue(&self, keys: &Keys) -> Result<Option<Dequeued>> {
        let mut conn = self.conn.clone();
        let reply: Vec<String> = self
            .dequeue_script
            .key(&keys.queue)
            .key(&keys.in_progress)
            .invoke_async(&mut conn)
            .await?;

        match reply.as_slice() {
            [] => Ok(None),
            [id, score, remaining] => {
                let score: f64 = score
                    .parse()
                    .map_err(|e| Error::Other(format!("bad priority {score:?} for {id}: {e}")))?;
                let remaining = remaining
                    .parse()
                    .map_err(|e| Error::Other(format!("bad queue length {remaining:?}: {e}")))?;
                // Exact within ±MAX_EXACT_PRIORITY.
                Ok(Some(Dequeued {
                    id: id.clone(),
                    priority: score as i64,
                    remaining,
                }))
            }
            other => Err(Error::Other(format!(
                "unexpected dequeue reply with {} elements",
                other.len()
            ))),
        }
    }

    async fn complete(&self, keys: &Keys, id: &str, completion: &Completion) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = ::redis::pipe();
        pipe.atomic();

        match completion {
            Completion::Value(bytes) => {
                pipe.set(keys.value(id), bytes.as_slice())
                    .ignore()
                    .del(keys.error(id))
                    .ignore();
            }
            Completion::Error { message, ttl } => {
                let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                pipe.pset_ex(keys.error(id), message, millis)
                    .ignore()
                    .del(keys.value(id))
                    .ignore();
            }
        }
        pipe.srem(&keys.in_progress, id)
            .ignore()
            .publish(&keys.channel, id)
            .ignore();

        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn lookup(&self, keys: &Keys, id: &str) -> Result<Lookup> {
        let mut conn = self.conn.clone();
        let (value, error): (Option<Vec<u8>>, Option<String>) = ::redis::pipe()
            .atomic()
            .get(keys.value(id))
            .get(keys.error(id))
            .query_async(&mut conn)
            .await?;

        Ok(match (value, error) {
            (_, Some(message)) => Lookup::Error(message),
            (Some(bytes), None) => Lookup::Value(bytes),
            (None, None) => Lookup::Missing,
        })
    }

    async fn is_finished(&self, keys: &Keys, id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let (has_value, has_error): (bool, bool) = ::redis::pipe()
            .atomic()
            .exists(keys.value(id))
            .exists(keys.error(id))
            .query_async(&mut conn)
            .await?;
        Ok(has_value || has_error)
    }

    async fn wait_for_work(&self, keys: &Keys, timeout: Duration) -> Result<bool> {
        let mut guard = self.blocking.lock().await;
        // On error the connection is dropped and a fresh one is opened next time.
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => self.client.get_multiplexed_async_connection().await?,
        };

        let popped: Option<(String, String)> =
            conn.blpop(&keys.work_ready, timeout.as_secs_f64()).await?;
        *guard = Some(conn);

        Ok(popped.is_some())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<String>> {
        let pubsub = connect_pubsub(&self.client, channel).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_messages(
            self.client.clone(),
            channel.to_string(),
            pubsub,
            tx,
        ));
        Ok(rx)
    }

    async fn queued(&self, keys: &Keys, max: usize) -> Result<Vec<String>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let stop = isize::try_from(max).unwrap_or(isize::MAX) - 1;
        Ok(conn.zrange(&keys.queue, 0, stop).await?)
    }

    async fn in_progress(&self, keys: &Keys) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut ids: Vec<String> = conn.smembers(&keys.in_progress).await?;
        ids.sort();
        Ok(ids)
    }

    async fn pending(&self, keys: &Keys) -> Result<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(&keys.queue).await?)
    }
}

async fn connect_pubsub(client: &Client, channel: &str) -> Result<PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    debug!(channel, "subscribed");
    Ok(pubsub)
}

/// Forward channel messages to `tx` until the receiver goes away, emitting
/// the empty-string sentinel after every (re)connection.
async fn forward_messages(
    client: Client,
    channel: String,
    mut pubsub: PubSub,
    tx: mpsc::UnboundedSender<String>,
) {
    loop {
        if tx.send(String::new()).is_err() {
            return;
        }

        {
            let mut messages = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = tx.closed() => return,
                    msg = messages.next() => match msg {
                        Some(msg) => match msg.get_payload::<String>() {
                            Ok(id) => {
                                if tx.send(id).is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!(channel = %channel, "undecodable message: {e}"),
                        },
                        None => break,
                    },
                }
            }
        }

        warn!(channel = %channel, "pub/sub connection lost, reconnecting");
        pubsub = loop {
            tokio::select! {
                _ = tx.closed() => return,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
            match connect_pubsub(&client, &channel).await {
                Ok(pubsub) => break pubsub,
                Err(e) => warn!(channel = %channel, "pub/sub reconnect failed: {e}"),
            }
        };
        info!(channel = %channel, "pub/sub reconnected");
    }
}
