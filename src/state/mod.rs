// src/state/mod.rs
// Typed operations over the shared key-value store: blocklist, tarpit visit
// flags, hop counters, and frequency windows. Each entity kind lives in its
// own logical database index. Every call carries a bounded deadline; reads
// used for classification fail open at the call sites, writes that affect
// enforcement propagate their errors.

pub mod memory;

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::secrets::Secrets;

pub const BLOCKLIST_KEY_PREFIX: &str = "blocklist:ip:";
pub const TARPIT_FLAG_KEY_PREFIX: &str = "tarpit:flag:";
pub const FREQUENCY_KEY_PREFIX: &str = "freq:";
pub const HOPS_KEY_PREFIX: &str = "hops:";

const DB_TARPIT_FLAGS: u8 = 1;
const DB_BLOCKLIST: u8 = 2;
const DB_FREQUENCY: u8 = 3;
const DB_HOPS: u8 = 4;

// Bound on the per-source timestamp list so a hot source cannot grow a key
// without limit.
const FREQUENCY_LIST_MAX: isize = 512;

pub enum StateStore {
    Redis(RedisStore),
    Memory(memory::MemoryStore),
}

pub struct RedisStore {
    flags: ConnectionManager,
    blocklist: ConnectionManager,
    frequency: ConnectionManager,
    hops: ConnectionManager,
    deadline: Duration,
}

impl StateStore {
    /// Connects one multiplexed manager per logical database index and
    /// verifies the store is reachable. Called once at startup.
    pub async fn connect(cfg: &Config, secrets: &Secrets) -> Result<Self> {
        let base = authenticated_url(&cfg.redis_url, secrets.redis_password.as_deref())?;
        let deadline = Duration::from_millis(cfg.state_timeout_ms);

        let flags = manager_for_db(&base, DB_TARPIT_FLAGS).await?;
        let blocklist = manager_for_db(&base, DB_BLOCKLIST).await?;
        let frequency = manager_for_db(&base, DB_FREQUENCY).await?;
        let hops = manager_for_db(&base, DB_HOPS).await?;

        let store = StateStore::Redis(RedisStore {
            flags,
            blocklist,
            frequency,
            hops,
            deadline,
        });
        store.ping().await?;
        info!(url = %cfg.redis_url, "connected to state store");
        Ok(store)
    }

    /// In-process backend with the same semantics, used by tests and
    /// single-node dry runs.
    pub fn memory() -> Self {
        StateStore::Memory(memory::MemoryStore::new())
    }

    pub fn as_memory(&self) -> Option<&memory::MemoryStore> {
        match self {
            StateStore::Memory(store) => Some(store),
            StateStore::Redis(_) => None,
        }
    }

    pub async fn ping(&self) -> Result<()> {
        match self {
            StateStore::Redis(store) => {
                let mut con = store.blocklist.clone();
                let fut = async move {
                    let _: String = redis::cmd("PING").query_async(&mut con).await?;
                    Ok(())
                };
                store.bounded(fut).await
            }
            StateStore::Memory(_) => Ok(()),
        }
    }

    /// Blocklist membership. Read on the hot path; callers treat errors as
    /// "not blocked".
    pub async fn is_blocked(&self, src: &str) -> Result<bool> {
        let key = format!("{}{}", BLOCKLIST_KEY_PREFIX, src);
        match self {
            StateStore::Redis(store) => {
                let mut con = store.blocklist.clone();
                store
                    .bounded(async move { con.exists(&key).await })
                    .await
            }
            StateStore::Memory(store) => Ok(store.exists(&key)),
        }
    }

    /// Inserts or refreshes a blocklist entry. Idempotent: a repeated block
    /// keeps the longer of the remaining and the new TTL. Only the
    /// enforcement service calls this.
    pub async fn add_block(&self, src: &str, ttl_seconds: u64, reason: &str) -> Result<()> {
        let key = format!("{}{}", BLOCKLIST_KEY_PREFIX, src);
        match self {
            StateStore::Redis(store) => {
                let mut con = store.blocklist.clone();
                let reason = reason.to_string();
                store
                    .bounded(async move {
                        let remaining: i64 = con.ttl(&key).await?;
                        let effective = ttl_seconds.max(remaining.max(0) as u64);
                        con.set_ex(&key, reason, effective).await
                    })
                    .await
            }
            StateStore::Memory(store) => {
                store.set_with_ttl_extend(&key, reason, ttl_seconds);
                Ok(())
            }
        }
    }

    /// Marks a source as having touched the tarpit. Short-lived marker used
    /// for observability and downstream scoring.
    pub async fn flag_tarpit(&self, src: &str, ttl_seconds: u64) -> Result<()> {
        let key = format!("{}{}", TARPIT_FLAG_KEY_PREFIX, src);
        let stamp = Utc::now().to_rfc3339();
        match self {
            StateStore::Redis(store) => {
                let mut con = store.flags.clone();
                store
                    .bounded(async move { con.set_ex(&key, stamp, ttl_seconds).await })
                    .await
            }
            StateStore::Memory(store) => {
                store.set_with_ttl(&key, &stamp, ttl_seconds);
                Ok(())
            }
        }
    }

    /// Atomically increments the hop counter for a source. The first
    /// increment in a window sets the window expiry; later increments leave
    /// it untouched so the window slides by expiry, not by activity.
    pub async fn incr_hops(&self, src: &str, window_seconds: u64) -> Result<u64> {
        let key = format!("{}{}", HOPS_KEY_PREFIX, src);
        match self {
            StateStore::Redis(store) => {
                let mut con = store.hops.clone();
                store
                    .bounded(async move {
                        let count: i64 = con.incr(&key, 1i64).await?;
                        if count == 1 {
                            let _: () = con.expire(&key, window_seconds as i64).await?;
                        }
                        Ok(count.max(0) as u64)
                    })
                    .await
            }
            StateStore::Memory(store) => Ok(store.incr_with_window(&key, window_seconds)),
        }
    }

    /// Current hop count for a source without incrementing.
    pub async fn current_hops(&self, src: &str) -> Result<u64> {
        let key = format!("{}{}", HOPS_KEY_PREFIX, src);
        match self {
            StateStore::Redis(store) => {
                let mut con = store.hops.clone();
                store
                    .bounded(async move {
                        let value: Option<String> = con.get(&key).await?;
                        Ok(value.and_then(|v| v.parse::<u64>().ok()).unwrap_or(0))
                    })
                    .await
            }
            StateStore::Memory(store) => Ok(store.counter_value(&key)),
        }
    }

    /// Appends a request timestamp to the source's bounded recent list and
    /// returns how many recorded requests fall inside the window.
    pub async fn record_request(
        &self,
        src: &str,
        now: DateTime<Utc>,
        window_seconds: u64,
    ) -> Result<u32> {
        let key = format!("{}{}", FREQUENCY_KEY_PREFIX, src);
        let stamp = now.to_rfc3339();
        match self {
            StateStore::Redis(store) => {
                let mut con = store.frequency.clone();
                store
                    .bounded(async move {
                        let _: () = con.lpush(&key, stamp).await?;
                        let _: () = con.ltrim(&key, 0, FREQUENCY_LIST_MAX - 1).await?;
                        let entries: Vec<String> = con.lrange(&key, 0, -1).await?;
                        let _: () = con.expire(&key, (window_seconds + 60) as i64).await?;
                        Ok(count_within_window(&entries, now, window_seconds))
                    })
                    .await
            }
            StateStore::Memory(store) => {
                Ok(store.push_and_count(&key, &stamp, now, window_seconds, FREQUENCY_LIST_MAX))
            }
        }
    }
}

impl RedisStore {
    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(Error::StateStore(err.to_string())),
            Err(_) => Err(Error::StateStore(format!(
                "deadline of {:?} exceeded",
                self.deadline
            ))),
        }
    }
}

async fn manager_for_db(base: &str, db: u8) -> Result<ConnectionManager> {
    let url = format!("{}/{}", base.trim_end_matches('/'), db);
    let client = redis::Client::open(url.as_str())
        .map_err(|e| Error::StateStore(format!("invalid state store URL: {}", e)))?;
    client
        .get_connection_manager()
        .await
        .map_err(|e| Error::StateStore(format!("state store unreachable (db {}): {}", db, e)))
}

/// Injects the password from the secrets directory into the configured URL
/// when the URL itself carries no credentials.
fn authenticated_url(base: &str, password: Option<&str>) -> Result<String> {
    let (scheme, rest) = base
        .split_once("://")
        .ok_or_else(|| Error::Config(format!("invalid redis URL '{}'", base)))?;
    if rest.contains('/') {
        return Err(Error::Config(
            "QUAG_REDIS_URL must not carry a database index; indices are fixed per entity kind"
                .into(),
        ));
    }
    match password {
        Some(pass) if !rest.contains('@') => Ok(format!("{}://:{}@{}", scheme, pass, rest)),
        _ => Ok(base.to_string()),
    }
}

/// Counts timestamps that fall inside the sliding window ending at `now`.
/// Entries that fail to parse are ignored.
pub(crate) fn count_within_window(
    entries: &[String],
    now: DateTime<Utc>,
    window_seconds: u64,
) -> u32 {
    let window_start = now - chrono::Duration::seconds(window_seconds as i64);
    entries
        .iter()
        .filter_map(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .filter(|ts| *ts >= window_start && *ts <= now)
        .count() as u32
}
