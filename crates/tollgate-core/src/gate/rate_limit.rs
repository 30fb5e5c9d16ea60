//! File-backed rate-limit counters shared across processes.
//!
//! Counters live in one JSON state file per workspace. Every mutation happens
//! under a sibling `.lock` file created with `create_new`, so concurrent
//! evaluations never lose an increment.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, DurationRound, SecondsFormat, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::GateError;
use crate::files;
use crate::gate::intent::IntentRequest;
use crate::gate::policy::{RateLimitPolicy, RateScope, RateWindow};

pub const RATE_LIMIT_STATE_SCHEMA_ID: &str = "tollgate.rate_limit_state";
pub const RATE_LIMIT_STATE_SCHEMA_VERSION: &str = "1.0.0";

pub const LOCK_TIMEOUT: Duration = Duration::from_secs(3);
pub const LOCK_RETRY: Duration = Duration::from_millis(15);
pub const LOCK_STALE_AFTER: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit lock {} not acquired within {timeout:?}", path.display())]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("acquire rate limit lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("rate limit state unavailable: {0}")]
    StateUnavailable(String),
}

impl RateLimitError {
    pub fn code(&self) -> &'static str {
        match self {
            RateLimitError::LockTimeout { .. } => "rate_limit_lock_timeout",
            RateLimitError::Lock { .. } => "rate_limit_lock_acquire_failed",
            RateLimitError::StateUnavailable(_) => "rate_limit_state_unavailable",
        }
    }

    pub fn is_contention(&self) -> bool {
        matches!(self, RateLimitError::LockTimeout { .. })
    }
}

impl From<RateLimitError> for GateError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::LockTimeout { .. } => GateError::StateContention(err.to_string()),
            RateLimitError::Lock { path, source } => {
                GateError::io(format!("acquire rate limit lock {}", path.display()), source)
            }
            RateLimitError::StateUnavailable(message) => GateError::Internal(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub used: u32,
    pub remaining: u32,
    pub scope: RateScope,
    pub key: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    schema_id: String,
    schema_version: String,
    #[serde(default)]
    counters: Vec<PersistedCounter>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedCounter {
    key: String,
    count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockMetadata {
    pid: u32,
    created_at: DateTime<Utc>,
}

/// Removes the lock file on every exit path.
#[derive(Debug)]
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to release rate limit lock");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitStore {
    state_path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl RateLimitStore {
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let mut lock = state_path.clone().into_os_string();
        lock.push(".lock");
        RateLimitStore {
            state_path,
            lock_path: PathBuf::from(lock),
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Count this request against `limit`. Over-budget requests are not
    /// counted.
    pub fn enforce(
        &self,
        limit: &RateLimitPolicy,
        intent: &IntentRequest,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let (counter_key, scope_key) = counter_key(limit, intent, now);
        let _guard = self.acquire()?;

        let mut counters = self.load()?;
        prune(&mut counters, now);
        let used = counters.get(&counter_key).copied().unwrap_or(0);
        if used >= limit.requests {
            tracing::info!(key = %scope_key, used, limit = limit.requests, "rate limit exceeded");
            return Ok(decision(limit, false, used, scope_key));
        }
        let used = used + 1;
        counters.insert(counter_key, used);
        self.store(&counters)?;
        Ok(decision(limit, true, used, scope_key))
    }

    /// Report the current budget without counting or locking.
    pub fn peek(
        &self,
        limit: &RateLimitPolicy,
        intent: &IntentRequest,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let (counter_key, scope_key) = counter_key(limit, intent, now);
        let counters = self.load()?;
        let used = counters.get(&counter_key).copied().unwrap_or(0);
        Ok(decision(limit, used < limit.requests, used, scope_key))
    }

    fn acquire(&self) -> Result<LockGuard, RateLimitError> {
        let lock_err = |source| RateLimitError::Lock {
            path: self.lock_path.clone(),
            source,
        };
        if let Some(dir) = self.lock_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(lock_err)?;
        }

        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(mut file) => {
                    let guard = LockGuard {
                        path: self.lock_path.clone(),
                    };
                    let meta = LockMetadata {
                        pid: std::process::id(),
                        created_at: Utc::now(),
                    };
                    let encoded = serde_json::to_vec(&meta)
                        .map_err(|e| RateLimitError::StateUnavailable(e.to_string()))?;
                    file.write_all(&encoded)
                        .and_then(|_| file.sync_all())
                        .map_err(lock_err)?;
                    return Ok(guard);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(lock_err(e)),
            }

            if lock_is_stale(&self.lock_path) {
                tracing::warn!(path = %self.lock_path.display(), "reclaiming stale rate limit lock");
                match reclaim_stale_lock(&self.lock_path) {
                    Ok(()) => continue,
                    Err(e) => tracing::warn!(error = %e, "stale rate limit lock not reclaimed"),
                }
            }
            if Instant::now() >= deadline {
                return Err(RateLimitError::LockTimeout {
                    path: self.lock_path.clone(),
                    timeout: self.lock_timeout,
                });
            }
            thread::sleep(LOCK_RETRY);
        }
    }

    fn load(&self) -> Result<BTreeMap<String, u32>, RateLimitError> {
        let raw = match fs::read(&self.state_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(RateLimitError::StateUnavailable(format!(
                    "read {}: {e}",
                    self.state_path.display()
                )))
            }
        };
        let state: PersistedState = serde_json::from_slice(&raw).map_err(|e| {
            RateLimitError::StateUnavailable(format!("parse {}: {e}", self.state_path.display()))
        })?;
        if state.schema_id != RATE_LIMIT_STATE_SCHEMA_ID {
            return Err(RateLimitError::StateUnavailable(format!(
                "unsupported schema_id {}",
                state.schema_id
            )));
        }
        Ok(state
            .counters
            .into_iter()
            .filter(|c| !c.key.trim().is_empty() && c.count > 0)
            .map(|c| (c.key, c.count))
            .collect())
    }

    fn store(&self, counters: &BTreeMap<String, u32>) -> Result<(), RateLimitError> {
        let state = PersistedState {
            schema_id: RATE_LIMIT_STATE_SCHEMA_ID.to_string(),
            schema_version: RATE_LIMIT_STATE_SCHEMA_VERSION.to_string(),
            counters: counters
                .iter()
                .map(|(key, count)| PersistedCounter {
                    key: key.clone(),
                    count: *count,
                })
                .collect(),
        };
        files::write_json_atomic(&self.state_path, &state)
            .map_err(|e| RateLimitError::StateUnavailable(e.to_string()))
    }
}

fn decision(limit: &RateLimitPolicy, allowed: bool, used: u32, key: String) -> RateLimitDecision {
    RateLimitDecision {
        allowed,
        limit: limit.requests,
        used,
        remaining: limit.requests.saturating_sub(used),
        scope: limit.scope,
        key,
    }
}

fn bucket_start(window: RateWindow, now: DateTime<Utc>) -> String {
    let span = match window {
        RateWindow::Minute => TimeDelta::minutes(1),
        RateWindow::Hour => TimeDelta::hours(1),
    };
    now.duration_trunc(span)
        .unwrap_or(now)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn scope_key(scope: RateScope, intent: &IntentRequest) -> String {
    match scope {
        RateScope::Tool => intent.tool_name.clone(),
        RateScope::Identity => intent.context.identity.clone(),
        RateScope::ToolIdentity => format!("{}|{}", intent.tool_name, intent.context.identity),
    }
}

/// `window|scope|bucket_start|scope_key`, plus the bare scope key.
fn counter_key(
    limit: &RateLimitPolicy,
    intent: &IntentRequest,
    now: DateTime<Utc>,
) -> (String, String) {
    let key = scope_key(limit.scope, intent);
    let counter = format!(
        "{}|{}|{}|{}",
        limit.window.as_str(),
        limit.scope.as_str(),
        bucket_start(limit.window, now),
        key
    );
    (counter, key)
}

/// Drop counters outside their window's current bucket, and malformed keys.
fn prune(counters: &mut BTreeMap<String, u32>, now: DateTime<Utc>) {
    let minute = bucket_start(RateWindow::Minute, now);
    let hour = bucket_start(RateWindow::Hour, now);
    counters.retain(|key, _| {
        let parts: Vec<&str> = key.splitn(4, '|').collect();
        match parts.as_slice() {
            ["minute", _, bucket, _] => *bucket == minute,
            ["hour", _, bucket, _] => *bucket == hour,
            _ => false,
        }
    });
}

fn lock_is_stale(path: &Path) -> bool {
    let older_than = |then: SystemTime| {
        SystemTime::now()
            .duration_since(then)
            .is_ok_and(|age| age > LOCK_STALE_AFTER)
    };
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    if meta.modified().is_ok_and(older_than) {
        return true;
    }
    fs::read(path)
        .ok()
        .and_then(|raw| serde_json::from_slice::<LockMetadata>(&raw).ok())
        .is_some_and(|m| older_than(m.created_at.into()))
}

/// Move the lock aside and delete it only if what was moved is still stale.
///
/// Two processes can both see the same stale lock. The rename lets only one
/// of them take it; a loser that instead moved the winner's fresh lock puts
/// it back.
fn reclaim_stale_lock(lock_path: &Path) -> io::Result<()> {
    static RECLAIMS: AtomicU64 = AtomicU64::new(0);
    let name = lock_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let claimed = lock_path.with_file_name(format!(
        "{name}.reclaim-{}-{}",
        std::process::id(),
        RECLAIMS.fetch_add(1, Ordering::Relaxed)
    ));
    match fs::rename(lock_path, &claimed) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    }
    if !lock_is_stale(&claimed) {
        match fs::hard_link(&claimed, lock_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                let _ = fs::remove_file(&claimed);
                return Err(e);
            }
        }
    }
    fs::remove_file(&claimed)
}
