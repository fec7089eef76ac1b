// src/sync.rs
// Pull-based, versioned snapshot sync. The hot path only ever reads the
// locally stored snapshot; refreshes are gated by a process-wide timestamp
// and run after the response for the triggering request has been built.
// Every failure here is non-fatal: the previous snapshot stays authoritative.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use spin_sdk::http::{Method, Request, Response};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config;
use crate::rules::{validate_snapshot, Snapshot};
use crate::stats::now_ts;
use crate::store::KeyValueStore;

pub const SNAPSHOT_KEY: &str = "tds:snapshot";
pub const SYNC_STATE_KEY: &str = "tds:sync_state";

#[cfg(not(test))]
const SNAPSHOT_CACHE_TTL_SECONDS: u64 = 2;

/// Version token and last successful sync, persisted next to the snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SyncState {
    pub version: String,
    pub last_sync_ts: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Unchanged,
    Applied {
        version: String,
        rules: usize,
        configs: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    Disabled,
    Network(String),
    Status(u16),
    Parse,
    Store,
}

impl SyncError {
    pub fn describe(&self) -> String {
        match self {
            SyncError::Disabled => "sync disabled (no source configured)".to_string(),
            SyncError::Network(detail) => format!("network error: {}", detail),
            SyncError::Status(code) => format!("unexpected source status {}", code),
            SyncError::Parse => "payload parse error".to_string(),
            SyncError::Store => "local store write error".to_string(),
        }
    }
}

/// The source answers either an "unchanged" sentinel or a full snapshot.
#[derive(Deserialize)]
#[serde(untagged)]
enum SyncPayload {
    Unchanged { unchanged: bool },
    Full(Snapshot),
}

// Last time any request line checked whether a sync is due. A single atomic
// claimed by compare-exchange, so concurrent requests elect one syncer.
static LAST_CHECK: AtomicU64 = AtomicU64::new(0);

struct CachedSnapshot {
    loaded_at: u64,
    snapshot: Arc<Snapshot>,
}

static SNAPSHOT_CACHE: Lazy<Mutex<Option<CachedSnapshot>>> = Lazy::new(|| Mutex::new(None));

/// The snapshot the matcher reads. Served from a short-lived in-process
/// cache; falls back to parsing the stored copy. None when nothing has ever
/// been synced.
pub fn current_snapshot<S: KeyValueStore>(store: &S) -> Option<Arc<Snapshot>> {
    #[cfg(test)]
    {
        return load_snapshot(store);
    }
    #[cfg(not(test))]
    {
        let now = now_ts();
        {
            let cache = SNAPSHOT_CACHE
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(entry) = cache.as_ref() {
                if now.saturating_sub(entry.loaded_at) <= SNAPSHOT_CACHE_TTL_SECONDS {
                    return Some(entry.snapshot.clone());
                }
            }
        }
        let snapshot = load_snapshot(store)?;
        let mut cache = SNAPSHOT_CACHE
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *cache = Some(CachedSnapshot {
            loaded_at: now,
            snapshot: snapshot.clone(),
        });
        Some(snapshot)
    }
}

fn load_snapshot<S: KeyValueStore>(store: &S) -> Option<Arc<Snapshot>> {
    let raw = store.get(SNAPSHOT_KEY).ok().flatten()?;
    match serde_json::from_slice::<Snapshot>(&raw) {
        Ok(snapshot) => Some(Arc::new(snapshot)),
        Err(err) => {
            crate::log_line(&format!("[sync] stored snapshot unreadable: {}", err));
            None
        }
    }
}

fn invalidate_snapshot_cache() {
    let mut cache = SNAPSHOT_CACHE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *cache = None;
}

pub fn load_sync_state<S: KeyValueStore>(store: &S) -> Option<SyncState> {
    let raw = store.get(SYNC_STATE_KEY).ok().flatten()?;
    serde_json::from_slice(&raw).ok()
}

fn save_sync_state<S: KeyValueStore>(store: &S, state: &SyncState) -> Result<(), SyncError> {
    let payload = serde_json::to_vec(state).map_err(|_| SyncError::Store)?;
    store.set(SYNC_STATE_KEY, &payload).map_err(|_| SyncError::Store)
}

/// Claim the right to sync. Returns false while inside the TTL window or
/// when another request won the claim.
fn claim_refresh_slot(now: u64, ttl_seconds: u64) -> bool {
    let last = LAST_CHECK.load(Ordering::Relaxed);
    if now.saturating_sub(last) < ttl_seconds {
        return false;
    }
    LAST_CHECK
        .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
}

/// Inline sync check, called once the response for the triggering request
/// has already been constructed. The decision is made; a slow source cannot
/// delay it.
pub async fn maybe_refresh_after_response() {
    if config::sync_url().is_none() {
        return;
    }
    if !claim_refresh_slot(now_ts(), config::sync_ttl_seconds()) {
        return;
    }
    let store = match spin_sdk::key_value::Store::open_default() {
        Ok(store) => store,
        Err(_) => return,
    };
    match run_sync(&store, false).await {
        Ok(SyncOutcome::Unchanged) => {}
        Ok(SyncOutcome::Applied {
            version,
            rules,
            configs,
        }) => crate::log_line(&format!(
            "[sync] applied snapshot version {} ({} rules, {} configs)",
            version, rules, configs
        )),
        // Non-fatal by design: the previous snapshot stays authoritative.
        Err(err) => crate::log_line(&format!("[sync] refresh failed: {}", err.describe())),
    }
}

/// Fetch from the central source and apply the result. `force` skips the
/// version token so the source returns a full payload.
pub async fn run_sync<S: KeyValueStore>(store: &S, force: bool) -> Result<SyncOutcome, SyncError> {
    let endpoint = config::sync_url().ok_or(SyncError::Disabled)?;
    let now = now_ts();

    let mut url = endpoint;
    if !force {
        if let Some(state) = load_sync_state(store) {
            if !state.version.is_empty() {
                let separator = if url.contains('?') { '&' } else { '?' };
                url = format!("{}{}version={}", url, separator, state.version);
            }
        }
    }

    let mut builder = Request::builder();
    builder.method(Method::Get).uri(&url);
    if let Some(token) = config::sync_token() {
        builder.header("authorization", format!("Bearer {}", token).as_str());
    }
    let request = builder.build();

    let response: Response = spin_sdk::http::send(request)
        .await
        .map_err(|err| SyncError::Network(format!("{:?}", err)))?;

    match *response.status() {
        304 => {
            touch_sync_state(store, now);
            Ok(SyncOutcome::Unchanged)
        }
        200 => apply_sync_payload(store, response.body(), now),
        status => Err(SyncError::Status(status)),
    }
}

/// Record a successful "nothing changed" check. Best-effort: the version we
/// already hold remains valid either way.
fn touch_sync_state<S: KeyValueStore>(store: &S, now: u64) {
    let mut state = load_sync_state(store).unwrap_or_default();
    state.last_sync_ts = now;
    if save_sync_state(store, &state).is_err() {
        crate::log_line("[sync] failed to persist sync timestamp");
    }
}

/// Parse and apply a source response body. A full snapshot is validated,
/// written as one atomic KV value, and only then recorded as the current
/// version. In-flight evaluations keep reading the old snapshot until the
/// single write lands.
pub fn apply_sync_payload<S: KeyValueStore>(
    store: &S,
    body: &[u8],
    now: u64,
) -> Result<SyncOutcome, SyncError> {
    let payload: SyncPayload = serde_json::from_slice(body).map_err(|_| SyncError::Parse)?;
    let mut snapshot = match payload {
        SyncPayload::Unchanged { unchanged: true } => {
            touch_sync_state(store, now);
            return Ok(SyncOutcome::Unchanged);
        }
        SyncPayload::Unchanged { unchanged: false } => return Err(SyncError::Parse),
        SyncPayload::Full(snapshot) => snapshot,
    };

    for warning in validate_snapshot(&mut snapshot) {
        crate::log_line(&format!("[sync] {}", warning));
    }

    let serialized = serde_json::to_vec(&snapshot).map_err(|_| SyncError::Store)?;
    store
        .set(SNAPSHOT_KEY, &serialized)
        .map_err(|_| SyncError::Store)?;
    save_sync_state(
        store,
        &SyncState {
            version: snapshot.version.clone(),
            last_sync_ts: now,
        },
    )?;
    invalidate_snapshot_cache();

    Ok(SyncOutcome::Applied {
        version: snapshot.version,
        rules: snapshot.rules.len(),
        configs: snapshot.configs.len(),
    })
}
