// src/stats.rs
// Three-channel statistics pipeline. Channel 1 is a fire-and-forget event
// sink writing one immutable record per decision. Channel 2 is the primary
// aggregator: a single-writer in-memory map flushed to the durable hourly
// table on a timer. Channel 3 is the fallback: when the aggregator lock is
// unavailable the event goes straight to the durable table through atomic
// insert-or-increment, so concurrent writers never lose counts.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::store::KeyValueStore;

const EVENT_KEY_PREFIX: &str = "events";
const STATS_KEY_PREFIX: &str = "stats";
const MAB_KEY_PREFIX: &str = "mab";

const FLUSH_INTERVAL_SECONDS: u64 = 15 * 60;
const FLUSH_RETRY_SECONDS: u64 = 60;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Redirect,
    Block,
    Pass,
}

impl DecisionKind {
    fn counter(self) -> &'static str {
        match self {
            DecisionKind::Redirect => "redirects",
            DecisionKind::Block => "blocks",
            DecisionKind::Pass => "passes",
        }
    }
}

/// One decision, as recorded by every channel.
#[derive(Serialize, Debug, Clone)]
pub struct DecisionEvent {
    pub ts: u64,
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    pub action: DecisionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    pub device: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

pub fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Hour-bucket key: unix time truncated to the hour, zero-padded so keys
/// sort lexicographically.
pub fn hour_bucket(ts: u64) -> String {
    format!("{:08}", ts / 3600)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    domain: String,
    rule_id: Option<String>,
    hour: String,
}

impl BucketKey {
    fn for_event(event: &DecisionEvent) -> Self {
        BucketKey {
            domain: event.domain.clone(),
            rule_id: event.rule_id.clone(),
            hour: hour_bucket(event.ts),
        }
    }

    fn durable_prefix(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            STATS_KEY_PREFIX,
            self.hour,
            self.domain,
            self.rule_id.as_deref().unwrap_or("-")
        )
    }
}

#[derive(Debug, Clone, Default)]
struct StatsBucket {
    hits: u64,
    redirects: u64,
    blocks: u64,
    passes: u64,
    countries: HashMap<String, u64>,
    devices: HashMap<String, u64>,
}

impl StatsBucket {
    fn apply(&mut self, event: &DecisionEvent) {
        self.hits += 1;
        match event.action {
            DecisionKind::Redirect => self.redirects += 1,
            DecisionKind::Block => self.blocks += 1,
            DecisionKind::Pass => self.passes += 1,
        }
        if let Some(country) = &event.country {
            *self.countries.entry(country.clone()).or_insert(0) += 1;
        }
        *self.devices.entry(event.device.to_string()).or_insert(0) += 1;
    }

    fn is_empty(&self) -> bool {
        self.hits == 0
            && self.redirects == 0
            && self.blocks == 0
            && self.passes == 0
            && self.countries.is_empty()
            && self.devices.is_empty()
    }
}

#[derive(Default)]
struct Aggregator {
    buckets: HashMap<BucketKey, StatsBucket>,
    flush_due: Option<u64>,
}

impl Aggregator {
    fn record(&mut self, event: &DecisionEvent) {
        self.buckets
            .entry(BucketKey::for_event(event))
            .or_default()
            .apply(event);
        // First write after idleness arms the flush timer.
        if self.flush_due.is_none() {
            self.flush_due = Some(event.ts + FLUSH_INTERVAL_SECONDS);
        }
    }

    fn maybe_flush<S: KeyValueStore>(&mut self, store: &S, now: u64) {
        let Some(due) = self.flush_due else { return };
        if now < due {
            return;
        }
        let buckets = std::mem::take(&mut self.buckets);
        let mut retained = HashMap::new();
        for (key, bucket) in buckets {
            if let Some(leftover) = persist_bucket(store, &key, bucket) {
                retained.insert(key, leftover);
            }
        }
        if retained.is_empty() {
            self.flush_due = None;
        } else {
            // Keep the unpersisted counts and retry shortly.
            crate::log_line(&format!(
                "[stats] flush left {} bucket(s) unpersisted, retrying in {}s",
                retained.len(),
                FLUSH_RETRY_SECONDS
            ));
            self.buckets = retained;
            self.flush_due = Some(now + FLUSH_RETRY_SECONDS);
        }
    }
}

static AGGREGATOR: Lazy<Mutex<Aggregator>> = Lazy::new(|| Mutex::new(Aggregator::default()));

/// Record one decision through all three channels. Never blocks and never
/// surfaces an error to the caller.
pub fn record_decision<S: KeyValueStore>(store: &S, event: &DecisionEvent) {
    emit_event(store, event);
    match AGGREGATOR.try_lock() {
        Ok(mut aggregator) => {
            aggregator.record(event);
            aggregator.maybe_flush(store, event.ts);
        }
        // Lock held (or poisoned): take the direct durable path instead of
        // waiting. Atomic increments keep concurrent writers lossless.
        Err(_) => fallback_write(store, event),
    }
}

/// Channel 1: best-effort compact event record under a distinct immutable
/// key, so concurrent emitters never contend. Failures are swallowed.
fn emit_event<S: KeyValueStore>(store: &S, event: &DecisionEvent) {
    let key = format!(
        "{}:{}:{}-{:016x}",
        EVENT_KEY_PREFIX,
        hour_bucket(event.ts),
        event.ts,
        rand::random::<u64>()
    );
    match serde_json::to_vec(event) {
        Ok(payload) => {
            if store.set(&key, &payload).is_err() {
                crate::log_line(&format!("[stats] event sink write failed for {}", key));
            }
        }
        Err(_) => crate::log_line("[stats] event serialization failed; dropping"),
    }
}

/// Channel 3: direct upsert into the durable hourly table.
fn fallback_write<S: KeyValueStore>(store: &S, event: &DecisionEvent) {
    let key = BucketKey::for_event(event);
    let prefix = key.durable_prefix();
    let mut failed = false;
    failed |= store.increment(&format!("{}:hits", prefix), 1).is_err();
    failed |= store
        .increment(&format!("{}:{}", prefix, event.action.counter()), 1)
        .is_err();
    if let Some(country) = &event.country {
        failed |= store
            .increment(&format!("{}:country:{}", prefix, country), 1)
            .is_err();
    }
    failed |= store
        .increment(&format!("{}:device:{}", prefix, event.device), 1)
        .is_err();
    if failed {
        crate::log_line(&format!("[stats] fallback write failed for {}", prefix));
    }
}

/// Persist one bucket. Returns the portion that failed to persist, so a
/// retry neither drops nor double-counts anything.
fn persist_bucket<S: KeyValueStore>(
    store: &S,
    key: &BucketKey,
    bucket: StatsBucket,
) -> Option<StatsBucket> {
    let prefix = key.durable_prefix();
    let mut leftover = StatsBucket::default();

    let persist_counter = |suffix: &str, value: u64| -> u64 {
        if value == 0 {
            return 0;
        }
        let durable_key = format!("{}:{}", prefix, suffix);
        match store.increment(&durable_key, value as i64) {
            Ok(_) => 0,
            Err(()) => value,
        }
    };

    leftover.hits = persist_counter("hits", bucket.hits);
    leftover.redirects = persist_counter("redirects", bucket.redirects);
    leftover.blocks = persist_counter("blocks", bucket.blocks);
    leftover.passes = persist_counter("passes", bucket.passes);
    for (country, count) in bucket.countries {
        let remaining = persist_counter(&format!("country:{}", country), count);
        if remaining > 0 {
            leftover.countries.insert(country, remaining);
        }
    }
    for (device, count) in bucket.devices {
        let remaining = persist_counter(&format!("device:{}", device), count);
        if remaining > 0 {
            leftover.devices.insert(device, remaining);
        }
    }

    if leftover.is_empty() {
        None
    } else {
        Some(leftover)
    }
}

/// Best-effort impression bump for the variant a bandit rule selected.
pub fn record_variant_impression<S: KeyValueStore>(store: &S, rule_id: &str, variant_index: usize) {
    let key = format!("{}:{}:{}:impressions", MAB_KEY_PREFIX, rule_id, variant_index);
    if store.increment(&key, 1).is_err() {
        crate::log_line(&format!("[stats] impression increment failed for {}", key));
    }
}

/// Force-flush everything regardless of the timer. Test hook and shutdown
/// aid; the production path flushes from record_decision.
#[cfg(test)]
pub(crate) fn flush_now_for_tests<S: KeyValueStore>(store: &S, now: u64) {
    let mut aggregator = AGGREGATOR
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    aggregator.flush_due = Some(now);
    aggregator.maybe_flush(store, now);
}

#[cfg(test)]
pub(crate) fn reset_for_tests() {
    let mut aggregator = AGGREGATOR
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    aggregator.buckets.clear();
    aggregator.flush_due = None;
}
