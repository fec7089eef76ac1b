// src/ops.rs
// Operator-facing endpoints, off the hot path: a read-only status report and
// a force-sync trigger. Both sit behind the configured API key.

use serde::Serialize;
use spin_sdk::http::{Method, Request, Response};

use crate::config;
use crate::store::KeyValueStore;
use crate::sync;

pub const STATUS_PATH: &str = "/tds/status";
pub const SYNC_PATH: &str = "/tds/sync";

#[derive(Serialize, Debug)]
pub struct StatusReport {
    pub disabled: bool,
    pub version: Option<String>,
    pub rules: usize,
    pub configs: usize,
    pub last_sync_ts: Option<u64>,
}

pub fn status_report<S: KeyValueStore>(store: &S) -> StatusReport {
    let snapshot = sync::current_snapshot(store);
    let state = sync::load_sync_state(store);
    StatusReport {
        disabled: config::kill_switch_engaged(),
        version: state.as_ref().map(|s| s.version.clone()),
        rules: snapshot.as_ref().map_or(0, |s| s.rules.len()),
        configs: snapshot.as_ref().map_or(0, |s| s.configs.len()),
        last_sync_ts: state.as_ref().map(|s| s.last_sync_ts),
    }
}

fn authorized(req: &Request) -> bool {
    let Some(expected) = config::api_key() else {
        return false;
    };
    req.header("x-api-key")
        .and_then(|v| v.as_str())
        .map(|got| got == expected)
        .unwrap_or(false)
}

fn json_response(status: u16, body: String) -> Response {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Cache-Control", "no-store")
        .body(body)
        .build()
}

/// Dispatch the operational routes; None means the request belongs to the
/// decision pipeline.
pub async fn maybe_handle_ops_route(req: &Request, path: &str) -> Option<Response> {
    if path != STATUS_PATH && path != SYNC_PATH {
        return None;
    }
    if !authorized(req) {
        return Some(Response::new(403, "Forbidden"));
    }

    if path == STATUS_PATH {
        if *req.method() != Method::Get {
            return Some(Response::new(405, "Method Not Allowed"));
        }
        let store = match spin_sdk::key_value::Store::open_default() {
            Ok(store) => store,
            Err(_) => return Some(Response::new(500, "Key-value store error")),
        };
        let report = status_report(&store);
        let body = serde_json::to_string(&report).unwrap_or_else(|_| "{}".to_string());
        return Some(json_response(200, body));
    }

    // Force sync: full replace, ignoring the stored version token.
    if *req.method() != Method::Post {
        return Some(Response::new(405, "Method Not Allowed"));
    }
    let store = match spin_sdk::key_value::Store::open_default() {
        Ok(store) => store,
        Err(_) => return Some(Response::new(500, "Key-value store error")),
    };
    let response = match sync::run_sync(&store, true).await {
        Ok(sync::SyncOutcome::Applied {
            version,
            rules,
            configs,
        }) => json_response(
            200,
            format!(
                "{{\"status\":\"applied\",\"version\":{},\"rules\":{},\"configs\":{}}}",
                serde_json::to_string(&version).unwrap_or_else(|_| "\"\"".to_string()),
                rules,
                configs
            ),
        ),
        Ok(sync::SyncOutcome::Unchanged) => {
            json_response(200, "{\"status\":\"unchanged\"}".to_string())
        }
        Err(err) => json_response(
            502,
            format!(
                "{{\"status\":\"error\",\"detail\":{}}}",
                serde_json::to_string(&err.describe()).unwrap_or_else(|_| "\"\"".to_string())
            ),
        ),
    };
    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::InMemoryStore;

    #[test]
    fn status_report_reflects_snapshot_and_state() {
        let store = InMemoryStore::default();
        let payload = r#"{
            "version": "v3",
            "rules": [
                {"id": "r1", "domain": "a.example", "action": "block"},
                {"id": "r2", "domain": "a.example", "action": "pass"}
            ],
            "configs": [{"domain": "a.example", "tds_enabled": true}]
        }"#;
        sync::apply_sync_payload(&store, payload.as_bytes(), 1_700_000_000).unwrap();

        let report = status_report(&store);
        assert_eq!(report.version.as_deref(), Some("v3"));
        assert_eq!(report.rules, 2);
        assert_eq!(report.configs, 1);
        assert_eq!(report.last_sync_ts, Some(1_700_000_000));
    }

    #[test]
    fn status_report_before_first_sync_is_empty() {
        let store = InMemoryStore::default();
        let report = status_report(&store);
        assert_eq!(report.version, None);
        assert_eq!(report.rules, 0);
        assert_eq!(report.configs, 0);
    }
}
