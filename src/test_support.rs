use spin_sdk::http::{Request, Response};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub(crate) struct InMemoryStore {
    map: Mutex<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl InMemoryStore {
    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.map
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        self.map
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub(crate) fn counter(&self, key: &str) -> i64 {
        self.raw(key)
            .and_then(|v| String::from_utf8(v).ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }
}

impl crate::store::KeyValueStore for InMemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ()> {
        let map = self
            .map
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), ()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(());
        }
        let mut map = self
            .map
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn increment(&self, key: &str, delta: i64) -> Result<i64, ()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(());
        }
        let mut map = self
            .map
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = map
            .get(key)
            .and_then(|v| String::from_utf8(v.clone()).ok())
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + delta;
        map.insert(key.to_string(), next.to_string().into_bytes());
        Ok(next)
    }
}

pub(crate) fn request_with_headers(path: &str, headers: &[(&str, &str)]) -> Request {
    let mut builder = Request::builder();
    builder.method(spin_sdk::http::Method::Get).uri(path);
    for (key, value) in headers {
        builder.header(*key, *value);
    }
    builder.build()
}

pub(crate) fn header_value(resp: &Response, name: &str) -> Option<String> {
    resp.headers()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, value)| value.as_str())
        .map(str::to_string)
}
