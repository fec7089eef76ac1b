// src/store.rs
// Key-value store abstraction for the traffic engine.
// Every stateful code path goes through this trait so it can be unit-tested
// against an in-memory store; production binds to the Spin key-value store.

use spin_sdk::key_value::Store;

pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ()>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), ()>;
    /// Atomic insert-or-increment of an integer counter. Returns the new value.
    fn increment(&self, key: &str, delta: i64) -> Result<i64, ()>;
}

impl KeyValueStore for Store {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ()> {
        Store::get(self, key).map_err(|_| ())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), ()> {
        Store::set(self, key, value).map_err(|_| ())
    }

    fn increment(&self, key: &str, delta: i64) -> Result<i64, ()> {
        Store::increment(self, key, delta).map_err(|_| ())
    }
}
