//! Key-value backend seam consumed by the note store.
//!
//! The synchronization engine never talks to a storage engine directly — it
//! mirrors notes through this narrow get/set/delete/list interface, so the
//! durable engine ([`RocksKv`](super::RocksKv)), the in-process map
//! ([`MemoryKv`]), or any external KV service can stand behind it.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

/// Backend errors.
#[derive(Debug, Clone)]
pub enum KvError {
    /// Engine-level failure (I/O, lock, corruption reported by the engine)
    BackendError(String),
    /// Value encoding failed
    SerializationError(String),
    /// Value decoding failed
    DeserializationError(String),
}

impl std::fmt::Display for KvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KvError::BackendError(e) => write!(f, "Backend error: {e}"),
            KvError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            KvError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for KvError {}

/// Durable key-value collaborator.
///
/// Methods are synchronous: implementations are expected to answer from
/// memory or an embedded engine fast enough to call inline from async
/// handlers. Keys are UTF-8 strings; values are opaque bytes.
pub trait KvBackend: Send + Sync {
    /// Fetch the value stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), KvError>;

    /// Remove `key`. Removing an absent key is a no-op.
    fn delete(&self, key: &str) -> Result<(), KvError>;

    /// All `(key, value)` pairs whose key starts with `prefix`, in key order.
    fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, KvError>;
}

/// In-process backend over a sorted map.
///
/// Used by tests and by memory-only deployments (storage disabled); the
/// `BTreeMap` keeps `list` a cheap ordered range scan.
#[derive(Debug, Default)]
pub struct MemoryKv {
    map: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.map.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvBackend for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let map = self
            .map
            .lock()
            .map_err(|e| KvError::BackendError(e.to_string()))?;
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let mut map = self
            .map
            .lock()
            .map_err(|e| KvError::BackendError(e.to_string()))?;
        map.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut map = self
            .map
            .lock()
            .map_err(|e| KvError::BackendError(e.to_string()))?;
        map.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        let map = self
            .map
            .lock()
            .map_err(|e| KvError::BackendError(e.to_string()))?;
        let pairs = map
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_roundtrip() {
        let kv = MemoryKv::new();
        kv.set("fusen/a", b"value").unwrap();

        assert_eq!(kv.get("fusen/a").unwrap(), Some(b"value".to_vec()));
        assert_eq!(kv.len(), 1);
    }

    #[test]
    fn test_get_absent_is_none() {
        let kv = MemoryKv::new();
        assert_eq!(kv.get("missing").unwrap(), None);
    }

    #[test]
    fn test_set_overwrites() {
        let kv = MemoryKv::new();
        kv.set("k", b"one").unwrap();
        kv.set("k", b"two").unwrap();

        assert_eq!(kv.get("k").unwrap(), Some(b"two".to_vec()));
        assert_eq!(kv.len(), 1);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let kv = MemoryKv::new();
        kv.set("k", b"v").unwrap();

        kv.delete("k").unwrap();
        assert_eq!(kv.get("k").unwrap(), None);

        // Second delete of the same key is a no-op.
        kv.delete("k").unwrap();
        assert!(kv.is_empty());
    }

    #[test]
    fn test_list_filters_by_prefix_in_key_order() {
        let kv = MemoryKv::new();
        kv.set("fusen/b", b"2").unwrap();
        kv.set("fusen/a", b"1").unwrap();
        kv.set("other/c", b"3").unwrap();
        kv.set("fusen/c", b"3").unwrap();

        let listed = kv.list("fusen/").unwrap();
        let keys: Vec<&str> = listed.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["fusen/a", "fusen/b", "fusen/c"]);
    }

    #[test]
    fn test_list_empty_prefix_returns_everything() {
        let kv = MemoryKv::new();
        kv.set("a", b"1").unwrap();
        kv.set("b", b"2").unwrap();

        assert_eq!(kv.list("").unwrap().len(), 2);
    }

    #[test]
    fn test_list_no_match() {
        let kv = MemoryKv::new();
        kv.set("fusen/a", b"1").unwrap();

        assert!(kv.list("zzz/").unwrap().is_empty());
    }
}
