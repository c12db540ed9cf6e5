//! Response caching for the geography API.
//!
//! The API client only talks to [`ResponseCache`]; which backing store is used
//! is decided by whoever builds the client.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ImportError;

pub trait ResponseCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, ImportError>;
    fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), ImportError>;
}

/// Cache key for a request URL, e.g. `api_data_https___host_path`.
pub fn cache_key(url: &str) -> String {
    format!("api_data_{}", url.replace('/', "_").replace(':', "_"))
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    expires_at: u64,
    value: Value,
}

/// One gzip-compressed JSON envelope per key under a directory.
#[derive(Debug, Clone)]
pub struct FileCache {
    root: Utf8PathBuf,
}

impl FileCache {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> Utf8PathBuf {
        let file_name: String = key
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.') {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{file_name}.json.gz"))
    }

    fn read_envelope(path: &Utf8Path) -> Result<Envelope, String> {
        let file = File::open(path.as_std_path()).map_err(|err| err.to_string())?;
        let mut decoder = GzDecoder::new(file);
        let mut text = String::new();
        decoder
            .read_to_string(&mut text)
            .map_err(|err| err.to_string())?;
        serde_json::from_str(&text).map_err(|err| err.to_string())
    }
}

impl ResponseCache for FileCache {
    fn get(&self, key: &str) -> Result<Option<Value>, ImportError> {
        let path = self.entry_path(key);
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        match Self::read_envelope(&path) {
            Ok(envelope) if envelope.expires_at > unix_now() => Ok(Some(envelope.value)),
            Ok(_) => {
                debug!(%key, "cache entry expired");
                Ok(None)
            }
            Err(err) => {
                warn!(%path, error = %err, "ignoring unreadable cache entry");
                Ok(None)
            }
        }
    }

    fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), ImportError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| ImportError::Cache(err.to_string()))?;
        let envelope = Envelope {
            expires_at: unix_now().saturating_add(ttl.as_secs()),
            value: value.clone(),
        };
        let content =
            serde_json::to_vec(&envelope).map_err(|err| ImportError::Cache(err.to_string()))?;

        let temp = tempfile::Builder::new()
            .prefix(".cache-entry")
            .tempfile_in(self.root.as_std_path())
            .map_err(|err| ImportError::Cache(err.to_string()))?;
        let mut encoder = GzEncoder::new(temp, Compression::default());
        encoder
            .write_all(&content)
            .map_err(|err| ImportError::Cache(err.to_string()))?;
        let temp = encoder
            .finish()
            .map_err(|err| ImportError::Cache(err.to_string()))?;
        temp.persist(self.entry_path(key).as_std_path())
            .map_err(|err| ImportError::Cache(err.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (SystemTime, Value)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResponseCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<Value>, ImportError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| ImportError::Cache("memory cache poisoned".to_string()))?;
        Ok(entries
            .get(key)
            .filter(|(expires_at, _)| *expires_at > SystemTime::now())
            .map(|(_, value)| value.clone()))
    }

    fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), ImportError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| ImportError::Cache("memory cache poisoned".to_string()))?;
        entries.insert(key.to_string(), (SystemTime::now() + ttl, value.clone()));
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn key_replaces_separators() {
        assert_eq!(
            cache_key("https://example.org/api/municipios"),
            "api_data_https___example.org_api_municipios"
        );
    }

    #[test]
    fn file_cache_round_trip_and_expiry() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("api")).unwrap();
        let cache = FileCache::new(root);
        let value = json!([{"id": 1, "nome": "Norte"}]);

        assert!(cache.get("k").unwrap().is_none());
        cache.set("k", &value, Duration::from_secs(60)).unwrap();
        assert_eq!(cache.get("k").unwrap(), Some(value.clone()));

        cache.set("expired", &value, Duration::ZERO).unwrap();
        assert!(cache.get("expired").unwrap().is_none());
    }

    #[test]
    fn file_cache_treats_garbage_as_miss() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let cache = FileCache::new(root.clone());
        fs::write(root.join("broken.json.gz").as_std_path(), b"not gzip").unwrap();
        assert!(cache.get("broken").unwrap().is_none());
    }

    #[test]
    fn memory_cache_honours_ttl() {
        let cache = MemoryCache::new();
        cache.set("a", &json!(1), Duration::from_secs(60)).unwrap();
        cache.set("b", &json!(2), Duration::ZERO).unwrap();
        assert_eq!(cache.get("a").unwrap(), Some(json!(1)));
        assert!(cache.get("b").unwrap().is_none());
        assert_eq!(cache.len(), 2);
    }
}
