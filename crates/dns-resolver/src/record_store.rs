//! Component B: the record store adapter.
//!
//! Fetches a zone's config and a node's record bundle from the
//! external key-value store, with a short-lived cache in front so a
//! burst of queries against the same node doesn't hit the KVS once
//! per query. Entries are evicted by the reload controller when a
//! keyspace notification says they're stale, and otherwise expire
//! after `cache_timeout`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use dns_types::protocol::types::DomainName;
use dns_types::zones::types::{NodePath, RecordBundle, ZoneConfig};

/// The subset of KVS operations the record store needs. Exists so
/// tests can supply an in-memory fake instead of a real connection.
#[async_trait]
pub trait Kvs: Send + Sync {
    async fn smembers(&self, key: &str) -> redis::RedisResult<Vec<String>>;
    async fn hgetall(&self, key: &str) -> redis::RedisResult<HashMap<String, String>>;
    async fn get(&self, key: &str) -> redis::RedisResult<Option<String>>;
}

#[async_trait]
impl Kvs for ConnectionManager {
    async fn smembers(&self, key: &str) -> redis::RedisResult<Vec<String>> {
        self.clone().smembers(key).await
    }

    async fn hgetall(&self, key: &str) -> redis::RedisResult<HashMap<String, String>> {
        self.clone().hgetall(key).await
    }

    async fn get(&self, key: &str) -> redis::RedisResult<Option<String>> {
        self.clone().get(key).await
    }
}

/// How keys are namespaced in the KVS: `format!("{prefix}{body}{suffix}")`.
#[derive(Debug, Clone, Default)]
pub struct KeyNaming {
    pub prefix: String,
    pub suffix: String,
}

impl KeyNaming {
    fn key(&self, body: &str) -> String {
        format!("{}{}{}", self.prefix, body, self.suffix)
    }

    pub fn zones_key(&self) -> String {
        self.key("zones")
    }

    pub fn zone_hash_key(&self, origin: &DomainName) -> String {
        self.key(&format!("zones:{}", origin.to_dotted_string()))
    }

    pub fn zone_config_key(&self, origin: &DomainName) -> String {
        self.key(&format!("zones:{}:config", origin.to_dotted_string()))
    }

    /// Remove this naming's prefix/suffix from a raw key, for decoding
    /// the body out of a keyspace notification channel name. Returns
    /// `None` if `raw` doesn't carry both.
    pub fn strip<'a>(&self, raw: &'a str) -> Option<&'a str> {
        raw.strip_prefix(self.prefix.as_str())?.strip_suffix(self.suffix.as_str())
    }
}

struct CachedBundle {
    bundle: RecordBundle,
    expires_at: Instant,
}

struct CachedConfig {
    config: ZoneConfig,
    expires_at: Instant,
}

/// KVS-backed record store, with a short TTL cache in front.
pub struct RecordStore<K: Kvs> {
    kvs: K,
    naming: KeyNaming,
    cache_timeout: Duration,
    read_timeout: Duration,
    bundles: Mutex<HashMap<(DomainName, String), CachedBundle>>,
    configs: Mutex<HashMap<DomainName, CachedConfig>>,
}

/// The outcome of a bounded KVS read: either the store answered in
/// time, or it didn't (treated the same as a backend error - see
/// §5 "subject to ConnectTimeout, ReadTimeout" and §7 "dependency
/// errors").
enum ReadOutcome<T> {
    Ok(T),
    Failed,
}

impl<K: Kvs> RecordStore<K> {
    pub fn new(kvs: K, naming: KeyNaming, cache_timeout: Duration) -> Self {
        Self::with_read_timeout(kvs, naming, cache_timeout, Duration::from_secs(2))
    }

    pub fn with_read_timeout(kvs: K, naming: KeyNaming, cache_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            kvs,
            naming,
            cache_timeout,
            read_timeout,
            bundles: Mutex::new(HashMap::new()),
            configs: Mutex::new(HashMap::new()),
        }
    }

    /// Run a KVS read subject to `read_timeout`, collapsing a transport
    /// error and a timeout into the same "failed" outcome - both are
    /// dependency errors the caller treats identically.
    async fn bounded<T>(&self, what: &str, fut: impl std::future::Future<Output = redis::RedisResult<T>>) -> ReadOutcome<T> {
        match tokio::time::timeout(self.read_timeout, fut).await {
            Ok(Ok(value)) => ReadOutcome::Ok(value),
            Ok(Err(error)) => {
                tracing::warn!(%error, what, "KVS read failed");
                ReadOutcome::Failed
            }
            Err(_) => {
                tracing::warn!(what, timeout = ?self.read_timeout, "KVS read timed out");
                ReadOutcome::Failed
            }
        }
    }

    /// All zone origins currently listed in the `zones` set.
    pub async fn list_origins(&self) -> Vec<DomainName> {
        match self.bounded("zones", self.kvs.smembers(&self.naming.zones_key())).await {
            ReadOutcome::Ok(members) => members
                .into_iter()
                .filter_map(|s| DomainName::from_dotted_string(&s))
                .collect(),
            ReadOutcome::Failed => Vec::new(),
        }
    }

    /// The record bundle for `node_path` within `origin`, or `None` if
    /// the node has no data at all.
    ///
    /// # Panics
    ///
    /// If the bundle cache mutex has been poisoned.
    pub async fn get_records(&self, origin: &DomainName, node_path: &NodePath) -> Option<RecordBundle> {
        let cache_key = (origin.clone(), node_path.to_key_string());

        if let Some(cached) = self.bundles.lock().expect("bundle cache poisoned").get(&cache_key) {
            if cached.expires_at > Instant::now() {
                crate::metrics::RECORD_STORE_CACHE_HIT_TOTAL.with_label_values(&["bundle"]).inc();
                return Some(cached.bundle.clone());
            }
        }
        crate::metrics::RECORD_STORE_CACHE_MISS_TOTAL.with_label_values(&["bundle"]).inc();

        let hash_key = self.naming.zone_hash_key(origin);
        let field = node_path.to_key_string();
        let raw = match self.bounded("node record bundle", self.kvs.hgetall(&hash_key)).await {
            ReadOutcome::Ok(fields) => fields.get(&field).cloned(),
            ReadOutcome::Failed => None,
        };

        let bundle = raw.map(|json| RecordBundle::parse(&json))?;
        let expires_at = Instant::now() + self.cache_timeout;
        self.bundles.lock().expect("bundle cache poisoned").insert(
            cache_key,
            CachedBundle {
                bundle: bundle.clone(),
                expires_at,
            },
        );

        Some(bundle)
    }

    /// The zone's config, or the default if it has none or the blob is
    /// malformed.
    ///
    /// # Panics
    ///
    /// If the config cache mutex has been poisoned.
    pub async fn get_config(&self, origin: &DomainName) -> ZoneConfig {
        if let Some(cached) = self.configs.lock().expect("config cache poisoned").get(origin) {
            if cached.expires_at > Instant::now() {
                crate::metrics::RECORD_STORE_CACHE_HIT_TOTAL.with_label_values(&["config"]).inc();
                return cached.config.clone();
            }
        }
        crate::metrics::RECORD_STORE_CACHE_MISS_TOTAL.with_label_values(&["config"]).inc();

        let config = match self.bounded("zone config", self.kvs.get(&self.naming.zone_config_key(origin))).await {
            ReadOutcome::Ok(Some(json)) => ZoneConfig::parse(&json),
            ReadOutcome::Ok(None) => ZoneConfig::default(),
            ReadOutcome::Failed => ZoneConfig::default(),
        };

        self.configs.lock().expect("config cache poisoned").insert(
            origin.clone(),
            CachedConfig {
                config: config.clone(),
                expires_at: Instant::now() + self.cache_timeout,
            },
        );

        config
    }

    /// Whether `origin` has any node strictly below `path` with its
    /// own record data - used to tell a genuinely absent name apart
    /// from an empty non-terminal (e.g. `w.example.com` has no data of
    /// its own, but `host.w.example.com` does).
    pub async fn has_descendant_records(&self, origin: &DomainName, path: &NodePath) -> bool {
        let hash_key = self.naming.zone_hash_key(origin);
        let fields = match self.bounded("empty-non-terminal check", self.kvs.hgetall(&hash_key)).await {
            ReadOutcome::Ok(fields) => fields,
            ReadOutcome::Failed => return false,
        };

        if path.is_apex() {
            return fields.keys().any(|k| k != "@");
        }

        let suffix = format!(".{}", path.to_key_string());
        fields.keys().any(|k| k != &path.to_key_string() && k.ends_with(&suffix))
    }

    /// Drop any cached entries for `origin`. Called by the reload
    /// controller when a keyspace notification reports the zone has
    /// changed.
    ///
    /// # Panics
    ///
    /// If either cache mutex has been poisoned.
    pub fn invalidate(&self, origin: &DomainName) {
        self.bundles
            .lock()
            .expect("bundle cache poisoned")
            .retain(|(o, _), _| o != origin);
        self.configs.lock().expect("config cache poisoned").remove(origin);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::protocol::types::test_util::domain;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeKvs {
        sets: StdMutex<StdHashMap<String, Vec<String>>>,
        hashes: StdMutex<StdHashMap<String, StdHashMap<String, String>>>,
        strings: StdMutex<StdHashMap<String, String>>,
    }

    #[async_trait]
    impl Kvs for FakeKvs {
        async fn smembers(&self, key: &str) -> redis::RedisResult<Vec<String>> {
            Ok(self.sets.lock().unwrap().get(key).cloned().unwrap_or_default())
        }

        async fn hgetall(&self, key: &str) -> redis::RedisResult<HashMap<String, String>> {
            Ok(self.hashes.lock().unwrap().get(key).cloned().unwrap_or_default())
        }

        async fn get(&self, key: &str) -> redis::RedisResult<Option<String>> {
            Ok(self.strings.lock().unwrap().get(key).cloned())
        }
    }

    fn naming() -> KeyNaming {
        KeyNaming::default()
    }

    #[tokio::test]
    async fn lists_origins_from_set() {
        let kvs = FakeKvs::default();
        kvs.sets
            .lock()
            .unwrap()
            .insert("zones".to_string(), vec!["example.com.".to_string()]);

        let store = RecordStore::new(kvs, naming(), Duration::from_secs(30));
        assert_eq!(vec![domain("example.com.")], store.list_origins().await);
    }

    #[tokio::test]
    async fn fetches_and_caches_record_bundle() {
        let kvs = FakeKvs::default();
        let origin = domain("example.com.");
        kvs.hashes.lock().unwrap().insert(
            "zones:example.com.".to_string(),
            StdHashMap::from([(
                "@".to_string(),
                r#"{"a":{"ttl":300, "records":[{"ip":"1.2.3.4"}]}}"#.to_string(),
            )]),
        );

        let store = RecordStore::new(kvs, naming(), Duration::from_secs(30));
        let bundle = store.get_records(&origin, &NodePath::apex()).await.unwrap();
        assert!(bundle.a.is_some());

        // mutate the backing hash directly - the cached value should
        // still be served until invalidated
        store
            .bundles
            .lock()
            .unwrap()
            .get(&(origin.clone(), "@".to_string()))
            .unwrap();
        store.invalidate(&origin);
        assert!(store.bundles.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_config_falls_back_to_default() {
        let kvs = FakeKvs::default();
        let store = RecordStore::new(kvs, naming(), Duration::from_secs(30));
        assert_eq!(ZoneConfig::default(), store.get_config(&domain("example.com.")).await);
    }

    #[tokio::test]
    async fn detects_descendant_records_for_empty_non_terminal() {
        let kvs = FakeKvs::default();
        let origin = domain("example.com.");
        kvs.hashes.lock().unwrap().insert(
            "zones:example.com.".to_string(),
            StdHashMap::from([(
                "host.v.w".to_string(),
                r#"{"a":{"ttl":300, "records":[{"ip":"1.2.3.4"}]}}"#.to_string(),
            )]),
        );

        let store = RecordStore::new(kvs, naming(), Duration::from_secs(30));
        let w = NodePath::parse("w").unwrap();
        let v_w = NodePath::parse("v.w").unwrap();
        let other = NodePath::parse("nope").unwrap();

        assert!(store.has_descendant_records(&origin, &w).await);
        assert!(store.has_descendant_records(&origin, &v_w).await);
        assert!(!store.has_descendant_records(&origin, &other).await);
    }

    #[test]
    fn key_naming_strip_roundtrips() {
        let naming = KeyNaming {
            prefix: "dns:".to_string(),
            suffix: "".to_string(),
        };
        assert_eq!(Some("zones"), naming.strip("dns:zones"));
        assert_eq!(None, naming.strip("other:zones"));
    }
}
