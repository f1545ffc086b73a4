//! Authorization Store (C5): local authorization list plus a bounded LRU
//! cache of CSMS `Authorize.conf` results. Grounded on
//! `examples/original_source/src/charger/ocpp/ocpp_authorization.c` (local
//! list + cache layering) and the teacher's `repo`-module pattern for an
//! in-memory store behind an async-friendly lock.

use std::collections::HashMap;
use std::collections::VecDeque;

use tokio::sync::RwLock;

/// Mirrors OCPP 1.6 `idTagInfo.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Accepted,
    Blocked,
    Expired,
    Invalid,
    ConcurrentTx,
}

#[derive(Debug, Clone)]
pub struct LocalListEntry {
    pub id_tag: String,
    pub parent_id_tag: Option<String>,
    pub status: AuthorizationStatus,
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    status: AuthorizationStatus,
}

pub struct AuthorizationStoreConfig {
    pub local_auth_list_enabled: bool,
    pub allow_offline_tx_for_unknown_id: bool,
    pub cache_capacity: usize,
}

impl Default for AuthorizationStoreConfig {
    fn default() -> Self {
        Self {
            local_auth_list_enabled: true,
            allow_offline_tx_for_unknown_id: false,
            cache_capacity: 64,
        }
    }
}

/// Local allow/deny list (versioned, pushed by `SendLocalList`) plus an LRU
/// cache of recent CSMS authorize results. `authorize()` consults the local
/// list first when enabled, then the cache, matching §4.4b's lookup order.
pub struct AuthorizationStore {
    config: AuthorizationStoreConfig,
    local_list: RwLock<HashMap<String, LocalListEntry>>,
    local_list_version: RwLock<i32>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    cache_order: RwLock<VecDeque<String>>,
}

impl AuthorizationStore {
    pub fn new(config: AuthorizationStoreConfig) -> Self {
        Self {
            config,
            local_list: RwLock::new(HashMap::new()),
            local_list_version: RwLock::new(0),
            cache: RwLock::new(HashMap::new()),
            cache_order: RwLock::new(VecDeque::new()),
        }
    }

    /// `AllowOfflineTxForUnknownId` governs the `csms_up = false` unknown-id
    /// path from §4.4b; callers pass that flag explicitly rather than this
    /// store tracking connectivity itself.
    pub async fn authorize(&self, id_tag: &str, csms_up: bool) -> AuthorizationStatus {
        if self.config.local_auth_list_enabled {
            if let Some(entry) = self.local_list.read().await.get(id_tag) {
                return entry.status;
            }
        }
        if let Some(entry) = self.cache.read().await.get(id_tag) {
            return entry.status;
        }
        if !csms_up && self.config.allow_offline_tx_for_unknown_id {
            return AuthorizationStatus::Accepted;
        }
        AuthorizationStatus::Invalid
    }

    pub async fn parent_id_for(&self, id_tag: &str) -> Option<String> {
        self.local_list.read().await.get(id_tag).and_then(|e| e.parent_id_tag.clone())
    }

    /// Records a fresh `Authorize.conf` result, evicting the least recently
    /// inserted entry once `cache_capacity` is exceeded.
    pub async fn record_authorize_conf(&self, id_tag: &str, status: AuthorizationStatus) {
        let mut cache = self.cache.write().await;
        let mut order = self.cache_order.write().await;

        if !cache.contains_key(id_tag) {
            order.push_back(id_tag.to_string());
            if order.len() > self.config.cache_capacity {
                if let Some(evicted) = order.pop_front() {
                    cache.remove(&evicted);
                }
            }
        }
        cache.insert(id_tag.to_string(), CacheEntry { status });
    }

    /// `ClearCache.req`.
    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
        self.cache_order.write().await.clear();
    }

    /// `SendLocalList.req` full replacement; `GetLocalListVersion.req`
    /// callers read `local_list_version()`.
    pub async fn replace_local_list(&self, entries: Vec<LocalListEntry>, version: i32) {
        let mut list = self.local_list.write().await;
        list.clear();
        for entry in entries {
            list.insert(entry.id_tag.clone(), entry);
        }
        *self.local_list_version.write().await = version;
    }

    pub async fn local_list_version(&self) -> i32 {
        *self.local_list_version.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_id_is_invalid_by_default() {
        let store = AuthorizationStore::new(AuthorizationStoreConfig::default());
        assert_eq!(store.authorize("unknown", true).await, AuthorizationStatus::Invalid);
    }

    #[tokio::test]
    async fn local_list_takes_precedence_over_cache() {
        let store = AuthorizationStore::new(AuthorizationStoreConfig::default());
        store
            .replace_local_list(
                vec![LocalListEntry { id_tag: "abc".into(), parent_id_tag: None, status: AuthorizationStatus::Blocked }],
                1,
            )
            .await;
        store.record_authorize_conf("abc", AuthorizationStatus::Accepted).await;

        assert_eq!(store.authorize("abc", true).await, AuthorizationStatus::Blocked);
    }

    #[tokio::test]
    async fn cache_hit_when_not_in_local_list() {
        let store = AuthorizationStore::new(AuthorizationStoreConfig::default());
        store.record_authorize_conf("xyz", AuthorizationStatus::Accepted).await;
        assert_eq!(store.authorize("xyz", true).await, AuthorizationStatus::Accepted);
    }

    #[tokio::test]
    async fn offline_unknown_id_accepted_when_flag_set() {
        let store = AuthorizationStore::new(AuthorizationStoreConfig {
            allow_offline_tx_for_unknown_id: true,
            ..AuthorizationStoreConfig::default()
        });
        assert_eq!(store.authorize("never-seen", false).await, AuthorizationStatus::Accepted);
    }

    #[tokio::test]
    async fn cache_evicts_oldest_entry_beyond_capacity() {
        let store = AuthorizationStore::new(AuthorizationStoreConfig { cache_capacity: 2, ..AuthorizationStoreConfig::default() });
        store.record_authorize_conf("a", AuthorizationStatus::Accepted).await;
        store.record_authorize_conf("b", AuthorizationStatus::Accepted).await;
        store.record_authorize_conf("c", AuthorizationStatus::Accepted).await;

        assert_eq!(store.authorize("a", true).await, AuthorizationStatus::Invalid);
        assert_eq!(store.authorize("c", true).await, AuthorizationStatus::Accepted);
    }

    #[tokio::test]
    async fn clear_cache_empties_entries() {
        let store = AuthorizationStore::new(AuthorizationStoreConfig::default());
        store.record_authorize_conf("abc", AuthorizationStatus::Accepted).await;
        store.clear_cache().await;
        assert_eq!(store.authorize("abc", true).await, AuthorizationStatus::Invalid);
    }
}
