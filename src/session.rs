use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// Cache retention for both namespaces
const TTL_HOURS: i64 = 24;
/// Thought-signature entries kept per session
const MAX_SIGNATURES: usize = 100;

/// The externally provided key/value collaborator. Best-effort semantics:
/// implementations swallow their own I/O errors and answer `None`.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<u8>>;
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration);
}

/// Default in-process store with lazy TTL expiry
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, (Vec<u8>, DateTime<Utc>)>,
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let entry = self.entries.get(key)?;
        let (value, expires_at) = entry.value();
        if *expires_at < Utc::now() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(value.clone())
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        self.entries
            .insert(key.to_string(), (value, Utc::now() + ttl));
    }
}

/// Derive a stable conversation key for otherwise stateless HTTP calls.
///
/// Priority: explicit `x-session-id` header, then the request's `user`
/// field, then a truncated hash of (model + first user text), prefixed with
/// the inbound token when one is present so different callers never share a
/// fallback key.
pub fn derive_session_key(
    session_header: Option<&str>,
    user: Option<&str>,
    model: &str,
    first_user_text: &str,
    inbound_token: Option<&str>,
) -> String {
    if let Some(header) = session_header.filter(|s| !s.is_empty()) {
        return header.to_string();
    }
    if let Some(user) = user.filter(|s| !s.is_empty()) {
        return user.to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update(first_user_text.as_bytes());
    let digest = hex_string(&hasher.finalize());
    let short = &digest[..16];
    match inbound_token {
        Some(token) if !token.is_empty() => format!("{}_{}", token, short),
        _ => short.to_string(),
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PreviousResponseEntry {
    previous_response_id: String,
    updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThoughtSignatureEntry {
    pub thought_signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    pub name: String,
    pub updated_at: i64,
}

/// Session-scoped cache over an injected [`KvStore`].
///
/// Two disjoint namespaces share one store; the storage key is always
/// `sha256("<prefix>_<session_key>")` so the same session key maps to the
/// same slot on every call.
#[derive(Clone)]
pub struct SessionCache {
    store: Arc<dyn KvStore>,
}

impl SessionCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::default()))
    }

    fn storage_key(prefix: &str, session_key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prefix.as_bytes());
        hasher.update(b"_");
        hasher.update(session_key.as_bytes());
        hex_string(&hasher.finalize())
    }

    pub async fn get_previous_response_id(&self, session_key: &str) -> Option<String> {
        let key = Self::storage_key("prev_resp", session_key);
        let bytes = self.store.get(&key).await?;
        serde_json::from_slice::<PreviousResponseEntry>(&bytes)
            .ok()
            .map(|e| e.previous_response_id)
    }

    pub async fn put_previous_response_id(&self, session_key: &str, response_id: &str) {
        let key = Self::storage_key("prev_resp", session_key);
        let entry = PreviousResponseEntry {
            previous_response_id: response_id.to_string(),
            updated_at: Utc::now().timestamp_millis(),
        };
        if let Ok(bytes) = serde_json::to_vec(&entry) {
            self.store.put(&key, bytes, Duration::hours(TTL_HOURS)).await;
        }
    }

    pub async fn get_thought_signatures(
        &self,
        session_key: &str,
    ) -> HashMap<String, ThoughtSignatureEntry> {
        let key = Self::storage_key("thought_sig", session_key);
        let Some(bytes) = self.store.get(&key).await else {
            return HashMap::new();
        };
        serde_json::from_slice(&bytes).unwrap_or_default()
    }

    /// Merge new signatures into the session map, evicting the stalest
    /// entries past the per-session bound.
    pub async fn put_thought_signatures(
        &self,
        session_key: &str,
        new_entries: impl IntoIterator<Item = (String, ThoughtSignatureEntry)>,
    ) {
        let mut map = self.get_thought_signatures(session_key).await;
        for (call_id, entry) in new_entries {
            map.insert(call_id, entry);
        }

        while map.len() > MAX_SIGNATURES {
            let stalest = map
                .iter()
                .min_by_key(|(_, e)| e.updated_at)
                .map(|(k, _)| k.clone());
            match stalest {
                Some(k) => map.remove(&k),
                None => break,
            };
        }

        let key = Self::storage_key("thought_sig", session_key);
        if let Ok(bytes) = serde_json::to_vec(&map) {
            self.store.put(&key, bytes, Duration::hours(TTL_HOURS)).await;
        }
    }
}
