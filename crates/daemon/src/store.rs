//! Account persistence and store readiness.
//!
//! The daemon reads and writes a small slice of application state: the cloud
//! credential and the cached entitlement of each account. [`AccountStore`] is
//! the seam; [`FileAccountStore`] persists it as `accounts.json` in the
//! daemon's data directory, [`MemoryAccountStore`] keeps it in memory.
//!
//! A headless process starts before its state is loaded. [`StoreReadiness`]
//! reports whether it has been, and lets the trigger gate wait for it.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use protocol::{ApiRequest, Credential, DeliveryError, Entitlement, LocalTokenGrant};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::transport::CloudClient;

/// Credential and entitlement storage, keyed by account id.
pub trait AccountStore: Send + Sync {
    fn get_account_token(&self, user_id: &str) -> Option<Credential>;

    /// Replaces the stored credential. Last write wins.
    fn set_account_token(&self, user_id: &str, credential: Credential) -> Result<()>;

    fn get_entitlement(&self, user_id: &str) -> Option<Entitlement>;

    fn set_entitlement(&self, user_id: &str, entitlement: Entitlement) -> Result<()>;
}

/// Stored state of one account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entitlement: Option<Entitlement>,
}

/// In-memory account store.
#[derive(Debug, Default)]
pub struct MemoryAccountStore {
    accounts: RwLock<HashMap<String, AccountRecord>>,
    token_writes: AtomicUsize,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an account with a credential without counting it as a write.
    pub fn with_account(self, user_id: &str, credential: Credential) -> Self {
        write_lock(&self.accounts)
            .entry(user_id.to_string())
            .or_default()
            .credential = Some(credential);
        self
    }

    /// Number of `set_account_token` calls so far.
    pub fn token_writes(&self) -> usize {
        self.token_writes.load(Ordering::SeqCst)
    }
}

impl AccountStore for MemoryAccountStore {
    fn get_account_token(&self, user_id: &str) -> Option<Credential> {
        read_lock(&self.accounts)
            .get(user_id)
            .and_then(|r| r.credential.clone())
    }

    fn set_account_token(&self, user_id: &str, credential: Credential) -> Result<()> {
        write_lock(&self.accounts)
            .entry(user_id.to_string())
            .or_default()
            .credential = Some(credential);
        self.token_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_entitlement(&self, user_id: &str) -> Option<Entitlement> {
        read_lock(&self.accounts)
            .get(user_id)
            .and_then(|r| r.entitlement)
    }

    fn set_entitlement(&self, user_id: &str, entitlement: Entitlement) -> Result<()> {
        write_lock(&self.accounts)
            .entry(user_id.to_string())
            .or_default()
            .entitlement = Some(entitlement);
        Ok(())
    }
}

/// Wrapper for serializing the account store.
#[derive(Debug, Serialize, Deserialize)]
struct AccountStoreData {
    /// Version of the store format.
    version: u32,
    accounts: HashMap<String, AccountRecord>,
}

/// JSON-backed account store.
///
/// Every write is persisted immediately with a temp-file-and-rename.
pub struct FileAccountStore {
    path: PathBuf,
    accounts: RwLock<HashMap<String, AccountRecord>>,
}

impl FileAccountStore {
    /// Creates a store persisting to `path`. Call [`load`](Self::load) to read it.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            accounts: RwLock::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the file. A missing file leaves the store empty.
    pub fn load(&self) -> Result<()> {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "account store not found, starting empty");
            return Ok(());
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read account store: {}", self.path.display()))?;
        let data: AccountStoreData = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse account store: {}", self.path.display()))?;

        let mut accounts = write_lock(&self.accounts);
        *accounts = data.accounts;
        tracing::info!(accounts = accounts.len(), path = %self.path.display(), "loaded account store");
        Ok(())
    }

    /// Writes the store to disk.
    pub fn save(&self) -> Result<()> {
        let accounts = read_lock(&self.accounts);
        self.persist(&accounts)
    }

    /// Account ids with a stored credential.
    pub fn accounts(&self) -> Vec<String> {
        let mut ids: Vec<String> = read_lock(&self.accounts)
            .iter()
            .filter(|(_, r)| r.credential.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn persist(&self, accounts: &HashMap<String, AccountRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create account store directory: {}", parent.display())
            })?;
        }

        let data = AccountStoreData {
            version: 1,
            accounts: accounts.clone(),
        };
        let contents =
            serde_json::to_string_pretty(&data).context("Failed to serialize account store")?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &contents).with_context(|| {
            format!("Failed to write temp account store: {}", temp_path.display())
        })?;
        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename temp account store {} to {}",
                temp_path.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }

    // The write lock is held through the file write so concurrent updates land in order.
    fn update(&self, user_id: &str, apply: impl FnOnce(&mut AccountRecord)) -> Result<()> {
        // Memory only changes once the new contents are on disk.
        let mut accounts = write_lock(&self.accounts);
        let mut record = accounts.get(user_id).cloned().unwrap_or_default();
        apply(&mut record);
        let previous = accounts.insert(user_id.to_string(), record);
        if let Err(e) = self.persist(&accounts) {
            match previous {
                Some(previous) => accounts.insert(user_id.to_string(), previous),
                None => accounts.remove(user_id),
            };
            return Err(e);
        }
        Ok(())
    }
}

impl AccountStore for FileAccountStore {
    fn get_account_token(&self, user_id: &str) -> Option<Credential> {
        read_lock(&self.accounts)
            .get(user_id)
            .and_then(|r| r.credential.clone())
    }

    fn set_account_token(&self, user_id: &str, credential: Credential) -> Result<()> {
        self.update(user_id, |record| record.credential = Some(credential))
    }

    fn get_entitlement(&self, user_id: &str) -> Option<Entitlement> {
        read_lock(&self.accounts)
            .get(user_id)
            .and_then(|r| r.entitlement)
    }

    fn set_entitlement(&self, user_id: &str, entitlement: Entitlement) -> Result<()> {
        self.update(user_id, |record| record.entitlement = Some(entitlement))
    }
}

/// Whether persisted state has been loaded.
pub trait StoreReadiness: Send + Sync {
    fn is_rehydrated(&self) -> bool;

    /// Watches the rehydration flag. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Readiness backed by a watch channel.
#[derive(Debug, Clone)]
pub struct ReadinessFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl ReadinessFlag {
    pub fn new(ready: bool) -> Self {
        let (tx, _rx) = watch::channel(ready);
        Self { tx: Arc::new(tx) }
    }

    /// Marks state as loaded and wakes waiters.
    pub fn mark_rehydrated(&self) {
        self.tx.send_replace(true);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl StoreReadiness for ReadinessFlag {
    fn is_rehydrated(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Obtains local-control tokens for gateways.
pub trait LocalTokenIssuer: Send + Sync {
    fn issue_local_token(&self, gateway_id: u64) -> BoxFuture<'_, protocol::Result<LocalTokenGrant>>;
}

/// Requests local tokens from the cloud on behalf of one account.
pub struct CloudTokenIssuer {
    cloud: Arc<CloudClient>,
    user_id: String,
    token_path: String,
}

impl CloudTokenIssuer {
    pub fn new(cloud: Arc<CloudClient>, user_id: impl Into<String>, token_path: impl Into<String>) -> Self {
        Self {
            cloud,
            user_id: user_id.into(),
            token_path: token_path.into(),
        }
    }
}

impl LocalTokenIssuer for CloudTokenIssuer {
    fn issue_local_token(&self, gateway_id: u64) -> BoxFuture<'_, protocol::Result<LocalTokenGrant>> {
        Box::pin(async move {
            let request = ApiRequest::get(self.token_path.as_str()).param("id", gateway_id);
            let body = self.cloud.call(&self.user_id, &request).await?;
            serde_json::from_value(body).map_err(|e| {
                DeliveryError::Deserialization(format!("local token for gateway {gateway_id}: {e}"))
            })
        })
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_store_counts_writes() {
        let store = MemoryAccountStore::new().with_account("u", Credential::new("a", "r"));
        assert_eq!(store.token_writes(), 0);
        assert_eq!(store.get_account_token("u").unwrap().access_token, "a");

        store
            .set_account_token("u", Credential::new("b", "r"))
            .unwrap();
        assert_eq!(store.token_writes(), 1);
        assert_eq!(store.get_account_token("u").unwrap().access_token, "b");
        assert!(store.get_account_token("other").is_none());
    }

    #[test]
    fn test_file_store_persists_across_restarts() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("accounts.json");

        {
            let store = FileAccountStore::new(&path);
            store
                .set_account_token("user-1", Credential::new("access", "refresh"))
                .unwrap();
            store
                .set_entitlement("user-1", Entitlement::Premium { expires_at: 99 })
                .unwrap();
        }

        let store = FileAccountStore::new(&path);
        store.load().unwrap();
        assert_eq!(
            store.get_account_token("user-1").unwrap().refresh_token,
            "refresh"
        );
        assert_eq!(
            store.get_entitlement("user-1"),
            Some(Entitlement::Premium { expires_at: 99 })
        );
        assert_eq!(store.accounts(), vec!["user-1".to_string()]);
    }

    #[test]
    fn test_file_store_atomic_write() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("accounts.json");
        let store = FileAccountStore::new(&path);
        store
            .set_account_token("u", Credential::new("a", "r"))
            .unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_failed_write_leaves_memory_unchanged() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("accounts.json");
        let store = FileAccountStore::new(&path);
        store
            .set_account_token("user-1", Credential::new("old", "refresh-1"))
            .unwrap();

        // a non-empty directory at the store path makes the rename fail
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();
        fs::write(path.join("blocker"), "x").unwrap();

        let err = store
            .set_account_token("user-1", Credential::new("new", "refresh-2"))
            .unwrap_err();
        assert!(err.to_string().contains("Failed to rename"));
        let credential = store.get_account_token("user-1").unwrap();
        assert_eq!(credential.access_token, "old");
        assert_eq!(credential.refresh_token, "refresh-1");

        assert!(store.set_account_token("user-2", Credential::new("a", "r")).is_err());
        assert!(store.get_account_token("user-2").is_none());
    }

    #[test]
    fn test_file_store_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileAccountStore::new(temp_dir.path().join("absent.json"));
        store.load().unwrap();
        assert!(store.accounts().is_empty());
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("accounts.json");
        fs::write(&path, "not json").unwrap();
        let err = FileAccountStore::new(&path).load().unwrap_err();
        assert!(err.to_string().contains("Failed to parse account store"));
    }

    #[tokio::test]
    async fn test_readiness_flag_wakes_subscribers() {
        let flag = ReadinessFlag::new(false);
        assert!(!flag.is_rehydrated());

        let mut rx = flag.subscribe();
        assert_eq!(flag.subscriber_count(), 1);
        let waiter = tokio::spawn(async move { rx.wait_for(|ready| *ready).await.is_ok() });

        flag.mark_rehydrated();
        assert!(waiter.await.unwrap());
        assert!(flag.is_rehydrated());
        assert_eq!(flag.subscriber_count(), 0);
    }
}
