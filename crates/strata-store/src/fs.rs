//! Filesystem JSON backend - the reference store
//!
//! One JSON file per resource at `<state-root>/<scope-chain>/<id>.json`.
//! Ids may contain `/` (nested logical names); those become `:` in file
//! names and are mapped back on read. Ids containing a literal `:` would
//! collide with that escape and are rejected.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use strata_core::{
    ResourceId, ScopeChain, StateRecord, StateStore, StoreFactory, StrataError, StrataResult,
};
use strata_crypto::SecretCipher;

use crate::serial;

/// Escape a resource id into a file name. A literal `:` in the id would
/// be indistinguishable from an escaped `/` on read, so it is rejected.
fn escape_id(id: &ResourceId) -> StrataResult<String> {
    if id.as_str().contains(':') {
        return Err(StrataError::Store(format!(
            "resource id '{id}' contains ':', which the filesystem backend reserves for '/'"
        )));
    }
    Ok(id.as_str().replace('/', ":"))
}

/// Invert [`escape_id`].
fn unescape_id(name: &str) -> ResourceId {
    ResourceId::new(name.replace(':', "/"))
}

/// Store partition backed by a directory of JSON files.
pub struct FsStore {
    dir: PathBuf,
    cipher: Option<Arc<SecretCipher>>,
}

impl FsStore {
    pub fn new(dir: impl Into<PathBuf>, cipher: Option<Arc<SecretCipher>>) -> Self {
        FsStore {
            dir: dir.into(),
            cipher,
        }
    }

    fn path_for(&self, id: &ResourceId) -> StrataResult<PathBuf> {
        Ok(self.dir.join(format!("{}.json", escape_id(id)?)))
    }

    fn cipher(&self) -> Option<&SecretCipher> {
        self.cipher.as_deref()
    }
}

#[async_trait]
impl StateStore for FsStore {
    async fn init(&self) -> StrataResult<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(StrataError::store)
    }

    async fn list(&self) -> StrataResult<Vec<ResourceId>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            // A partition that was never written to is simply empty.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StrataError::store(e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(StrataError::store)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(unescape_id(stem));
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn get(&self, id: &ResourceId) -> StrataResult<Option<StateRecord>> {
        let bytes = match tokio::fs::read(self.path_for(id)?).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StrataError::store(e)),
        };
        let json: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| StrataError::Serialize(e.to_string()))?;
        serial::record_from_json(&json, self.cipher()).map(Some)
    }

    async fn set(&self, id: &ResourceId, record: &StateRecord) -> StrataResult<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(StrataError::store)?;
        let json = serial::record_to_json(record, self.cipher())?;
        let bytes =
            serde_json::to_vec_pretty(&json).map_err(|e| StrataError::Serialize(e.to_string()))?;
        tokio::fs::write(self.path_for(id)?, bytes)
            .await
            .map_err(StrataError::store)
    }

    async fn delete(&self, id: &ResourceId) -> StrataResult<()> {
        match tokio::fs::remove_file(self.path_for(id)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StrataError::store(e)),
        }
    }
}

/// Factory opening one [`FsStore`] directory per scope chain.
pub struct FsStoreFactory {
    state_root: PathBuf,
    cipher: Option<Arc<SecretCipher>>,
}

impl FsStoreFactory {
    pub fn new(state_root: impl Into<PathBuf>, password: Option<&str>) -> Self {
        FsStoreFactory {
            state_root: state_root.into(),
            cipher: password.map(|pw| Arc::new(SecretCipher::from_passphrase(pw))),
        }
    }

    fn dir_for(&self, chain: &ScopeChain) -> PathBuf {
        chain
            .segments()
            .iter()
            .fold(self.state_root.clone(), |dir, segment| dir.join(segment))
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }
}

#[async_trait]
impl StoreFactory for FsStoreFactory {
    async fn open(&self, chain: &ScopeChain) -> StrataResult<Arc<dyn StateStore>> {
        let store = FsStore::new(self.dir_for(chain), self.cipher.clone());
        store.init().await?;
        Ok(Arc::new(store))
    }
}
