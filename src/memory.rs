//! In-memory dataset tree and key store.
//!
//! Stands in for the kernel key store and the on-disk property store so the
//! lifecycle can be driven end to end without a real pool. Keylocation,
//! keyformat and PBKDF2 parameters live on encryption roots only; every
//! other encrypted dataset resolves them by walking up to its root, which
//! is exactly how inheritance is reported to callers.

use std::collections::BTreeMap;

use crate::error::{KeyError, StoreStatus};
use crate::keys::WrappingKey;
use crate::policy::EncryptionParams;
use crate::props::{
    CryptoParams, DatasetCryptoProps, EncryptionSuite, KeyFormat, KeyLocation, KeyStatus,
    PropSource,
};
use crate::store::{self, DatasetTree, FeatureRegistry, KeyChange, KeyStore, PropertyStore};

/// Key parameters and wrapping key owned by an encryption root.
struct RootKey {
    format: KeyFormat,
    location: KeyLocation,
    salt: u64,
    iters: u64,
    key: WrappingKey,
    loaded: bool,
}

#[derive(Default)]
struct DatasetEntry {
    encryption: EncryptionSuite,
    root: Option<RootKey>,
    busy: bool,
}

/// A pool held entirely in memory.
pub struct MemoryPool {
    datasets: BTreeMap<String, DatasetEntry>,
    encryption_feature: bool,
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPool {
    /// An empty pool with the encryption feature enabled.
    pub fn new() -> Self {
        Self {
            datasets: BTreeMap::new(),
            encryption_feature: true,
        }
    }

    pub fn set_encryption_feature(&mut self, enabled: bool) {
        self.encryption_feature = enabled;
    }

    pub fn contains(&self, dataset: &str) -> bool {
        self.datasets.contains_key(dataset)
    }

    /// Mark a dataset as in use (mounted, open volume). Busy datasets block
    /// unloading the key they use.
    pub fn set_busy(&mut self, dataset: &str, busy: bool) -> Result<(), StoreStatus> {
        let entry = self.datasets.get_mut(dataset).ok_or(StoreStatus::Enoent)?;
        entry.busy = busy;
        Ok(())
    }

    /// Create a dataset with the outcome of a create or clone. A new
    /// encryption root starts with its key loaded.
    pub fn add_dataset(
        &mut self,
        dataset: &str,
        params: &EncryptionParams,
    ) -> Result<(), StoreStatus> {
        if self.datasets.contains_key(dataset) || dataset.contains('@') {
            return Err(StoreStatus::Eexist);
        }

        let parent_encrypted = match store::parent_name(dataset) {
            Some(parent) => {
                let entry = self.datasets.get(parent).ok_or(StoreStatus::Enoent)?;
                entry.encryption.is_on()
            }
            None => false,
        };

        let root = match &params.wrapping_key {
            Some(key) => Some(root_key(&params.params, key)?),
            None if params.encryption.is_on() && !parent_encrypted => {
                return Err(StoreStatus::Einval);
            }
            None => None,
        };

        if parent_encrypted && !params.encryption.is_on() {
            return Err(StoreStatus::Einval);
        }

        self.datasets.insert(
            dataset.to_string(),
            DatasetEntry {
                encryption: params.encryption,
                root,
                busy: false,
            },
        );
        Ok(())
    }

    /// Nearest dataset at or above `dataset` that owns a key.
    fn find_root(&self, dataset: &str) -> Option<(&str, &RootKey)> {
        let mut current = Some(dataset);
        while let Some(name) = current {
            let (name, entry) = self.datasets.get_key_value(name)?;
            if let Some(root) = &entry.root {
                return Some((name.as_str(), root));
            }
            current = store::parent_name(name);
        }
        None
    }

    /// True if `dataset` or anything using the same key is busy.
    fn key_in_use(&self, root: &str) -> bool {
        let prefix = format!("{root}/");
        self.datasets
            .iter()
            .filter(|(name, _)| name.as_str() == root || name.starts_with(&prefix))
            .filter(|(name, _)| {
                self.find_root(name.as_str())
                    .is_some_and(|(owner, _)| owner == root)
            })
            .any(|(_, entry)| entry.busy)
    }

    fn encrypted_entry(&mut self, dataset: &str) -> Result<&mut DatasetEntry, StoreStatus> {
        let entry = self.datasets.get_mut(dataset).ok_or(StoreStatus::Enoent)?;
        if !entry.encryption.is_on() {
            return Err(StoreStatus::Einval);
        }
        Ok(entry)
    }
}

fn root_key(props: &CryptoParams, key: &WrappingKey) -> Result<RootKey, StoreStatus> {
    let (Some(format), Some(location)) = (props.keyformat, props.keylocation.clone()) else {
        return Err(StoreStatus::Einval);
    };
    Ok(RootKey {
        format,
        location,
        salt: props.pbkdf2_salt.unwrap_or_default(),
        iters: props.pbkdf2_iters.unwrap_or_default(),
        key: WrappingKey::from_bytes(*key.as_bytes()),
        loaded: true,
    })
}

impl KeyStore for MemoryPool {
    fn load_key(
        &mut self,
        dataset: &str,
        noop: bool,
        key: &WrappingKey,
    ) -> Result<(), StoreStatus> {
        let entry = self.encrypted_entry(dataset)?;
        let root = entry.root.as_mut().ok_or(StoreStatus::Einval)?;

        if root.loaded && !noop {
            return Err(StoreStatus::Eexist);
        }
        if root.key.as_bytes() != key.as_bytes() {
            return Err(StoreStatus::Eacces);
        }

        if !noop {
            root.loaded = true;
        }
        Ok(())
    }

    fn unload_key(&mut self, dataset: &str) -> Result<(), StoreStatus> {
        let entry = self.encrypted_entry(dataset)?;
        match &entry.root {
            None => return Err(StoreStatus::Einval),
            Some(root) if !root.loaded => return Err(StoreStatus::Enoent),
            Some(_) => {}
        }

        if self.key_in_use(dataset) {
            return Err(StoreStatus::Ebusy);
        }

        if let Some(root) = self.datasets.get_mut(dataset).and_then(|e| e.root.as_mut()) {
            root.loaded = false;
        }
        Ok(())
    }

    fn change_key(&mut self, dataset: &str, change: KeyChange<'_>) -> Result<(), StoreStatus> {
        self.encrypted_entry(dataset)?;
        let (_, current) = self.find_root(dataset).ok_or(StoreStatus::Einval)?;
        if !current.loaded {
            return Err(StoreStatus::Eacces);
        }

        match change {
            KeyChange::NewKey { params, key } => {
                let root = root_key(params, key)?;
                self.encrypted_entry(dataset)?.root = Some(root);
            }
            KeyChange::InheritFromParent => {
                let parent = store::parent_name(dataset).ok_or(StoreStatus::Einval)?;
                if self.datasets.get(dataset).is_some_and(|e| e.root.is_none()) {
                    return Err(StoreStatus::Einval);
                }
                match self.find_root(parent) {
                    None => return Err(StoreStatus::Einval),
                    Some((_, root)) if !root.loaded => return Err(StoreStatus::Eacces),
                    Some(_) => {}
                }
                self.encrypted_entry(dataset)?.root = None;
            }
        }
        Ok(())
    }
}

impl PropertyStore for MemoryPool {
    fn crypto_props(&self, dataset: &str) -> Result<DatasetCryptoProps, KeyError> {
        let name = store::dataset_of(dataset);
        let Some(entry) = self.datasets.get(name) else {
            return Err(KeyError::conflict(
                StoreStatus::Enoent,
                format!("dataset '{name}' does not exist"),
            ));
        };
        if !entry.encryption.is_on() {
            return Ok(DatasetCryptoProps::unencrypted());
        }

        let (root_name, root) = self.find_root(name).ok_or_else(|| {
            KeyError::Environment(format!("encryption root for '{name}' not found"))
        })?;

        Ok(DatasetCryptoProps {
            encryption: entry.encryption,
            keyformat: root.format,
            keylocation: root.location.clone(),
            keylocation_source: if root_name == name {
                PropSource::Local
            } else {
                PropSource::Inherited(root_name.to_string())
            },
            pbkdf2_salt: root.salt,
            pbkdf2_iters: root.iters,
            key_status: if root.loaded {
                KeyStatus::Available
            } else {
                KeyStatus::Unavailable
            },
        })
    }
}

impl FeatureRegistry for MemoryPool {
    fn encryption_enabled(&self, _dataset: &str) -> bool {
        self.encryption_feature
    }
}

impl DatasetTree for MemoryPool {
    fn children(&self, dataset: &str) -> Result<Vec<String>, KeyError> {
        if !self.datasets.contains_key(dataset) {
            return Err(KeyError::conflict(
                StoreStatus::Enoent,
                format!("dataset '{dataset}' does not exist"),
            ));
        }
        let prefix = format!("{dataset}/");
        Ok(self
            .datasets
            .keys()
            .filter_map(|name| name.strip_prefix(&prefix).map(|rest| (name, rest)))
            .filter(|(_, rest)| !rest.contains('/'))
            .map(|(name, _)| name.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> WrappingKey {
        WrappingKey::from_bytes([byte; 32])
    }

    fn root_params(byte: u8) -> EncryptionParams {
        EncryptionParams {
            encryption: EncryptionSuite::Aes256Gcm,
            params: CryptoParams {
                keyformat: Some(KeyFormat::Raw),
                keylocation: Some(KeyLocation::File("/keys/k".into())),
                pbkdf2_salt: None,
                pbkdf2_iters: None,
            },
            wrapping_key: Some(key(byte)),
        }
    }

    fn inherit() -> EncryptionParams {
        EncryptionParams {
            encryption: EncryptionSuite::Aes256Gcm,
            params: CryptoParams::default(),
            wrapping_key: None,
        }
    }

    fn plain() -> EncryptionParams {
        EncryptionParams {
            encryption: EncryptionSuite::Off,
            params: CryptoParams::default(),
            wrapping_key: None,
        }
    }

    fn load(pool: &mut MemoryPool, dataset: &str, byte: u8) -> Result<(), StoreStatus> {
        pool.load_key(dataset, false, &key(byte))
    }

    fn pool() -> MemoryPool {
        let mut pool = MemoryPool::new();
        pool.add_dataset("tank", &plain()).unwrap();
        pool.add_dataset("tank/secure", &root_params(1)).unwrap();
        pool.add_dataset("tank/secure/child", &inherit()).unwrap();
        pool
    }

    #[test]
    fn inherited_props_name_the_root() {
        let pool = pool();
        let child = pool.crypto_props("tank/secure/child").unwrap();
        assert_eq!(child.inherited_root(), Some("tank/secure"));
        assert_eq!(child.keyformat, KeyFormat::Raw);
        assert!(!child.is_encryption_root());
        assert!(pool.crypto_props("tank/secure").unwrap().is_encryption_root());
        assert!(!pool.crypto_props("tank").unwrap().is_encrypted());
        assert!(pool.crypto_props("tank/secure@snap").unwrap().is_encryption_root());
    }

    #[test]
    fn hierarchy_enforced_on_insert() {
        let mut pool = pool();
        let mut add = |name: &str, params: EncryptionParams| pool.add_dataset(name, &params);
        assert_eq!(add("tank/secure/plain", plain()), Err(StoreStatus::Einval));
        assert_eq!(add("tank/orphan", inherit()), Err(StoreStatus::Einval));
        assert_eq!(add("tank/missing/x", plain()), Err(StoreStatus::Enoent));
        assert_eq!(add("tank/secure", plain()), Err(StoreStatus::Eexist));
    }

    #[test]
    fn load_and_unload_status_codes() {
        let mut pool = pool();
        assert_eq!(load(&mut pool, "tank/secure", 1), Err(StoreStatus::Eexist));
        assert_eq!(pool.load_key("tank/secure", true, &key(1)), Ok(()));
        assert_eq!(
            load(&mut pool, "tank/secure/child", 1),
            Err(StoreStatus::Einval)
        );

        pool.unload_key("tank/secure").unwrap();
        assert_eq!(pool.unload_key("tank/secure"), Err(StoreStatus::Enoent));
        assert_eq!(load(&mut pool, "tank/secure", 2), Err(StoreStatus::Eacces));
        assert_eq!(load(&mut pool, "tank/secure", 1), Ok(()));
        assert_eq!(load(&mut pool, "tank", 1), Err(StoreStatus::Einval));
        assert_eq!(load(&mut pool, "nope", 1), Err(StoreStatus::Enoent));
    }

    #[test]
    fn busy_descendant_blocks_unload() {
        let mut pool = pool();
        pool.set_busy("tank/secure/child", true).unwrap();
        assert_eq!(pool.unload_key("tank/secure"), Err(StoreStatus::Ebusy));
        pool.set_busy("tank/secure/child", false).unwrap();
        assert_eq!(pool.unload_key("tank/secure"), Ok(()));
    }

    #[test]
    fn change_key_moves_root() {
        let mut pool = pool();
        let params = root_params(9);
        pool.change_key(
            "tank/secure/child",
            KeyChange::NewKey {
                params: &params.params,
                key: &key(9),
            },
        )
        .unwrap();
        assert!(pool.crypto_props("tank/secure/child").unwrap().is_encryption_root());

        pool.change_key("tank/secure/child", KeyChange::InheritFromParent)
            .unwrap();
        let child = pool.crypto_props("tank/secure/child").unwrap();
        assert_eq!(child.inherited_root(), Some("tank/secure"));

        assert_eq!(
            pool.change_key("tank/secure", KeyChange::InheritFromParent),
            Err(StoreStatus::Einval)
        );
    }

    #[test]
    fn change_key_requires_loaded_key() {
        let mut pool = pool();
        pool.unload_key("tank/secure").unwrap();
        let params = root_params(3);
        assert_eq!(
            pool.change_key(
                "tank/secure",
                KeyChange::NewKey {
                    params: &params.params,
                    key: &key(3)
                }
            ),
            Err(StoreStatus::Eacces)
        );
    }

    #[test]
    fn children_are_immediate_only() {
        let mut pool = pool();
        pool.add_dataset("tank/other", &plain()).unwrap();
        let children = |name: &str| pool.children(name).unwrap();
        assert_eq!(children("tank"), ["tank/other", "tank/secure"]);
        assert_eq!(children("tank/secure"), ["tank/secure/child"]);
        assert!(children("tank/secure/child").is_empty());
        assert!(pool.children("gone").is_err());
    }
}
