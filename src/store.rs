//! Collaborators this crate consumes but does not implement.
//!
//! The key store holds unwrapped keys (in a real system, the kernel); the
//! property store, feature registry and tree traversal describe the
//! dataset hierarchy. [`crate::memory::MemoryPool`] implements all four
//! in memory.

use crate::error::{KeyError, StoreStatus};
use crate::keys::WrappingKey;
use crate::props::{CryptoParams, DatasetCryptoProps};

/// A key transition submitted by rewrap.
pub enum KeyChange<'a> {
    /// Re-wrap under a new key and persist the new key parameters.
    NewKey {
        params: &'a CryptoParams,
        key: &'a WrappingKey,
    },
    /// Drop the local key parameters and use the parent's key.
    InheritFromParent,
}

/// Holder of loaded wrapping keys.
///
/// Must guarantee at most one key state per dataset and that each call is
/// atomic.
pub trait KeyStore {
    /// Load (or with `noop`, only verify) a wrapping key.
    fn load_key(&mut self, dataset: &str, noop: bool, key: &WrappingKey) -> Result<(), StoreStatus>;

    fn unload_key(&mut self, dataset: &str) -> Result<(), StoreStatus>;

    fn change_key(&mut self, dataset: &str, change: KeyChange<'_>) -> Result<(), StoreStatus>;
}

/// Read access to encryption properties.
pub trait PropertyStore {
    fn crypto_props(&self, dataset: &str) -> Result<DatasetCryptoProps, KeyError>;
}

/// Pool feature flags.
pub trait FeatureRegistry {
    /// Is the encryption feature enabled for the pool containing `dataset`?
    fn encryption_enabled(&self, dataset: &str) -> bool;
}

/// Dataset hierarchy enumeration.
pub trait DatasetTree {
    /// Immediate child filesystems and volumes of `dataset`.
    fn children(&self, dataset: &str) -> Result<Vec<String>, KeyError>;
}

/// Everything [`crate::lifecycle::KeyManager`] needs from its environment.
pub trait Pool: KeyStore + PropertyStore + FeatureRegistry + DatasetTree {}

impl<T: KeyStore + PropertyStore + FeatureRegistry + DatasetTree> Pool for T {}

/// Name of the parent dataset, or `None` for a pool's root dataset.
pub fn parent_name(dataset: &str) -> Option<&str> {
    let dataset = dataset_of(dataset);
    dataset.rfind('/').map(|idx| &dataset[..idx])
}

/// The filesystem a snapshot (`fs@snap`) belongs to; datasets map to
/// themselves.
pub fn dataset_of(name: &str) -> &str {
    name.split_once('@').map_or(name, |(dataset, _)| dataset)
}
