//! # keyroot
//!
//! Per-dataset encryption key management for a hierarchical filesystem.
//!
//! Every dataset in a tree may be encrypted. Encryption and the active
//! wrapping key are inherited down the tree until a dataset becomes an
//! *encryption root* owning its own key. This crate acquires key material
//! from a person or a file, derives the 32-byte wrapping key (PBKDF2-HMAC-
//! SHA1 for passphrases), enforces the encryption root rules for create,
//! clone and rewrap, and drives load/unload against an external key store.
//!
//! ## Public API
//!
//! - [`KeyManager`]: create, clone, load, unload, rewrap and batch load.
//! - [`RootPolicy`]: the hierarchy rules on their own.
//! - [`KeySource`] and the [`KeyInput`] implementations: where material
//!   comes from.
//! - [`derive_wrapping_key`] and [`pbkdf2_hmac_sha1`].
//! - The collaborator traits in [`store`], implemented in memory by
//!   [`MemoryPool`].
//!
//! Key material lives in buffers that are zeroed when dropped and is never
//! logged or audited.

pub mod audit;
pub mod config;
pub(crate) mod crypto;
pub mod error;
pub mod keys;
pub mod lifecycle;
pub mod material;
pub mod memory;
pub mod policy;
pub mod props;
pub mod store;
pub mod tty;

pub use config::KeyConfig;
pub use crypto::{generate_raw_key, WRAPPING_KEY_LEN};
pub use error::{ErrorKind, KeyError, StoreStatus};
pub use keys::{derive_wrapping_key, pbkdf2_hmac_sha1, WrappingKey};
pub use lifecycle::{KeyManager, LoadSummary};
pub use material::{FileInput, KeyInput, KeySource, ScriptedInput, StdinInput};
pub use memory::MemoryPool;
pub use policy::{EncryptionParams, Rewrap, RootPolicy};
pub use props::{
    CryptoParams, DatasetCryptoProps, EncryptionSuite, KeyFormat, KeyLocation, KeyStatus,
    PropSource, RequestedProps,
};
