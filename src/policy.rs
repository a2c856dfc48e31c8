//! Encryption root policy.
//!
//! Decides whether a create, clone or rewrap is legal given the dataset's
//! position in the tree, and produces the key parameters (and, for a new
//! encryption root, the wrapping key) to submit.
//!
//! ## Rules
//!
//! - Encryption is monotonic down the tree: no unencrypted dataset below an
//!   encrypted one.
//! - Setting `keylocation` locally makes a dataset an encryption root; a
//!   root always needs a `keyformat`. A `keyformat` alone implies
//!   `keylocation=prompt`.
//! - `pbkdf2iters` (and the generated salt) only exist for passphrase
//!   roots.

use tracing::debug;

use crate::config::KeyConfig;
use crate::crypto;
use crate::error::KeyError;
use crate::keys::{self, WrappingKey};
use crate::material::{AcquireContext, KeySource};
use crate::props::{
    CryptoParams, DatasetCryptoProps, EncryptionSuite, KeyFormat, KeyLocation, RequestedProps,
};

/// Outcome of a legal create or clone, or of a key rewrap.
#[derive(Debug)]
pub struct EncryptionParams {
    /// Effective encryption suite of the dataset.
    pub encryption: EncryptionSuite,
    /// Key parameters to set locally. Empty unless `wrapping_key` is set.
    pub params: CryptoParams,
    /// Present iff the dataset becomes (or stays) an encryption root with
    /// a freshly derived key.
    pub wrapping_key: Option<WrappingKey>,
}

impl EncryptionParams {
    fn without_key(encryption: EncryptionSuite) -> Self {
        Self {
            encryption,
            params: CryptoParams::default(),
            wrapping_key: None,
        }
    }

    pub fn is_new_root(&self) -> bool {
        self.wrapping_key.is_some()
    }
}

/// Outcome of a legal rewrap.
#[derive(Debug)]
pub enum Rewrap {
    /// New key parameters and wrapping key for this dataset.
    NewKey(EncryptionParams),
    /// Give up the local key and inherit the parent's.
    InheritFromParent,
}

/// Hierarchy rules plus the means to produce a new key when they call for
/// one.
pub struct RootPolicy<'a> {
    config: &'a KeyConfig,
    source: &'a mut KeySource,
}

impl<'a> RootPolicy<'a> {
    pub fn new(config: &'a KeyConfig, source: &'a mut KeySource) -> Self {
        Self { config, source }
    }

    /// Validate encryption properties for a new dataset.
    ///
    /// `parent` is `None` when creating a pool's root dataset.
    pub fn create(
        &mut self,
        dataset: &str,
        parent: Option<&DatasetCryptoProps>,
        feature_enabled: bool,
        request: &RequestedProps,
    ) -> Result<EncryptionParams, KeyError> {
        if !feature_enabled {
            if request.has_encryption_props() {
                return Err(KeyError::Environment("encryption feature not enabled".into()));
            }
            return Ok(EncryptionParams::without_key(EncryptionSuite::Off));
        }

        let parent_suite = parent.map_or(EncryptionSuite::Off, |p| p.encryption);

        if request.encryption == Some(EncryptionSuite::Off) && parent_suite.is_on() {
            return Err(KeyError::PolicyViolation(
                "invalid encryption value: dataset must be encrypted".into(),
            ));
        }

        let suite = request.encryption.unwrap_or(parent_suite);
        if !suite.is_on() {
            if request.has_encryption_props() {
                return Err(KeyError::PolicyViolation(
                    "encryption must be turned on to set encryption properties".into(),
                ));
            }
            return Ok(EncryptionParams::without_key(EncryptionSuite::Off));
        }

        let format = request.effective_keyformat();
        if !parent_suite.is_on() && request.keylocation.is_none() && format == KeyFormat::None {
            return Err(KeyError::PolicyViolation(
                "keyformat required for new encryption root".into(),
            ));
        }

        match resolve_keylocation(request, format)? {
            Some(location) => {
                self.establish_root(dataset, suite, format, &location, request, false)
            }
            None => {
                debug!(dataset, "inheriting parent's wrapping key");
                Ok(EncryptionParams::without_key(suite))
            }
        }
    }

    /// Validate encryption properties for a clone of `origin` under
    /// `parent`.
    pub fn clone_dataset(
        &mut self,
        dataset: &str,
        parent: &DatasetCryptoProps,
        origin: &DatasetCryptoProps,
        request: &RequestedProps,
    ) -> Result<EncryptionParams, KeyError> {
        if request.encryption.is_some() {
            return Err(KeyError::PolicyViolation(
                "encryption may not be specified during cloning".into(),
            ));
        }

        if parent.is_encrypted() && !origin.is_encrypted() {
            return Err(KeyError::PolicyViolation(
                "cannot create unencrypted clone as child of encrypted parent".into(),
            ));
        }

        if !origin.is_encrypted() {
            if request.has_encryption_props() {
                return Err(KeyError::PolicyViolation(
                    "encryption properties may not be set for an unencrypted clone".into(),
                ));
            }
            return Ok(EncryptionParams::without_key(EncryptionSuite::Off));
        }

        if !origin.key_available() {
            return Err(KeyError::Environment("origin wrapping key must be loaded".into()));
        }

        let format = request.effective_keyformat();
        let location = resolve_keylocation(request, format)?;

        if !parent.is_encrypted() && format == KeyFormat::None {
            return Err(KeyError::PolicyViolation("keyformat required".into()));
        }

        let suite = origin.encryption;
        match location {
            Some(location) => {
                self.establish_root(dataset, suite, format, &location, request, false)
            }
            None => Ok(EncryptionParams::without_key(suite)),
        }
    }

    /// Validate a key change on an existing dataset.
    ///
    /// With `inherit_key`, the dataset stops being an encryption root and
    /// uses `parent`'s key; otherwise a new key is acquired, defaulting
    /// keyformat and keylocation to their current values.
    pub fn rewrap(
        &mut self,
        dataset: &str,
        current: &DatasetCryptoProps,
        parent: Option<&DatasetCryptoProps>,
        request: &RequestedProps,
        inherit_key: bool,
    ) -> Result<Rewrap, KeyError> {
        if !current.is_encrypted() {
            return Err(KeyError::PolicyViolation("dataset not encrypted".into()));
        }

        if inherit_key {
            if !current.is_encryption_root() {
                return Err(KeyError::PolicyViolation(
                    "key inheriting can only be performed on encryption roots".into(),
                ));
            }
            let parent = parent.ok_or_else(|| {
                KeyError::PolicyViolation("root dataset cannot inherit key".into())
            })?;
            if !parent.is_encrypted() {
                return Err(KeyError::PolicyViolation("parent must be encrypted".into()));
            }
            if !parent.key_available() {
                return Err(KeyError::Environment("parent key must be loaded".into()));
            }
            if !current.key_available() {
                return Err(KeyError::Environment("key must be loaded".into()));
            }
            return Ok(Rewrap::InheritFromParent);
        }

        if request.encryption.is_some() || !request.other.is_empty() {
            return Err(KeyError::PolicyViolation(
                "only keyformat, keylocation and pbkdf2iters may be set with this command".into(),
            ));
        }

        if !current.key_available() {
            return Err(KeyError::Environment("key must be loaded".into()));
        }

        let format = match request.effective_keyformat() {
            KeyFormat::None => current.keyformat,
            requested => requested,
        };
        let location = request
            .keylocation
            .clone()
            .unwrap_or_else(|| current.keylocation.clone());

        let suite = current.encryption;
        let params = self.establish_root(dataset, suite, format, &location, request, true)?;
        Ok(Rewrap::NewKey(params))
    }

    /// Acquire and derive the key for a new encryption root.
    fn establish_root(
        &mut self,
        dataset: &str,
        encryption: EncryptionSuite,
        format: KeyFormat,
        location: &KeyLocation,
        request: &RequestedProps,
        new_key: bool,
    ) -> Result<EncryptionParams, KeyError> {
        let (salt, iterations) = if format == KeyFormat::Passphrase {
            let iterations = match request.pbkdf2_iters {
                Some(iters) if iters < self.config.min_pbkdf2_iterations => {
                    return Err(KeyError::PolicyViolation(format!(
                        "pbkdf2iters must be at least {}",
                        self.config.min_pbkdf2_iterations
                    )));
                }
                Some(iters) => iters,
                None => self.config.default_pbkdf2_iterations,
            };
            (Some(crypto::generate_salt()?), Some(iterations))
        } else {
            if request.pbkdf2_iters.is_some() {
                return Err(KeyError::PolicyViolation(
                    "cannot specify pbkdf2iters with a non-passphrase keyformat".into(),
                ));
            }
            (None, None)
        };

        debug!(dataset, %format, %location, "establishing encryption root");

        let ctx = AcquireContext {
            dataset,
            confirm: true,
            new_key,
        };
        let material = self.source.acquire(location, format, &ctx)?;
        let key = keys::derive_wrapping_key(
            format,
            &material.bytes,
            salt.unwrap_or_default(),
            iterations.unwrap_or_default(),
        )?;

        Ok(EncryptionParams {
            encryption,
            params: CryptoParams {
                keyformat: Some(format),
                keylocation: Some(location.clone()),
                pbkdf2_salt: salt,
                pbkdf2_iters: iterations,
            },
            wrapping_key: Some(key),
        })
    }
}

/// Keylocation a new root will use, or `None` if the dataset inherits.
fn resolve_keylocation(
    request: &RequestedProps,
    format: KeyFormat,
) -> Result<Option<KeyLocation>, KeyError> {
    match (&request.keylocation, format) {
        (Some(_), KeyFormat::None) => Err(KeyError::PolicyViolation(
            "keyformat required for new encryption root".into(),
        )),
        (Some(location), _) => Ok(Some(location.clone())),
        (None, KeyFormat::None) => Ok(None),
        (None, _) => Ok(Some(KeyLocation::Prompt)),
    }
}
