//! Key lifecycle: load, unload, rewrap and batch load against a pool.
//!
//! [`KeyManager`] owns the pool handle, the material source, the tunables
//! and the audit log. Every operation is synchronous; the pool is the
//! only arbiter of key state and this layer takes no locks of its own.
//!
//! ## Retry
//!
//! A load whose material came from a person gets up to
//! [`MAX_KEY_PROMPT_RETRIES`] further attempts after a correctable failure
//! (bad format, mismatched entry, wrong key). File sources and every other
//! error class fail on the first attempt.
//!
//! Batch loads never talk to a person: a root keyed from a terminal prompt
//! is counted as failed without reading.

use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditLog, AuditRecord, FileAuditSink};
use crate::config::{KeyConfig, MAX_KEY_PROMPT_RETRIES};
use crate::error::{KeyError, StoreStatus};
use crate::keys;
use crate::material::{AcquireContext, KeySource};
use crate::policy::{EncryptionParams, Rewrap, RootPolicy};
use crate::props::{DatasetCryptoProps, KeyLocation, RequestedProps};
use crate::store::{self, KeyChange, Pool};

/// Counts from a batch load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadSummary {
    /// Encryption roots with an unavailable key that were tried.
    pub attempted: u64,
    pub failed: u64,
}

impl LoadSummary {
    pub fn loaded(&self) -> u64 {
        self.attempted - self.failed
    }
}

/// Drives key operations for the datasets of one pool.
pub struct KeyManager<P> {
    pool: P,
    source: KeySource,
    config: KeyConfig,
    audit: AuditLog,
}

impl<P: Pool> KeyManager<P> {
    pub fn new(pool: P, source: KeySource, config: KeyConfig) -> Self {
        Self {
            pool,
            source,
            config,
            audit: AuditLog::new(),
        }
    }

    /// Like [`KeyManager::new`], also forwarding audit records to the file
    /// named by `config.audit_log`.
    pub fn from_config(pool: P, source: KeySource, config: KeyConfig) -> Result<Self, KeyError> {
        let mut manager = Self::new(pool, source, config);
        if let Some(path) = &manager.config.audit_log {
            let sink = FileAuditSink::new(path).map_err(|e| {
                KeyError::Config(format!("cannot open audit log {}: {e}", path.display()))
            })?;
            manager.audit.add_forward_sink(Box::new(sink));
        }
        Ok(manager)
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut P {
        &mut self.pool
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn config(&self) -> &KeyConfig {
        &self.config
    }

    /// Mutable access to the audit log, for attaching sinks.
    pub fn audit_log_mut(&mut self) -> &mut AuditLog {
        &mut self.audit
    }

    /// Decide the encryption parameters for a new dataset.
    ///
    /// Creating the dataset with the returned parameters is up to the
    /// caller.
    pub fn create(
        &mut self,
        dataset: &str,
        request: &RequestedProps,
    ) -> Result<EncryptionParams, KeyError> {
        let parent = store::parent_name(dataset)
            .map(|p| self.pool.crypto_props(p))
            .transpose()?;
        let feature = self.pool.encryption_enabled(dataset);
        RootPolicy::new(&self.config, &mut self.source).create(
            dataset,
            parent.as_ref(),
            feature,
            request,
        )
    }

    /// Decide the encryption parameters for a clone of `origin`, usually a
    /// snapshot.
    pub fn clone_dataset(
        &mut self,
        dataset: &str,
        origin: &str,
        request: &RequestedProps,
    ) -> Result<EncryptionParams, KeyError> {
        let parent_name = store::parent_name(dataset).ok_or_else(|| {
            KeyError::Environment(format!("failed to lookup parent of '{dataset}'"))
        })?;
        let parent = self.pool.crypto_props(parent_name)?;
        let origin = self.pool.crypto_props(origin)?;
        RootPolicy::new(&self.config, &mut self.source).clone_dataset(
            dataset,
            &parent,
            &origin,
            request,
        )
    }

    pub fn is_encryption_root(&self, dataset: &str) -> Result<bool, KeyError> {
        Ok(self.pool.crypto_props(dataset)?.is_encryption_root())
    }

    /// Load (or with `noop`, only verify) the key of an encryption root.
    ///
    /// `location` overrides the dataset's keylocation for this call only.
    pub fn load_key(
        &mut self,
        dataset: &str,
        noop: bool,
        location: Option<&KeyLocation>,
    ) -> Result<(), KeyError> {
        self.load_key_impl(dataset, noop, location, true)
    }

    /// Load with `interactive` false refuses terminal prompts outright.
    fn load_key_impl(
        &mut self,
        dataset: &str,
        noop: bool,
        location: Option<&KeyLocation>,
        interactive: bool,
    ) -> Result<(), KeyError> {
        let mut attempts = 0;
        let result = self.load_with_retry(dataset, noop, location, interactive, &mut attempts);

        let record = match &result {
            Ok(()) if noop => AuditRecord::new(dataset, AuditEvent::Verified, attempts),
            Ok(()) => AuditRecord::new(dataset, AuditEvent::Loaded, attempts),
            Err(e) => AuditRecord::new(dataset, AuditEvent::LoadFailed, attempts).with_error(e),
        };
        self.audit.append(record);

        match &result {
            Ok(()) => info!(dataset, attempts, noop, "key loaded"),
            Err(e) => warn!(dataset, attempts, error = %e, "key load failed"),
        }
        result
    }

    fn load_with_retry(
        &mut self,
        dataset: &str,
        noop: bool,
        location: Option<&KeyLocation>,
        interactive: bool,
        attempts: &mut u32,
    ) -> Result<(), KeyError> {
        let props = self.key_root_props(dataset, "loaded")?;

        if props.key_available() && !noop {
            return Err(KeyError::conflict(
                StoreStatus::Eexist,
                format!("key already loaded for '{dataset}'"),
            ));
        }

        let location = location.unwrap_or(&props.keylocation).clone();
        let retry = self.source.is_interactive(&location);
        if retry && !interactive {
            return Err(KeyError::MaterialAcquisition(format!(
                "key for '{dataset}' must be entered at a terminal"
            )));
        }

        loop {
            *attempts += 1;
            match self.try_load(dataset, &props, noop, &location) {
                Ok(()) => return Ok(()),
                Err(e) if retry && e.is_correctable() && *attempts <= MAX_KEY_PROMPT_RETRIES => {
                    warn!(dataset, attempt = *attempts, error = %e, "retrying key entry");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One acquisition, derivation and submission.
    fn try_load(
        &mut self,
        dataset: &str,
        props: &DatasetCryptoProps,
        noop: bool,
        location: &KeyLocation,
    ) -> Result<(), KeyError> {
        let ctx = AcquireContext {
            dataset,
            confirm: false,
            new_key: false,
        };
        let material = self.source.acquire(location, props.keyformat, &ctx)?;
        let key = keys::derive_wrapping_key(
            props.keyformat,
            &material.bytes,
            props.pbkdf2_salt,
            props.pbkdf2_iters,
        )?;

        self.pool
            .load_key(dataset, noop, &key)
            .map_err(|status| match status {
                StoreStatus::Eacces => {
                    KeyError::Authentication(format!("incorrect key provided for '{dataset}'"))
                }
                StoreStatus::Eexist => {
                    KeyError::conflict(status, format!("key already loaded for '{dataset}'"))
                }
                StoreStatus::Ebusy => KeyError::conflict(status, format!("'{dataset}' is busy")),
                StoreStatus::Einval => KeyError::PolicyViolation(format!(
                    "invalid parameters provided for '{dataset}'"
                )),
                other => {
                    KeyError::Environment(format!("failed to load key for '{dataset}': {other}"))
                }
            })
    }

    /// Unload the key of an encryption root.
    pub fn unload_key(&mut self, dataset: &str) -> Result<(), KeyError> {
        let result = self.unload_key_impl(dataset);
        let record = match &result {
            Ok(()) => AuditRecord::new(dataset, AuditEvent::Unloaded, 0),
            Err(e) => AuditRecord::new(dataset, AuditEvent::UnloadFailed, 0).with_error(e),
        };
        self.audit.append(record);
        if result.is_ok() {
            info!(dataset, "key unloaded");
        }
        result
    }

    fn unload_key_impl(&mut self, dataset: &str) -> Result<(), KeyError> {
        let props = self.key_root_props(dataset, "unloaded")?;
        if !props.key_available() {
            return Err(KeyError::conflict(
                StoreStatus::Enoent,
                format!("key already unloaded for '{dataset}'"),
            ));
        }

        self.pool
            .unload_key(dataset)
            .map_err(|status| match status {
                StoreStatus::Enoent => {
                    KeyError::conflict(status, format!("key already unloaded for '{dataset}'"))
                }
                StoreStatus::Ebusy => KeyError::conflict(status, format!("'{dataset}' is busy")),
                other => {
                    KeyError::Environment(format!("failed to unload key for '{dataset}': {other}"))
                }
            })
    }

    /// Change the wrapping key of a dataset, or with `inherit_key`, make
    /// it use its parent's key.
    pub fn rewrap(
        &mut self,
        dataset: &str,
        request: &RequestedProps,
        inherit_key: bool,
    ) -> Result<(), KeyError> {
        let result = self.rewrap_impl(dataset, request, inherit_key);
        let record = match &result {
            Ok(()) if inherit_key => AuditRecord::new(dataset, AuditEvent::KeyInherited, 0),
            Ok(()) => AuditRecord::new(dataset, AuditEvent::Rewrapped, 1),
            Err(e) => AuditRecord::new(dataset, AuditEvent::RewrapFailed, 0).with_error(e),
        };
        self.audit.append(record);
        if result.is_ok() {
            info!(dataset, inherit_key, "wrapping key changed");
        }
        result
    }

    fn rewrap_impl(
        &mut self,
        dataset: &str,
        request: &RequestedProps,
        inherit_key: bool,
    ) -> Result<(), KeyError> {
        self.require_feature(dataset)?;
        let current = self.pool.crypto_props(dataset)?;
        let parent = store::parent_name(dataset)
            .map(|p| self.pool.crypto_props(p))
            .transpose()?;

        let outcome = RootPolicy::new(&self.config, &mut self.source).rewrap(
            dataset,
            &current,
            parent.as_ref(),
            request,
            inherit_key,
        )?;

        let submitted = match &outcome {
            Rewrap::InheritFromParent => {
                self.pool.change_key(dataset, KeyChange::InheritFromParent)
            }
            Rewrap::NewKey(new) => {
                let Some(key) = &new.wrapping_key else {
                    return Err(KeyError::Environment("rewrap produced no wrapping key".into()));
                };
                let change = KeyChange::NewKey {
                    params: &new.params,
                    key,
                };
                self.pool.change_key(dataset, change)
            }
        };

        submitted.map_err(|status| match status {
            StoreStatus::Einval => KeyError::PolicyViolation(format!(
                "invalid properties for key change on '{dataset}'"
            )),
            StoreStatus::Eacces => {
                KeyError::Environment(format!("key is not currently loaded for '{dataset}'"))
            }
            StoreStatus::Eexist | StoreStatus::Ebusy | StoreStatus::Enoent => {
                KeyError::conflict(status, format!("cannot change key of '{dataset}'"))
            }
            other => KeyError::Environment(format!("failed to change key of '{dataset}': {other}")),
        })
    }

    /// Try to load every unavailable encryption root key at or below
    /// `root`. Individual failures are counted and the walk continues.
    ///
    /// Nothing is prompted for: roots whose key would be typed at a
    /// terminal count as failed.
    ///
    /// Returns [`KeyError::PartialLoad`] when any load failed.
    pub fn attempt_load_all(&mut self, root: &str) -> Result<LoadSummary, KeyError> {
        let mut summary = LoadSummary::default();
        let mut pending = vec![root.to_string()];

        while let Some(dataset) = pending.pop() {
            let props = self.pool.crypto_props(&dataset)?;
            if props.is_encryption_root() && !props.key_available() {
                summary.attempted += 1;
                if self.load_key_impl(&dataset, false, None, false).is_err() {
                    summary.failed += 1;
                }
            } else {
                debug!(dataset, "skipping");
            }

            let mut children = self.pool.children(&dataset)?;
            children.reverse();
            pending.extend(children);
        }

        info!(
            "{} / {} keys successfully loaded",
            summary.loaded(),
            summary.attempted
        );

        if summary.failed > 0 {
            return Err(KeyError::PartialLoad {
                attempted: summary.attempted,
                failed: summary.failed,
            });
        }
        Ok(summary)
    }

    fn require_feature(&self, dataset: &str) -> Result<(), KeyError> {
        if !self.pool.encryption_enabled(dataset) {
            return Err(KeyError::Environment("encryption feature not enabled".into()));
        }
        Ok(())
    }

    /// Properties of `dataset`, which must be an encryption root.
    fn key_root_props(&self, dataset: &str, verb: &str) -> Result<DatasetCryptoProps, KeyError> {
        self.require_feature(dataset)?;
        let props = self.pool.crypto_props(dataset)?;
        if !props.is_encrypted() {
            return Err(KeyError::PolicyViolation(format!("encryption not enabled on '{dataset}'")));
        }
        if let Some(root) = props.inherited_root() {
            return Err(KeyError::PolicyViolation(format!(
                "keys must be {verb} for encryption root of '{dataset}' ({root})"
            )));
        }
        Ok(props)
    }
}
