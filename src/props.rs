//! Encryption-related dataset properties.
//!
//! Property values are parsed from and rendered to the same tokens the
//! property store uses (`passphrase`, `prompt`, `file:///path`, ...).

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KeyError;

/// Property names handled by this crate.
pub mod prop_name {
    pub const ENCRYPTION: &str = "encryption";
    pub const KEYFORMAT: &str = "keyformat";
    pub const KEYLOCATION: &str = "keylocation";
    pub const PBKDF2_ITERS: &str = "pbkdf2iters";
    pub const PBKDF2_SALT: &str = "pbkdf2salt";
}

/// Encoding of user-supplied key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFormat {
    /// Dataset is not an encryption root / not encrypted.
    #[default]
    None,
    /// 32 raw bytes.
    Raw,
    /// 64 hexadecimal characters.
    Hex,
    /// 8 to 64 bytes, stretched with PBKDF2.
    Passphrase,
}

impl KeyFormat {
    /// Noun used when prompting for material of this format.
    pub fn prompt_label(self) -> &'static str {
        match self {
            Self::Raw => "raw key",
            Self::Hex => "hex key",
            Self::Passphrase => "passphrase",
            Self::None => "key",
        }
    }
}

impl FromStr for KeyFormat {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "raw" => Ok(Self::Raw),
            "hex" => Ok(Self::Hex),
            "passphrase" => Ok(Self::Passphrase),
            other => Err(KeyError::PolicyViolation(format!("invalid keyformat '{other}'"))),
        }
    }
}

impl fmt::Display for KeyFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            Self::None => "none",
            Self::Raw => "raw",
            Self::Hex => "hex",
            Self::Passphrase => "passphrase",
        };
        f.write_str(token)
    }
}

/// Where key material is fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeyLocation {
    /// No location (unencrypted dataset).
    #[default]
    None,
    /// Interactive prompt on standard input.
    Prompt,
    /// A file, referenced as `file://<absolute path>`.
    File(PathBuf),
}

const FILE_SCHEME: &str = "file://";

impl FromStr for KeyLocation {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "prompt" => Ok(Self::Prompt),
            _ => match s.strip_prefix(FILE_SCHEME) {
                Some(path) if path.len() > 1 && path.starts_with('/') => {
                    Ok(Self::File(PathBuf::from(path)))
                }
                _ => Err(KeyError::PolicyViolation(format!("invalid keylocation '{s}'"))),
            },
        }
    }
}

impl TryFrom<String> for KeyLocation {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeyLocation> for String {
    fn from(value: KeyLocation) -> Self {
        value.to_string()
    }
}

impl fmt::Display for KeyLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Prompt => f.write_str("prompt"),
            Self::File(path) => write!(f, "{FILE_SCHEME}{}", path.display()),
        }
    }
}

/// Encryption suite of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EncryptionSuite {
    #[default]
    Off,
    Aes128Ccm,
    Aes192Ccm,
    Aes256Ccm,
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
}

impl EncryptionSuite {
    /// Suite selected by the `on` token.
    pub const DEFAULT: Self = Self::Aes256Ccm;

    pub fn is_on(self) -> bool {
        self != Self::Off
    }
}

impl FromStr for EncryptionSuite {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(Self::Off),
            "on" => Ok(Self::DEFAULT),
            "aes-128-ccm" => Ok(Self::Aes128Ccm),
            "aes-192-ccm" => Ok(Self::Aes192Ccm),
            "aes-256-ccm" => Ok(Self::Aes256Ccm),
            "aes-128-gcm" => Ok(Self::Aes128Gcm),
            "aes-192-gcm" => Ok(Self::Aes192Gcm),
            "aes-256-gcm" => Ok(Self::Aes256Gcm),
            other => Err(KeyError::PolicyViolation(format!("invalid encryption suite '{other}'"))),
        }
    }
}

impl TryFrom<String> for EncryptionSuite {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EncryptionSuite> for String {
    fn from(value: EncryptionSuite) -> Self {
        value.to_string()
    }
}

impl fmt::Display for EncryptionSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            Self::Off => "off",
            Self::Aes128Ccm => "aes-128-ccm",
            Self::Aes192Ccm => "aes-192-ccm",
            Self::Aes256Ccm => "aes-256-ccm",
            Self::Aes128Gcm => "aes-128-gcm",
            Self::Aes192Gcm => "aes-192-gcm",
            Self::Aes256Gcm => "aes-256-gcm",
        };
        f.write_str(token)
    }
}

/// Whether a dataset's wrapping key is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Available,
    #[default]
    Unavailable,
}

/// Where a property value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropSource {
    /// Set on the dataset itself.
    Local,
    /// Inherited from the named ancestor.
    Inherited(String),
    /// Never set anywhere on the path.
    #[default]
    Default,
}

/// Snapshot of a dataset's encryption properties.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DatasetCryptoProps {
    pub encryption: EncryptionSuite,
    pub keyformat: KeyFormat,
    pub keylocation: KeyLocation,
    pub keylocation_source: PropSource,
    pub pbkdf2_salt: u64,
    pub pbkdf2_iters: u64,
    pub key_status: KeyStatus,
}

impl DatasetCryptoProps {
    /// Properties of a dataset with encryption off.
    pub fn unencrypted() -> Self {
        Self::default()
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_on()
    }

    /// A dataset is its own encryption root iff it is encrypted and its
    /// keylocation is not inherited.
    pub fn is_encryption_root(&self) -> bool {
        self.is_encrypted() && !matches!(self.keylocation_source, PropSource::Inherited(_))
    }

    pub fn key_available(&self) -> bool {
        self.key_status == KeyStatus::Available
    }

    /// Name of the ancestor this dataset inherits its key from, if any.
    pub fn inherited_root(&self) -> Option<&str> {
        match &self.keylocation_source {
            PropSource::Inherited(root) => Some(root),
            _ => None,
        }
    }
}

/// Properties supplied by a caller for create, clone or rewrap.
///
/// Absent fields mean "not specified". Properties unrelated to encryption
/// are carried in `other` so that rewrap can reject them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestedProps {
    pub encryption: Option<EncryptionSuite>,
    pub keyformat: Option<KeyFormat>,
    pub keylocation: Option<KeyLocation>,
    pub pbkdf2_iters: Option<u64>,
    pub other: BTreeMap<String, String>,
}

impl RequestedProps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `(name, value)` pairs as given on a command line.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, KeyError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut props = Self::default();
        for (name, value) in pairs {
            match name {
                prop_name::ENCRYPTION => props.encryption = Some(value.parse()?),
                prop_name::KEYFORMAT => props.keyformat = Some(value.parse()?),
                prop_name::KEYLOCATION => props.keylocation = Some(value.parse()?),
                prop_name::PBKDF2_ITERS => {
                    let iters = value.parse().map_err(|_| {
                        KeyError::PolicyViolation(format!("invalid pbkdf2iters '{value}'"))
                    })?;
                    props.pbkdf2_iters = Some(iters);
                }
                _ => {
                    props.other.insert(name.to_string(), value.to_string());
                }
            }
        }
        Ok(props)
    }

    pub fn encryption(mut self, suite: EncryptionSuite) -> Self {
        self.encryption = Some(suite);
        self
    }

    pub fn keyformat(mut self, format: KeyFormat) -> Self {
        self.keyformat = Some(format);
        self
    }

    pub fn keylocation(mut self, location: KeyLocation) -> Self {
        self.keylocation = Some(location);
        self
    }

    pub fn pbkdf2_iters(mut self, iters: u64) -> Self {
        self.pbkdf2_iters = Some(iters);
        self
    }

    /// Requested keyformat, with "not given" folded into `None`.
    pub(crate) fn effective_keyformat(&self) -> KeyFormat {
        self.keyformat.unwrap_or_default()
    }

    /// True if any property requires the encryption feature.
    pub fn has_encryption_props(&self) -> bool {
        self.encryption.is_some_and(EncryptionSuite::is_on)
            || !matches!(self.keylocation, None | Some(KeyLocation::None))
            || self.keyformat.is_some()
            || self.pbkdf2_iters.is_some()
    }
}

/// Key parameters to persist on a dataset after a successful operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoParams {
    pub keyformat: Option<KeyFormat>,
    pub keylocation: Option<KeyLocation>,
    pub pbkdf2_salt: Option<u64>,
    pub pbkdf2_iters: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(token: &str) -> KeyLocation {
        token.parse().unwrap()
    }

    #[test]
    fn keylocation_tokens() {
        assert_eq!(location("prompt"), KeyLocation::Prompt);
        assert_eq!(location("none"), KeyLocation::None);
        assert_eq!(
            location("file:///etc/keys/tank"),
            KeyLocation::File(PathBuf::from("/etc/keys/tank"))
        );

        for bad in [
            "file://",
            "file:///",
            "file://relative",
            "https://x",
            "Prompt",
            "",
        ] {
            assert!(bad.parse::<KeyLocation>().is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn keylocation_display_round_trips() {
        for token in ["none", "prompt", "file:///root/key.bin"] {
            assert_eq!(token.parse::<KeyLocation>().unwrap().to_string(), token);
        }
    }

    #[test]
    fn suite_on_selects_default() {
        let on: EncryptionSuite = "on".parse().unwrap();
        assert_eq!(on, EncryptionSuite::DEFAULT);
        assert!(!"off".parse::<EncryptionSuite>().unwrap().is_on());
        assert!("aes-512-xts".parse::<EncryptionSuite>().is_err());
    }

    #[test]
    fn suite_serializes_as_property_token() {
        let suites = [
            EncryptionSuite::Off,
            EncryptionSuite::Aes128Ccm,
            EncryptionSuite::Aes192Ccm,
            EncryptionSuite::Aes256Ccm,
            EncryptionSuite::Aes128Gcm,
            EncryptionSuite::Aes192Gcm,
            EncryptionSuite::Aes256Gcm,
        ];
        for suite in suites {
            let json = serde_json::to_string(&suite).unwrap();
            assert_eq!(json, format!("\"{suite}\""));
            let back: EncryptionSuite = serde_json::from_str(&json).unwrap();
            assert_eq!(back, suite);
        }
        assert!(serde_json::from_str::<EncryptionSuite>("\"aes128-ccm\"").is_err());
    }

    #[test]
    fn crypto_props_survive_serde() {
        let props = DatasetCryptoProps {
            encryption: EncryptionSuite::Aes128Ccm,
            keyformat: KeyFormat::Hex,
            keylocation: KeyLocation::File(PathBuf::from("/etc/keys/tank")),
            keylocation_source: PropSource::Local,
            pbkdf2_salt: 7,
            pbkdf2_iters: 0,
            key_status: KeyStatus::Available,
        };
        let json = serde_json::to_string(&props).unwrap();
        assert!(json.contains("\"aes-128-ccm\""));
        let back: DatasetCryptoProps = serde_json::from_str(&json).unwrap();
        assert_eq!(back, props);
    }

    #[test]
    fn encryption_root_follows_keylocation_source() {
        let mut props = DatasetCryptoProps {
            encryption: EncryptionSuite::Aes256Gcm,
            keyformat: KeyFormat::Passphrase,
            keylocation: KeyLocation::Prompt,
            keylocation_source: PropSource::Local,
            ..Default::default()
        };
        assert!(props.is_encryption_root());

        props.keylocation_source = PropSource::Inherited("tank".into());
        assert!(!props.is_encryption_root());
        assert_eq!(props.inherited_root(), Some("tank"));

        assert!(!DatasetCryptoProps::unencrypted().is_encryption_root());
    }

    #[test]
    fn from_pairs_separates_unrelated_props() {
        let props = RequestedProps::from_pairs([
            ("keyformat", "hex"),
            ("keylocation", "file:///k"),
            ("pbkdf2iters", "200000"),
            ("compression", "lz4"),
        ])
        .unwrap();

        assert_eq!(props.keyformat, Some(KeyFormat::Hex));
        assert_eq!(props.pbkdf2_iters, Some(200_000));
        assert_eq!(props.other["compression"], "lz4");
        assert!(RequestedProps::from_pairs([("pbkdf2iters", "many")]).is_err());
    }

    #[test]
    fn has_encryption_props_ignores_off_and_none() {
        assert!(!RequestedProps::new().has_encryption_props());
        let off = RequestedProps::new().encryption(EncryptionSuite::Off);
        assert!(!off.has_encryption_props());
        let nowhere = RequestedProps::new().keylocation(KeyLocation::None);
        assert!(!nowhere.has_encryption_props());
        let formatted = RequestedProps::new().keyformat(KeyFormat::None);
        assert!(formatted.has_encryption_props());
        assert!(RequestedProps::new().pbkdf2_iters(1).has_encryption_props());
    }
}
