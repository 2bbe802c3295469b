use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::expand_home;
use crate::error::{Result, StorageError};

pub const DEFAULT_CONFIG_PATH: &str = "~/.oci/config";
pub const DEFAULT_PROFILE: &str = "DEFAULT";

/// One authentication profile from an OCI CLI/SDK config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OciProfile {
    pub user: String,
    pub fingerprint: String,
    pub tenancy: String,
    pub key_file: PathBuf,
}

impl OciProfile {
    pub fn load(path: &Path, profile: &str) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            StorageError::Configuration(format!(
                "Failed to read OCI config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&contents, profile)
    }

    /// Parses the INI text; named profiles inherit any key they omit from `[DEFAULT]`.
    pub fn parse(text: &str, profile: &str) -> Result<Self> {
        let sections = parse_sections(text);

        if !sections.contains_key(profile) {
            return Err(StorageError::Configuration(format!(
                "Profile {} not found in OCI config file",
                profile
            )));
        }

        let mut values = sections.get(DEFAULT_PROFILE).cloned().unwrap_or_default();
        if let Some(named) = sections.get(profile) {
            values.extend(named.clone());
        }

        let mut missing = Vec::new();
        let mut field = |key: &str| {
            let value = values.get(key).filter(|v| !v.is_empty()).cloned();
            if value.is_none() {
                missing.push(format!("{} must be set in OCI profile {}", key, profile));
            }
            value
        };

        let user = field("user");
        let fingerprint = field("fingerprint");
        let tenancy = field("tenancy");
        let key_file = field("key_file");

        if values.get("pass_phrase").is_some_and(|p| !p.is_empty()) {
            missing.push(format!(
                "OCI profile {} uses an encrypted key_file, which is not supported",
                profile
            ));
        }

        match (user, fingerprint, tenancy, key_file) {
            (Some(user), Some(fingerprint), Some(tenancy), Some(key_file)) if missing.is_empty() => {
                Ok(Self {
                    user,
                    fingerprint,
                    tenancy,
                    key_file: expand_home(&key_file),
                })
            }
            _ => Err(StorageError::Configuration(missing.join("\n"))),
        }
    }

    /// `keyId` used in the request signature.
    pub fn key_id(&self) -> String {
        format!("{}/{}/{}", self.tenancy, self.user, self.fingerprint)
    }
}

fn parse_sections(text: &str) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    let mut current: Option<String> = None;

    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim().to_string();
            sections.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }

        if let (Some(section), Some((key, value))) = (&current, line.split_once('=')) {
            sections
                .entry(section.clone())
                .or_default()
                .insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    sections
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[DEFAULT]
user=ocid1.user.oc1..aaaa
fingerprint=12:34:56:78
key_file=/keys/oci_api_key.pem
tenancy=ocid1.tenancy.oc1..bbbb
region=us-ashburn-1

# conversion service account
[CONVERTER]
user = ocid1.user.oc1..cccc
fingerprint = ab:cd:ef
key_file = ~/.oci/converter.pem

[BROKEN]
pass_phrase=secret
"#;

    #[test]
    fn test_default_profile() {
        let profile = OciProfile::parse(CONFIG, DEFAULT_PROFILE).unwrap();
        assert_eq!(profile.user, "ocid1.user.oc1..aaaa");
        assert_eq!(profile.key_file, PathBuf::from("/keys/oci_api_key.pem"));
        assert_eq!(
            profile.key_id(),
            "ocid1.tenancy.oc1..bbbb/ocid1.user.oc1..aaaa/12:34:56:78"
        );
    }

    #[test]
    fn test_named_profile_inherits_default() {
        let profile = OciProfile::parse(CONFIG, "CONVERTER").unwrap();
        assert_eq!(profile.user, "ocid1.user.oc1..cccc");
        assert_eq!(profile.fingerprint, "ab:cd:ef");
        assert_eq!(profile.tenancy, "ocid1.tenancy.oc1..bbbb");
        assert_eq!(profile.key_file, expand_home("~/.oci/converter.pem"));
    }

    #[test]
    fn test_missing_profile() {
        match OciProfile::parse(CONFIG, "NOPE") {
            Err(StorageError::Configuration(message)) => {
                assert!(message.contains("Profile NOPE not found"))
            }
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_encrypted_key_is_rejected() {
        match OciProfile::parse(CONFIG, "BROKEN") {
            Err(StorageError::Configuration(message)) => {
                assert!(message.contains("encrypted key_file"))
            }
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_every_missing_field_is_reported() {
        match OciProfile::parse("[DEFAULT]\nregion=us-ashburn-1\n", DEFAULT_PROFILE) {
            Err(StorageError::Configuration(message)) => {
                for key in ["user", "fingerprint", "tenancy", "key_file"] {
                    assert!(message.contains(&format!("{} must be set", key)));
                }
            }
            other => panic!("expected configuration error, got {:?}", other),
        }
    }
}
