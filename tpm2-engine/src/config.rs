// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Engine configuration

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_human_bytes as hex_bytes;

/// Which hierarchies accept tickets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchyConfig {
    pub owner: bool,
    pub endorsement: bool,
    pub platform: bool,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            owner: true,
            endorsement: true,
            platform: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TpmConfig {
    /// Capacity of the session table
    pub max_sessions: usize,
    /// Largest response envelope the engine will produce
    pub max_response_size: usize,
    /// Evict the least recently used session instead of failing when full
    pub evict_when_full: bool,
    pub hierarchies: HierarchyConfig,
    /// Seed for the hierarchy proof values; random proofs when empty
    #[serde(with = "hex_bytes")]
    pub proof_seed: Vec<u8>,
    /// Command codes reported as not implemented
    pub disabled_commands: Vec<u32>,
}

impl Default for TpmConfig {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            max_response_size: 4096,
            evict_when_full: false,
            hierarchies: HierarchyConfig::default(),
            proof_seed: Vec::new(),
            disabled_commands: Vec::new(),
        }
    }
}

impl TpmConfig {
    /// Load a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs_err::read_to_string(path.as_ref())?;
        serde_json::from_str(&data).context("failed to parse TPM config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: TpmConfig = serde_json::from_str(r#"{"max_sessions": 3}"#).unwrap();
        assert_eq!(config.max_sessions, 3);
        assert_eq!(config.max_response_size, 4096);
        assert!(config.hierarchies.owner);
        assert!(config.proof_seed.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "evict_when_full": true,
                "hierarchies": {{ "platform": false }},
                "proof_seed": "00112233",
                "disabled_commands": [367]
            }}"#
        )
        .unwrap();
        let config = TpmConfig::load(file.path()).unwrap();
        assert!(config.evict_when_full);
        assert!(config.hierarchies.owner);
        assert!(!config.hierarchies.platform);
        assert_eq!(config.proof_seed, vec![0x00, 0x11, 0x22, 0x33]);
        assert_eq!(config.disabled_commands, vec![0x16F]);
    }

    #[test]
    fn test_load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = TpmConfig::load(dir.path().join("absent.json")).unwrap_err();
        assert!(format!("{err:#}").contains("absent.json"));
    }
}
