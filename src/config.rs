//! Configuration file support for the Arbor node.
//!
//! Loads optional `arbor.toml` from the data directory. CLI flags override
//! config file values. If no config file exists, defaults are used; a
//! default config still fails committee validation at startup, because a
//! node cannot invent the round-1 witness set.

use serde::Deserialize;
use std::path::Path;

use crate::constants::TOTAL_COORDINATORS;
use crate::identity::{parse_public_key, Address, IdentityError};

/// Errors from committee validation. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("committee must list exactly {expected} witnesses, found {found}")]
    WitnessCount { expected: usize, found: usize },
    #[error("witness {index}: {source}")]
    Witness {
        index: usize,
        source: IdentityError,
    },
    #[error("foundation key: {0}")]
    Foundation(IdentityError),
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ArborConfig {
    pub node: NodeConfig,
    pub committee: CommitteeConfig,
}

/// Node configuration section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: "./arbor-data".into(),
        }
    }
}

/// Committee configuration section.
///
/// Witnesses are listed as hex ed25519 public keys rather than addresses:
/// the node seeds their definitions into the store so precommit signatures
/// verify before any of them has authored a unit.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct CommitteeConfig {
    /// Round-1 committee, in rotation order.
    pub initial_witnesses: Vec<String>,
    /// The seat appended to every committee after round 1.
    pub foundation: String,
}

/// One parsed committee member.
#[derive(Clone, Debug)]
pub struct WitnessKey {
    pub public_key: [u8; 32],
    pub address: Address,
}

/// The committee after parsing and validation.
#[derive(Clone, Debug)]
pub struct Committee {
    pub witnesses: Vec<WitnessKey>,
    pub foundation: WitnessKey,
}

impl Committee {
    pub fn witness_addresses(&self) -> Vec<Address> {
        self.witnesses.iter().map(|w| w.address).collect()
    }
}

impl CommitteeConfig {
    /// Parse and validate the configured committee.
    pub fn resolve(&self) -> Result<Committee, ConfigError> {
        if self.initial_witnesses.len() != TOTAL_COORDINATORS {
            return Err(ConfigError::WitnessCount {
                expected: TOTAL_COORDINATORS,
                found: self.initial_witnesses.len(),
            });
        }
        let mut witnesses = Vec::with_capacity(self.initial_witnesses.len());
        for (index, hex_key) in self.initial_witnesses.iter().enumerate() {
            let (public_key, address) =
                parse_public_key(hex_key).map_err(|source| ConfigError::Witness { index, source })?;
            witnesses.push(WitnessKey {
                public_key,
                address,
            });
        }
        let (public_key, address) =
            parse_public_key(&self.foundation).map_err(ConfigError::Foundation)?;
        Ok(Committee {
            witnesses,
            foundation: WitnessKey {
                public_key,
                address,
            },
        })
    }
}

impl ArborConfig {
    /// Load configuration from `arbor.toml` in the given directory.
    /// Returns `Default` if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("arbor.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{LocalIdentity, Signer};

    fn hex_key(seed: u8) -> String {
        hex::encode(LocalIdentity::from_seed([seed; 32]).public_key_bytes())
    }

    fn full_committee() -> CommitteeConfig {
        CommitteeConfig {
            initial_witnesses: (1..=10).map(hex_key).collect(),
            foundation: hex_key(10),
        }
    }

    #[test]
    fn default_config_fails_committee_validation() {
        let config = ArborConfig::default();
        assert_eq!(config.node.data_dir, "./arbor-data");
        assert!(matches!(
            config.committee.resolve(),
            Err(ConfigError::WitnessCount {
                expected: 10,
                found: 0
            })
        ));
    }

    #[test]
    fn parse_toml_config() {
        let witnesses: Vec<String> = (1..=10).map(hex_key).collect();
        let toml_str = format!(
            r#"
[node]
data_dir = "/tmp/arbor-test"

[committee]
initial_witnesses = [{}]
foundation = "{}"
"#,
            witnesses
                .iter()
                .map(|w| format!("\"{w}\""))
                .collect::<Vec<_>>()
                .join(", "),
            witnesses[9],
        );
        let config: ArborConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.node.data_dir, "/tmp/arbor-test");

        let committee = config.committee.resolve().unwrap();
        assert_eq!(committee.witnesses.len(), 10);
        assert_eq!(
            committee.foundation.address,
            LocalIdentity::from_seed([10u8; 32]).address()
        );
        assert_eq!(
            committee.witness_addresses()[0],
            LocalIdentity::from_seed([1u8; 32]).address()
        );
    }

    #[test]
    fn missing_config_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = ArborConfig::load(dir.path());
        assert_eq!(config.node.data_dir, "./arbor-data");
    }

    #[test]
    fn malformed_witness_key_is_rejected_with_its_index() {
        let mut committee = full_committee();
        committee.initial_witnesses[4] = "zz".into();
        assert!(matches!(
            committee.resolve(),
            Err(ConfigError::Witness { index: 4, .. })
        ));
    }

    #[test]
    fn wrong_witness_count_is_rejected() {
        let mut committee = full_committee();
        committee.initial_witnesses.pop();
        assert!(matches!(
            committee.resolve(),
            Err(ConfigError::WitnessCount {
                expected: 10,
                found: 9
            })
        ));
    }
}
