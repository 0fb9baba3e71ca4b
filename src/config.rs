use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};

/// Denominator for every percentage expressed in basis points.
pub const PERCENT_100: u32 = 10_000;

pub const SYSTEM_ACCOUNT: &str = "system";
pub const PRODUCERS_ACCOUNT: &str = "producers";
pub const OWNER_PERMISSION: &str = "owner";
pub const ACTIVE_PERMISSION: &str = "active";

/// Built-in scopes that do not resolve to accounts.
pub const ALL_SCOPE: &str = "system.all";
pub const AUTH_SCOPE: &str = "system.auth";

/// Consensus-critical constants. Every node on a network must run with a
/// byte-identical set; they are snapshotted into the global property row at
/// genesis and never reloaded from disk afterwards.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsensusParams {
    pub producer_count: u32,
    pub producer_repetitions: u32,
    pub block_interval_ms: u64,
    pub max_transaction_lifetime_sec: u64,
    pub max_authority_depth: u16,
    /// Share of producers (in basis points) that must confirm past a block
    /// before it becomes irreversible.
    pub irreversible_threshold_percent: u32,
    pub producers_authority_threshold: u32,
}

impl ConsensusParams {
    pub fn blocks_per_round(&self) -> u64 {
        u64::from(self.producer_count) * u64::from(self.producer_repetitions)
    }

    /// One full producer round expressed in seconds; the dedup index keeps
    /// entries for two of these windows past their expiration.
    pub fn forking_window_sec(&self) -> u64 {
        (self.blocks_per_round() * self.block_interval_ms) / 1_000
    }
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            producer_count: 21,
            producer_repetitions: 4,
            block_interval_ms: 500,
            max_transaction_lifetime_sec: 3_600,
            max_authority_depth: 6,
            irreversible_threshold_percent: 7_000,
            producers_authority_threshold: 14,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainConfig {
    pub params: ConsensusParams,
    pub genesis: GenesisConfig,
}

impl ChainConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn validate(&self) -> ChainResult<()> {
        let params = &self.params;
        if params.producer_count == 0 || params.producer_repetitions == 0 {
            return Err(ChainError::Config(
                "producer count and repetitions must be nonzero".into(),
            ));
        }
        if params.block_interval_ms == 0 {
            return Err(ChainError::Config("block interval must be nonzero".into()));
        }
        if params.irreversible_threshold_percent == 0
            || params.irreversible_threshold_percent > PERCENT_100
        {
            return Err(ChainError::Config(
                "irreversible threshold must be within (0, 100%]".into(),
            ));
        }
        if self.genesis.timestamp_ms % params.block_interval_ms != 0 {
            return Err(ChainError::Config(
                "genesis timestamp must be divisible by the block interval".into(),
            ));
        }
        if self.genesis.producers.len() != params.producer_count as usize {
            return Err(ChainError::Config(format!(
                "genesis must name exactly {} producers",
                params.producer_count
            )));
        }
        Ok(())
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            params: ConsensusParams::default(),
            genesis: GenesisConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub chain_id: String,
    /// Milliseconds since the UNIX epoch; must align with the block interval.
    pub timestamp_ms: u64,
    /// Hex-encoded public key controlling the system account.
    pub system_key: String,
    pub accounts: Vec<GenesisAccount>,
    pub producers: Vec<GenesisProducer>,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            chain_id: "cadence-local".to_string(),
            timestamp_ms: 0,
            system_key: String::new(),
            accounts: Vec::new(),
            producers: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub name: String,
    /// Hex-encoded public key installed as both owner and active authority.
    pub key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisProducer {
    pub name: String,
    pub signing_key: String,
    /// Initial vote tally seeded into the producer-vote table.
    #[serde(default)]
    pub votes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ChainConfig {
        let mut config = ChainConfig::default();
        config.params.producer_count = 3;
        config.params.producer_repetitions = 1;
        config.genesis.producers = (0..3)
            .map(|i| GenesisProducer {
                name: format!("producer{i}"),
                signing_key: format!("{:064x}", i + 1),
                votes: 0,
            })
            .collect();
        config
    }

    #[test]
    fn default_round_length_matches_schedule_shape() {
        let params = ConsensusParams::default();
        assert_eq!(params.blocks_per_round(), 84);
        assert_eq!(params.forking_window_sec(), 42);
    }

    #[test]
    fn validate_rejects_misaligned_genesis_timestamp() {
        let mut config = sample_config();
        config.genesis.timestamp_ms = 250;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ChainError::Config(_)));
    }

    #[test]
    fn validate_requires_full_producer_set() {
        let mut config = sample_config();
        config.genesis.producers.pop();
        assert!(config.validate().is_err());
        let config = sample_config();
        config.validate().unwrap();
    }

    #[test]
    fn config_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.toml");
        let config = sample_config();
        config.save(&path).unwrap();
        let loaded = ChainConfig::load(&path).unwrap();
        assert_eq!(loaded.params, config.params);
        assert_eq!(loaded.genesis.producers.len(), 3);
    }
}
