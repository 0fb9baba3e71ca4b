use serde::{Deserialize, Serialize};

use super::{AccountName, PermissionName};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PermissionLevel {
    pub actor: AccountName,
    pub permission: PermissionName,
}

impl PermissionLevel {
    pub fn new(actor: impl Into<AccountName>, permission: impl Into<PermissionName>) -> Self {
        Self {
            actor: actor.into(),
            permission: permission.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyWeight {
    /// Hex-encoded public key.
    pub key: String,
    pub weight: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionLevelWeight {
    pub level: PermissionLevel,
    pub weight: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WaitWeight {
    pub wait_sec: u32,
    pub weight: u16,
}

/// Weighted-threshold gate over keys, sub-authorities and waits. Wait weights
/// are only honored by delayed execution; static signature checking ignores
/// them.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Authority {
    pub threshold: u32,
    pub keys: Vec<KeyWeight>,
    pub accounts: Vec<PermissionLevelWeight>,
    pub waits: Vec<WaitWeight>,
}

impl Authority {
    pub fn single_key(key: impl Into<String>) -> Self {
        Self {
            threshold: 1,
            keys: vec![KeyWeight {
                key: key.into(),
                weight: 1,
            }],
            accounts: Vec::new(),
            waits: Vec::new(),
        }
    }

    pub fn account_threshold(
        threshold: u32,
        levels: impl IntoIterator<Item = PermissionLevel>,
    ) -> Self {
        Self {
            threshold,
            keys: Vec::new(),
            accounts: levels
                .into_iter()
                .map(|level| PermissionLevelWeight { level, weight: 1 })
                .collect(),
            waits: Vec::new(),
        }
    }

    /// An authority is well formed when its threshold is reachable without
    /// waits alone.
    pub fn is_valid(&self) -> bool {
        if self.threshold == 0 {
            return false;
        }
        let reachable: u64 = self
            .keys
            .iter()
            .map(|k| u64::from(k.weight))
            .chain(self.accounts.iter().map(|a| u64::from(a.weight)))
            .sum();
        reachable >= u64::from(self.threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_key_authority_is_valid() {
        let auth = Authority::single_key("aa".repeat(32));
        assert!(auth.is_valid());
        assert_eq!(auth.threshold, 1);
    }

    #[test]
    fn unreachable_threshold_is_rejected() {
        let mut auth = Authority::single_key("aa".repeat(32));
        auth.threshold = 3;
        assert!(!auth.is_valid());
        auth.accounts.push(PermissionLevelWeight {
            level: PermissionLevel::new("alice", "active"),
            weight: 2,
        });
        assert!(auth.is_valid());
    }
}
