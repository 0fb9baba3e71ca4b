mod authority;
mod block;
mod trace;
mod transaction;

pub use authority::{Authority, KeyWeight, PermissionLevel, PermissionLevelWeight, WaitWeight};
pub use block::{
    BlockHeader, Cycle, ProducerKey, ProducerSchedule, ReceiptStatus, Region, Shard, SignedBlock,
    TransactionReceipt,
};
pub use trace::{
    ActionTrace, BlockTrace, CycleTrace, RegionTrace, ShardTrace, TransactionTrace,
};
pub use transaction::{
    Action, DeferredTransaction, SignatureEntry, SignedTransaction, Transaction,
};

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub type AccountName = String;
pub type PermissionName = String;
pub type ActionName = String;

pub type BlockId = Digest;
pub type TransactionId = Digest;

/// 32-byte blake2s digest, rendered as hex on every wire and log surface.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Prefix a transaction binds to for its reference block check: the
    /// little-endian word at bytes 8..12 of the block id.
    pub fn ref_prefix(&self) -> u32 {
        u32::from_le_bytes([self.0[8], self.0[9], self.0[10], self.0[11]])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        let bytes = hex::decode(&value).map_err(serde::de::Error::custom)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("digest must be 32 bytes"))?;
        Ok(Digest(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_serializes_as_hex() {
        let mut bytes = [0u8; 32];
        bytes[8] = 0xAA;
        bytes[9] = 0xBB;
        let digest = Digest(bytes);
        let encoded = serde_json::to_string(&digest).unwrap();
        assert!(encoded.contains("aabb"));
        let decoded: Digest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, digest);
    }

    #[test]
    fn ref_prefix_reads_the_second_word() {
        let mut bytes = [0u8; 32];
        bytes[8..12].copy_from_slice(&0x0403_0201u32.to_le_bytes());
        assert_eq!(Digest(bytes).ref_prefix(), 0x0403_0201);
    }
}
