use ed25519_dalek::{Keypair, PublicKey};
use serde::{Deserialize, Serialize};

use crate::crypto::{digest, sign_message, signature_from_hex, signature_to_hex, verify_signature};
use crate::errors::ChainResult;
use crate::merkle::merkle_root;

use super::{AccountName, BlockId, Digest, SignedTransaction, TransactionId};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProducerKey {
    pub producer_name: AccountName,
    /// Hex-encoded block-signing public key.
    pub signing_key: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProducerSchedule {
    pub version: u32,
    pub producers: Vec<ProducerKey>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReceiptStatus {
    Executed,
    SoftFail,
    HardFail,
    Delayed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionReceipt {
    pub id: TransactionId,
    pub status: ReceiptStatus,
}

/// Receipts that must be applied serially.
pub type Shard = Vec<TransactionReceipt>;
/// Shards whose scope sets do not conflict; applicable in parallel.
pub type Cycle = Vec<Shard>;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Region {
    pub region: u16,
    pub cycles: Vec<Cycle>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub height: u64,
    pub previous: BlockId,
    pub timestamp_ms: u64,
    pub producer: AccountName,
    /// Merkle root over the canonical encodings of `input_transactions`.
    pub transaction_mroot: Digest,
    /// Merkle root over the shard roots of every action trace in the block.
    pub action_mroot: Digest,
    /// Root of the incremental merkle over all prior block ids.
    pub block_mroot: Digest,
    pub new_producers: Option<ProducerSchedule>,
}

impl BlockHeader {
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("serializing block header")
    }

    pub fn id(&self) -> BlockId {
        digest(&self.canonical_bytes())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedBlock {
    pub header: BlockHeader,
    pub producer_signature: String,
    pub regions: Vec<Region>,
    /// Full signed transactions referenced by the receipts above.
    pub input_transactions: Vec<SignedTransaction>,
}

impl SignedBlock {
    pub fn new(header: BlockHeader) -> Self {
        Self {
            header,
            producer_signature: String::new(),
            regions: Vec::new(),
            input_transactions: Vec::new(),
        }
    }

    pub fn id(&self) -> BlockId {
        self.header.id()
    }

    pub fn block_num(&self) -> u64 {
        self.header.height
    }

    pub fn sign(&mut self, keypair: &Keypair) {
        let signature = sign_message(keypair, &self.header.canonical_bytes());
        self.producer_signature = signature_to_hex(&signature);
    }

    pub fn verify_signature(&self, public_key: &PublicKey) -> ChainResult<()> {
        let signature = signature_from_hex(&self.producer_signature)?;
        verify_signature(public_key, &self.header.canonical_bytes(), &signature)
    }

    pub fn calculate_transaction_merkle_root(&self) -> Digest {
        let leaves: Vec<Digest> = self
            .input_transactions
            .iter()
            .map(|trx| trx.id())
            .collect();
        merkle_root(&leaves)
    }
}
