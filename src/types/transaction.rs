use std::collections::BTreeSet;

use ed25519_dalek::Keypair;
use serde::{Deserialize, Serialize};

use crate::crypto::{
    digest, public_key_from_hex, public_key_to_hex, sign_message, signature_from_hex,
    signature_to_hex, verify_signature,
};
use crate::errors::ChainResult;

use super::{AccountName, ActionName, Digest, PermissionLevel, TransactionId};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Action {
    /// Account whose contract interprets this action.
    pub scope: AccountName,
    pub name: ActionName,
    pub authorization: Vec<PermissionLevel>,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub expiration_sec: u64,
    /// Low 16 bits of the referenced block height (the summary-ring slot).
    pub ref_block_num: u16,
    /// Prefix of the referenced block id; binds the transaction to one fork.
    pub ref_block_prefix: u32,
    pub read_scope: Vec<AccountName>,
    pub write_scope: Vec<AccountName>,
    pub actions: Vec<Action>,
}

impl Transaction {
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("serializing transaction")
    }

    pub fn id(&self) -> TransactionId {
        digest(&self.canonical_bytes())
    }

    pub fn signing_digest(&self, chain_id: &Digest) -> Digest {
        let canonical = self.canonical_bytes();
        let mut data = Vec::with_capacity(32 + canonical.len());
        data.extend_from_slice(&chain_id.0);
        data.extend_from_slice(&canonical);
        digest(&data)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignatureEntry {
    pub public_key: String,
    pub signature: String,
}

impl SignatureEntry {
    /// Verifies the entry against `signing_digest` and yields the hex key
    /// that provably signed it.
    pub fn verify(&self, signing_digest: &Digest) -> ChainResult<String> {
        let public_key = public_key_from_hex(&self.public_key)?;
        let signature = signature_from_hex(&self.signature)?;
        verify_signature(&public_key, &signing_digest.0, &signature)?;
        Ok(self.public_key.clone())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedTransaction {
    pub transaction: Transaction,
    pub signatures: Vec<SignatureEntry>,
}

impl SignedTransaction {
    pub fn new(transaction: Transaction) -> Self {
        Self {
            transaction,
            signatures: Vec::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.transaction.id()
    }

    pub fn sign(&mut self, keypair: &Keypair, chain_id: &Digest) {
        let signing_digest = self.transaction.signing_digest(chain_id);
        let signature = sign_message(keypair, &signing_digest.0);
        self.signatures.push(SignatureEntry {
            public_key: public_key_to_hex(&keypair.public),
            signature: signature_to_hex(&signature),
        });
    }

    /// The set of keys that provably signed this transaction. Fails if any
    /// attached signature does not verify.
    pub fn signature_keys(&self, chain_id: &Digest) -> ChainResult<BTreeSet<String>> {
        let signing_digest = self.transaction.signing_digest(chain_id);
        let mut keys = BTreeSet::new();
        for entry in &self.signatures {
            keys.insert(entry.verify(&signing_digest)?);
        }
        Ok(keys)
    }
}

/// A transaction generated during execution, parked until its delay elapses.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeferredTransaction {
    pub sender: AccountName,
    pub sender_id: u64,
    pub execute_after_sec: u64,
    pub transaction: Transaction,
}

impl DeferredTransaction {
    pub fn id(&self) -> TransactionId {
        self.transaction.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keypair_from_seed;

    fn sample_transaction() -> Transaction {
        Transaction {
            expiration_sec: 120,
            ref_block_num: 1,
            ref_block_prefix: 42,
            read_scope: vec!["bob".into()],
            write_scope: vec!["alice".into()],
            actions: vec![Action {
                scope: "alice".into(),
                name: "transfer".into(),
                authorization: vec![PermissionLevel::new("alice", "active")],
                data: vec![1, 2, 3],
            }],
        }
    }

    #[test]
    fn id_commits_to_the_payload() {
        let trx = sample_transaction();
        let mut altered = trx.clone();
        altered.ref_block_prefix += 1;
        assert_ne!(trx.id(), altered.id());
        assert_eq!(trx.id(), sample_transaction().id());
    }

    #[test]
    fn signature_keys_reports_every_signer() {
        let chain_id = digest(b"test-chain");
        let mut signed = SignedTransaction::new(sample_transaction());
        let alice = keypair_from_seed(1);
        let bob = keypair_from_seed(2);
        signed.sign(&alice, &chain_id);
        signed.sign(&bob, &chain_id);
        let keys = signed.signature_keys(&chain_id).unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&public_key_to_hex(&alice.public)));
    }

    #[test]
    fn signature_over_wrong_chain_is_rejected() {
        let mut signed = SignedTransaction::new(sample_transaction());
        let alice = keypair_from_seed(1);
        signed.sign(&alice, &digest(b"other-chain"));
        assert!(signed.signature_keys(&digest(b"test-chain")).is_err());
    }
}
