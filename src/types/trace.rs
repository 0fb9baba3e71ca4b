use serde::{Deserialize, Serialize};

use crate::crypto::digest;
use crate::merkle::merkle_root;

use super::{AccountName, Action, DeferredTransaction, Digest, TransactionId};

/// Observable record of one action's execution.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionTrace {
    pub receiver: AccountName,
    pub action: Action,
    pub console: String,
    pub region_id: u16,
    pub cycle_index: u32,
    pub shard_index: u32,
}

impl ActionTrace {
    pub fn digest(&self) -> Digest {
        let bytes = serde_json::to_vec(self).expect("serializing action trace");
        digest(&bytes)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionTrace {
    pub id: TransactionId,
    pub action_traces: Vec<ActionTrace>,
    pub deferred_transactions: Vec<DeferredTransaction>,
}

impl TransactionTrace {
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            action_traces: Vec::new(),
            deferred_transactions: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardTrace {
    pub transaction_traces: Vec<TransactionTrace>,
    pub shard_root: Digest,
}

impl ShardTrace {
    pub fn append(&mut self, trace: TransactionTrace) {
        self.transaction_traces.push(trace);
    }

    pub fn calculate_root(&mut self) {
        let leaves: Vec<Digest> = self
            .transaction_traces
            .iter()
            .flat_map(|trace| trace.action_traces.iter().map(ActionTrace::digest))
            .collect();
        self.shard_root = merkle_root(&leaves);
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CycleTrace {
    pub shard_traces: Vec<ShardTrace>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegionTrace {
    pub cycle_traces: Vec<CycleTrace>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockTrace {
    pub region_traces: Vec<RegionTrace>,
}

impl BlockTrace {
    /// Root over every shard root in region, cycle, shard order. The block
    /// header's `action_mroot` must equal this on both the producing and the
    /// validating side.
    pub fn calculate_action_merkle_root(&self) -> Digest {
        let leaves: Vec<Digest> = self
            .region_traces
            .iter()
            .flat_map(|region| {
                region.cycle_traces.iter().flat_map(|cycle| {
                    cycle.shard_traces.iter().map(|shard| shard.shard_root)
                })
            })
            .collect();
        merkle_root(&leaves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PermissionLevel;

    fn sample_action_trace(tag: u8) -> ActionTrace {
        ActionTrace {
            receiver: "alice".into(),
            action: Action {
                scope: "alice".into(),
                name: "transfer".into(),
                authorization: vec![PermissionLevel::new("alice", "active")],
                data: vec![tag],
            },
            console: String::new(),
            region_id: 0,
            cycle_index: 0,
            shard_index: 0,
        }
    }

    #[test]
    fn shard_root_covers_action_traces_in_order() {
        let mut shard = ShardTrace::default();
        let mut trace = TransactionTrace::new(Digest([9u8; 32]));
        trace.action_traces.push(sample_action_trace(1));
        trace.action_traces.push(sample_action_trace(2));
        shard.append(trace);
        shard.calculate_root();
        let expected = merkle_root(&[
            sample_action_trace(1).digest(),
            sample_action_trace(2).digest(),
        ]);
        assert_eq!(shard.shard_root, expected);
    }

    #[test]
    fn action_root_folds_shard_roots_across_cycles() {
        let mut first = ShardTrace::default();
        first.shard_root = Digest([1u8; 32]);
        let mut second = ShardTrace::default();
        second.shard_root = Digest([2u8; 32]);
        let trace = BlockTrace {
            region_traces: vec![RegionTrace {
                cycle_traces: vec![
                    CycleTrace {
                        shard_traces: vec![first],
                    },
                    CycleTrace {
                        shard_traces: vec![second],
                    },
                ],
            }],
        };
        let expected = merkle_root(&[Digest([1u8; 32]), Digest([2u8; 32])]);
        assert_eq!(trace.calculate_action_merkle_root(), expected);
    }
}
