use std::collections::HashSet;
use std::mem;

use tracing::debug;

use crate::errors::ChainResult;
use crate::state::{Database, GeneratedTransactionObject};
use crate::types::{
    AccountName, BlockHeader, BlockTrace, CycleTrace, Region, RegionTrace, SignedBlock,
    Transaction,
};

#[derive(Default)]
struct ShardScopes {
    reads: HashSet<AccountName>,
    writes: HashSet<AccountName>,
}

/// Places transactions into the shards of the cycle being assembled. A write
/// scope belongs to exactly one shard and excludes reads of it elsewhere;
/// read scopes may repeat across shards.
#[derive(Default)]
pub struct CycleScheduler {
    shards: Vec<ShardScopes>,
}

impl CycleScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// The shard this transaction must run in, or `None` when its scopes are
    /// already split across shards and only a fresh cycle can take it.
    pub fn schedule(&mut self, trx: &Transaction) -> Option<usize> {
        let mut forced: Option<usize> = None;
        for (index, shard) in self.shards.iter().enumerate() {
            let writes_touched = trx
                .write_scope
                .iter()
                .chain(trx.read_scope.iter())
                .any(|scope| shard.writes.contains(scope));
            let reads_blocked = trx
                .write_scope
                .iter()
                .any(|scope| shard.reads.contains(scope));
            if writes_touched || reads_blocked {
                match forced {
                    None => forced = Some(index),
                    Some(existing) if existing == index => {}
                    Some(_) => return None,
                }
            }
        }
        let index = forced.unwrap_or_else(|| {
            self.shards.push(ShardScopes::default());
            self.shards.len() - 1
        });
        let shard = &mut self.shards[index];
        shard.reads.extend(trx.read_scope.iter().cloned());
        shard.writes.extend(trx.write_scope.iter().cloned());
        Some(index)
    }
}

/// The block under assembly together with its trace and cycle scheduling
/// state. Exactly one of these exists while the controller has a pending
/// block; the paired store session lives next to it on the controller.
pub struct PendingState {
    pub block: SignedBlock,
    pub block_trace: BlockTrace,
    pub cycle_trace: CycleTrace,
    pub scheduler: CycleScheduler,
}

impl PendingState {
    pub fn new() -> Self {
        let mut block = SignedBlock::new(BlockHeader::default());
        block.regions.push(Region {
            region: 0,
            cycles: Vec::new(),
        });
        let mut block_trace = BlockTrace::default();
        block_trace.region_traces.push(RegionTrace::default());
        let mut pending = Self {
            block,
            block_trace,
            cycle_trace: CycleTrace::default(),
            scheduler: CycleScheduler::new(),
        };
        pending.start_cycle();
        pending
    }

    pub fn start_cycle(&mut self) {
        let region = self.block.regions.last_mut().expect("pending region");
        region.cycles.push(Vec::new());
        self.cycle_trace = CycleTrace::default();
        self.scheduler = CycleScheduler::new();
        self.start_shard();
    }

    pub fn start_shard(&mut self) {
        let region = self.block.regions.last_mut().expect("pending region");
        let cycle = region.cycles.last_mut().expect("pending cycle");
        cycle.push(Vec::new());
        self.cycle_trace.shard_traces.push(Default::default());
    }

    pub fn cycle_index(&self) -> u32 {
        let region = self.block.regions.last().expect("pending region");
        (region.cycles.len() - 1) as u32
    }

    pub fn shard_count(&self) -> usize {
        let region = self.block.regions.last().expect("pending region");
        region.cycles.last().map(Vec::len).unwrap_or(0)
    }

    /// Seals the open cycle: computes every shard root, emits its deferred
    /// transactions and console output, and folds the cycle trace into the
    /// block trace.
    pub fn finalize_cycle(&mut self, db: &mut Database) -> ChainResult<()> {
        for shard in &mut self.cycle_trace.shard_traces {
            shard.calculate_root();
        }
        let cycle_trace = mem::take(&mut self.cycle_trace);
        apply_cycle_trace(db, &cycle_trace)?;
        let region_trace = self
            .block_trace
            .region_traces
            .last_mut()
            .expect("pending region trace");
        region_trace.cycle_traces.push(cycle_trace);
        Ok(())
    }
}

/// Parks the cycle's deferred transactions in the generated-transaction
/// table (packed canonically) and routes contract console output to the log.
pub fn apply_cycle_trace(db: &mut Database, cycle_trace: &CycleTrace) -> ChainResult<()> {
    for shard in &cycle_trace.shard_traces {
        for trace in &shard.transaction_traces {
            for deferred in &trace.deferred_transactions {
                let packed = bincode::serialize(deferred)?;
                db.generated_transactions.create(GeneratedTransactionObject {
                    trx_id: deferred.id(),
                    sender: deferred.sender.clone(),
                    sender_id: deferred.sender_id,
                    expiration_sec: deferred.transaction.expiration_sec,
                    delay_until_sec: deferred.execute_after_sec,
                    packed,
                })?;
            }
            for action in &trace.action_traces {
                if !action.console.is_empty() {
                    debug!(
                        scope = %action.action.scope,
                        action = %action.action.name,
                        receiver = %action.receiver,
                        console = %action.console,
                        "contract console output"
                    );
                }
            }
        }
    }
    Ok(())
}

impl Default for PendingState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeferredTransaction, Digest, TransactionTrace};

    fn trx(reads: &[&str], writes: &[&str]) -> Transaction {
        Transaction {
            read_scope: reads.iter().map(|s| s.to_string()).collect(),
            write_scope: writes.iter().map(|s| s.to_string()).collect(),
            ..Transaction::default()
        }
    }

    #[test]
    fn disjoint_writers_land_in_parallel_shards() {
        let mut scheduler = CycleScheduler::new();
        assert_eq!(scheduler.schedule(&trx(&[], &["a"])), Some(0));
        assert_eq!(scheduler.schedule(&trx(&[], &["b"])), Some(1));
        assert_eq!(scheduler.schedule(&trx(&[], &["a"])), Some(0));
        assert_eq!(scheduler.shard_count(), 2);
    }

    #[test]
    fn readers_join_the_shard_that_writes_their_scope() {
        let mut scheduler = CycleScheduler::new();
        assert_eq!(scheduler.schedule(&trx(&[], &["a"])), Some(0));
        assert_eq!(scheduler.schedule(&trx(&["a"], &["c"])), Some(0));
        // a scope only read can still be read elsewhere
        assert_eq!(scheduler.schedule(&trx(&["x"], &["d"])), Some(1));
        assert_eq!(scheduler.schedule(&trx(&["x"], &["e"])), Some(2));
    }

    #[test]
    fn scopes_split_across_shards_force_a_new_cycle() {
        let mut scheduler = CycleScheduler::new();
        assert_eq!(scheduler.schedule(&trx(&[], &["a"])), Some(0));
        assert_eq!(scheduler.schedule(&trx(&[], &["b"])), Some(1));
        assert_eq!(scheduler.schedule(&trx(&[], &["a", "b"])), None);
        assert_eq!(scheduler.schedule(&trx(&["a", "b"], &["c"])), None);
    }

    #[test]
    fn writing_a_scope_read_elsewhere_forces_that_shard_or_a_new_cycle() {
        let mut scheduler = CycleScheduler::new();
        assert_eq!(scheduler.schedule(&trx(&["q"], &["a"])), Some(0));
        // writing q must co-locate with the reader of q
        assert_eq!(scheduler.schedule(&trx(&[], &["q"])), Some(0));

        let mut scheduler = CycleScheduler::new();
        assert_eq!(scheduler.schedule(&trx(&["q"], &["a"])), Some(0));
        assert_eq!(scheduler.schedule(&trx(&["q"], &["b"])), Some(1));
        // q is now read in two shards; writing it cannot be placed
        assert_eq!(scheduler.schedule(&trx(&[], &["q"])), None);
    }

    #[test]
    fn pending_state_tracks_cycles_and_shards() {
        let mut pending = PendingState::new();
        assert_eq!(pending.cycle_index(), 0);
        assert_eq!(pending.shard_count(), 1);
        pending.start_shard();
        assert_eq!(pending.shard_count(), 2);

        let mut db = Database::new();
        pending.finalize_cycle(&mut db).unwrap();
        pending.start_cycle();
        assert_eq!(pending.cycle_index(), 1);
        assert_eq!(pending.shard_count(), 1);
        assert_eq!(pending.block_trace.region_traces[0].cycle_traces.len(), 1);
    }

    #[test]
    fn finalize_emits_deferred_transactions() {
        let mut pending = PendingState::new();
        let deferred = DeferredTransaction {
            sender: "alice".into(),
            sender_id: 4,
            execute_after_sec: 90,
            transaction: trx(&[], &["alice"]),
        };
        let mut trace = TransactionTrace::new(Digest([1u8; 32]));
        trace.deferred_transactions.push(deferred.clone());
        pending.cycle_trace.shard_traces[0].append(trace);

        let mut db = Database::new();
        pending.finalize_cycle(&mut db).unwrap();
        let row = db.generated_transactions.get(&deferred.id()).unwrap();
        assert_eq!(row.sender, "alice");
        assert_eq!(row.delay_until_sec, 90);
        let unpacked: DeferredTransaction = bincode::deserialize(&row.packed).unwrap();
        assert_eq!(unpacked, deferred);
    }
}
