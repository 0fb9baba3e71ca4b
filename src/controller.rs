use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use ed25519_dalek::Keypair;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::authority::{lookup_minimum_permission, permission_satisfies, AuthorityChecker};
use crate::block_log::BlockLog;
use crate::config::{
    ChainConfig, ACTIVE_PERMISSION, ALL_SCOPE, AUTH_SCOPE, OWNER_PERMISSION, PERCENT_100,
    PRODUCERS_ACCOUNT, SYSTEM_ACCOUNT,
};
use crate::crypto::{digest, public_key_from_hex, public_key_to_hex};
use crate::errors::{ChainError, ChainResult};
use crate::execution::{
    self, AdjustProducerVotes, ApplyContext, ApplyHandler, NewAccount, RegisterProducer,
    ADJUST_VOTES_ACTION, NEW_ACCOUNT_ACTION, REGISTER_PRODUCER_ACTION,
};
use crate::fork_db::{ForkDatabase, ForkItem};
use crate::pending::{apply_cycle_trace, PendingState};
use crate::scheduler::{
    calculate_producer_schedule, head_producer_schedule, is_start_of_round, SchedulerView,
};
use crate::state::{
    AccountObject, BlockSummaryObject, Database, DynamicGlobalPropertyObject,
    GlobalPropertyObject, PermissionObject, ProducerObject, TransactionObject,
};
use crate::store::Session;
use crate::types::{
    AccountName, Action, ActionName, ActionTrace, Authority, BlockId, BlockTrace, CycleTrace,
    Digest, PermissionLevel, ProducerSchedule, ReceiptStatus, RegionTrace, ShardTrace,
    SignedBlock, SignedTransaction, Transaction, TransactionId, TransactionReceipt,
    TransactionTrace,
};

/// Validation steps an entry point may bypass. `RECEIVED_BLOCK` is not a
/// bypass, it marks blocks that arrived from the network.
pub mod skip {
    pub const NOTHING: u32 = 0;
    pub const PRODUCER_SIGNATURE: u32 = 1 << 0;
    pub const TRANSACTION_SIGNATURES: u32 = 1 << 1;
    pub const TRANSACTION_DUPE_CHECK: u32 = 1 << 2;
    pub const FORK_DB: u32 = 1 << 3;
    pub const TAPOS_CHECK: u32 = 1 << 4;
    pub const AUTHORITY_CHECK: u32 = 1 << 5;
    pub const MERKLE_CHECK: u32 = 1 << 6;
    pub const PRODUCER_SCHEDULE_CHECK: u32 = 1 << 7;
    pub const SCOPE_CHECK: u32 = 1 << 8;
    pub const RECEIVED_BLOCK: u32 = 1 << 9;
    pub const EVERYTHING: u32 = u32::MAX;
}

const FIXED_BANDWIDTH_OVERHEAD_PER_TRANSACTION: u64 = 100;

struct TransactionMetadata<'a> {
    trx: &'a Transaction,
    id: TransactionId,
    region_id: u16,
    cycle_index: u32,
    shard_index: u32,
}

type PendingTransactionObserver = Box<dyn Fn(&SignedTransaction) + Send + Sync>;
type AppliedBlockObserver = Box<dyn Fn(&SignedBlock, &BlockTrace) + Send + Sync>;
type IrreversibleBlockObserver = Box<dyn Fn(&SignedBlock) + Send + Sync>;

/// The deterministic core of the node: owns the canonical chain state,
/// arbitrates forks, applies transactions and blocks, produces blocks when
/// asked to, and advances the irreversible frontier. Every public entry
/// point serializes on the state lock.
pub struct ChainController {
    inner: Arc<RwLock<ControllerState>>,
}

struct ControllerState {
    config: ChainConfig,
    chain_id: Digest,
    db: Database,
    fork_db: ForkDatabase,
    block_log: BlockLog,
    pending: Option<PendingState>,
    pending_session: Option<Session>,
    checkpoints: BTreeMap<u64, BlockId>,
    skip_flags: u32,
    applying_block: bool,
    replaying: bool,
    apply_handlers: HashMap<(AccountName, AccountName, ActionName), ApplyHandler>,
    pending_transaction_observers: Vec<PendingTransactionObserver>,
    applied_block_observers: Vec<AppliedBlockObserver>,
    irreversible_block_observers: Vec<IrreversibleBlockObserver>,
}

impl ChainController {
    pub fn new(config: ChainConfig, data_dir: &Path) -> ChainResult<Self> {
        config.validate()?;
        let chain_id = digest(config.genesis.chain_id.as_bytes());
        let block_log = BlockLog::open(&data_dir.join("blocks"))?;
        let mut state = ControllerState {
            config,
            chain_id,
            db: Database::new(),
            fork_db: ForkDatabase::new(),
            block_log,
            pending: None,
            pending_session: None,
            checkpoints: BTreeMap::new(),
            skip_flags: skip::NOTHING,
            applying_block: false,
            replaying: false,
            apply_handlers: HashMap::new(),
            pending_transaction_observers: Vec::new(),
            applied_block_observers: Vec::new(),
            irreversible_block_observers: Vec::new(),
        };
        for (key, handler) in execution::native_handlers() {
            state.apply_handlers.insert(key, handler);
        }
        state.initialize_chain()?;
        state.spinup_db()?;
        state.spinup_fork_db()?;
        if state.block_log.head_num().unwrap_or(0) > state.head_block_num()? {
            state.replay_blocks()?;
        }
        Ok(Self {
            inner: Arc::new(RwLock::new(state)),
        })
    }

    pub fn chain_id(&self) -> Digest {
        self.inner.read().chain_id
    }

    /// Feeds a candidate block through fork arbitration and, when it lands
    /// on or overtakes the canonical branch, applies it. Returns true iff a
    /// fork switch occurred. Pending transactions are discarded first.
    pub fn push_block(&self, block: SignedBlock, skip_flags: u32) -> ChainResult<bool> {
        let mut state = self.inner.write();
        state.clear_pending_impl();
        state.with_skip_flags(skip_flags, |state| state.push_block_impl(block))
    }

    /// Validates, schedules and executes a transaction inside the pending
    /// block, starting one when none is open.
    pub fn push_transaction(
        &self,
        trx: SignedTransaction,
        skip_flags: u32,
    ) -> ChainResult<TransactionTrace> {
        let mut state = self.inner.write();
        state.with_skip_flags(skip_flags, |state| state.push_transaction_impl(&trx))
    }

    /// Seals the pending block for the scheduled producer, signs it, applies
    /// it to the chain state and hands it to the fork database.
    pub fn generate_block(
        &self,
        when_ms: u64,
        producer: &str,
        signing_key: &Keypair,
        skip_flags: u32,
    ) -> ChainResult<SignedBlock> {
        let mut state = self.inner.write();
        state.with_skip_flags(skip_flags, |state| {
            state.generate_block_impl(when_ms, producer, signing_key)
        })
    }

    /// Removes the head block, rewinding the store by one revision.
    pub fn pop_block(&self) -> ChainResult<()> {
        self.inner.write().pop_block_impl()
    }

    /// Discards the pending block and rolls its session back.
    pub fn clear_pending(&self) {
        self.inner.write().clear_pending_impl();
    }

    /// Rebuilds the chain state from genesis plus every block in the log.
    pub fn replay(&self) -> ChainResult<()> {
        self.inner.write().replay_impl()
    }

    pub fn add_checkpoints(&self, checkpoints: &BTreeMap<u64, BlockId>) {
        let mut state = self.inner.write();
        for (num, id) in checkpoints {
            state.checkpoints.insert(*num, *id);
        }
    }

    pub fn before_last_checkpoint(&self) -> bool {
        let state = self.inner.read();
        match state.checkpoints.keys().next_back() {
            Some(&last) => {
                last >= state
                    .head_block_num()
                    .unwrap_or(u64::MAX)
            }
            None => false,
        }
    }

    pub fn head_block_num(&self) -> ChainResult<u64> {
        self.inner.read().head_block_num()
    }

    pub fn head_block_id(&self) -> ChainResult<BlockId> {
        self.inner.read().head_block_id()
    }

    pub fn head_block_time_ms(&self) -> ChainResult<u64> {
        self.inner.read().head_block_time_ms()
    }

    pub fn head_block_producer(&self) -> ChainResult<AccountName> {
        Ok(self.inner.read().db.dynamic_property()?.current_producer.clone())
    }

    pub fn last_irreversible_block_num(&self) -> ChainResult<u64> {
        Ok(self
            .inner
            .read()
            .db
            .dynamic_property()?
            .last_irreversible_block_num)
    }

    pub fn producer_participation_rate(&self) -> ChainResult<u32> {
        let state = self.inner.read();
        let gpo = state.db.global_property()?;
        let dgp = state.db.dynamic_property()?;
        let view = SchedulerView {
            params: &gpo.params,
            gpo,
            dgp,
        };
        Ok(view.participation_rate())
    }

    /// Producer owed the slot `slot_num` intervals past the head.
    pub fn get_scheduled_producer(&self, slot_num: u64) -> ChainResult<AccountName> {
        let state = self.inner.read();
        let gpo = state.db.global_property()?;
        let dgp = state.db.dynamic_property()?;
        let view = SchedulerView {
            params: &gpo.params,
            gpo,
            dgp,
        };
        view.scheduled_producer(slot_num)
    }

    pub fn get_slot_time_ms(&self, slot_num: u64) -> ChainResult<u64> {
        let state = self.inner.read();
        let gpo = state.db.global_property()?;
        let dgp = state.db.dynamic_property()?;
        let view = SchedulerView {
            params: &gpo.params,
            gpo,
            dgp,
        };
        Ok(view.slot_time_ms(slot_num))
    }

    pub fn get_slot_at_time_ms(&self, when_ms: u64) -> ChainResult<u64> {
        let state = self.inner.read();
        let gpo = state.db.global_property()?;
        let dgp = state.db.dynamic_property()?;
        let view = SchedulerView {
            params: &gpo.params,
            gpo,
            dgp,
        };
        Ok(view.slot_at_time_ms(when_ms))
    }

    pub fn fetch_block_by_id(&self, id: &BlockId) -> ChainResult<Option<SignedBlock>> {
        self.inner.read().fetch_block_by_id_impl(id)
    }

    pub fn fetch_block_by_number(&self, num: u64) -> ChainResult<Option<SignedBlock>> {
        self.inner.read().fetch_block_by_number_impl(num)
    }

    pub fn is_known_block(&self, id: &BlockId) -> bool {
        let state = self.inner.read();
        state.fork_db.is_known_block(id) || state.block_log.contains_id(id)
    }

    pub fn is_known_transaction(&self, id: &TransactionId) -> bool {
        self.inner.read().db.transactions.contains(id)
    }

    /// Ids from a fork tip back to and including the common ancestor with
    /// the canonical chain.
    pub fn get_block_ids_on_fork(&self, head_of_fork: &BlockId) -> ChainResult<Vec<BlockId>> {
        self.inner.read().get_block_ids_on_fork_impl(head_of_fork)
    }

    /// The minimal subset of `candidate_keys` that satisfies every declared
    /// authority of the transaction.
    pub fn get_required_keys(
        &self,
        trx: &SignedTransaction,
        candidate_keys: &BTreeSet<String>,
    ) -> ChainResult<BTreeSet<String>> {
        self.inner.read().get_required_keys_impl(trx, candidate_keys)
    }

    pub fn set_apply_handler(
        &self,
        receiver: &str,
        scope: &str,
        action: &str,
        handler: ApplyHandler,
    ) {
        self.inner.write().apply_handlers.insert(
            (receiver.to_string(), scope.to_string(), action.to_string()),
            handler,
        );
    }

    pub fn on_pending_transaction(&self, observer: PendingTransactionObserver) {
        self.inner.write().pending_transaction_observers.push(observer);
    }

    pub fn on_applied_block(&self, observer: AppliedBlockObserver) {
        self.inner.write().applied_block_observers.push(observer);
    }

    pub fn on_applied_irreversible_block(&self, observer: IrreversibleBlockObserver) {
        self.inner.write().irreversible_block_observers.push(observer);
    }
}

impl Drop for ControllerState {
    fn drop(&mut self) {
        self.clear_pending_impl();
    }
}

impl ControllerState {
    fn with_skip_flags<R>(
        &mut self,
        flags: u32,
        f: impl FnOnce(&mut Self) -> ChainResult<R>,
    ) -> ChainResult<R> {
        let previous = self.skip_flags;
        self.skip_flags = flags;
        let result = f(self);
        self.skip_flags = previous;
        result
    }

    fn skipping(&self, flag: u32) -> bool {
        self.skip_flags & flag != 0
    }

    fn head_block_num(&self) -> ChainResult<u64> {
        Ok(self.db.dynamic_property()?.head_block_number)
    }

    fn head_block_id(&self) -> ChainResult<BlockId> {
        Ok(self.db.dynamic_property()?.head_block_id)
    }

    fn head_block_time_ms(&self) -> ChainResult<u64> {
        Ok(self.db.dynamic_property()?.time_ms)
    }

    fn head_time_sec(&self) -> ChainResult<u64> {
        Ok(self.head_block_time_ms()? / 1_000)
    }

    // ---- genesis & spin-up -------------------------------------------------

    fn initialize_chain(&mut self) -> ChainResult<()> {
        if !self.db.global_properties.is_empty() {
            return Ok(());
        }
        info!(chain = %self.config.genesis.chain_id, "initializing chain state from genesis");
        let genesis = self.config.genesis.clone();
        self.create_native_account(
            SYSTEM_ACCOUNT,
            Authority::single_key(genesis.system_key.clone()),
        )?;
        self.create_native_account(
            PRODUCERS_ACCOUNT,
            Authority {
                threshold: 1,
                keys: Vec::new(),
                accounts: Vec::new(),
                waits: Vec::new(),
            },
        )?;
        self.db.global_properties.create(GlobalPropertyObject {
            params: self.config.params.clone(),
            active_producers: ProducerSchedule::default(),
            pending_active_producers: Vec::new(),
        })?;
        self.db.dynamic_properties.create(DynamicGlobalPropertyObject {
            time_ms: genesis.timestamp_ms,
            recent_slots_filled: u64::MAX,
            ..DynamicGlobalPropertyObject::default()
        })?;
        for slot in 0..0x10000u64 {
            self.db.block_summaries.create(BlockSummaryObject {
                slot,
                block_id: BlockId::default(),
            })?;
        }

        let genesis_trx = self.build_genesis_transaction(&genesis)?;
        info!(actions = genesis_trx.actions.len(), "applying genesis transaction");
        let flags = skip::SCOPE_CHECK
            | skip::TRANSACTION_SIGNATURES
            | skip::AUTHORITY_CHECK
            | skip::RECEIVED_BLOCK;
        self.applying_block = true;
        let applied = self.with_skip_flags(flags, |state| {
            let meta = TransactionMetadata {
                trx: &genesis_trx,
                id: genesis_trx.id(),
                region_id: 0,
                cycle_index: 0,
                shard_index: 0,
            };
            state.apply_transaction(&meta)
        });
        self.applying_block = false;
        applied?;

        let computed = calculate_producer_schedule(&self.db)?;
        let schedule = ProducerSchedule {
            version: 0,
            producers: computed.producers,
        };
        self.db
            .modify_global_property(|gpo| gpo.active_producers = schedule.clone())?;
        self.update_producers_authority()
    }

    fn create_native_account(&mut self, name: &str, authority: Authority) -> ChainResult<()> {
        self.db.accounts.create(AccountObject {
            name: name.to_string(),
            bandwidth_bytes: 0,
        })?;
        let owner_id = self.db.permissions.create(PermissionObject {
            owner: name.to_string(),
            name: OWNER_PERMISSION.to_string(),
            parent: None,
            authority: authority.clone(),
        })?;
        self.db.permissions.create(PermissionObject {
            owner: name.to_string(),
            name: ACTIVE_PERMISSION.to_string(),
            parent: Some(owner_id),
            authority,
        })?;
        Ok(())
    }

    fn build_genesis_transaction(
        &self,
        genesis: &crate::config::GenesisConfig,
    ) -> ChainResult<Transaction> {
        let system_auth = vec![PermissionLevel::new(SYSTEM_ACCOUNT, ACTIVE_PERMISSION)];
        let mut actions = Vec::new();
        let mut new_account = |name: &str, key: &str| -> ChainResult<Action> {
            Ok(Action {
                scope: SYSTEM_ACCOUNT.to_string(),
                name: NEW_ACCOUNT_ACTION.to_string(),
                authorization: system_auth.clone(),
                data: bincode::serialize(&NewAccount {
                    creator: SYSTEM_ACCOUNT.to_string(),
                    name: name.to_string(),
                    owner: Authority::single_key(key),
                    active: Authority::single_key(key),
                })?,
            })
        };
        for account in &genesis.accounts {
            actions.push(new_account(&account.name, &account.key)?);
        }
        for producer in &genesis.producers {
            actions.push(new_account(&producer.name, &producer.signing_key)?);
            actions.push(Action {
                scope: SYSTEM_ACCOUNT.to_string(),
                name: REGISTER_PRODUCER_ACTION.to_string(),
                authorization: system_auth.clone(),
                data: bincode::serialize(&RegisterProducer {
                    producer: producer.name.clone(),
                    signing_key: producer.signing_key.clone(),
                })?,
            });
            if producer.votes > 0 {
                actions.push(Action {
                    scope: SYSTEM_ACCOUNT.to_string(),
                    name: ADJUST_VOTES_ACTION.to_string(),
                    authorization: system_auth.clone(),
                    data: bincode::serialize(&AdjustProducerVotes {
                        producer: producer.name.clone(),
                        delta: i128::from(producer.votes),
                    })?,
                });
            }
        }
        Ok(Transaction {
            expiration_sec: genesis.timestamp_ms / 1_000,
            write_scope: vec![ALL_SCOPE.to_string()],
            actions,
            ..Transaction::default()
        })
    }

    fn spinup_db(&mut self) -> ChainResult<()> {
        self.db.undo_all();
        let head = self.head_block_num()?;
        if self.db.revision() != head {
            return Err(ChainError::Config(format!(
                "store revision {} does not match head block {head}",
                self.db.revision()
            )));
        }
        Ok(())
    }

    fn spinup_fork_db(&mut self) -> ChainResult<()> {
        let Some(last_block) = self.block_log.read_head()? else {
            return Ok(());
        };
        let last_id = last_block.id();
        let item = self.fork_db.push_block(last_block)?;
        self.fork_db.set_head(item);
        if last_id != self.head_block_id()? && self.head_block_num()? != 0 {
            return Err(ChainError::Config(
                "last block in the log does not match the chain state".into(),
            ));
        }
        Ok(())
    }

    fn replay_impl(&mut self) -> ChainResult<()> {
        self.clear_pending_impl();
        self.db = Database::new();
        self.fork_db = ForkDatabase::new();
        self.initialize_chain()?;
        self.spinup_fork_db()?;
        if self.block_log.head_num().unwrap_or(0) > self.head_block_num()? {
            self.replay_blocks()?;
        }
        Ok(())
    }

    fn replay_blocks(&mut self) -> ChainResult<()> {
        let last_block_num = self.block_log.head_num().unwrap_or(0);
        info!(blocks = last_block_num, "replaying blockchain from the log");
        self.replaying = true;
        let replayed = (|| -> ChainResult<()> {
            for num in 1..=last_block_num {
                let block = self.block_log.read_block_by_num(num)?.ok_or_else(|| {
                    ChainError::CorruptLog(format!("block {num} missing during replay"))
                })?;
                self.apply_block(
                    &block,
                    skip::PRODUCER_SIGNATURE
                        | skip::TRANSACTION_SIGNATURES
                        | skip::TRANSACTION_DUPE_CHECK
                        | skip::TAPOS_CHECK
                        | skip::PRODUCER_SCHEDULE_CHECK
                        | skip::AUTHORITY_CHECK
                        | skip::RECEIVED_BLOCK,
                )?;
            }
            Ok(())
        })();
        self.replaying = false;
        replayed?;
        let head = self.head_block_num()?;
        self.db.set_revision(head)?;
        info!(head, "replay complete");
        Ok(())
    }

    // ---- block push & fork arbitration ------------------------------------

    fn push_block_impl(&mut self, block: SignedBlock) -> ChainResult<bool> {
        let skip_flags = self.skip_flags;
        if !self.skipping(skip::FORK_DB) {
            let new_head = self.fork_db.push_block(block.clone())?;
            if new_head.previous != self.head_block_id()? {
                if new_head.num > self.head_block_num()? {
                    return self.switch_forks(new_head);
                }
                return Ok(false);
            }
        }
        let session = self.db.start_undo_session(true);
        match self.apply_block(&block, skip_flags) {
            Ok(()) => {
                self.db.push_session(session);
                Ok(false)
            }
            Err(err) => {
                warn!(block = %block.id(), %err, "failed to push block");
                self.db.rollback_session(session);
                self.fork_db.remove(&block.id());
                Err(err)
            }
        }
    }

    fn switch_forks(&mut self, new_head: Arc<ForkItem>) -> ChainResult<bool> {
        let skip_flags = self.skip_flags;
        let head_id = self.head_block_id()?;
        info!(new_head = %new_head.id, num = new_head.num, "switching forks");
        let (branch_new, branch_old) = self.fork_db.fetch_branch_from(&new_head.id, &head_id)?;
        let common_parent = branch_new
            .last()
            .map(|item| item.previous)
            .ok_or_else(|| {
                ChainError::NoCommonAncestor("fork head does not extend the common ancestor".into())
            })?;

        // rewind to the fork point; the abandoned branch stays in the fork db
        while self.head_block_id()? != common_parent {
            self.db.undo()?;
        }
        for item in branch_new.iter().rev() {
            debug!(num = item.num, id = %item.id, "applying block from new fork");
            let session = self.db.start_undo_session(true);
            match self.apply_block(&item.block, skip_flags) {
                Ok(()) => self.db.push_session(session),
                Err(err) => {
                    warn!(id = %item.id, %err, "exception while switching forks");
                    self.db.rollback_session(session);
                    // the failed block and everything built on it is invalid
                    self.fork_db.remove(&item.id);
                    if let Some(old_tip) = branch_old.first() {
                        self.fork_db.set_head(old_tip.clone());
                    } else if let Some(parent) = self.fork_db.fetch_block(&common_parent) {
                        self.fork_db.set_head(parent);
                    }
                    while self.head_block_id()? != common_parent {
                        self.db.undo()?;
                    }
                    for old_item in branch_old.iter().rev() {
                        let session = self.db.start_undo_session(true);
                        self.apply_block(&old_item.block, skip_flags)?;
                        self.db.push_session(session);
                    }
                    return Err(err);
                }
            }
        }
        Ok(true)
    }

    fn pop_block_impl(&mut self) -> ChainResult<()> {
        self.clear_pending_impl();
        // revisions released by commit are irreversible and cannot be popped
        if self.db.reversible_revisions() == 0 {
            return Err(ChainError::PopEmptyChain);
        }
        self.fork_db.pop_block()?;
        self.db.undo()?;
        Ok(())
    }

    fn clear_pending_impl(&mut self) {
        self.pending = None;
        if let Some(session) = self.pending_session.take() {
            self.db.rollback_session(session);
        }
    }

    // ---- transaction push -------------------------------------------------

    fn push_transaction_impl(&mut self, trx: &SignedTransaction) -> ChainResult<TransactionTrace> {
        if self.pending.is_none() {
            self.start_pending_block()?;
        }
        let temp_session = self.db.start_undo_session(true);
        match self.apply_pushed_transaction(trx) {
            Ok(trace) => {
                self.db.squash_session(temp_session);
                for observer in &self.pending_transaction_observers {
                    observer(trx);
                }
                Ok(trace)
            }
            Err(err) => {
                self.db.rollback_session(temp_session);
                Err(err)
            }
        }
    }

    fn apply_pushed_transaction(
        &mut self,
        trx: &SignedTransaction,
    ) -> ChainResult<TransactionTrace> {
        if !self.skipping(skip::SCOPE_CHECK) {
            validate_scope(&trx.transaction)?;
        }
        self.validate_referenced_accounts(&trx.transaction)?;
        self.check_transaction_authorization(trx, false)?;
        self.validate_tapos(&trx.transaction)?;
        self.validate_expiration(&trx.transaction)?;

        let shard = {
            let pending = self.pending.as_mut().expect("pending block");
            match pending.scheduler.schedule(&trx.transaction) {
                Some(shard) => shard,
                None => {
                    // scope conflict: seal this cycle and place into a fresh one
                    pending.finalize_cycle(&mut self.db)?;
                    pending.start_cycle();
                    pending.scheduler.schedule(&trx.transaction).ok_or_else(|| {
                        ChainError::Transaction(
                            "transaction scopes cannot be scheduled in an empty cycle".into(),
                        )
                    })?
                }
            }
        };
        {
            let pending = self.pending.as_mut().expect("pending block");
            while pending.shard_count() <= shard {
                pending.start_shard();
            }
        }
        let meta = TransactionMetadata {
            trx: &trx.transaction,
            id: trx.id(),
            region_id: 0,
            cycle_index: self.pending.as_ref().expect("pending block").cycle_index(),
            shard_index: shard as u32,
        };
        let trace = self.apply_transaction(&meta)?;

        let pending = self.pending.as_mut().expect("pending block");
        let region = pending.block.regions.last_mut().expect("pending region");
        let cycle = region.cycles.last_mut().expect("pending cycle");
        cycle[shard].push(TransactionReceipt {
            id: trace.id,
            status: ReceiptStatus::Executed,
        });
        pending.cycle_trace.shard_traces[shard].append(trace.clone());
        pending.block.input_transactions.push(trx.clone());
        Ok(trace)
    }

    fn start_pending_block(&mut self) -> ChainResult<()> {
        debug_assert!(self.pending.is_none() && self.pending_session.is_none());
        self.pending = Some(PendingState::new());
        self.pending_session = Some(self.db.start_undo_session(true));
        Ok(())
    }

    // ---- transaction application (shared by push and block replay) --------

    fn apply_transaction(&mut self, meta: &TransactionMetadata) -> ChainResult<TransactionTrace> {
        self.validate_uniqueness(&meta.id)?;
        let mut result = TransactionTrace::new(meta.id);
        for act in &meta.trx.actions {
            let receiver = act.scope.clone();
            let handler = self.find_apply_handler(&receiver, &act.scope, &act.name);
            let mut context = ApplyContext {
                db: &mut self.db,
                chain_id: self.chain_id,
                trx: meta.trx,
                act,
                receiver: receiver.clone(),
                region_id: meta.region_id,
                cycle_index: meta.cycle_index,
                shard_index: meta.shard_index,
                console: String::new(),
                deferred_transactions: Vec::new(),
            };
            if let Some(handler) = handler {
                handler(&mut context)?;
            }
            let console = context.console;
            let deferred = context.deferred_transactions;
            result.action_traces.push(ActionTrace {
                receiver,
                action: act.clone(),
                console,
                region_id: meta.region_id,
                cycle_index: meta.cycle_index,
                shard_index: meta.shard_index,
            });
            result.deferred_transactions.extend(deferred);
        }

        // bandwidth is tracked per authorizing account, never enforced
        let usage = meta.trx.canonical_bytes().len() as u64
            + FIXED_BANDWIDTH_OVERHEAD_PER_TRANSACTION;
        let mut authorizers: BTreeSet<AccountName> = BTreeSet::new();
        for act in &meta.trx.actions {
            for auth in &act.authorization {
                authorizers.insert(auth.actor.clone());
            }
        }
        for account in authorizers {
            if self.db.accounts.contains(&account) {
                self.db
                    .accounts
                    .modify(&account, |row| row.bandwidth_bytes += usage)?;
            }
        }
        self.record_transaction(meta)?;
        Ok(result)
    }

    fn find_apply_handler(
        &self,
        receiver: &str,
        scope: &str,
        action: &str,
    ) -> Option<ApplyHandler> {
        self.apply_handlers
            .get(&(receiver.to_string(), scope.to_string(), action.to_string()))
            .cloned()
    }

    fn record_transaction(&mut self, meta: &TransactionMetadata) -> ChainResult<()> {
        if self.skipping(skip::TRANSACTION_DUPE_CHECK) {
            return Ok(());
        }
        self.db.transactions.create(TransactionObject {
            trx_id: meta.id,
            expiration_sec: meta.trx.expiration_sec,
        })?;
        Ok(())
    }

    // ---- transaction validation -------------------------------------------

    fn validate_referenced_accounts(&self, trx: &Transaction) -> ChainResult<()> {
        for scope in trx.read_scope.iter().chain(trx.write_scope.iter()) {
            self.require_scope(scope)?;
        }
        for act in &trx.actions {
            self.require_account(&act.scope)?;
            for auth in &act.authorization {
                self.require_account(&auth.actor)?;
            }
        }
        Ok(())
    }

    fn require_scope(&self, scope: &AccountName) -> ChainResult<()> {
        if scope == ALL_SCOPE || scope == AUTH_SCOPE {
            return Ok(());
        }
        self.require_account(scope)
    }

    fn require_account(&self, name: &AccountName) -> ChainResult<()> {
        if self.db.accounts.contains(name) {
            return Ok(());
        }
        Err(ChainError::UnknownAccount(name.clone()))
    }

    fn check_transaction_authorization(
        &self,
        trx: &SignedTransaction,
        allow_unused_signatures: bool,
    ) -> ChainResult<()> {
        let check_signatures = !self.skipping(skip::TRANSACTION_SIGNATURES);
        let provided_keys = if check_signatures {
            trx.signature_keys(&self.chain_id)?
        } else {
            BTreeSet::new()
        };
        let db = &self.db;
        let max_depth = db.global_property()?.params.max_authority_depth;
        let mut checker = AuthorityChecker::new(
            |level: &PermissionLevel| {
                db.permissions
                    .find(&(level.actor.clone(), level.permission.clone()))
                    .map(|permission| permission.authority.clone())
                    .ok_or_else(|| {
                        ChainError::UnknownAccount(format!(
                            "{}@{}",
                            level.actor, level.permission
                        ))
                    })
            },
            max_depth,
            provided_keys,
            BTreeSet::new(),
        );
        for act in &trx.transaction.actions {
            for declared in &act.authorization {
                let declared_key = (declared.actor.clone(), declared.permission.clone());
                if !db.permissions.contains(&declared_key) {
                    return Err(ChainError::UnknownAccount(format!(
                        "{}@{}",
                        declared.actor, declared.permission
                    )));
                }
                let minimum =
                    lookup_minimum_permission(db, &declared.actor, &act.scope, &act.name)?;
                if !self.skipping(skip::AUTHORITY_CHECK)
                    && !permission_satisfies(db, declared, &minimum)?
                {
                    return Err(ChainError::IrrelevantAuth(format!(
                        "{}@{} is weaker than the required {}@{minimum}",
                        declared.actor, declared.permission, declared.actor
                    )));
                }
                if check_signatures && !checker.satisfied(declared)? {
                    return Err(ChainError::MissingSigs(format!(
                        "{}@{}",
                        declared.actor, declared.permission
                    )));
                }
            }
        }
        if check_signatures && !allow_unused_signatures && !checker.all_keys_used() {
            let unused: Vec<String> = checker.unused_keys().into_iter().collect();
            return Err(ChainError::IrrelevantSig(unused.join(", ")));
        }
        Ok(())
    }

    fn validate_uniqueness(&self, id: &TransactionId) -> ChainResult<()> {
        if self.skipping(skip::TRANSACTION_DUPE_CHECK) {
            return Ok(());
        }
        if self.db.transactions.contains(id) {
            return Err(ChainError::DuplicateTransaction(id.to_string()));
        }
        Ok(())
    }

    fn validate_tapos(&self, trx: &Transaction) -> ChainResult<()> {
        if self.skipping(skip::TAPOS_CHECK) {
            return Ok(());
        }
        let summary = self
            .db
            .block_summaries
            .get(&u64::from(trx.ref_block_num))?;
        if summary.block_id.ref_prefix() != trx.ref_block_prefix {
            return Err(ChainError::Transaction(
                "transaction reference block does not match chain history; is it from another fork?"
                    .into(),
            ));
        }
        Ok(())
    }

    fn validate_expiration(&self, trx: &Transaction) -> ChainResult<()> {
        let now = self.head_time_sec()?;
        let lifetime = self.db.global_property()?.params.max_transaction_lifetime_sec;
        if trx.expiration_sec > now + lifetime {
            return Err(ChainError::Transaction(format!(
                "expiration {} is too far in the future (now {now})",
                trx.expiration_sec
            )));
        }
        if now > trx.expiration_sec {
            return Err(ChainError::Transaction(format!(
                "transaction expired at {} (now {now})",
                trx.expiration_sec
            )));
        }
        Ok(())
    }

    // ---- block application ------------------------------------------------

    fn apply_block(&mut self, block: &SignedBlock, mut skip_flags: u32) -> ChainResult<()> {
        let block_num = block.block_num();
        if let Some((&last_checkpoint, _)) = self.checkpoints.iter().next_back() {
            if let Some(expected) = self.checkpoints.get(&block_num) {
                if *expected != block.id() {
                    return Err(ChainError::CheckpointMismatch(format!(
                        "block {block_num} has id {} but checkpoint requires {expected}",
                        block.id()
                    )));
                }
            }
            if last_checkpoint >= block_num {
                // deep history below the last checkpoint needs no re-validation
                skip_flags = skip::EVERYTHING;
            }
        }
        let was_applying = self.applying_block;
        self.applying_block = true;
        let result = self.with_skip_flags(skip_flags, |state| state.apply_block_impl(block));
        self.applying_block = was_applying;
        result
    }

    fn apply_block_impl(&mut self, block: &SignedBlock) -> ChainResult<()> {
        self.validate_block_header(block)?;
        for window in block.regions.windows(2) {
            if window[0].region >= window[1].region {
                return Err(ChainError::BlockValidate(
                    "regions must be listed in ascending order".into(),
                ));
            }
        }
        let mut trx_index: HashMap<TransactionId, &SignedTransaction> = HashMap::new();
        for trx in &block.input_transactions {
            trx_index.insert(trx.id(), trx);
        }

        let mut block_trace = BlockTrace::default();
        for region in &block.regions {
            let mut region_trace = RegionTrace::default();
            for (cycle_index, cycle) in region.cycles.iter().enumerate() {
                let mut cycle_trace = CycleTrace::default();
                for (shard_index, shard) in cycle.iter().enumerate() {
                    let mut shard_trace = ShardTrace::default();
                    for receipt in shard {
                        if receipt.status != ReceiptStatus::Executed {
                            continue;
                        }
                        let trx = trx_index.get(&receipt.id).ok_or_else(|| {
                            ChainError::BlockValidate(format!(
                                "receipt {} has no input transaction; deferred execution is not supported",
                                receipt.id
                            ))
                        })?;
                        let meta = TransactionMetadata {
                            trx: &trx.transaction,
                            id: receipt.id,
                            region_id: region.region,
                            cycle_index: cycle_index as u32,
                            shard_index: shard_index as u32,
                        };
                        shard_trace.append(self.apply_transaction(&meta)?);
                    }
                    shard_trace.calculate_root();
                    cycle_trace.shard_traces.push(shard_trace);
                }
                apply_cycle_trace(&mut self.db, &cycle_trace)?;
                region_trace.cycle_traces.push(cycle_trace);
            }
            block_trace.region_traces.push(region_trace);
        }

        if !self.skipping(skip::MERKLE_CHECK) {
            let computed = block_trace.calculate_action_merkle_root();
            if computed != block.header.action_mroot {
                return Err(ChainError::BlockValidate(format!(
                    "action merkle root {computed} does not match header {}",
                    block.header.action_mroot
                )));
            }
        }
        self.finalize_block(block, &block_trace)
    }

    fn validate_block_header(&self, block: &SignedBlock) -> ChainResult<ProducerObject> {
        let header = &block.header;
        let dgp = self.db.dynamic_property()?.clone();
        let gpo = self.db.global_property()?;
        if header.previous != dgp.head_block_id {
            return Err(ChainError::BlockValidate(format!(
                "previous id {} does not match head {}",
                header.previous, dgp.head_block_id
            )));
        }
        if header.height != dgp.head_block_number + 1 {
            return Err(ChainError::BlockValidate(format!(
                "height {} does not follow head {}",
                header.height, dgp.head_block_number
            )));
        }
        if header.timestamp_ms <= dgp.time_ms {
            return Err(ChainError::BlockValidate(
                "block timestamp must advance past the head".into(),
            ));
        }
        if header.timestamp_ms % gpo.params.block_interval_ms != 0 {
            return Err(ChainError::BlockValidate(
                "block timestamp does not land on a slot boundary".into(),
            ));
        }
        if !is_start_of_round(header.height, &gpo.params) && header.new_producers.is_some() {
            return Err(ChainError::BlockValidate(
                "producer changes may only occur at the start of a round".into(),
            ));
        }
        let view = SchedulerView {
            params: &gpo.params,
            gpo,
            dgp: &dgp,
        };
        let slot = view.slot_at_time_ms(header.timestamp_ms);
        if slot == 0 {
            return Err(ChainError::BlockValidate(
                "block time is before the first open slot".into(),
            ));
        }
        let scheduled = view.scheduled_producer(slot)?;
        let producer = self.db.producers.get(&scheduled)?.clone();
        if !self.skipping(skip::PRODUCER_SIGNATURE) {
            let key = public_key_from_hex(&producer.signing_key)?;
            block.verify_signature(&key).map_err(|_| {
                ChainError::BlockValidate(format!(
                    "block is not signed with {}'s signing key",
                    producer.owner
                ))
            })?;
        }
        if !self.skipping(skip::PRODUCER_SCHEDULE_CHECK) && header.producer != producer.owner {
            return Err(ChainError::BlockValidate(format!(
                "{} produced the block, but {} was scheduled for that slot",
                header.producer, producer.owner
            )));
        }
        if !self.skipping(skip::MERKLE_CHECK)
            && block.calculate_transaction_merkle_root() != header.transaction_mroot
        {
            return Err(ChainError::BlockValidate(
                "transaction merkle root does not match".into(),
            ));
        }
        Ok(producer)
    }

    fn finalize_block(&mut self, block: &SignedBlock, block_trace: &BlockTrace) -> ChainResult<()> {
        let signing_producer = self.validate_block_header(block)?;
        self.update_global_properties(block)?;
        self.update_global_dynamic_data(block)?;
        self.update_signing_producer(&signing_producer, block)?;
        self.update_last_irreversible_block()?;
        self.create_block_summary(block)?;
        self.clear_expired_transactions()?;
        for observer in &self.applied_block_observers {
            observer(block, block_trace);
        }
        if self.replaying {
            for observer in &self.irreversible_block_observers {
                observer(block);
            }
        }
        Ok(())
    }

    fn update_global_properties(&mut self, block: &SignedBlock) -> ChainResult<()> {
        let params = self.db.global_property()?.params.clone();
        if !is_start_of_round(block.block_num(), &params) {
            return Ok(());
        }
        let schedule = calculate_producer_schedule(&self.db)?;
        if let Some(declared) = &block.header.new_producers {
            if *declared != schedule {
                return Err(ChainError::BlockValidate(
                    "pending producer set differs from the expected schedule".into(),
                ));
            }
        }
        let head_schedule = head_producer_schedule(self.db.global_property()?).clone();
        if head_schedule != schedule && block.header.new_producers.is_none() {
            return Err(ChainError::BlockValidate(
                "pending producer set changed but the block did not declare it".into(),
            ));
        }
        let block_num = block.block_num();
        self.db.modify_global_property(|gpo| {
            match gpo.pending_active_producers.last_mut() {
                Some((num, pending)) if *num == block_num => *pending = schedule.clone(),
                _ => gpo
                    .pending_active_producers
                    .push((block_num, schedule.clone())),
            }
        })?;
        self.update_producers_authority()
    }

    /// Keeps the producers account's active authority in step with the
    /// active schedule.
    fn update_producers_authority(&mut self) -> ChainResult<()> {
        let gpo = self.db.global_property()?;
        let producer_count = gpo.active_producers.producers.len().max(1) as u32;
        let threshold = gpo
            .params
            .producers_authority_threshold
            .clamp(1, producer_count);
        let levels: Vec<PermissionLevel> = gpo
            .active_producers
            .producers
            .iter()
            .map(|producer| {
                PermissionLevel::new(producer.producer_name.clone(), ACTIVE_PERMISSION)
            })
            .collect();
        let authority = Authority::account_threshold(threshold, levels);
        self.db.permissions.modify(
            &(PRODUCERS_ACCOUNT.to_string(), ACTIVE_PERMISSION.to_string()),
            |permission| permission.authority = authority.clone(),
        )
    }

    fn update_global_dynamic_data(&mut self, block: &SignedBlock) -> ChainResult<()> {
        let dgp = self.db.dynamic_property()?.clone();
        let expected_block_mroot = dgp.block_merkle.root();
        if expected_block_mroot != block.header.block_mroot {
            return Err(ChainError::BlockValidate(format!(
                "block merkle root {} does not match the expected {expected_block_mroot}",
                block.header.block_mroot
            )));
        }
        let missed = {
            let gpo = self.db.global_property()?;
            let view = SchedulerView {
                params: &gpo.params,
                gpo,
                dgp: &dgp,
            };
            if dgp.head_block_number == 0 {
                0
            } else {
                view.slot_at_time_ms(block.header.timestamp_ms).saturating_sub(1)
            }
        };
        let mut missed_producers = Vec::new();
        {
            let gpo = self.db.global_property()?;
            let view = SchedulerView {
                params: &gpo.params,
                gpo,
                dgp: &dgp,
            };
            for i in 0..missed {
                let name = view.scheduled_producer(i + 1)?;
                if name != block.header.producer {
                    missed_producers.push(name);
                }
            }
        }
        for name in missed_producers {
            self.db
                .producers
                .modify(&name, |producer| producer.total_missed += 1)?;
        }

        let head_id = block.id();
        let height = block.block_num();
        let timestamp_ms = block.header.timestamp_ms;
        let producer = block.header.producer.clone();
        self.db.modify_dynamic_property(|dgp| {
            dgp.head_block_number = height;
            dgp.head_block_id = head_id;
            dgp.time_ms = timestamp_ms;
            dgp.current_producer = producer.clone();
            dgp.current_absolute_slot += missed + 1;
            if missed < 64 {
                dgp.recent_slots_filled = ((dgp.recent_slots_filled << 1) | 1) << missed;
            } else {
                dgp.recent_slots_filled = 0;
            }
            dgp.block_merkle.append(head_id);
        })?;

        let dgp = self.db.dynamic_property()?;
        self.fork_db
            .set_max_size(dgp.head_block_number - dgp.last_irreversible_block_num + 1);
        Ok(())
    }

    fn update_signing_producer(
        &mut self,
        producer: &ProducerObject,
        block: &SignedBlock,
    ) -> ChainResult<()> {
        let new_aslot = {
            let gpo = self.db.global_property()?;
            let dgp = self.db.dynamic_property()?;
            let view = SchedulerView {
                params: &gpo.params,
                gpo,
                dgp,
            };
            dgp.current_absolute_slot + view.slot_at_time_ms(block.header.timestamp_ms)
        };
        let block_num = block.block_num();
        self.db.producers.modify(&producer.owner, |row| {
            row.last_aslot = new_aslot;
            row.last_confirmed_block_num = block_num;
        })
    }

    fn update_last_irreversible_block(&mut self) -> ChainResult<()> {
        let gpo = self.db.global_property()?.clone();
        let previous_lib = self.db.dynamic_property()?.last_irreversible_block_num;
        let mut confirmations = Vec::with_capacity(gpo.active_producers.producers.len());
        for producer_key in &gpo.active_producers.producers {
            confirmations.push(
                self.db
                    .producers
                    .get(&producer_key.producer_name)?
                    .last_confirmed_block_num,
            );
        }
        if confirmations.is_empty() {
            return Ok(());
        }
        confirmations.sort_unstable();
        let offset = (confirmations.len()
            * (PERCENT_100 - gpo.params.irreversible_threshold_percent) as usize)
            / PERCENT_100 as usize;
        let new_lib = confirmations[offset];
        if new_lib > previous_lib {
            debug!(new_lib, "advancing last irreversible block");
            self.db
                .modify_dynamic_property(|dgp| dgp.last_irreversible_block_num = new_lib)?;
        }

        let last_on_disk = self.block_log.head_num().unwrap_or(0);
        if last_on_disk < new_lib {
            for num in last_on_disk + 1..=new_lib {
                let block = self.fetch_block_by_number_impl(num)?.ok_or_else(|| {
                    ChainError::UnknownBlock(format!("irreversible block {num} is missing"))
                })?;
                self.block_log.append(&block)?;
                for observer in &self.irreversible_block_observers {
                    observer(&block);
                }
            }
        }

        // the newest schedule proposed before the frontier becomes active
        let activated = gpo
            .pending_active_producers
            .iter()
            .filter(|(num, _)| *num < new_lib)
            .last()
            .cloned();
        if let Some((activation, schedule)) = activated {
            info!(version = schedule.version, activation, "activating producer schedule");
            self.db.modify_global_property(|gpo| {
                gpo.pending_active_producers
                    .retain(|(num, _)| *num > activation);
                gpo.active_producers = schedule.clone();
            })?;
        }

        let dgp = self.db.dynamic_property()?;
        let head = dgp.head_block_number;
        let lib = dgp.last_irreversible_block_num;
        self.fork_db.set_max_size(head - lib + 1);
        self.db.commit(lib);
        Ok(())
    }

    fn create_block_summary(&mut self, block: &SignedBlock) -> ChainResult<()> {
        let slot = block.block_num() & 0xFFFF;
        let id = block.id();
        self.db
            .block_summaries
            .modify(&slot, |summary| summary.block_id = id)
    }

    /// Dedup and generated entries are kept for two forking windows past
    /// their expiration, then dropped.
    fn clear_expired_transactions(&mut self) -> ChainResult<()> {
        let now = self.head_time_sec()?;
        let window = self.db.global_property()?.params.forking_window_sec();
        let horizon = now.saturating_sub(2 * window);
        let stale: Vec<TransactionId> = self
            .db
            .transactions
            .by_order()
            .take_while(|row| row.expiration_sec < horizon)
            .map(|row| row.trx_id)
            .collect();
        for id in stale {
            self.db.transactions.remove(&id)?;
        }
        let stale: Vec<TransactionId> = self
            .db
            .generated_transactions
            .by_order()
            .take_while(|row| row.expiration_sec < horizon)
            .map(|row| row.trx_id)
            .collect();
        for id in stale {
            self.db.generated_transactions.remove(&id)?;
        }
        Ok(())
    }

    // ---- block generation -------------------------------------------------

    fn generate_block_impl(
        &mut self,
        when_ms: u64,
        producer: &str,
        signing_key: &Keypair,
    ) -> ChainResult<SignedBlock> {
        let skip_flags = self.skip_flags;
        let scheduled = {
            let gpo = self.db.global_property()?;
            let dgp = self.db.dynamic_property()?;
            let view = SchedulerView {
                params: &gpo.params,
                gpo,
                dgp,
            };
            let slot = view.slot_at_time_ms(when_ms);
            if slot == 0 {
                return Err(ChainError::BlockValidate(
                    "generation time is not past the head block".into(),
                ));
            }
            view.scheduled_producer(slot)?
        };
        if scheduled != producer {
            return Err(ChainError::BlockValidate(format!(
                "{producer} is not scheduled for that slot; {scheduled} is"
            )));
        }
        let producer_row = self.db.producers.get(&scheduled)?.clone();
        if skip_flags & skip::PRODUCER_SIGNATURE == 0
            && producer_row.signing_key != public_key_to_hex(&signing_key.public)
        {
            return Err(ChainError::BlockValidate(format!(
                "signing key does not match {}'s registered key",
                producer_row.owner
            )));
        }

        if self.pending.is_none() {
            self.start_pending_block()?;
        }
        {
            let pending = self.pending.as_mut().expect("pending block");
            pending.finalize_cycle(&mut self.db)?;
        }

        let head_num = self.head_block_num()?;
        let head_id = self.head_block_id()?;
        let block_mroot = self.db.dynamic_property()?.block_merkle.root();
        {
            let pending = self.pending.as_mut().expect("pending block");
            let transaction_mroot = pending.block.calculate_transaction_merkle_root();
            let action_mroot = pending.block_trace.calculate_action_merkle_root();
            let header = &mut pending.block.header;
            header.height = head_num + 1;
            header.previous = head_id;
            header.timestamp_ms = when_ms;
            header.producer = scheduled.clone();
            header.block_mroot = block_mroot;
            header.transaction_mroot = transaction_mroot;
            header.action_mroot = action_mroot;
        }
        let params = self.db.global_property()?.params.clone();
        if is_start_of_round(head_num + 1, &params) {
            let schedule = calculate_producer_schedule(&self.db)?;
            if schedule != *head_producer_schedule(self.db.global_property()?) {
                self.pending.as_mut().expect("pending block").block.header.new_producers =
                    Some(schedule);
            }
        }
        if skip_flags & skip::PRODUCER_SIGNATURE == 0 {
            self.pending
                .as_mut()
                .expect("pending block")
                .block
                .sign(signing_key);
        }

        let pending = self.pending.take().expect("pending block");
        let session = self.pending_session.take().expect("pending session");
        let block = pending.block;
        let block_trace = pending.block_trace;
        match self.finalize_block(&block, &block_trace) {
            Ok(()) => self.db.push_session(session),
            Err(err) => {
                self.db.rollback_session(session);
                return Err(err);
            }
        }
        if skip_flags & skip::FORK_DB == 0 {
            let item = self.fork_db.push_block(block.clone())?;
            self.fork_db.set_head(item);
        }
        info!(
            num = block.block_num(),
            id = %block.id(),
            producer = %block.header.producer,
            transactions = block.input_transactions.len(),
            "generated block"
        );
        Ok(block)
    }

    // ---- queries ----------------------------------------------------------

    fn fetch_block_by_id_impl(&self, id: &BlockId) -> ChainResult<Option<SignedBlock>> {
        if let Some(item) = self.fork_db.fetch_block(id) {
            return Ok(Some(item.block.clone()));
        }
        self.block_log.read_block_by_id(id)
    }

    fn fetch_block_by_number_impl(&self, num: u64) -> ChainResult<Option<SignedBlock>> {
        if let Some(block) = self.block_log.read_block_by_num(num)? {
            return Ok(Some(block));
        }
        if num <= self.head_block_num()? {
            let mut item = self.fork_db.head();
            while let Some(current) = item {
                if current.num == num {
                    return Ok(Some(current.block.clone()));
                }
                if current.num < num {
                    break;
                }
                item = current.prev();
            }
        }
        Ok(None)
    }

    fn get_block_ids_on_fork_impl(&self, head_of_fork: &BlockId) -> ChainResult<Vec<BlockId>> {
        let (canonical, fork) = self
            .fork_db
            .fetch_branch_from(&self.head_block_id()?, head_of_fork)?;
        let mut result: Vec<BlockId> = fork.iter().map(|item| item.id).collect();
        match canonical.last().or_else(|| fork.last()) {
            Some(deepest) => result.push(deepest.previous),
            None => result.push(*head_of_fork),
        }
        Ok(result)
    }

    fn get_required_keys_impl(
        &self,
        trx: &SignedTransaction,
        candidate_keys: &BTreeSet<String>,
    ) -> ChainResult<BTreeSet<String>> {
        let db = &self.db;
        let max_depth = db.global_property()?.params.max_authority_depth;
        let mut checker = AuthorityChecker::new(
            |level: &PermissionLevel| {
                db.permissions
                    .find(&(level.actor.clone(), level.permission.clone()))
                    .map(|permission| permission.authority.clone())
                    .ok_or_else(|| {
                        ChainError::UnknownAccount(format!(
                            "{}@{}",
                            level.actor, level.permission
                        ))
                    })
            },
            max_depth,
            candidate_keys.clone(),
            BTreeSet::new(),
        );
        for act in &trx.transaction.actions {
            for declared in &act.authorization {
                if !checker.satisfied(declared)? {
                    return Err(ChainError::MissingSigs(format!(
                        "{}@{}",
                        declared.actor, declared.permission
                    )));
                }
            }
        }
        Ok(checker.used_keys().clone())
    }
}

fn validate_scope(trx: &Transaction) -> ChainResult<()> {
    for window in trx.read_scope.windows(2) {
        if window[0] >= window[1] {
            return Err(ChainError::Transaction(
                "read scopes must be sorted and unique".into(),
            ));
        }
    }
    for window in trx.write_scope.windows(2) {
        if window[0] >= window[1] {
            return Err(ChainError::Transaction(
                "write scopes must be sorted and unique".into(),
            ));
        }
    }
    for scope in &trx.read_scope {
        if trx.write_scope.binary_search(scope).is_ok() {
            return Err(ChainError::Transaction(format!(
                "scope {scope} may not appear in both read and write scope"
            )));
        }
    }
    for act in &trx.actions {
        for auth in &act.authorization {
            if trx.write_scope.binary_search(&auth.actor).is_err() {
                return Err(ChainError::Transaction(format!(
                    "authorizing account {} requires write scope",
                    auth.actor
                )));
            }
        }
    }
    Ok(())
}
