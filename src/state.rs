use std::cmp::Reverse;

use crate::config::ConsensusParams;
use crate::errors::{ChainError, ChainResult};
use crate::merkle::IncrementalMerkle;
use crate::store::{Row, Session, Table, UndoTable};
use crate::types::{
    AccountName, ActionName, Authority, BlockId, PermissionName, ProducerSchedule, TransactionId,
};

#[derive(Clone, Debug)]
pub struct AccountObject {
    pub name: AccountName,
    /// Accumulated transaction bytes charged to this account. Tracked for
    /// observability; nothing is throttled on it.
    pub bandwidth_bytes: u64,
}

impl Row for AccountObject {
    const NAME: &'static str = "account";
    type Key = AccountName;
    type OrderKey = ();

    fn key(&self) -> AccountName {
        self.name.clone()
    }

    fn order_key(&self) {}
}

#[derive(Clone, Debug)]
pub struct PermissionObject {
    pub owner: AccountName,
    pub name: PermissionName,
    /// Row id of the parent permission within this account's tree.
    pub parent: Option<u64>,
    pub authority: Authority,
}

impl Row for PermissionObject {
    const NAME: &'static str = "permission";
    type Key = (AccountName, PermissionName);
    type OrderKey = ();

    fn key(&self) -> (AccountName, PermissionName) {
        (self.owner.clone(), self.name.clone())
    }

    fn order_key(&self) {}
}

#[derive(Clone, Debug)]
pub struct PermissionLinkObject {
    pub account: AccountName,
    pub code: AccountName,
    /// Empty string links the contract-wide default.
    pub action: ActionName,
    pub required_permission: PermissionName,
}

impl Row for PermissionLinkObject {
    const NAME: &'static str = "permission link";
    type Key = (AccountName, AccountName, ActionName);
    type OrderKey = ();

    fn key(&self) -> (AccountName, AccountName, ActionName) {
        (self.account.clone(), self.code.clone(), self.action.clone())
    }

    fn order_key(&self) {}
}

#[derive(Clone, Debug)]
pub struct ProducerObject {
    pub owner: AccountName,
    pub signing_key: String,
    pub last_aslot: u64,
    pub last_confirmed_block_num: u64,
    pub total_missed: u64,
}

impl Row for ProducerObject {
    const NAME: &'static str = "producer";
    type Key = AccountName;
    type OrderKey = ();

    fn key(&self) -> AccountName {
        self.owner.clone()
    }

    fn order_key(&self) {}
}

/// Stake-weighted vote tally per producer, maintained by the staking
/// contract. Ordered so a reverse scan yields highest votes first with ties
/// broken by name.
#[derive(Clone, Debug)]
pub struct ProducerVoteObject {
    pub owner: AccountName,
    pub votes: u128,
}

impl Row for ProducerVoteObject {
    const NAME: &'static str = "producer vote";
    type Key = AccountName;
    type OrderKey = (u128, Reverse<AccountName>);

    fn key(&self) -> AccountName {
        self.owner.clone()
    }

    fn order_key(&self) -> (u128, Reverse<AccountName>) {
        (self.votes, Reverse(self.owner.clone()))
    }
}

/// Dedup entry for an accepted transaction.
#[derive(Clone, Debug)]
pub struct TransactionObject {
    pub trx_id: TransactionId,
    pub expiration_sec: u64,
}

impl Row for TransactionObject {
    const NAME: &'static str = "transaction";
    type Key = TransactionId;
    type OrderKey = u64;

    fn key(&self) -> TransactionId {
        self.trx_id
    }

    fn order_key(&self) -> u64 {
        self.expiration_sec
    }
}

#[derive(Clone, Debug)]
pub struct GeneratedTransactionObject {
    pub trx_id: TransactionId,
    pub sender: AccountName,
    pub sender_id: u64,
    pub expiration_sec: u64,
    pub delay_until_sec: u64,
    /// Canonically packed deferred transaction.
    pub packed: Vec<u8>,
}

impl Row for GeneratedTransactionObject {
    const NAME: &'static str = "generated transaction";
    type Key = TransactionId;
    type OrderKey = u64;

    fn key(&self) -> TransactionId {
        self.trx_id
    }

    fn order_key(&self) -> u64 {
        self.expiration_sec
    }
}

/// One slot of the reference-block ring; exactly 0x10000 rows exist from
/// genesis onward.
#[derive(Clone, Debug)]
pub struct BlockSummaryObject {
    pub slot: u64,
    pub block_id: BlockId,
}

impl Row for BlockSummaryObject {
    const NAME: &'static str = "block summary";
    type Key = u64;
    type OrderKey = ();

    fn key(&self) -> u64 {
        self.slot
    }

    fn order_key(&self) {}
}

#[derive(Clone, Debug)]
pub struct GlobalPropertyObject {
    pub params: ConsensusParams,
    pub active_producers: ProducerSchedule,
    /// Schedules awaiting irreversibility, keyed by the block that proposed
    /// them.
    pub pending_active_producers: Vec<(u64, ProducerSchedule)>,
}

impl Row for GlobalPropertyObject {
    const NAME: &'static str = "global property";
    type Key = ();
    type OrderKey = ();

    fn key(&self) {}

    fn order_key(&self) {}
}

#[derive(Clone, Debug, Default)]
pub struct DynamicGlobalPropertyObject {
    pub head_block_number: u64,
    pub head_block_id: BlockId,
    pub time_ms: u64,
    pub current_producer: AccountName,
    pub current_absolute_slot: u64,
    /// Bitmap of the 64 most recent slots; bit 0 is the latest.
    pub recent_slots_filled: u64,
    pub last_irreversible_block_num: u64,
    pub block_merkle: IncrementalMerkle,
}

impl Row for DynamicGlobalPropertyObject {
    const NAME: &'static str = "dynamic global property";
    type Key = ();
    type OrderKey = ();

    fn key(&self) {}

    fn order_key(&self) {}
}

/// The versioned chain state: every consensus object behind typed journaled
/// tables that move through undo sessions in lockstep.
pub struct Database {
    pub accounts: Table<AccountObject>,
    pub permissions: Table<PermissionObject>,
    pub permission_links: Table<PermissionLinkObject>,
    pub producers: Table<ProducerObject>,
    pub producer_votes: Table<ProducerVoteObject>,
    pub transactions: Table<TransactionObject>,
    pub generated_transactions: Table<GeneratedTransactionObject>,
    pub block_summaries: Table<BlockSummaryObject>,
    pub global_properties: Table<GlobalPropertyObject>,
    pub dynamic_properties: Table<DynamicGlobalPropertyObject>,
    base_revision: u64,
    depth: usize,
    open_sessions: usize,
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Database {
    pub fn new() -> Self {
        Self {
            accounts: Table::new(),
            permissions: Table::new(),
            permission_links: Table::new(),
            producers: Table::new(),
            producer_votes: Table::new(),
            transactions: Table::new(),
            generated_transactions: Table::new(),
            block_summaries: Table::new(),
            global_properties: Table::new(),
            dynamic_properties: Table::new(),
            base_revision: 0,
            depth: 0,
            open_sessions: 0,
        }
    }

    fn tables_mut(&mut self) -> [&mut dyn UndoTable; 10] {
        [
            &mut self.accounts,
            &mut self.permissions,
            &mut self.permission_links,
            &mut self.producers,
            &mut self.producer_votes,
            &mut self.transactions,
            &mut self.generated_transactions,
            &mut self.block_summaries,
            &mut self.global_properties,
            &mut self.dynamic_properties,
        ]
    }

    pub fn start_undo_session(&mut self, enabled: bool) -> Session {
        if !enabled {
            return Session::disabled();
        }
        for table in self.tables_mut() {
            table.begin_level();
        }
        self.depth += 1;
        self.open_sessions += 1;
        Session { depth: self.depth }
    }

    /// Commits the session's mutations into the enclosing history as one
    /// revision.
    pub fn push_session(&mut self, session: Session) {
        if !session.enabled() {
            let _ = session.defuse();
            return;
        }
        let depth = session.defuse();
        assert_eq!(depth, self.depth, "undo sessions closed out of order");
        self.open_sessions -= 1;
    }

    /// Folds the session's mutations into its parent without creating a
    /// revision.
    pub fn squash_session(&mut self, session: Session) {
        if !session.enabled() {
            let _ = session.defuse();
            return;
        }
        let depth = session.defuse();
        assert_eq!(depth, self.depth, "undo sessions closed out of order");
        for table in self.tables_mut() {
            table.squash_level();
        }
        self.depth -= 1;
        self.open_sessions -= 1;
    }

    pub fn rollback_session(&mut self, session: Session) {
        if !session.enabled() {
            let _ = session.defuse();
            return;
        }
        let depth = session.defuse();
        assert_eq!(depth, self.depth, "undo sessions closed out of order");
        for table in self.tables_mut() {
            table.undo_level();
        }
        self.depth -= 1;
        self.open_sessions -= 1;
    }

    /// Rewinds the most recently pushed revision.
    pub fn undo(&mut self) -> ChainResult<()> {
        if self.open_sessions > 0 {
            return Err(ChainError::Config(
                "cannot undo while sessions are open".into(),
            ));
        }
        if self.depth == 0 {
            return Err(ChainError::Config("no undo history".into()));
        }
        for table in self.tables_mut() {
            table.undo_level();
        }
        self.depth -= 1;
        Ok(())
    }

    /// Rewinds every revision back to the last commit point.
    pub fn undo_all(&mut self) {
        while self.depth > 0 {
            for table in self.tables_mut() {
                table.undo_level();
            }
            self.depth -= 1;
            self.open_sessions = self.open_sessions.saturating_sub(1);
        }
    }

    /// Finalizes revisions up to and including `revision`, releasing their
    /// undo history.
    pub fn commit(&mut self, revision: u64) {
        let mut committable = self.depth - self.open_sessions;
        while self.base_revision < revision && committable > 0 {
            for table in self.tables_mut() {
                table.commit_oldest();
            }
            self.base_revision += 1;
            self.depth -= 1;
            committable -= 1;
        }
    }

    pub fn revision(&self) -> u64 {
        self.base_revision + self.depth as u64
    }

    /// Pushed revisions that can still be rewound with [`Database::undo`].
    pub fn reversible_revisions(&self) -> usize {
        self.depth - self.open_sessions
    }

    pub fn set_revision(&mut self, revision: u64) -> ChainResult<()> {
        if self.depth != 0 {
            return Err(ChainError::Config(
                "cannot set revision with undo history in place".into(),
            ));
        }
        self.base_revision = revision;
        Ok(())
    }

    pub fn global_property(&self) -> ChainResult<&GlobalPropertyObject> {
        self.global_properties.get(&())
    }

    pub fn dynamic_property(&self) -> ChainResult<&DynamicGlobalPropertyObject> {
        self.dynamic_properties.get(&())
    }

    pub fn modify_global_property(
        &mut self,
        f: impl FnOnce(&mut GlobalPropertyObject),
    ) -> ChainResult<()> {
        self.global_properties.modify(&(), f)
    }

    pub fn modify_dynamic_property(
        &mut self,
        f: impl FnOnce(&mut DynamicGlobalPropertyObject),
    ) -> ChainResult<()> {
        self.dynamic_properties.modify(&(), f)
    }
}
