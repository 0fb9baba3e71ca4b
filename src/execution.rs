use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::{ACTIVE_PERMISSION, ALL_SCOPE, OWNER_PERMISSION, SYSTEM_ACCOUNT};
use crate::errors::{ChainError, ChainResult};
use crate::state::{AccountObject, Database, PermissionObject, ProducerObject, ProducerVoteObject};
use crate::types::{
    AccountName, Action, ActionName, Authority, DeferredTransaction, Digest, PermissionName,
    Transaction,
};

/// Contract entry point resolved by `(receiver, scope, action)`.
pub type ApplyHandler = Arc<dyn Fn(&mut ApplyContext) -> ChainResult<()> + Send + Sync>;

pub const NEW_ACCOUNT_ACTION: &str = "newaccount";
pub const UPDATE_AUTH_ACTION: &str = "updateauth";
pub const LINK_AUTH_ACTION: &str = "linkauth";
pub const REGISTER_PRODUCER_ACTION: &str = "regproducer";
pub const ADJUST_VOTES_ACTION: &str = "adjustvotes";

/// Execution surface handed to each handler: store access scoped by the
/// transaction's declared scopes, a console buffer, a deferred-transaction
/// sink, and the position of the action inside the block being built.
pub struct ApplyContext<'a> {
    pub db: &'a mut Database,
    pub chain_id: Digest,
    pub trx: &'a Transaction,
    pub act: &'a Action,
    pub receiver: AccountName,
    pub region_id: u16,
    pub cycle_index: u32,
    pub shard_index: u32,
    pub console: String,
    pub deferred_transactions: Vec<DeferredTransaction>,
}

impl ApplyContext<'_> {
    pub fn unpack<T: DeserializeOwned>(&self) -> ChainResult<T> {
        bincode::deserialize(&self.act.data).map_err(|err| {
            ChainError::Transaction(format!("malformed {} payload: {err}", self.act.name))
        })
    }

    pub fn has_authorization(&self, account: &str) -> bool {
        self.act
            .authorization
            .iter()
            .any(|level| level.actor == account)
    }

    pub fn require_authorization(&self, account: &str) -> ChainResult<()> {
        if self.has_authorization(account) {
            return Ok(());
        }
        Err(ChainError::Transaction(format!(
            "action {} is missing the authority of {account}",
            self.act.name
        )))
    }

    pub fn require_write_scope(&self, account: &str) -> ChainResult<()> {
        let covered = self
            .trx
            .write_scope
            .iter()
            .any(|scope| scope == account || scope == ALL_SCOPE);
        if covered {
            return Ok(());
        }
        Err(ChainError::Transaction(format!(
            "transaction does not declare write scope {account}"
        )))
    }

    pub fn append_console(&mut self, message: &str) {
        self.console.push_str(message);
    }

    pub fn send_deferred(&mut self, deferred: DeferredTransaction) {
        self.deferred_transactions.push(deferred);
    }

    fn require_account(&self, name: &AccountName) -> ChainResult<()> {
        if self.db.accounts.contains(name) {
            return Ok(());
        }
        Err(ChainError::UnknownAccount(name.clone()))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewAccount {
    pub creator: AccountName,
    pub name: AccountName,
    pub owner: Authority,
    pub active: Authority,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateAuth {
    pub account: AccountName,
    pub permission: PermissionName,
    pub parent: PermissionName,
    pub authority: Authority,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkAuth {
    pub account: AccountName,
    pub code: AccountName,
    pub action: ActionName,
    pub requirement: PermissionName,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterProducer {
    pub producer: AccountName,
    pub signing_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdjustProducerVotes {
    pub producer: AccountName,
    pub delta: i128,
}

/// The native handler set registered under the system account. These stand
/// in for the on-chain account/staking contracts; anything else resolves
/// through the same table once user code registers there.
pub fn native_handlers() -> Vec<((AccountName, AccountName, ActionName), ApplyHandler)> {
    let system: AccountName = SYSTEM_ACCOUNT.to_string();
    let entry = |action: &str, handler: ApplyHandler| {
        ((system.clone(), system.clone(), action.to_string()), handler)
    };
    vec![
        entry(NEW_ACCOUNT_ACTION, Arc::new(apply_new_account)),
        entry(UPDATE_AUTH_ACTION, Arc::new(apply_update_auth)),
        entry(LINK_AUTH_ACTION, Arc::new(apply_link_auth)),
        entry(REGISTER_PRODUCER_ACTION, Arc::new(apply_register_producer)),
        entry(ADJUST_VOTES_ACTION, Arc::new(apply_adjust_votes)),
    ]
}

fn validate_authority(authority: &Authority) -> ChainResult<()> {
    if authority.is_valid() {
        return Ok(());
    }
    Err(ChainError::Transaction(
        "authority threshold is unreachable".into(),
    ))
}

fn apply_new_account(ctx: &mut ApplyContext) -> ChainResult<()> {
    let args: NewAccount = ctx.unpack()?;
    ctx.require_authorization(&args.creator)?;
    ctx.require_account(&args.creator)?;
    validate_authority(&args.owner)?;
    validate_authority(&args.active)?;
    if ctx.db.accounts.contains(&args.name) {
        return Err(ChainError::Transaction(format!(
            "account {} already exists",
            args.name
        )));
    }
    ctx.db.accounts.create(AccountObject {
        name: args.name.clone(),
        bandwidth_bytes: 0,
    })?;
    let owner_id = ctx.db.permissions.create(PermissionObject {
        owner: args.name.clone(),
        name: OWNER_PERMISSION.to_string(),
        parent: None,
        authority: args.owner,
    })?;
    ctx.db.permissions.create(PermissionObject {
        owner: args.name.clone(),
        name: ACTIVE_PERMISSION.to_string(),
        parent: Some(owner_id),
        authority: args.active,
    })?;
    Ok(())
}

fn apply_update_auth(ctx: &mut ApplyContext) -> ChainResult<()> {
    let args: UpdateAuth = ctx.unpack()?;
    ctx.require_authorization(&args.account)?;
    ctx.require_account(&args.account)?;
    validate_authority(&args.authority)?;
    let parent = if args.permission == OWNER_PERMISSION {
        None
    } else {
        let key = (args.account.clone(), args.parent.clone());
        let parent_id = ctx.db.permissions.find_id(&key).ok_or_else(|| {
            ChainError::Transaction(format!(
                "parent permission {}@{} does not exist",
                args.account, args.parent
            ))
        })?;
        Some(parent_id)
    };
    let key = (args.account.clone(), args.permission.clone());
    if ctx.db.permissions.contains(&key) {
        ctx.db.permissions.modify(&key, |permission| {
            permission.authority = args.authority.clone();
            permission.parent = parent;
        })?;
    } else {
        ctx.db.permissions.create(PermissionObject {
            owner: args.account.clone(),
            name: args.permission.clone(),
            parent,
            authority: args.authority,
        })?;
    }
    Ok(())
}

fn apply_link_auth(ctx: &mut ApplyContext) -> ChainResult<()> {
    let args: LinkAuth = ctx.unpack()?;
    ctx.require_authorization(&args.account)?;
    ctx.require_account(&args.account)?;
    ctx.require_account(&args.code)?;
    let permission_key = (args.account.clone(), args.requirement.clone());
    if !ctx.db.permissions.contains(&permission_key) {
        return Err(ChainError::Transaction(format!(
            "required permission {}@{} does not exist",
            args.account, args.requirement
        )));
    }
    let key = (args.account.clone(), args.code.clone(), args.action.clone());
    if ctx.db.permission_links.contains(&key) {
        ctx.db.permission_links.modify(&key, |link| {
            link.required_permission = args.requirement.clone();
        })?;
    } else {
        ctx.db
            .permission_links
            .create(crate::state::PermissionLinkObject {
                account: args.account,
                code: args.code,
                action: args.action,
                required_permission: args.requirement,
            })?;
    }
    Ok(())
}

fn apply_register_producer(ctx: &mut ApplyContext) -> ChainResult<()> {
    let args: RegisterProducer = ctx.unpack()?;
    if !ctx.has_authorization(&args.producer) && !ctx.has_authorization(SYSTEM_ACCOUNT) {
        return Err(ChainError::Transaction(format!(
            "registering {} requires its own or the system authority",
            args.producer
        )));
    }
    ctx.require_account(&args.producer)?;
    if ctx.db.producers.contains(&args.producer) {
        ctx.db.producers.modify(&args.producer, |producer| {
            producer.signing_key = args.signing_key.clone();
        })?;
    } else {
        ctx.db.producers.create(ProducerObject {
            owner: args.producer.clone(),
            signing_key: args.signing_key.clone(),
            last_aslot: 0,
            last_confirmed_block_num: 0,
            total_missed: 0,
        })?;
    }
    if !ctx.db.producer_votes.contains(&args.producer) {
        ctx.db.producer_votes.create(ProducerVoteObject {
            owner: args.producer,
            votes: 0,
        })?;
    }
    Ok(())
}

fn apply_adjust_votes(ctx: &mut ApplyContext) -> ChainResult<()> {
    let args: AdjustProducerVotes = ctx.unpack()?;
    ctx.require_authorization(SYSTEM_ACCOUNT)?;
    if !ctx.db.producer_votes.contains(&args.producer) {
        return Err(ChainError::Transaction(format!(
            "{} is not a registered producer",
            args.producer
        )));
    }
    ctx.db.producer_votes.modify(&args.producer, |vote| {
        vote.votes = if args.delta >= 0 {
            vote.votes.saturating_add(args.delta as u128)
        } else {
            vote.votes.saturating_sub(args.delta.unsigned_abs())
        };
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PermissionLevel;

    fn seeded_db() -> Database {
        let mut db = Database::new();
        db.accounts
            .create(AccountObject {
                name: SYSTEM_ACCOUNT.into(),
                bandwidth_bytes: 0,
            })
            .unwrap();
        db
    }

    fn system_action(name: &str, data: Vec<u8>) -> Action {
        Action {
            scope: SYSTEM_ACCOUNT.into(),
            name: name.into(),
            authorization: vec![PermissionLevel::new(SYSTEM_ACCOUNT, ACTIVE_PERMISSION)],
            data,
        }
    }

    fn run(db: &mut Database, act: &Action) -> ChainResult<()> {
        let trx = Transaction {
            write_scope: vec![ALL_SCOPE.into()],
            actions: vec![act.clone()],
            ..Transaction::default()
        };
        let handler = native_handlers()
            .into_iter()
            .find(|((_, _, action), _)| *action == act.name)
            .map(|(_, handler)| handler)
            .expect("native handler");
        let mut ctx = ApplyContext {
            db,
            chain_id: Digest::default(),
            trx: &trx,
            act,
            receiver: SYSTEM_ACCOUNT.into(),
            region_id: 0,
            cycle_index: 0,
            shard_index: 0,
            console: String::new(),
            deferred_transactions: Vec::new(),
        };
        handler(&mut ctx)
    }

    #[test]
    fn new_account_installs_owner_and_active_permissions() {
        let mut db = seeded_db();
        let payload = bincode::serialize(&NewAccount {
            creator: SYSTEM_ACCOUNT.into(),
            name: "alice".into(),
            owner: Authority::single_key("aa".repeat(32)),
            active: Authority::single_key("bb".repeat(32)),
        })
        .unwrap();
        run(&mut db, &system_action(NEW_ACCOUNT_ACTION, payload.clone())).unwrap();

        assert!(db.accounts.contains(&"alice".into()));
        let owner = db
            .permissions
            .get(&("alice".into(), OWNER_PERMISSION.into()))
            .unwrap();
        assert!(owner.parent.is_none());
        let active = db
            .permissions
            .get(&("alice".into(), ACTIVE_PERMISSION.into()))
            .unwrap();
        assert!(active.parent.is_some());

        let err = run(&mut db, &system_action(NEW_ACCOUNT_ACTION, payload)).unwrap_err();
        assert!(matches!(err, ChainError::Transaction(_)));
    }

    #[test]
    fn update_auth_requires_the_accounts_authority() {
        let mut db = seeded_db();
        let payload = bincode::serialize(&UpdateAuth {
            account: "alice".into(),
            permission: "trading".into(),
            parent: ACTIVE_PERMISSION.into(),
            authority: Authority::single_key("cc".repeat(32)),
        })
        .unwrap();
        let act = system_action(UPDATE_AUTH_ACTION, payload);
        // declared authority is system, not alice
        let err = run(&mut db, &act).unwrap_err();
        assert!(matches!(err, ChainError::Transaction(_)));
    }

    #[test]
    fn register_producer_creates_row_and_tally() {
        let mut db = seeded_db();
        let payload = bincode::serialize(&NewAccount {
            creator: SYSTEM_ACCOUNT.into(),
            name: "prod".into(),
            owner: Authority::single_key("aa".repeat(32)),
            active: Authority::single_key("aa".repeat(32)),
        })
        .unwrap();
        run(&mut db, &system_action(NEW_ACCOUNT_ACTION, payload)).unwrap();

        let payload = bincode::serialize(&RegisterProducer {
            producer: "prod".into(),
            signing_key: "dd".repeat(32),
        })
        .unwrap();
        run(&mut db, &system_action(REGISTER_PRODUCER_ACTION, payload)).unwrap();
        assert_eq!(db.producers.get(&"prod".into()).unwrap().signing_key, "dd".repeat(32));
        assert_eq!(db.producer_votes.get(&"prod".into()).unwrap().votes, 0);

        let payload = bincode::serialize(&AdjustProducerVotes {
            producer: "prod".into(),
            delta: 40,
        })
        .unwrap();
        run(&mut db, &system_action(ADJUST_VOTES_ACTION, payload)).unwrap();
        assert_eq!(db.producer_votes.get(&"prod".into()).unwrap().votes, 40);
    }
}
