use std::collections::BTreeSet;

use crate::config::ACTIVE_PERMISSION;
use crate::errors::{ChainError, ChainResult};
use crate::state::Database;
use crate::types::{AccountName, ActionName, Authority, PermissionLevel, PermissionName};

/// Evaluates weighted-threshold authorities against a set of provided keys
/// and account levels, recursing through sub-authorities up to a depth
/// budget. Wait weights are ignored here; only delayed execution credits
/// them.
pub struct AuthorityChecker<F>
where
    F: Fn(&PermissionLevel) -> ChainResult<Authority>,
{
    lookup: F,
    max_depth: u16,
    provided_keys: BTreeSet<String>,
    provided_levels: BTreeSet<PermissionLevel>,
    used_keys: BTreeSet<String>,
}

impl<F> AuthorityChecker<F>
where
    F: Fn(&PermissionLevel) -> ChainResult<Authority>,
{
    pub fn new(
        lookup: F,
        max_depth: u16,
        provided_keys: BTreeSet<String>,
        provided_levels: BTreeSet<PermissionLevel>,
    ) -> Self {
        Self {
            lookup,
            max_depth,
            provided_keys,
            provided_levels,
            used_keys: BTreeSet::new(),
        }
    }

    /// True when the permission's authority is satisfiable with the provided
    /// material. Keys are only recorded as used when the whole check
    /// succeeds.
    pub fn satisfied(&mut self, level: &PermissionLevel) -> ChainResult<bool> {
        let mut used = BTreeSet::new();
        let ok = self.satisfied_at(level, i32::from(self.max_depth), &mut used)?;
        if ok {
            self.used_keys.extend(used);
        }
        Ok(ok)
    }

    fn satisfied_at(
        &self,
        level: &PermissionLevel,
        depth: i32,
        used: &mut BTreeSet<String>,
    ) -> ChainResult<bool> {
        if depth < 0 {
            return Ok(false);
        }
        let authority = (self.lookup)(level)?;
        self.satisfies_authority(&authority, depth, used)
    }

    fn satisfies_authority(
        &self,
        authority: &Authority,
        depth: i32,
        used: &mut BTreeSet<String>,
    ) -> ChainResult<bool> {
        let threshold = u64::from(authority.threshold);
        let mut total = 0u64;
        for key_weight in &authority.keys {
            if self.provided_keys.contains(&key_weight.key) {
                total += u64::from(key_weight.weight);
                used.insert(key_weight.key.clone());
                if total >= threshold {
                    return Ok(true);
                }
            }
        }
        for account_weight in &authority.accounts {
            let satisfied = if self.provided_levels.contains(&account_weight.level) {
                true
            } else {
                let mut sub_used = BTreeSet::new();
                let ok = self.satisfied_at(&account_weight.level, depth - 1, &mut sub_used)?;
                if ok {
                    used.extend(sub_used);
                }
                ok
            };
            if satisfied {
                total += u64::from(account_weight.weight);
                if total >= threshold {
                    return Ok(true);
                }
            }
        }
        Ok(total >= threshold)
    }

    pub fn used_keys(&self) -> &BTreeSet<String> {
        &self.used_keys
    }

    pub fn unused_keys(&self) -> BTreeSet<String> {
        self.provided_keys
            .difference(&self.used_keys)
            .cloned()
            .collect()
    }

    pub fn all_keys_used(&self) -> bool {
        self.used_keys.len() == self.provided_keys.len()
    }
}

/// Most specific permission required of `authorizer` for an action: an exact
/// link for the action, else the contract-wide default link, else `active`.
pub fn lookup_minimum_permission(
    db: &Database,
    authorizer: &AccountName,
    scope: &AccountName,
    action: &ActionName,
) -> ChainResult<PermissionName> {
    let exact = (authorizer.clone(), scope.clone(), action.clone());
    if let Some(link) = db.permission_links.find(&exact) {
        return Ok(link.required_permission.clone());
    }
    let default = (authorizer.clone(), scope.clone(), String::new());
    if let Some(link) = db.permission_links.find(&default) {
        return Ok(link.required_permission.clone());
    }
    Ok(ACTIVE_PERMISSION.to_string())
}

/// True when the declared permission is the minimum itself or an ancestor of
/// it in the account's permission tree.
pub fn permission_satisfies(
    db: &Database,
    declared: &PermissionLevel,
    minimum: &PermissionName,
) -> ChainResult<bool> {
    let mut current = db
        .permissions
        .find(&(declared.actor.clone(), minimum.clone()))
        .ok_or_else(|| {
            ChainError::UnknownAccount(format!("{}@{}", declared.actor, minimum))
        })?;
    loop {
        if current.name == declared.permission {
            return Ok(true);
        }
        match current.parent.and_then(|id| db.permissions.find_by_id(id)) {
            Some(parent) => current = parent,
            None => return Ok(false),
        }
    }
}
