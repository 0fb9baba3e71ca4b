use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::errors::{ChainError, ChainResult};

/// A row stored in a [`Table`]. `Key` is the unique lookup key; `OrderKey`
/// drives the table's secondary ordering (use `()` when the table has none).
/// The key of a row must never change across a modify.
pub trait Row: Clone {
    const NAME: &'static str;
    type Key: Ord + Clone;
    type OrderKey: Ord + Clone;

    fn key(&self) -> Self::Key;
    fn order_key(&self) -> Self::OrderKey;
}

/// Session mechanics shared by every table so the database can drive all of
/// them in lockstep.
pub(crate) trait UndoTable {
    fn begin_level(&mut self);
    fn undo_level(&mut self);
    fn squash_level(&mut self);
    fn commit_oldest(&mut self);
}

struct Level<T: Row> {
    created: BTreeSet<u64>,
    modified: BTreeMap<u64, T>,
    removed: BTreeMap<u64, T>,
    next_id: u64,
}

impl<T: Row> Level<T> {
    fn new(next_id: u64) -> Self {
        Self {
            created: BTreeSet::new(),
            modified: BTreeMap::new(),
            removed: BTreeMap::new(),
            next_id,
        }
    }
}

/// Journaled object table with a unique index and an ordered secondary
/// index, both maintained on create/modify/remove.
pub struct Table<T: Row> {
    rows: BTreeMap<u64, T>,
    by_key: BTreeMap<T::Key, u64>,
    by_order: BTreeMap<(T::OrderKey, u64), u64>,
    next_id: u64,
    levels: VecDeque<Level<T>>,
}

impl<T: Row> Default for Table<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Row> Table<T> {
    pub fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
            by_key: BTreeMap::new(),
            by_order: BTreeMap::new(),
            next_id: 0,
            levels: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn create(&mut self, row: T) -> ChainResult<u64> {
        let key = row.key();
        if self.by_key.contains_key(&key) {
            return Err(ChainError::Transaction(format!(
                "duplicate {} row",
                T::NAME
            )));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.by_key.insert(key, id);
        self.by_order.insert((row.order_key(), id), id);
        self.rows.insert(id, row);
        if let Some(level) = self.levels.back_mut() {
            level.created.insert(id);
        }
        Ok(id)
    }

    pub fn find(&self, key: &T::Key) -> Option<&T> {
        self.by_key.get(key).map(|id| self.row(*id))
    }

    pub fn get(&self, key: &T::Key) -> ChainResult<&T> {
        self.find(key)
            .ok_or_else(|| ChainError::Config(format!("missing {} row", T::NAME)))
    }

    pub fn find_by_id(&self, id: u64) -> Option<&T> {
        self.rows.get(&id)
    }

    pub fn find_id(&self, key: &T::Key) -> Option<u64> {
        self.by_key.get(key).copied()
    }

    pub fn contains(&self, key: &T::Key) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn modify(&mut self, key: &T::Key, f: impl FnOnce(&mut T)) -> ChainResult<()> {
        let id = *self
            .by_key
            .get(key)
            .ok_or_else(|| ChainError::Config(format!("missing {} row", T::NAME)))?;
        let row = self.rows.get_mut(&id).expect("row behind unique index");
        if let Some(level) = self.levels.back_mut() {
            if !level.created.contains(&id) && !level.modified.contains_key(&id) {
                level.modified.insert(id, row.clone());
            }
        }
        let old_order = row.order_key();
        f(row);
        debug_assert!(row.key() == *key, "{} row key changed in modify", T::NAME);
        let new_order = row.order_key();
        if new_order != old_order {
            self.by_order.remove(&(old_order, id));
            self.by_order.insert((new_order, id), id);
        }
        Ok(())
    }

    pub fn remove(&mut self, key: &T::Key) -> ChainResult<()> {
        let id = self
            .by_key
            .remove(key)
            .ok_or_else(|| ChainError::Config(format!("missing {} row", T::NAME)))?;
        let row = self.rows.remove(&id).expect("row behind unique index");
        self.by_order.remove(&(row.order_key(), id));
        if let Some(level) = self.levels.back_mut() {
            if level.created.remove(&id) {
                // created and removed inside the same level: no trace left
            } else if let Some(original) = level.modified.remove(&id) {
                level.removed.insert(id, original);
            } else {
                level.removed.insert(id, row);
            }
        }
        Ok(())
    }

    /// Rows in secondary-index order; reversible for descending scans.
    pub fn by_order(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.by_order.values().map(move |id| self.row(*id))
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.rows.values()
    }

    fn row(&self, id: u64) -> &T {
        self.rows.get(&id).expect("row behind index entry")
    }

    fn insert_untracked(&mut self, id: u64, row: T) {
        self.by_key.insert(row.key(), id);
        self.by_order.insert((row.order_key(), id), id);
        self.rows.insert(id, row);
    }

    fn drop_untracked(&mut self, id: u64) {
        if let Some(row) = self.rows.remove(&id) {
            self.by_key.remove(&row.key());
            self.by_order.remove(&(row.order_key(), id));
        }
    }
}

impl<T: Row> UndoTable for Table<T> {
    fn begin_level(&mut self) {
        self.levels.push_back(Level::new(self.next_id));
    }

    fn undo_level(&mut self) {
        let level = self.levels.pop_back().expect("undo level underflow");
        for (id, original) in level.modified {
            self.drop_untracked(id);
            self.insert_untracked(id, original);
        }
        for id in level.created {
            self.drop_untracked(id);
        }
        for (id, original) in level.removed {
            self.insert_untracked(id, original);
        }
        self.next_id = level.next_id;
    }

    fn squash_level(&mut self) {
        let top = self.levels.pop_back().expect("squash level underflow");
        let Some(parent) = self.levels.back_mut() else {
            // no enclosing level: the merged mutations become trunk state
            return;
        };
        for id in top.created {
            parent.created.insert(id);
        }
        for (id, original) in top.modified {
            if parent.created.contains(&id) {
                continue;
            }
            parent.modified.entry(id).or_insert(original);
        }
        for (id, original) in top.removed {
            if parent.created.remove(&id) {
                continue;
            }
            if let Some(parent_original) = parent.modified.remove(&id) {
                parent.removed.insert(id, parent_original);
            } else {
                parent.removed.insert(id, original);
            }
        }
    }

    fn commit_oldest(&mut self) {
        self.levels.pop_front().expect("commit level underflow");
    }
}

/// Token for one nested undo level. Linear: every session must be consumed
/// by `push_session`, `squash_session` or `rollback_session`; the drop guard
/// only exists to flag controller bugs.
#[must_use]
pub struct Session {
    pub(crate) depth: usize,
}

impl Session {
    pub(crate) fn disabled() -> Self {
        Self { depth: 0 }
    }

    pub fn enabled(&self) -> bool {
        self.depth > 0
    }

    pub(crate) fn defuse(mut self) -> usize {
        let depth = self.depth;
        self.depth = 0;
        depth
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug_assert!(
            self.depth == 0,
            "undo session dropped without push/squash/rollback"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct Named {
        name: String,
        rank: u64,
    }

    impl Row for Named {
        const NAME: &'static str = "named";
        type Key = String;
        type OrderKey = u64;

        fn key(&self) -> String {
            self.name.clone()
        }

        fn order_key(&self) -> u64 {
            self.rank
        }
    }

    fn named(name: &str, rank: u64) -> Named {
        Named {
            name: name.into(),
            rank,
        }
    }

    #[test]
    fn create_rejects_duplicate_keys() {
        let mut table = Table::<Named>::new();
        table.create(named("a", 1)).unwrap();
        assert!(table.create(named("a", 2)).is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn undo_reverts_create_modify_remove() {
        let mut table = Table::<Named>::new();
        table.create(named("a", 1)).unwrap();
        table.create(named("b", 2)).unwrap();

        table.begin_level();
        table.create(named("c", 3)).unwrap();
        table.modify(&"a".into(), |row| row.rank = 9).unwrap();
        table.remove(&"b".into()).unwrap();
        assert_eq!(table.len(), 2);

        table.undo_level();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&"a".into()).unwrap().rank, 1);
        assert!(table.contains(&"b".into()));
        assert!(!table.contains(&"c".into()));
    }

    #[test]
    fn squash_folds_into_parent_level() {
        let mut table = Table::<Named>::new();
        table.create(named("a", 1)).unwrap();

        table.begin_level();
        table.modify(&"a".into(), |row| row.rank = 5).unwrap();
        table.begin_level();
        table.modify(&"a".into(), |row| row.rank = 7).unwrap();
        table.create(named("b", 2)).unwrap();
        table.squash_level();

        // a single undo reverts both merged levels
        table.undo_level();
        assert_eq!(table.get(&"a".into()).unwrap().rank, 1);
        assert!(!table.contains(&"b".into()));
    }

    #[test]
    fn squash_of_create_then_remove_leaves_no_trace() {
        let mut table = Table::<Named>::new();
        table.begin_level();
        table.create(named("x", 1)).unwrap();
        table.begin_level();
        table.remove(&"x".into()).unwrap();
        table.squash_level();
        table.undo_level();
        assert!(table.is_empty());
    }

    #[test]
    fn commit_discards_oldest_level_only() {
        let mut table = Table::<Named>::new();
        table.begin_level();
        table.create(named("a", 1)).unwrap();
        table.begin_level();
        table.create(named("b", 2)).unwrap();

        table.commit_oldest();
        table.undo_level();
        assert!(table.contains(&"a".into()));
        assert!(!table.contains(&"b".into()));
    }

    #[test]
    fn order_index_follows_rank_changes() {
        let mut table = Table::<Named>::new();
        table.create(named("a", 3)).unwrap();
        table.create(named("b", 1)).unwrap();
        table.create(named("c", 2)).unwrap();
        let ranked: Vec<&str> = table.by_order().map(|row| row.name.as_str()).collect();
        assert_eq!(ranked, ["b", "c", "a"]);

        table.modify(&"a".into(), |row| row.rank = 0).unwrap();
        let ranked: Vec<&str> = table.by_order().map(|row| row.name.as_str()).collect();
        assert_eq!(ranked, ["a", "b", "c"]);
    }
}
