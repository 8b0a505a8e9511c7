//! In-memory column-family store with transactions and checkpoints

use crate::error::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

/// Identifies a column family
pub type ColumnId = u16;

type Column = BTreeMap<Vec<u8>, Vec<u8>>;
type Columns = BTreeMap<ColumnId, Column>;

/// Read access shared by the store and its transactions
pub trait ReadContext {
    fn get(&self, column: ColumnId, key: &[u8]) -> Option<Vec<u8>>;

    /// First entry of `column` starting with `prefix` whose key is greater
    /// than `after` (or the first one with the prefix when `after` is None)
    fn next_after(
        &self,
        column: ColumnId,
        prefix: &[u8],
        after: Option<&[u8]>,
    ) -> Option<(Vec<u8>, Vec<u8>)>;

    /// Lazily iterate all entries of `column` with the given key prefix
    ///
    /// Every step takes a fresh look at the store, so no lock is held while
    /// the caller consumes the iterator.
    fn scan<'a>(&'a self, column: ColumnId, prefix: Vec<u8>) -> ScanIter<'a, Self>
    where
        Self: Sized,
    {
        ScanIter {
            ctx: self,
            column,
            prefix,
            cursor: None,
            done: false,
        }
    }
}

/// Iterator returned by [`ReadContext::scan`]
pub struct ScanIter<'a, C: ReadContext + ?Sized> {
    ctx: &'a C,
    column: ColumnId,
    prefix: Vec<u8>,
    cursor: Option<Vec<u8>>,
    done: bool,
}

impl<'a, C: ReadContext + ?Sized> Iterator for ScanIter<'a, C> {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self
            .ctx
            .next_after(self.column, &self.prefix, self.cursor.as_deref())
        {
            Some((key, value)) => {
                self.cursor = Some(key.clone());
                Some((key, value))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

fn first_in_column(
    column: &Column,
    prefix: &[u8],
    after: Option<&[u8]>,
) -> Option<(Vec<u8>, Vec<u8>)> {
    let lower = match after {
        Some(after) if after >= prefix => Bound::Excluded(after),
        _ => Bound::Included(prefix),
    };
    column
        .range::<[u8], _>((lower, Bound::Unbounded))
        .next()
        .filter(|(key, _)| key.starts_with(prefix))
        .map(|(key, value)| (key.clone(), value.clone()))
}

/// Shared handle to the keyed state of one partition
///
/// Clones observe the same data. [`StateDb::restore`] replaces the contents
/// in place, so handles held elsewhere stay valid.
#[derive(Clone, Default)]
pub struct StateDb {
    columns: Arc<RwLock<Columns>>,
}

impl StateDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a transaction buffering writes until [`Transaction::commit`]
    pub fn transaction(&self) -> Transaction {
        Transaction {
            db: self.clone(),
            writes: BTreeMap::new(),
        }
    }

    /// Serialize a consistent view of every column
    pub fn checkpoint(&self) -> Result<Vec<u8>> {
        let columns = self.columns.read();
        Ok(bincode::serialize(&*columns)?)
    }

    /// Replace the contents with a checkpoint
    pub fn restore(&self, checkpoint: &[u8]) -> Result<()> {
        let columns: Columns = bincode::deserialize(checkpoint)?;
        *self.columns.write() = columns;
        Ok(())
    }

    pub fn clear(&self) {
        self.columns.write().clear();
    }

    /// Content hash, equal on every replica that applied the same records
    pub fn checksum(&self) -> Result<String> {
        Ok(blake3::hash(&self.checkpoint()?).to_hex().to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.columns.read().values().all(|c| c.is_empty())
    }
}

impl ReadContext for StateDb {
    fn get(&self, column: ColumnId, key: &[u8]) -> Option<Vec<u8>> {
        self.columns
            .read()
            .get(&column)
            .and_then(|c| c.get(key))
            .cloned()
    }

    fn next_after(
        &self,
        column: ColumnId,
        prefix: &[u8],
        after: Option<&[u8]>,
    ) -> Option<(Vec<u8>, Vec<u8>)> {
        let columns = self.columns.read();
        first_in_column(columns.get(&column)?, prefix, after)
    }
}

/// Buffered writes over a [`StateDb`]
///
/// Reads see the transaction's own writes merged over the committed state.
/// Dropping a transaction without committing discards it.
pub struct Transaction {
    db: StateDb,
    /// `None` marks a deletion
    writes: BTreeMap<ColumnId, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
}

impl Transaction {
    pub fn put(&mut self, column: ColumnId, key: Vec<u8>, value: Vec<u8>) {
        self.writes.entry(column).or_default().insert(key, Some(value));
    }

    pub fn delete(&mut self, column: ColumnId, key: Vec<u8>) {
        self.writes.entry(column).or_default().insert(key, None);
    }

    pub fn is_empty(&self) -> bool {
        self.writes.values().all(|w| w.is_empty())
    }

    /// Apply all buffered writes atomically
    pub fn commit(self) {
        let mut columns = self.db.columns.write();
        for (id, writes) in self.writes {
            let column = columns.entry(id).or_default();
            for (key, value) in writes {
                match value {
                    Some(value) => {
                        column.insert(key, value);
                    }
                    None => {
                        column.remove(&key);
                    }
                }
            }
        }
    }

    /// Discard all buffered writes
    pub fn rollback(&mut self) {
        self.writes.clear();
    }

    fn next_write(
        &self,
        column: ColumnId,
        prefix: &[u8],
        after: Option<&[u8]>,
    ) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        let writes = self.writes.get(&column)?;
        let lower = match after {
            Some(after) if after >= prefix => Bound::Excluded(after),
            _ => Bound::Included(prefix),
        };
        writes
            .range::<[u8], _>((lower, Bound::Unbounded))
            .next()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
    }
}

impl ReadContext for Transaction {
    fn get(&self, column: ColumnId, key: &[u8]) -> Option<Vec<u8>> {
        match self.writes.get(&column).and_then(|w| w.get(key)) {
            Some(value) => value.clone(),
            None => self.db.get(column, key),
        }
    }

    fn next_after(
        &self,
        column: ColumnId,
        prefix: &[u8],
        after: Option<&[u8]>,
    ) -> Option<(Vec<u8>, Vec<u8>)> {
        let mut cursor = after.map(|a| a.to_vec());
        loop {
            let committed = self.db.next_after(column, prefix, cursor.as_deref());
            let written = self.next_write(column, prefix, cursor.as_deref());

            match (committed, written) {
                (None, None) => return None,
                (Some(committed), None) => return Some(committed),
                (committed, Some((key, value))) => {
                    if let Some((committed_key, committed_value)) = committed {
                        if committed_key < key {
                            return Some((committed_key, committed_value));
                        }
                    }
                    match value {
                        Some(value) => return Some((key, value)),
                        // Deleted in this transaction, continue behind it
                        None => cursor = Some(key),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLUMN: ColumnId = 1;

    fn keys<C: ReadContext>(ctx: &C, prefix: &[u8]) -> Vec<Vec<u8>> {
        ctx.scan(COLUMN, prefix.to_vec()).map(|(k, _)| k).collect()
    }

    #[test]
    fn test_transaction_is_invisible_until_commit() {
        let db = StateDb::new();
        let mut txn = db.transaction();
        txn.put(COLUMN, b"a".to_vec(), b"1".to_vec());

        assert_eq!(txn.get(COLUMN, b"a"), Some(b"1".to_vec()));
        assert_eq!(db.get(COLUMN, b"a"), None);

        txn.commit();
        assert_eq!(db.get(COLUMN, b"a"), Some(b"1".to_vec()));
    }

    #[test]
    fn test_rollback_discards_writes() {
        let db = StateDb::new();
        let mut txn = db.transaction();
        txn.put(COLUMN, b"a".to_vec(), b"1".to_vec());
        txn.rollback();
        assert!(txn.is_empty());
        txn.commit();
        assert!(db.is_empty());
    }

    #[test]
    fn test_scan_merges_writes_and_deletes() {
        let db = StateDb::new();
        let mut setup = db.transaction();
        for key in [b"p1", b"p3", b"p5", b"q1"] {
            setup.put(COLUMN, key.to_vec(), b"v".to_vec());
        }
        setup.commit();

        let mut txn = db.transaction();
        txn.put(COLUMN, b"p2".to_vec(), b"new".to_vec());
        txn.delete(COLUMN, b"p3".to_vec());
        txn.delete(COLUMN, b"p5".to_vec());
        txn.put(COLUMN, b"p6".to_vec(), b"new".to_vec());

        assert_eq!(
            keys(&txn, b"p"),
            vec![b"p1".to_vec(), b"p2".to_vec(), b"p6".to_vec()]
        );
        assert_eq!(
            keys(&db, b"p"),
            vec![b"p1".to_vec(), b"p3".to_vec(), b"p5".to_vec()]
        );
    }

    #[test]
    fn test_scan_is_lazy() {
        let db = StateDb::new();
        let mut setup = db.transaction();
        for i in 0u8..10 {
            setup.put(COLUMN, vec![i], vec![i]);
        }
        setup.commit();

        let mut scan = db.scan(COLUMN, Vec::new());
        assert_eq!(scan.next(), Some((vec![0], vec![0])));

        // Writes between steps are observed
        let mut txn = db.transaction();
        txn.delete(COLUMN, vec![1]);
        txn.commit();
        assert_eq!(scan.next(), Some((vec![2], vec![2])));
        assert_eq!(scan.take(2).count(), 2);
    }

    #[test]
    fn test_checkpoint_restore_keeps_handles() {
        let db = StateDb::new();
        let handle = db.clone();
        let mut txn = db.transaction();
        txn.put(COLUMN, b"k".to_vec(), b"v".to_vec());
        txn.commit();
        let checkpoint = db.checkpoint().unwrap();
        let checksum = db.checksum().unwrap();

        db.clear();
        assert_eq!(handle.get(COLUMN, b"k"), None);

        db.restore(&checkpoint).unwrap();
        assert_eq!(handle.get(COLUMN, b"k"), Some(b"v".to_vec()));
        assert_eq!(handle.checksum().unwrap(), checksum);
    }
}
