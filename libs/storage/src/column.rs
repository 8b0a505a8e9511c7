//! Typed access to column families

use crate::db::{ColumnId, ReadContext, Transaction};
use crate::error::{Result, StorageError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Order-preserving binary key encoding
///
/// Integers are big-endian so byte order equals numeric order; strings are
/// length-prefixed so that a composite key's prefix never matches a longer
/// string.
pub trait DbKey: Sized {
    fn write_key(&self, out: &mut Vec<u8>);

    fn read_key(input: &mut &[u8]) -> std::result::Result<Self, String>;

    fn to_key_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_key(&mut out);
        out
    }
}

fn take<'a>(input: &mut &'a [u8], len: usize) -> std::result::Result<&'a [u8], String> {
    if input.len() < len {
        return Err(format!("needed {} bytes, {} left", len, input.len()));
    }
    let (head, tail) = input.split_at(len);
    *input = tail;
    Ok(head)
}

macro_rules! int_key {
    ($($ty:ty),*) => {
        $(
            impl DbKey for $ty {
                fn write_key(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_be_bytes());
                }

                fn read_key(input: &mut &[u8]) -> std::result::Result<Self, String> {
                    let bytes = take(input, std::mem::size_of::<$ty>())?;
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    buf.copy_from_slice(bytes);
                    Ok(<$ty>::from_be_bytes(buf))
                }
            }
        )*
    };
}

int_key!(u16, u32, u64);

impl DbKey for String {
    fn write_key(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.len() as u32).to_be_bytes());
        out.extend_from_slice(self.as_bytes());
    }

    fn read_key(input: &mut &[u8]) -> std::result::Result<Self, String> {
        let len = u32::read_key(input)? as usize;
        let bytes = take(input, len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| e.to_string())
    }
}

impl<A: DbKey, B: DbKey> DbKey for (A, B) {
    fn write_key(&self, out: &mut Vec<u8>) {
        self.0.write_key(out);
        self.1.write_key(out);
    }

    fn read_key(input: &mut &[u8]) -> std::result::Result<Self, String> {
        Ok((A::read_key(input)?, B::read_key(input)?))
    }
}

impl<A: DbKey, B: DbKey, C: DbKey> DbKey for (A, B, C) {
    fn write_key(&self, out: &mut Vec<u8>) {
        self.0.write_key(out);
        self.1.write_key(out);
        self.2.write_key(out);
    }

    fn read_key(input: &mut &[u8]) -> std::result::Result<Self, String> {
        Ok((A::read_key(input)?, B::read_key(input)?, C::read_key(input)?))
    }
}

/// A column family with typed keys and bincode-encoded values
pub struct TypedColumn<K, V> {
    id: ColumnId,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for TypedColumn<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for TypedColumn<K, V> {}

impl<K: DbKey, V: Serialize + DeserializeOwned> TypedColumn<K, V> {
    pub const fn new(id: ColumnId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> ColumnId {
        self.id
    }

    pub fn get<C: ReadContext + ?Sized>(&self, ctx: &C, key: &K) -> Result<Option<V>> {
        ctx.get(self.id, &key.to_key_bytes())
            .map(|bytes| bincode::deserialize(&bytes).map_err(StorageError::from))
            .transpose()
    }

    pub fn exists<C: ReadContext + ?Sized>(&self, ctx: &C, key: &K) -> bool {
        ctx.get(self.id, &key.to_key_bytes()).is_some()
    }

    pub fn put(&self, txn: &mut Transaction, key: &K, value: &V) -> Result<()> {
        txn.put(self.id, key.to_key_bytes(), bincode::serialize(value)?);
        Ok(())
    }

    pub fn delete(&self, txn: &mut Transaction, key: &K) {
        txn.delete(self.id, key.to_key_bytes());
    }

    /// Lazily iterate every entry in key order
    pub fn iter<'a, C: ReadContext>(
        &self,
        ctx: &'a C,
    ) -> impl Iterator<Item = Result<(K, V)>> + 'a
    where
        K: 'a,
        V: 'a,
    {
        self.iter_raw(ctx, Vec::new())
    }

    /// Lazily iterate the entries whose key starts with `prefix`
    pub fn iter_prefix<'a, C: ReadContext, P: DbKey>(
        &self,
        ctx: &'a C,
        prefix: &P,
    ) -> impl Iterator<Item = Result<(K, V)>> + 'a
    where
        K: 'a,
        V: 'a,
    {
        self.iter_raw(ctx, prefix.to_key_bytes())
    }

    fn iter_raw<'a, C: ReadContext>(
        &self,
        ctx: &'a C,
        prefix: Vec<u8>,
    ) -> impl Iterator<Item = Result<(K, V)>> + 'a
    where
        K: 'a,
        V: 'a,
    {
        let id = self.id;
        ctx.scan(id, prefix).map(move |(key, value)| {
            let mut input = key.as_slice();
            let key = K::read_key(&mut input).map_err(|reason| StorageError::CorruptedKey {
                column: id,
                reason,
            })?;
            let value = bincode::deserialize(&value)?;
            Ok((key, value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StateDb;
    use proptest::prelude::*;

    const BY_NAME: TypedColumn<(String, u64), u64> = TypedColumn::new(7);

    #[test]
    fn test_prefix_scan_does_not_match_longer_strings() {
        let db = StateDb::new();
        let mut txn = db.transaction();
        BY_NAME.put(&mut txn, &("ab".to_string(), 1), &10).unwrap();
        BY_NAME.put(&mut txn, &("a".to_string(), 2), &20).unwrap();
        BY_NAME.put(&mut txn, &("a".to_string(), 1), &30).unwrap();
        txn.commit();

        let entries: Vec<_> = BY_NAME
            .iter_prefix(&db, &"a".to_string())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            entries,
            vec![(("a".to_string(), 1), 30), (("a".to_string(), 2), 20)]
        );
    }

    #[test]
    fn test_get_put_delete() {
        let db = StateDb::new();
        let key = ("tenant".to_string(), 5);
        let mut txn = db.transaction();
        BY_NAME.put(&mut txn, &key, &1).unwrap();
        assert_eq!(BY_NAME.get(&txn, &key).unwrap(), Some(1));
        BY_NAME.delete(&mut txn, &key);
        assert!(!BY_NAME.exists(&txn, &key));
    }

    proptest! {
        #[test]
        fn prop_integer_keys_sort_numerically(a: u64, b: u64) {
            prop_assert_eq!(a.cmp(&b), a.to_key_bytes().cmp(&b.to_key_bytes()));
        }

        #[test]
        fn prop_composite_keys_decode(name in "[a-z]{0,12}", id: u64) {
            let bytes = (name.clone(), id).to_key_bytes();
            let mut input = bytes.as_slice();
            prop_assert_eq!(<(String, u64)>::read_key(&mut input).unwrap(), (name, id));
            prop_assert!(input.is_empty());
        }
    }
}
