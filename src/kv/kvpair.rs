// Copyright 2025 RangeKV Project Authors. Licensed under Apache-2.0.

use std::fmt;

#[cfg(test)]
use proptest_derive::Arbitrary;

use super::HexRepr;
use super::Key;
use super::Value;
use crate::proto::kvrpcpb;

/// One key and the value stored under it.
///
/// Both halves are plain byte buffers and the fields are public; batch
/// operations accept anything `Into<KvPair>`, so `("k".to_owned(),
/// "v".to_owned())` style tuples work directly:
///
/// ```rust
/// # use rangekv_client::KvPair;
/// let pair: KvPair = ("k".to_owned(), "v".to_owned()).into();
/// assert_eq!(pair.value, b"v");
/// ```
#[derive(Default, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(test, derive(Arbitrary))]
pub struct KvPair {
    pub key: Key,
    pub value: Value,
}

impl KvPair {
    #[inline]
    pub fn new(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        KvPair {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl<K, V> From<(K, V)> for KvPair
where
    K: Into<Key>,
    V: Into<Value>,
{
    fn from((k, v): (K, V)) -> Self {
        KvPair::new(k, v)
    }
}

impl From<kvrpcpb::KvPair> for KvPair {
    fn from(pair: kvrpcpb::KvPair) -> Self {
        KvPair::new(pair.key, pair.value)
    }
}

impl From<KvPair> for kvrpcpb::KvPair {
    fn from(pair: KvPair) -> Self {
        kvrpcpb::KvPair {
            key: pair.key.into(),
            value: pair.value,
        }
    }
}

impl AsRef<Key> for KvPair {
    fn as_ref(&self) -> &Key {
        &self.key
    }
}

const DEBUG_VALUE_PREVIEW: usize = 32;

/// Values can be large and arbitrary bytes; show the key in full (hex) but
/// only a bounded hex preview of the value.
impl fmt::Debug for KvPair {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview = &self.value[..self.value.len().min(DEBUG_VALUE_PREVIEW)];
        write!(
            f,
            "{:?} => {}B:{}",
            self.key,
            self.value.len(),
            HexRepr(preview)
        )?;
        if self.value.len() > DEBUG_VALUE_PREVIEW {
            f.write_str("..")?;
        }
        Ok(())
    }
}

/// The per-key outcome of a conditional write (`PutIfAbsent`,
/// `CompareAndSet` and their batch variants).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyOpState {
    pub key: Key,
    /// Whether the conditional write was applied on the server.
    pub taken: bool,
}

impl KeyOpState {
    pub fn new(key: impl Into<Key>, taken: bool) -> Self {
        KeyOpState {
            key: key.into(),
            taken,
        }
    }
}
