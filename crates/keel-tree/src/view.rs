//! Bounded views over a tree.
//!
//! A view restricts a tree to a key range. Reads outside the range
//! see nothing; stores outside the range are constraint violations.

use keel_common::error::{KeelError, KeelResult};
use keel_txn::Txn;

use crate::cursor::TreeCursor;
use crate::tree::Tree;

/// One end of a view's range.
#[derive(Debug, Clone)]
pub struct Bound {
    key: Option<Vec<u8>>,
    inclusive: bool,
}

impl Bound {
    /// An unbounded end.
    #[must_use]
    pub fn open() -> Bound {
        Bound {
            key: None,
            inclusive: true,
        }
    }

    /// A bound including `key`.
    #[must_use]
    pub fn inclusive(key: &[u8]) -> Bound {
        Bound {
            key: Some(key.to_vec()),
            inclusive: true,
        }
    }

    /// A bound excluding `key`.
    #[must_use]
    pub fn exclusive(key: &[u8]) -> Bound {
        Bound {
            key: Some(key.to_vec()),
            inclusive: false,
        }
    }
}

/// A tree restricted to a key range.
#[derive(Clone)]
pub struct BoundedView {
    tree: Tree,
    low: Bound,
    high: Bound,
}

impl BoundedView {
    pub(crate) fn new(tree: Tree, low: Bound, high: Bound) -> BoundedView {
        BoundedView { tree, low, high }
    }

    /// A view over every key sharing `prefix`.
    pub(crate) fn prefix(tree: Tree, prefix: &[u8]) -> BoundedView {
        let high = prefix_successor(prefix)
            .map(|key| Bound {
                key: Some(key),
                inclusive: false,
            })
            .unwrap_or_else(Bound::open);
        BoundedView {
            tree,
            low: Bound::inclusive(prefix),
            high,
        }
    }

    /// Returns true when `key` lies inside the view's range.
    #[must_use]
    pub fn in_range(&self, key: &[u8]) -> bool {
        if let Some(low) = &self.low.key {
            let ok = if self.low.inclusive {
                key >= low.as_slice()
            } else {
                key > low.as_slice()
            };
            if !ok {
                return false;
            }
        }
        if let Some(high) = &self.high.key {
            let ok = if self.high.inclusive {
                key <= high.as_slice()
            } else {
                key < high.as_slice()
            };
            if !ok {
                return false;
            }
        }
        true
    }

    /// Loads a value; keys outside the range read as absent.
    pub fn load(&self, txn: Option<&Txn>, key: &[u8]) -> KeelResult<Option<Vec<u8>>> {
        if !self.in_range(key) {
            return Ok(None);
        }
        self.tree.load(txn, key)
    }

    /// Stores a value; keys outside the range are rejected.
    pub fn store(&self, txn: Option<&Txn>, key: &[u8], value: Option<&[u8]>) -> KeelResult<()> {
        if !self.in_range(key) {
            return Err(KeelError::view_constraint(
                "key is outside the view's range",
            ));
        }
        self.tree.store(txn, key, value)
    }

    /// Counts the entries inside the view.
    pub fn count(&self) -> KeelResult<u64> {
        let mut cursor = self.new_cursor(None);
        let mut count = 0;
        let mut positioned = cursor.first()?;
        while positioned {
            count += 1;
            positioned = cursor.next()?;
        }
        Ok(count)
    }

    /// Opens a cursor confined to the view.
    #[must_use]
    pub fn new_cursor(&self, txn: Option<&Txn>) -> BoundedCursor {
        BoundedCursor {
            cursor: self.tree.new_cursor(txn),
            view: self.clone(),
        }
    }
}

/// A cursor confined to a view's range.
pub struct BoundedCursor {
    cursor: TreeCursor,
    view: BoundedView,
}

impl BoundedCursor {
    /// Returns the bound key, if positioned inside the range.
    #[must_use]
    pub fn key(&self) -> Option<&[u8]> {
        self.cursor.key()
    }

    /// Loads the value at the current position.
    pub fn load(&mut self) -> KeelResult<Option<Vec<u8>>> {
        self.cursor.load()
    }

    /// Positions at the first in-range entry.
    pub fn first(&mut self) -> KeelResult<bool> {
        let positioned = match &self.view.low.key {
            None => self.cursor.first()?,
            Some(low) => {
                if self.view.low.inclusive {
                    self.cursor.find_ge(low)?
                } else {
                    self.cursor.find_gt(low)?
                }
            }
        };
        Ok(positioned && self.clamp())
    }

    /// Positions at the last in-range entry.
    pub fn last(&mut self) -> KeelResult<bool> {
        let positioned = match &self.view.high.key {
            None => self.cursor.last()?,
            Some(high) => {
                if self.view.high.inclusive {
                    self.cursor.find_le(high)?
                } else {
                    self.cursor.find_lt(high)?
                }
            }
        };
        Ok(positioned && self.clamp())
    }

    /// Advances within the range.
    pub fn next(&mut self) -> KeelResult<bool> {
        Ok(self.cursor.next()? && self.clamp())
    }

    /// Steps back within the range.
    pub fn previous(&mut self) -> KeelResult<bool> {
        Ok(self.cursor.previous()? && self.clamp())
    }

    fn clamp(&mut self) -> bool {
        match self.cursor.key() {
            Some(key) if self.view.in_range(key) => true,
            _ => {
                self.cursor.reset();
                false
            }
        }
    }
}

/// The smallest key ordered after every key with `prefix`, or `None`
/// when the prefix is all `0xff`.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut succ = prefix.to_vec();
    while let Some(last) = succ.last() {
        if *last == 0xff {
            succ.pop();
        } else {
            *succ.last_mut().unwrap() += 1;
            return Some(succ);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(b"abc"), Some(b"abd".to_vec()));
        assert_eq!(prefix_successor(b"a\xff"), Some(b"b".to_vec()));
        assert_eq!(prefix_successor(b"\xff\xff"), None);
    }

    #[test]
    fn test_bound_construction() {
        let bound = Bound::inclusive(b"k");
        assert!(bound.inclusive);
        let bound = Bound::exclusive(b"k");
        assert!(!bound.inclusive);
        assert!(Bound::open().key.is_none());
    }
}
