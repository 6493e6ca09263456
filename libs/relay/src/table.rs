//! Backend id allocation and the per-session backend table.
//!
//! Ids start at 1 and only ever increase, so an id that was evicted can never
//! resolve to a newer backend. Entries live in a vector kept sorted by id,
//! bounded by a configurable capacity of live backends.

use std::fmt;
use std::num::NonZeroU32;

use crate::error::RelayError;

/// Default maximum number of live backends per session.
pub const DEFAULT_MAX_BACKENDS: usize = 1024;

/// Identifier of a backend within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackendId(NonZeroU32);

impl BackendId {
    /// Wrap a raw id. Returns `None` for 0, which is reserved.
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Live backends keyed by id.
#[derive(Debug)]
pub struct BackendTable<T> {
    entries: Vec<(BackendId, T)>,
    cursor: u32,
    capacity: usize,
}

impl<T> BackendTable<T> {
    /// Create an empty table allowing `capacity` live entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            cursor: 0,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The id the next successful insert will receive.
    ///
    /// Fails with [`RelayError::TableFull`] when no slot is free.
    pub fn next_id(&self) -> Result<BackendId, RelayError> {
        if self.entries.len() >= self.capacity {
            return Err(RelayError::TableFull {
                capacity: self.capacity,
            });
        }
        self.cursor
            .checked_add(1)
            .and_then(BackendId::new)
            .ok_or(RelayError::TableFull {
                capacity: self.capacity,
            })
    }

    /// Insert a value built from its freshly allocated id.
    pub fn insert_with(
        &mut self,
        build: impl FnOnce(BackendId) -> T,
    ) -> Result<BackendId, RelayError> {
        let id = self.next_id()?;
        self.cursor = id.get();
        // Ids are monotonic, so pushing keeps the vector sorted.
        self.entries.push((id, build(id)));
        Ok(id)
    }

    fn position(&self, id: BackendId) -> Option<usize> {
        self.entries.binary_search_by_key(&id, |(k, _)| *k).ok()
    }

    pub fn contains(&self, id: BackendId) -> bool {
        self.position(id).is_some()
    }

    pub fn get(&self, id: BackendId) -> Option<&T> {
        self.position(id).map(|i| &self.entries[i].1)
    }

    pub fn get_mut(&mut self, id: BackendId) -> Option<&mut T> {
        self.position(id).map(|i| &mut self.entries[i].1)
    }

    /// Remove every entry, in id order.
    pub fn drain(&mut self) -> impl Iterator<Item = (BackendId, T)> + '_ {
        self.entries.drain(..)
    }

    /// Live ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = BackendId> + '_ {
        self.entries.iter().map(|(id, _)| *id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (BackendId, &T)> {
        self.entries.iter().map(|(id, v)| (*id, v))
    }

    /// First entry after `after` (wrapping around) that satisfies `pred`.
    pub fn find_after(&self, after: Option<BackendId>, pred: impl Fn(&T) -> bool) -> Option<BackendId> {
        let start = match after {
            Some(after) => self.entries.partition_point(|(id, _)| *id <= after),
            None => 0,
        };
        let (head, tail) = self.entries.split_at(start);
        tail.iter()
            .chain(head.iter())
            .find(|(_, v)| pred(v))
            .map(|(id, _)| *id)
    }
}
