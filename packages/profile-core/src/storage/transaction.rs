//! Read and write transactions.
//!
//! A [`WriteTransaction`] derefs to a [`ReadTransaction`], so every read
//! helper also works inside a write. Besides the SQL transaction it collects
//! what the commit changed: the identifier keys of touched profiles, whether
//! the whitelist moved, and the outbound sync events to flush afterwards.

use rusqlite::Connection;
use std::collections::BTreeSet;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::sync::SyncEvent;

/// Global write generation
///
/// Bumped once per commit that touched a profile, while the connection lock
/// is still held. Cache entries remember the generation they were loaded at.
#[derive(Debug, Clone, Default)]
pub struct WriteGeneration(Arc<AtomicU64>);

impl WriteGeneration {
    /// The latest committed generation
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// A read-only view of committed state
pub struct ReadTransaction<'conn> {
    tx: rusqlite::Transaction<'conn>,
    generation: u64,
}

impl<'conn> ReadTransaction<'conn> {
    pub(crate) fn new(tx: rusqlite::Transaction<'conn>, generation: u64) -> Self {
        Self { tx, generation }
    }

    /// Write generation this transaction's snapshot was taken at
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.tx
    }

    pub(crate) fn into_inner(self) -> rusqlite::Transaction<'conn> {
        self.tx
    }
}

/// What a write transaction changed
#[derive(Debug, Default, Clone)]
pub struct ChangeSet {
    /// Identifier keys of every profile row written, before and after
    pub touched: BTreeSet<String>,
    /// Whether any whitelist row was inserted, moved or deleted
    pub whitelist_changed: bool,
    /// Locally initiated changes to hand to the sync collaborator
    pub outbound: Vec<SyncEvent>,
}

impl ChangeSet {
    /// Whether the commit changed nothing observable
    pub fn is_empty(&self) -> bool {
        self.touched.is_empty() && !self.whitelist_changed && self.outbound.is_empty()
    }
}

/// A read-write transaction
///
/// Dropping it without commit rolls back.
pub struct WriteTransaction<'conn> {
    read: ReadTransaction<'conn>,
    changes: ChangeSet,
}

impl<'conn> WriteTransaction<'conn> {
    pub(crate) fn new(tx: rusqlite::Transaction<'conn>, generation: u64) -> Self {
        Self {
            read: ReadTransaction::new(tx, generation),
            changes: ChangeSet::default(),
        }
    }

    /// Changes recorded so far
    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    pub(crate) fn touch<I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.changes.touched.extend(keys);
    }

    pub(crate) fn mark_whitelist_changed(&mut self) {
        self.changes.whitelist_changed = true;
    }

    pub(crate) fn enqueue_sync(&mut self, event: SyncEvent) {
        self.changes.outbound.push(event);
    }

    pub(crate) fn into_parts(self) -> (ReadTransaction<'conn>, ChangeSet) {
        (self.read, self.changes)
    }
}

impl<'conn> Deref for WriteTransaction<'conn> {
    type Target = ReadTransaction<'conn>;

    fn deref(&self) -> &Self::Target {
        &self.read
    }
}
