//! Whitelist decisions and mutations.

use std::sync::Arc;

use super::{ConversationThread, GroupId, ShareTarget, WhitelistEntry};
use crate::address::Address;
use crate::error::Result;
use crate::profiles::ProfileStore;
use crate::storage::{ReadTransaction, WriteTransaction};
use crate::sync::SyncEvent;

/// Decides who the local profile is shared with
///
/// Mutations flagged `was_locally_initiated` are queued for outbound sync
/// when they change membership. Repeated adds and removes are no-ops.
pub struct WhitelistPolicy {
    store: Arc<ProfileStore>,
}

impl WhitelistPolicy {
    /// Create a policy over a store
    pub fn new(store: Arc<ProfileStore>) -> Self {
        Self { store }
    }

    /// Whether the local profile may be shared with the target
    pub fn share_profile_with(&self, target: &ShareTarget, tx: &ReadTransaction<'_>) -> Result<bool> {
        self.contains(&target.whitelist_entry(), tx)
    }

    /// Whether an entry is whitelisted
    pub fn contains(&self, entry: &WhitelistEntry, tx: &ReadTransaction<'_>) -> Result<bool> {
        self.store.is_whitelisted(tx, entry)
    }

    /// Every whitelist entry
    pub fn all(&self, tx: &ReadTransaction<'_>) -> Result<Vec<WhitelistEntry>> {
        self.store.all_whitelist(tx)
    }

    /// Add a user
    pub fn add_user(
        &self,
        address: &Address,
        was_locally_initiated: bool,
        tx: &mut WriteTransaction<'_>,
    ) -> Result<bool> {
        self.add(WhitelistEntry::User(address.clone()), was_locally_initiated, tx)
    }

    /// Add several users; returns how many were new
    pub fn add_users(
        &self,
        addresses: &[Address],
        was_locally_initiated: bool,
        tx: &mut WriteTransaction<'_>,
    ) -> Result<usize> {
        let mut added = 0;
        for address in addresses {
            if self.add_user(address, was_locally_initiated, tx)? {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Remove a user
    pub fn remove_user(
        &self,
        address: &Address,
        was_locally_initiated: bool,
        tx: &mut WriteTransaction<'_>,
    ) -> Result<bool> {
        self.remove(WhitelistEntry::User(address.clone()), was_locally_initiated, tx)
    }

    /// Add a group
    pub fn add_group(
        &self,
        group_id: &GroupId,
        was_locally_initiated: bool,
        tx: &mut WriteTransaction<'_>,
    ) -> Result<bool> {
        self.add(WhitelistEntry::Group(group_id.clone()), was_locally_initiated, tx)
    }

    /// Remove a group
    pub fn remove_group(
        &self,
        group_id: &GroupId,
        was_locally_initiated: bool,
        tx: &mut WriteTransaction<'_>,
    ) -> Result<bool> {
        self.remove(WhitelistEntry::Group(group_id.clone()), was_locally_initiated, tx)
    }

    /// Add whatever governs a conversation thread
    pub fn add_thread(
        &self,
        thread: &ConversationThread,
        was_locally_initiated: bool,
        tx: &mut WriteTransaction<'_>,
    ) -> Result<bool> {
        self.add(thread.whitelist_entry(), was_locally_initiated, tx)
    }

    fn add(
        &self,
        entry: WhitelistEntry,
        was_locally_initiated: bool,
        tx: &mut WriteTransaction<'_>,
    ) -> Result<bool> {
        let changed = self.store.add_whitelist(tx, &entry)?;
        if changed && was_locally_initiated {
            tx.enqueue_sync(match entry {
                WhitelistEntry::User(address) => SyncEvent::WhitelistUserAdded { address },
                WhitelistEntry::Group(group_id) => SyncEvent::WhitelistGroupAdded { group_id },
            });
        }
        Ok(changed)
    }

    fn remove(
        &self,
        entry: WhitelistEntry,
        was_locally_initiated: bool,
        tx: &mut WriteTransaction<'_>,
    ) -> Result<bool> {
        let changed = self.store.remove_whitelist(tx, &entry)?;
        if changed && was_locally_initiated {
            tx.enqueue_sync(match entry {
                WhitelistEntry::User(address) => SyncEvent::WhitelistUserRemoved { address },
                WhitelistEntry::Group(group_id) => SyncEvent::WhitelistGroupRemoved { group_id },
            });
        }
        Ok(changed)
    }
}
