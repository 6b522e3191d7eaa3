//! # Profile Whitelist
//!
//! The set of users and groups the local profile may be shared with.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     SHARE DECISION                                      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ShareTarget                                                            │
//! │    ├── Address(addr) ─────────────────► UserEntry(addr) in whitelist?   │
//! │    └── Thread(thread)                                                   │
//! │          ├── Contact(addr) ───────────► UserEntry(addr) in whitelist?   │
//! │          └── Group(group_id) ─────────► GroupEntry(id)  in whitelist?   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! User entries are matched with address equality, resolved through the
//! profile record so that an entry stored under a phone number is found
//! by the UUID the number later turned out to belong to.

mod policy;

pub use policy::WhitelistPolicy;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::address::Address;

/// Opaque group identifier
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(Vec<u8>);

impl GroupId {
    /// Wrap raw group id bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for GroupId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for GroupId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({})", hex::encode(&self.0))
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

/// One member of the whitelist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WhitelistEntry {
    /// A single user
    User(Address),
    /// A group conversation
    Group(GroupId),
}

/// A conversation the user takes part in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConversationThread {
    /// One-to-one conversation
    Contact(Address),
    /// Group conversation
    Group(GroupId),
}

impl ConversationThread {
    /// The whitelist entry that governs this thread
    pub fn whitelist_entry(&self) -> WhitelistEntry {
        match self {
            ConversationThread::Contact(address) => WhitelistEntry::User(address.clone()),
            ConversationThread::Group(group_id) => WhitelistEntry::Group(group_id.clone()),
        }
    }
}

/// Who a share decision is about
#[derive(Debug, Clone, PartialEq)]
pub enum ShareTarget {
    /// A user
    Address(Address),
    /// A conversation
    Thread(ConversationThread),
}

impl ShareTarget {
    /// The whitelist entry that governs this target
    pub fn whitelist_entry(&self) -> WhitelistEntry {
        match self {
            ShareTarget::Address(address) => WhitelistEntry::User(address.clone()),
            ShareTarget::Thread(thread) => thread.whitelist_entry(),
        }
    }
}

impl From<Address> for ShareTarget {
    fn from(address: Address) -> Self {
        ShareTarget::Address(address)
    }
}

impl From<ConversationThread> for ShareTarget {
    fn from(thread: ConversationThread) -> Self {
        ShareTarget::Thread(thread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_thread_decomposition() {
        let alice = Address::from_uuid(Uuid::from_u128(1));
        let group = GroupId::new(vec![7u8; 16]);

        assert_eq!(
            ShareTarget::from(ConversationThread::Contact(alice.clone())).whitelist_entry(),
            WhitelistEntry::User(alice.clone())
        );
        assert_eq!(
            ShareTarget::from(ConversationThread::Group(group.clone())).whitelist_entry(),
            WhitelistEntry::Group(group)
        );
        assert_eq!(
            ShareTarget::from(alice.clone()).whitelist_entry(),
            WhitelistEntry::User(alice)
        );
    }

    #[test]
    fn test_group_id_display_is_hex() {
        assert_eq!(GroupId::new(vec![0xAB, 0x01]).to_string(), "ab01");
    }
}
