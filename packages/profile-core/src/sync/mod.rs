//! # Sync Stream
//!
//! Bridge to the external sync collaborator that mirrors whitelist and
//! profile changes across a user's devices.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           SYNC FLOW                                     │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  local mutation (locally initiated)                                     │
//! │       │  enqueued on the WriteTransaction                               │
//! │       ▼                                                                 │
//! │  commit ──► SyncHub::publish ──► ledger[entity].push(event)             │
//! │                    │                                                    │
//! │                    └──► outbound channel ──► sync collaborator          │
//! │                                                   │                     │
//! │                                                   ▼                     │
//! │  apply_inbound_sync(event) ◄───────────── mirrored back later           │
//! │       │                                                                 │
//! │       ├── latest in ledger[entity] ──► Echo: dropped, entry cleared     │
//! │       ├── older in ledger[entity]  ──► Stale: dropped, older consumed   │
//! │       └── otherwise                ──► Fresh: entry cleared, applied    │
//! │                                        as not locally initiated         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The ledger is an LRU over entities, and each entity keeps only its most
//! recent unacknowledged local changes.

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use tokio::sync::mpsc;

use crate::address::Address;
use crate::crypto::ProfileKey;
use crate::whitelist::GroupId;

/// Entities tracked by the echo ledger before the least recent is dropped
const LEDGER_ENTITIES: usize = 1024;

/// Unacknowledged local changes remembered per entity
const LEDGER_DEPTH: usize = 8;

/// A profile or whitelist change crossing the sync boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// A user was added to the profile whitelist
    WhitelistUserAdded {
        /// The user
        address: Address,
    },
    /// A user was removed from the profile whitelist
    WhitelistUserRemoved {
        /// The user
        address: Address,
    },
    /// A group was added to the profile whitelist
    WhitelistGroupAdded {
        /// The group
        group_id: GroupId,
    },
    /// A group was removed from the profile whitelist
    WhitelistGroupRemoved {
        /// The group
        group_id: GroupId,
    },
    /// A user's profile key changed
    ProfileKeyChanged {
        /// Whose key
        address: Address,
        /// The new key
        profile_key: ProfileKey,
    },
    /// A user's profile name (and possibly avatar) changed
    ProfileNameChanged {
        /// Whose profile
        address: Address,
        /// New given name
        given_name: Option<String>,
        /// New family name
        family_name: Option<String>,
        /// New avatar URL path, `None` if the avatar was not part of the change
        #[serde(default)]
        avatar_url_path: Option<Option<String>>,
    },
}

/// The thing a sync event is about
///
/// The echo ledger groups local changes by entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SyncEntity {
    /// Whitelist membership of a user, by canonical address key
    WhitelistUser(String),
    /// Whitelist membership of a group
    WhitelistGroup(GroupId),
    /// A user's profile key, by canonical address key
    ProfileKey(String),
    /// A user's profile name, by canonical address key
    ProfileName(String),
}

impl SyncEvent {
    /// The entity this event changes
    pub fn entity(&self) -> SyncEntity {
        match self {
            SyncEvent::WhitelistUserAdded { address }
            | SyncEvent::WhitelistUserRemoved { address } => {
                SyncEntity::WhitelistUser(address.canonical_key())
            }
            SyncEvent::WhitelistGroupAdded { group_id }
            | SyncEvent::WhitelistGroupRemoved { group_id } => {
                SyncEntity::WhitelistGroup(group_id.clone())
            }
            SyncEvent::ProfileKeyChanged { address, .. } => {
                SyncEntity::ProfileKey(address.canonical_key())
            }
            SyncEvent::ProfileNameChanged { address, .. } => {
                SyncEntity::ProfileName(address.canonical_key())
            }
        }
    }
}

/// How an inbound event relates to this device's own changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Mirrors the latest local change to its entity
    Echo,
    /// Mirrors a local change that a later local change superseded
    Stale,
    /// Made on another device
    Fresh,
}

impl Inbound {
    /// Whether the event should be applied
    pub fn should_apply(self) -> bool {
        self == Inbound::Fresh
    }
}

/// Outbound channel plus echo ledger
pub struct SyncHub {
    sender: mpsc::UnboundedSender<SyncEvent>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<SyncEvent>>>,
    ledger: Mutex<LruCache<SyncEntity, VecDeque<SyncEvent>>>,
}

impl SyncHub {
    /// Create a hub with an untaken outbound receiver
    pub fn new() -> Self {
        Self::with_capacity(LEDGER_ENTITIES)
    }

    /// Create a hub whose echo ledger tracks at most `entities` entities
    pub fn with_capacity(entities: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let capacity = NonZeroUsize::new(entities.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            ledger: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Hand the outbound receiver to the sync collaborator
    ///
    /// Returns `None` after the first call.
    pub fn take_outbound(&self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.receiver.lock().take()
    }

    /// Record committed local events and send them out
    pub fn publish(&self, events: Vec<SyncEvent>) {
        if events.is_empty() {
            return;
        }

        let mut ledger = self.ledger.lock();
        for event in events {
            let entity = event.entity();
            tracing::debug!(entity = ?entity, "Queued outbound sync event");

            let pending = ledger.get_or_insert_mut(entity, VecDeque::new);
            pending.push_back(event.clone());
            if pending.len() > LEDGER_DEPTH {
                pending.pop_front();
            }

            if self.sender.send(event).is_err() {
                tracing::debug!("Sync collaborator dropped the outbound receiver");
            }
        }
    }

    /// Match an inbound event against this device's pending local changes
    ///
    /// Matched changes, and every older change to the same entity, are
    /// consumed. A fresh event clears the entity's entry.
    pub fn classify(&self, event: &SyncEvent) -> Inbound {
        let entity = event.entity();
        let mut ledger = self.ledger.lock();
        let Some(pending) = ledger.get_mut(&entity) else {
            return Inbound::Fresh;
        };

        let Some(index) = pending.iter().position(|local| local == event) else {
            ledger.pop(&entity);
            return Inbound::Fresh;
        };

        let latest = index + 1 == pending.len();
        pending.drain(..=index);
        if pending.is_empty() {
            ledger.pop(&entity);
        }
        if latest {
            Inbound::Echo
        } else {
            Inbound::Stale
        }
    }

    /// Number of entities with unacknowledged local changes
    pub fn pending_entities(&self) -> usize {
        self.ledger.lock().len()
    }
}

impl Default for SyncHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn added(n: u128) -> SyncEvent {
        SyncEvent::WhitelistUserAdded {
            address: Address::from_uuid(Uuid::from_u128(n)),
        }
    }

    fn removed(n: u128) -> SyncEvent {
        SyncEvent::WhitelistUserRemoved {
            address: Address::from_uuid(Uuid::from_u128(n)),
        }
    }

    #[test]
    fn test_publish_delivers_and_records() {
        let hub = SyncHub::new();
        let mut rx = hub.take_outbound().unwrap();
        assert!(hub.take_outbound().is_none());

        hub.publish(vec![added(1)]);

        assert_eq!(rx.try_recv().unwrap(), added(1));
        assert_eq!(hub.classify(&added(2)), Inbound::Fresh);
        assert_eq!(hub.classify(&added(1)), Inbound::Echo);
        assert_eq!(hub.pending_entities(), 0);

        // Seen once, the echo is gone
        assert_eq!(hub.classify(&added(1)), Inbound::Fresh);
    }

    #[test]
    fn test_superseded_change_is_stale() {
        let hub = SyncHub::new();
        hub.publish(vec![added(1)]);
        hub.publish(vec![removed(1)]);

        assert_eq!(hub.classify(&added(1)), Inbound::Stale);
        assert!(!Inbound::Stale.should_apply());
        assert_eq!(hub.classify(&removed(1)), Inbound::Echo);
        assert_eq!(hub.pending_entities(), 0);
    }

    #[test]
    fn test_repeated_changes_are_matched_in_order() {
        let hub = SyncHub::new();
        hub.publish(vec![added(1), removed(1), added(1)]);

        assert_eq!(hub.classify(&added(1)), Inbound::Stale);
        assert_eq!(hub.classify(&removed(1)), Inbound::Stale);
        assert_eq!(hub.classify(&added(1)), Inbound::Echo);
    }

    #[test]
    fn test_fresh_event_clears_entity() {
        let hub = SyncHub::new();
        hub.publish(vec![added(1)]);

        assert_eq!(hub.classify(&removed(1)), Inbound::Fresh);
        assert!(Inbound::Fresh.should_apply());
        assert_eq!(hub.classify(&added(1)), Inbound::Fresh);
    }

    #[test]
    fn test_ledger_is_bounded() {
        let hub = SyncHub::with_capacity(4);
        hub.publish((0..10).map(added).collect());
        assert_eq!(hub.pending_entities(), 4);

        // Oldest entities were evicted
        assert_eq!(hub.classify(&added(0)), Inbound::Fresh);
        assert_eq!(hub.classify(&added(9)), Inbound::Echo);

        let alternating: Vec<_> = (0..20)
            .map(|i| if i % 2 == 0 { added(50) } else { removed(50) })
            .collect();
        hub.publish(alternating);
        let depth = hub
            .ledger
            .lock()
            .peek(&added(50).entity())
            .map(|pending| pending.len());
        assert_eq!(depth, Some(LEDGER_DEPTH));
    }

    #[test]
    fn test_publish_without_receiver_is_harmless() {
        let hub = SyncHub::new();
        drop(hub.take_outbound());
        hub.publish(vec![added(3)]);
        assert_eq!(hub.classify(&added(3)), Inbound::Echo);
    }
}
