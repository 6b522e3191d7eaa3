//! Per-address fetch slots.

use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::AbortHandle;

use super::FetchedProfile;
use crate::address::Address;
use crate::error::{Error, Result};

/// The result every subscriber of one fetch shares
pub(crate) type SharedFetch = Shared<BoxFuture<'static, Result<Arc<FetchedProfile>>>>;

/// Observable phase of an address's slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPhase {
    /// Nothing pending and no window open
    Idle,
    /// A network fetch is running
    InFlight,
    /// A recent fetch succeeded; requests are served from the store
    Cooling,
    /// A recent fetch failed; requests get the recorded failure
    BackingOff,
    /// The coordinator has been closed
    Closed,
}

pub(crate) struct InFlight {
    pub(crate) sequence: u64,
    pub(crate) attempt: u32,
    pub(crate) shared: SharedFetch,
    pub(crate) subscribers: usize,
    /// Set once the network returned and the commit began; no abort after this
    pub(crate) committing: bool,
    pub(crate) abort: AbortHandle,
    /// State to restore if the fetch is cancelled or fails without back-off
    pub(crate) prior: Box<SlotState>,
}

pub(crate) enum SlotState {
    Idle,
    InFlight(InFlight),
    Cooling { until: Instant },
    BackingOff { until: Instant, attempt: u32, error: Error },
}

impl SlotState {
    pub(crate) fn phase(&self) -> FetchPhase {
        match self {
            SlotState::Idle => FetchPhase::Idle,
            SlotState::InFlight(_) => FetchPhase::InFlight,
            SlotState::Cooling { .. } => FetchPhase::Cooling,
            SlotState::BackingOff { .. } => FetchPhase::BackingOff,
        }
    }

    /// Collapse windows that have already passed
    pub(crate) fn expire(&mut self, now: Instant) {
        if let SlotState::Cooling { until } = self {
            if now >= *until {
                *self = SlotState::Idle;
            }
        }
    }

    /// Failed attempts so far in the current back-off run
    pub(crate) fn failed_attempts(&self) -> u32 {
        match self {
            SlotState::BackingOff { attempt, .. } => *attempt,
            _ => 0,
        }
    }
}

/// One address's slot
pub(crate) struct Slot {
    pub(crate) state: SlotState,
    /// Last sequence number handed out
    pub(crate) next_sequence: u64,
    /// Sequence of the last fetch that committed
    pub(crate) last_delivered: u64,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            state: SlotState::Idle,
            next_sequence: 0,
            last_delivered: 0,
        }
    }
}

/// Maps every identifier key of an address to the key of its slot
///
/// A slot is keyed by the canonical key of the first address that used it.
/// Each identifier seen with that address points back at it, so a
/// phone-only request and a later UUID-and-phone request share one slot.
#[derive(Default)]
pub(crate) struct AliasIndex {
    slot_keys: HashMap<String, String>,
}

impl AliasIndex {
    /// Key of the slot already serving any identifier of `address`
    ///
    /// The UUID alias wins when identifiers point at different slots.
    pub(crate) fn find(&self, address: &Address) -> Option<String> {
        address
            .identifier_keys()
            .iter()
            .find_map(|id| self.slot_keys.get(id).cloned())
    }

    /// Slot key for `address`, aliasing every identifier it carries
    pub(crate) fn claim(&mut self, address: &Address) -> String {
        let key = self.find(address).unwrap_or_else(|| address.canonical_key());
        for id in address.identifier_keys() {
            self.slot_keys.insert(id, key.clone());
        }
        key
    }
}
