//! Notifications from the core back to its owner.

use crate::address::Address;
use crate::error::Error;

/// Something observable happened
#[derive(Debug, Clone)]
pub enum ProfileEvent {
    /// Profile rows with these identifier keys were committed
    RecordsChanged {
        /// Identifier keys (`uuid:…` / `e164:…`) of every row touched
        keys: Vec<String>,
    },
    /// The profile whitelist was committed with changes
    WhitelistChanged,
    /// A remote fetch committed
    ProfileFetched {
        /// Whose profile
        address: Address,
        /// Per-address fetch sequence number
        sequence: u64,
    },
    /// A remote fetch failed
    FetchFailed {
        /// Whose profile
        address: Address,
        /// Why
        error: Error,
    },
}
