//! # Profile Fetching
//!
//! Remote profile fetches, deduplicated and throttled per address.
//!
//! ## Per-Address State Machine
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   Idle ──request──▶ InFlight ──ok───▶ Cooling (until now + cooldown)    │
//! │                        │                                                │
//! │                        └──err──▶ BackingOff (until now + backoff(n))    │
//! │                                                                         │
//! │   InFlight   ──request──▶ InFlight      (joins the pending fetch)       │
//! │   Cooling    ──request──▶ Cooling       (served from the store)         │
//! │   Cooling    ──request, ignore_throttling──▶ InFlight                   │
//! │   BackingOff ──request──▶ InFlight once the window has passed,          │
//! │                           otherwise the recorded failure                │
//! │                                                                         │
//! │   close() ──▶ every request fails with Unavailable                      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Concurrent requests for one address share a single [`FetchHandle`]
//! result. When the last handle is dropped before the fetch started
//! committing, the network request is aborted and the slot goes back to
//! its previous state.

mod coordinator;
mod state;

pub use coordinator::{FetchCoordinator, FetchHandle};
pub use state::FetchPhase;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::address::Address;
use crate::error::Error;
use crate::profiles::ProfileRecord;

pub use crate::config::HostEnvironment;

/// Failure reported by the network collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The service has no profile for the address
    #[error("Profile not found on the service")]
    NotFound,

    /// The request timed out
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Any other transport failure
    #[error("Network error: {0}")]
    Network(String),
}

impl FetchError {
    /// Convert into a crate error for the given address
    pub fn into_error(self, address: &Address) -> Error {
        match self {
            FetchError::NotFound => Error::NotFound(address.to_string()),
            FetchError::Timeout(msg) => Error::Timeout(msg),
            FetchError::Network(msg) => Error::Network(msg),
        }
    }
}

impl From<FetchError> for Error {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::NotFound => Error::NotFound("remote profile".into()),
            FetchError::Timeout(msg) => Error::Timeout(msg),
            FetchError::Network(msg) => Error::Network(msg),
        }
    }
}

/// The service that stores encrypted profiles
///
/// Timeouts and transport retries live below this trait.
#[async_trait]
pub trait ProfileNetwork: Send + Sync {
    /// Download the encrypted profile envelope for an address
    async fn fetch_profile(&self, address: &Address) -> Result<Vec<u8>, FetchError>;

    /// Upload the local user's encrypted profile envelope
    async fn upload_profile(&self, envelope: Vec<u8>) -> Result<(), FetchError>;
}

/// How a fetch request should be treated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Drop the request when running in a background extension
    pub main_app_only: bool,
    /// Fetch even inside the cooldown window
    pub ignore_throttling: bool,
    /// Fail with `Throttled` instead of serving the stored record
    pub require_fresh: bool,
}

impl FetchOptions {
    /// Options for a fetch that bypasses the cooldown
    pub fn forced() -> Self {
        Self {
            ignore_throttling: true,
            ..Self::default()
        }
    }
}

/// Where a fetch result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    /// A network round-trip that committed
    Network,
    /// The stored record, served without a round-trip
    Cache,
}

/// Outcome of a successful fetch request
#[derive(Debug, Clone)]
pub struct FetchedProfile {
    /// The profile as stored after the request
    pub record: Arc<ProfileRecord>,
    /// Sequence number of the network fetch this result reflects
    pub sequence: u64,
    /// Whether the network was contacted
    pub source: FetchSource,
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Network double with scripted responses and a call counter
    pub(crate) struct ScriptedNetwork {
        responses: Mutex<VecDeque<Result<Vec<u8>, FetchError>>>,
        fallback: Mutex<Result<Vec<u8>, FetchError>>,
        delay: Duration,
        calls: AtomicUsize,
        pub(crate) uploads: Mutex<Vec<Vec<u8>>>,
    }

    impl ScriptedNetwork {
        pub(crate) fn new(fallback: Result<Vec<u8>, FetchError>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(fallback),
                delay,
                calls: AtomicUsize::new(0),
                uploads: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn push(&self, response: Result<Vec<u8>, FetchError>) {
            self.responses.lock().push_back(response);
        }

        pub(crate) fn set_fallback(&self, response: Result<Vec<u8>, FetchError>) {
            *self.fallback.lock() = response;
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProfileNetwork for ScriptedNetwork {
        async fn fetch_profile(&self, _address: &Address) -> Result<Vec<u8>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let scripted = self.responses.lock().pop_front();
            scripted.unwrap_or_else(|| self.fallback.lock().clone())
        }

        async fn upload_profile(&self, envelope: Vec<u8>) -> Result<(), FetchError> {
            self.uploads.lock().push(envelope);
            Ok(())
        }
    }
}
