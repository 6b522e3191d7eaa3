//! # Fetch Coordinator
//!
//! Deduplicates, throttles and schedules remote profile fetches.
//!
//! ## Locking
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  every identifier key ──► AliasIndex ──► slot key                      │
//! │  hash(slot key) % SHARDS           ──► Mutex<HashMap<key, Slot>>      │
//! │                                                                         │
//! │  request()   resolve address ──► alias lock: claim key ──► unlock       │
//! │              shard lock ──► store read ──► decide ──► spawn ──► unlock  │
//! │  fetch task  network.await (no lock held)                               │
//! │              shard lock: mark committing ──► unlock                     │
//! │              decrypt + write transaction (synchronous)                  │
//! │              shard lock: Cooling / BackingOff ──► unlock ──► publish    │
//! │  drop(last handle)  shard lock: abort unless committing, restore prior  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! No lock is held across an await. The commit runs without an await
//! point, so a cancellation that races with it always loses. A record
//! served from the store is read under the shard lock, after any commit
//! that `finish` has already reported.

use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};

use super::state::{AliasIndex, InFlight, SharedFetch, Slot, SlotState};
use super::{FetchOptions, FetchPhase, FetchSource, FetchedProfile, ProfileNetwork};
use crate::address::Address;
use crate::config::{FetchConfig, HostEnvironment};
use crate::error::{Error, Result};
use crate::events::ProfileEvent;
use crate::profiles::{ProfileEnvelope, ProfilePatch, ProfileRecord, ProfileStore};
use crate::time::Clock;

/// Number of lock shards for address slots
const SHARD_COUNT: usize = 16;

type Shard = Mutex<HashMap<String, Slot>>;

struct Inner {
    shards: Vec<Shard>,
    aliases: Mutex<AliasIndex>,
    closed: Arc<AtomicBool>,
    store: Arc<ProfileStore>,
    network: Arc<dyn ProfileNetwork>,
    clock: Arc<dyn Clock>,
    config: FetchConfig,
    host: HostEnvironment,
    events: broadcast::Sender<ProfileEvent>,
}

/// Schedules remote profile fetches
pub struct FetchCoordinator {
    inner: Arc<Inner>,
}

impl FetchCoordinator {
    /// Create a coordinator
    pub fn new(
        store: Arc<ProfileStore>,
        network: Arc<dyn ProfileNetwork>,
        clock: Arc<dyn Clock>,
        config: FetchConfig,
        host: HostEnvironment,
        events: broadcast::Sender<ProfileEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
                aliases: Mutex::new(AliasIndex::default()),
                closed: Arc::new(AtomicBool::new(false)),
                store,
                network,
                clock,
                config,
                host,
                events,
            }),
        }
    }

    /// Request the profile for an address
    ///
    /// Must be called within a Tokio runtime when a network fetch may be
    /// needed.
    pub fn request(&self, address: &Address, options: FetchOptions) -> FetchHandle {
        match self.inner.start(address, options) {
            Ok(handle) => handle,
            Err(e) => FetchHandle::ready(Err(e)),
        }
    }

    /// Current phase for an address
    pub fn phase(&self, address: &Address) -> FetchPhase {
        if self.is_closed() {
            return FetchPhase::Closed;
        }
        let address = self.inner.resolve(address);
        let Some(key) = self.inner.aliases.lock().find(&address) else {
            return FetchPhase::Idle;
        };
        let mut shard = self.inner.shard(&key).lock();
        match shard.get_mut(&key) {
            Some(slot) => {
                slot.state.expire(self.inner.clock.now());
                slot.state.phase()
            }
            None => FetchPhase::Idle,
        }
    }

    /// Close the coordinator
    ///
    /// Fetches that have not started committing are aborted and their
    /// subscribers get `Unavailable`, as does every later request.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut aborted = 0;
        for shard in &self.inner.shards {
            let mut shard = shard.lock();
            for slot in shard.values_mut() {
                if let SlotState::InFlight(flight) = &slot.state {
                    if !flight.committing {
                        flight.abort.abort();
                        slot.state = SlotState::Idle;
                        aborted += 1;
                    }
                }
            }
        }
        tracing::info!(aborted, "Profile fetch coordinator closed");
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl Inner {
    fn shard(&self, key: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Widen an address with the identifiers of its stored record
    fn resolve(&self, address: &Address) -> Address {
        match self.store.get_cached(address) {
            Ok(Some(record)) => record
                .address
                .union(address)
                .unwrap_or_else(|_| record.address.clone()),
            _ => address.clone(),
        }
    }

    fn start(self: &Arc<Self>, address: &Address, options: FetchOptions) -> Result<FetchHandle> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Unavailable);
        }

        let address = self.resolve(address);
        let now = self.clock.now();

        let key = self.aliases.lock().claim(&address);

        let mut shard = self.shard(&key).lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Unavailable);
        }
        let slot = shard.entry(key.clone()).or_default();
        slot.state.expire(now);

        // Read under the lock so a Cooling slot's sequence matches the record
        let cached = self.store.get_cached(&address)?;

        if options.main_app_only && self.host == HostEnvironment::Extension {
            tracing::debug!(address = %address, "Main-app-only fetch suppressed in extension");
            return match cached {
                Some(record) => Ok(FetchHandle::ready(Ok(cached_result(record, slot)))),
                None => Err(Error::Suppressed),
            };
        }

        let throttled = match &mut slot.state {
            SlotState::InFlight(flight) => {
                flight.subscribers += 1;
                tracing::trace!(address = %address, subscribers = flight.subscribers, "Joined pending fetch");
                return Ok(FetchHandle::pending(
                    Arc::clone(self),
                    key,
                    flight.sequence,
                    flight.shared.clone(),
                ));
            }
            SlotState::BackingOff { until, error, .. } if now < *until => {
                tracing::debug!(address = %address, "Fetch refused while backing off");
                return Err(error.clone());
            }
            SlotState::Cooling { .. } => !options.ignore_throttling,
            SlotState::Idle => !options.ignore_throttling && self.persisted_cooldown(cached.as_deref()),
            SlotState::BackingOff { .. } => false,
        };

        if throttled {
            if options.require_fresh {
                return Err(Error::Throttled);
            }
            if let Some(record) = cached {
                tracing::trace!(address = %address, "Served profile from store during cooldown");
                return Ok(FetchHandle::ready(Ok(cached_result(record, slot))));
            }
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Internal("profile fetch needs a Tokio runtime".into()))?;

        let prior = std::mem::replace(&mut slot.state, SlotState::Idle);
        let attempt = prior.failed_attempts() + 1;
        slot.next_sequence += 1;
        let sequence = slot.next_sequence;

        let (reply, receiver) = oneshot::channel();
        let closed = Arc::clone(&self.closed);
        let shared: SharedFetch = async move {
            match receiver.await {
                Ok(result) => result,
                Err(_) if closed.load(Ordering::Acquire) => Err(Error::Unavailable),
                Err(_) => Err(Error::Cancelled),
            }
        }
        .boxed()
        .shared();

        let task = runtime.spawn(Arc::clone(self).run(key.clone(), address.clone(), sequence, reply));
        slot.state = SlotState::InFlight(InFlight {
            sequence,
            attempt,
            shared: shared.clone(),
            subscribers: 1,
            committing: false,
            abort: task.abort_handle(),
            prior: Box::new(prior),
        });

        tracing::debug!(address = %address, sequence, attempt, "Started profile fetch");
        Ok(FetchHandle::pending(Arc::clone(self), key, sequence, shared))
    }

    fn persisted_cooldown(&self, record: Option<&ProfileRecord>) -> bool {
        let Some(last_fetch_at) = record.and_then(|r| r.last_fetch_at) else {
            return false;
        };
        let elapsed = self.clock.wall_millis().saturating_sub(last_fetch_at);
        elapsed >= 0 && (elapsed as u128) < self.config.cooldown.as_millis()
    }

    async fn run(
        self: Arc<Self>,
        key: String,
        address: Address,
        sequence: u64,
        reply: oneshot::Sender<Result<Arc<FetchedProfile>>>,
    ) {
        let fetched = self
            .network
            .fetch_profile(&address)
            .await
            .map_err(|e| e.into_error(&address));

        // No await from here on
        {
            let mut shard = self.shard(&key).lock();
            match shard.get_mut(&key).map(|slot| &mut slot.state) {
                Some(SlotState::InFlight(flight)) if flight.sequence == sequence => {
                    flight.committing = true;
                }
                _ => {
                    tracing::debug!(address = %address, sequence, "Fetch superseded before commit");
                    return;
                }
            }
        }

        let result = fetched.and_then(|bytes| self.commit(&address, &bytes, sequence));
        self.finish(&key, &address, sequence, &result);
        let _ = reply.send(result);
    }

    /// Decrypt and persist a fetched envelope
    fn commit(&self, address: &Address, bytes: &[u8], sequence: u64) -> Result<Arc<FetchedProfile>> {
        let envelope = ProfileEnvelope::from_bytes(bytes)?;
        let now = self.clock.wall_millis();

        let record = self.store.write_tx(|tx| {
            let existing = self.store.read(tx, address)?;
            let opened = envelope.open(existing.as_ref().and_then(|r| r.profile_key.as_ref()))?;

            let patch = ProfilePatch::new()
                .name(opened.given_name, opened.family_name)
                .username(opened.username)
                .uuid_capable(opened.uuid_capable)
                .fetched_at(now);
            let patch = match (opened.avatar_url_path, opened.avatar) {
                (None, _) => patch.avatar(None, None),
                (Some(url), Some(blob)) => patch.avatar(Some(url), Some(blob)),
                (Some(url), None) => {
                    let unchanged = existing
                        .as_ref()
                        .and_then(|r| r.avatar_url_path.as_deref())
                        == Some(url.as_str());
                    if unchanged {
                        patch.avatar_url_path(Some(url))
                    } else {
                        // Bytes for the old path no longer apply
                        patch.avatar(Some(url), None)
                    }
                }
            };

            Ok(self.store.write(tx, address, &patch)?.record)
        })?;

        Ok(Arc::new(FetchedProfile {
            record: Arc::new(record),
            sequence,
            source: FetchSource::Network,
        }))
    }

    /// Move the slot out of `InFlight` and notify subscribers
    fn finish(
        &self,
        key: &str,
        address: &Address,
        sequence: u64,
        result: &Result<Arc<FetchedProfile>>,
    ) {
        let now = self.clock.now();
        {
            let mut shard = self.shard(key).lock();
            let Some(slot) = shard.get_mut(key) else {
                return;
            };
            let flight = match std::mem::replace(&mut slot.state, SlotState::Idle) {
                SlotState::InFlight(flight) if flight.sequence == sequence => flight,
                other => {
                    slot.state = other;
                    return;
                }
            };

            slot.state = match result {
                Ok(_) => {
                    slot.last_delivered = sequence;
                    SlotState::Cooling {
                        until: now + self.config.cooldown,
                    }
                }
                Err(e) if e.starts_backoff() => {
                    let window: Duration = self.config.backoff_for(flight.attempt);
                    tracing::warn!(
                        address = %address,
                        attempt = flight.attempt,
                        backoff_secs = window.as_secs(),
                        "Profile fetch failed: {}",
                        e
                    );
                    SlotState::BackingOff {
                        until: now + window,
                        attempt: flight.attempt,
                        error: e.clone(),
                    }
                }
                Err(e) => {
                    tracing::warn!(address = %address, "Profile fetch failed, state restored: {}", e);
                    *flight.prior
                }
            };
        }

        match result {
            Ok(_) => {
                tracing::debug!(address = %address, sequence, "Profile fetch committed");
                let _ = self.events.send(ProfileEvent::ProfileFetched {
                    address: address.clone(),
                    sequence,
                });
            }
            Err(e) => {
                if e.starts_backoff() {
                    self.record_attempt(address);
                }
                let _ = self.events.send(ProfileEvent::FetchFailed {
                    address: address.clone(),
                    error: e.clone(),
                });
            }
        }
    }

    /// Best-effort `last_fetch_attempt_at` update after a failure
    fn record_attempt(&self, address: &Address) {
        let at = self.clock.wall_millis();
        if let Err(e) = self
            .store
            .write_tx(|tx| self.store.record_fetch_attempt(tx, address, at))
        {
            tracing::debug!(address = %address, "Could not record fetch attempt: {}", e);
        }
    }

    fn retain(&self, key: &str, sequence: u64) {
        let mut shard = self.shard(key).lock();
        if let Some(Slot {
            state: SlotState::InFlight(flight),
            ..
        }) = shard.get_mut(key)
        {
            if flight.sequence == sequence {
                flight.subscribers += 1;
            }
        }
    }

    fn release(&self, key: &str, sequence: u64) {
        let mut shard = self.shard(key).lock();
        let Some(slot) = shard.get_mut(key) else {
            return;
        };

        let cancel = match &mut slot.state {
            SlotState::InFlight(flight) if flight.sequence == sequence => {
                flight.subscribers = flight.subscribers.saturating_sub(1);
                flight.subscribers == 0 && !flight.committing
            }
            _ => false,
        };

        if cancel {
            if let SlotState::InFlight(flight) = std::mem::replace(&mut slot.state, SlotState::Idle) {
                flight.abort.abort();
                slot.state = *flight.prior;
                tracing::debug!(key, sequence, "Cancelled profile fetch with no subscribers");
            }
        }
    }
}

fn cached_result(record: Arc<ProfileRecord>, slot: &Slot) -> Arc<FetchedProfile> {
    Arc::new(FetchedProfile {
        record,
        sequence: slot.last_delivered,
        source: FetchSource::Cache,
    })
}

// ============================================================================
// HANDLE
// ============================================================================

enum HandleState {
    Ready(Option<Result<Arc<FetchedProfile>>>),
    Pending {
        inner: Arc<Inner>,
        key: String,
        sequence: u64,
        shared: SharedFetch,
    },
}

/// A subscriber's view of a fetch request
///
/// Resolves to the shared result. Handles for one fetch hand out the same
/// `Arc<FetchedProfile>`. Dropping the last handle before the fetch
/// commits cancels it.
pub struct FetchHandle {
    state: HandleState,
}

impl FetchHandle {
    fn ready(result: Result<Arc<FetchedProfile>>) -> Self {
        Self {
            state: HandleState::Ready(Some(result)),
        }
    }

    fn pending(inner: Arc<Inner>, key: String, sequence: u64, shared: SharedFetch) -> Self {
        Self {
            state: HandleState::Pending {
                inner,
                key,
                sequence,
                shared,
            },
        }
    }

    /// Sequence of the network fetch this handle waits on
    ///
    /// `None` for requests answered without a fetch.
    pub fn sequence(&self) -> Option<u64> {
        match &self.state {
            HandleState::Pending { sequence, .. } => Some(*sequence),
            HandleState::Ready(_) => None,
        }
    }

    /// Whether both handles wait on the same network fetch
    pub fn same_fetch(&self, other: &FetchHandle) -> bool {
        match (&self.state, &other.state) {
            (
                HandleState::Pending {
                    key: a, sequence: x, ..
                },
                HandleState::Pending {
                    key: b, sequence: y, ..
                },
            ) => a == b && x == y,
            _ => false,
        }
    }

    /// Stop waiting; cancels the fetch if this was the last subscriber
    pub fn cancel(self) {
        drop(self);
    }

    /// Let the fetch run to completion without a caller waiting on it
    pub fn detach(self) {
        if matches!(self.state, HandleState::Ready(_)) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = self.await {
                        tracing::debug!("Detached profile fetch failed: {}", e);
                    }
                });
            }
            Err(_) => tracing::warn!("No runtime to drive a detached profile fetch"),
        }
    }
}

impl Clone for FetchHandle {
    fn clone(&self) -> Self {
        match &self.state {
            HandleState::Ready(result) => Self {
                state: HandleState::Ready(result.clone()),
            },
            HandleState::Pending {
                inner,
                key,
                sequence,
                shared,
            } => {
                inner.retain(key, *sequence);
                Self::pending(Arc::clone(inner), key.clone(), *sequence, shared.clone())
            }
        }
    }
}

impl Future for FetchHandle {
    type Output = Result<Arc<FetchedProfile>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            HandleState::Ready(result) => Poll::Ready(
                result
                    .take()
                    .unwrap_or_else(|| Err(Error::Internal("fetch handle polled after completion".into()))),
            ),
            HandleState::Pending { shared, .. } => shared.poll_unpin(cx),
        }
    }
}

impl Drop for FetchHandle {
    fn drop(&mut self) {
        if let HandleState::Pending {
            inner,
            key,
            sequence,
            ..
        } = &self.state
        {
            inner.release(key, *sequence);
        }
    }
}

impl std::fmt::Debug for FetchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.state {
            HandleState::Ready(_) => f.write_str("FetchHandle(ready)"),
            HandleState::Pending { key, sequence, .. } => {
                write!(f, "FetchHandle({} #{})", key, sequence)
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::crypto::ProfileKey;
    use crate::fetch::mock::ScriptedNetwork;
    use crate::fetch::FetchError;
    use crate::profiles::OpenedProfile;
    use crate::storage::Database;
    use crate::sync::SyncHub;
    use crate::time::ManualClock;
    use uuid::Uuid;

    struct Fixture {
        coordinator: FetchCoordinator,
        store: Arc<ProfileStore>,
        network: Arc<ScriptedNetwork>,
        clock: Arc<ManualClock>,
    }

    fn alice() -> Address {
        Address::from_uuid(Uuid::from_u128(1))
    }

    fn envelope(key: &ProfileKey, given: &str) -> Vec<u8> {
        let profile = OpenedProfile {
            given_name: Some(given.into()),
            uuid_capable: true,
            ..Default::default()
        };
        ProfileEnvelope::seal(key, &profile).unwrap().to_bytes().unwrap()
    }

    fn fixture_with(host: HostEnvironment, delay: Duration) -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let (events, _) = broadcast::channel(64);
        let store = Arc::new(ProfileStore::new(
            Arc::new(Database::open(None).unwrap()),
            &CacheConfig::default(),
            Arc::new(SyncHub::new()),
            events.clone(),
            clock.clone(),
        ));

        let key = ProfileKey::generate();
        store
            .write_tx(|tx| {
                store.write(tx, &alice(), &ProfilePatch::new().profile_key(Some(key.clone())))
            })
            .unwrap();

        let network = ScriptedNetwork::new(Ok(envelope(&key, "Ada")), delay);
        let coordinator = FetchCoordinator::new(
            Arc::clone(&store),
            network.clone(),
            clock.clone(),
            FetchConfig::default(),
            host,
            events,
        );
        Fixture {
            coordinator,
            store,
            network,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(HostEnvironment::MainApp, Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_fetch() {
        let f = fixture();
        let a = f.coordinator.request(&alice(), FetchOptions::default());
        let b = f.coordinator.request(&alice(), FetchOptions::default());
        assert!(a.same_fetch(&b));

        let (ra, rb) = tokio::join!(a, b);
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert!(Arc::ptr_eq(&ra, &rb));
        assert_eq!(ra.source, FetchSource::Network);
        assert_eq!(ra.record.given_name.as_deref(), Some("Ada"));
        assert_eq!(f.network.calls(), 1);
        assert_eq!(f.coordinator.phase(&alice()), FetchPhase::Cooling);
    }

    #[tokio::test]
    async fn test_cooldown_serves_store_unless_forced() {
        let f = fixture();
        f.coordinator.request(&alice(), FetchOptions::default()).await.unwrap();

        let cached = f.coordinator.request(&alice(), FetchOptions::default()).await.unwrap();
        assert_eq!(cached.source, FetchSource::Cache);
        assert_eq!(cached.sequence, 1);
        assert_eq!(f.network.calls(), 1);

        let fresh = f
            .coordinator
            .request(
                &alice(),
                FetchOptions {
                    require_fresh: true,
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(fresh, Err(Error::Throttled)));

        let forced = f.coordinator.request(&alice(), FetchOptions::forced()).await.unwrap();
        assert_eq!(forced.source, FetchSource::Network);
        assert_eq!(forced.sequence, 2);
        assert_eq!(f.network.calls(), 2);
    }

    #[tokio::test]
    async fn test_cooldown_ends() {
        let f = fixture();
        f.coordinator.request(&alice(), FetchOptions::default()).await.unwrap();

        f.clock.advance(Duration::from_secs(3601));
        let again = f.coordinator.request(&alice(), FetchOptions::default()).await.unwrap();
        assert_eq!(again.source, FetchSource::Network);
        assert_eq!(f.network.calls(), 2);
    }

    #[tokio::test]
    async fn test_failure_backs_off() {
        let f = fixture();
        f.network.push(Err(FetchError::Network("reset".into())));

        let first = f.coordinator.request(&alice(), FetchOptions::default()).await;
        assert!(matches!(first, Err(Error::Network(_))));
        assert_eq!(f.coordinator.phase(&alice()), FetchPhase::BackingOff);

        let second = f.coordinator.request(&alice(), FetchOptions::default()).await;
        assert_eq!(second.unwrap_err(), first.unwrap_err());
        assert_eq!(f.network.calls(), 1);

        let record = f.store.get_cached(&alice()).unwrap().unwrap();
        assert!(record.last_fetch_attempt_at.is_some());
        assert!(record.last_fetch_at.is_none());

        f.clock.advance(Duration::from_secs(31));
        let third = f.coordinator.request(&alice(), FetchOptions::default()).await;
        assert!(third.is_ok());
        assert_eq!(f.network.calls(), 2);
    }

    #[tokio::test]
    async fn test_backoff_grows_per_attempt() {
        let f = fixture();
        f.network.set_fallback(Err(FetchError::Timeout("10s".into())));

        f.coordinator.request(&alice(), FetchOptions::default()).await.unwrap_err();
        f.clock.advance(Duration::from_secs(31));
        f.coordinator.request(&alice(), FetchOptions::default()).await.unwrap_err();
        assert_eq!(f.network.calls(), 2);

        // Second window is 60s
        f.clock.advance(Duration::from_secs(31));
        f.coordinator.request(&alice(), FetchOptions::default()).await.unwrap_err();
        assert_eq!(f.network.calls(), 2);

        f.clock.advance(Duration::from_secs(30));
        f.coordinator.request(&alice(), FetchOptions::default()).await.unwrap_err();
        assert_eq!(f.network.calls(), 3);
    }

    #[tokio::test]
    async fn test_decrypt_failure_leaves_store_untouched() {
        let f = fixture();
        f.network.push(Ok(envelope(&ProfileKey::generate(), "Mallory")));

        let result = f.coordinator.request(&alice(), FetchOptions::default()).await;
        assert!(matches!(result, Err(Error::DecryptFailure(_))));

        let record = f.store.get_cached(&alice()).unwrap().unwrap();
        assert!(record.given_name.is_none());
        assert_eq!(f.coordinator.phase(&alice()), FetchPhase::BackingOff);
    }

    #[tokio::test]
    async fn test_main_app_only_in_extension() {
        let f = fixture_with(HostEnvironment::Extension, Duration::ZERO);
        let options = FetchOptions {
            main_app_only: true,
            ..Default::default()
        };

        let stored = f.coordinator.request(&alice(), options).await.unwrap();
        assert_eq!(stored.source, FetchSource::Cache);

        let unknown = Address::from_uuid(Uuid::from_u128(99));
        let result = f.coordinator.request(&unknown, options).await;
        assert!(matches!(result, Err(Error::Suppressed)));
        assert_eq!(f.network.calls(), 0);
    }

    #[tokio::test]
    async fn test_dropping_last_handle_cancels() {
        let f = fixture_with(HostEnvironment::MainApp, Duration::from_millis(200));
        let a = f.coordinator.request(&alice(), FetchOptions::default());
        let b = a.clone();
        assert_eq!(f.coordinator.phase(&alice()), FetchPhase::InFlight);

        drop(a);
        assert_eq!(f.coordinator.phase(&alice()), FetchPhase::InFlight);

        b.cancel();
        assert_eq!(f.coordinator.phase(&alice()), FetchPhase::Idle);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let record = f.store.get_cached(&alice()).unwrap().unwrap();
        assert!(record.given_name.is_none());
    }

    #[tokio::test]
    async fn test_detached_fetch_completes() {
        let f = fixture();
        let mut events = f.store_events();
        f.coordinator.request(&alice(), FetchOptions::default()).detach();

        loop {
            match events.recv().await.unwrap() {
                ProfileEvent::ProfileFetched { sequence, .. } => {
                    assert_eq!(sequence, 1);
                    break;
                }
                _ => continue,
            }
        }
        assert_eq!(f.coordinator.phase(&alice()), FetchPhase::Cooling);
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_future_requests() {
        let f = fixture_with(HostEnvironment::MainApp, Duration::from_millis(200));
        let pending = f.coordinator.request(&alice(), FetchOptions::default());

        f.coordinator.close();

        assert!(matches!(pending.await, Err(Error::Unavailable)));
        let later = f.coordinator.request(&alice(), FetchOptions::default()).await;
        assert!(matches!(later, Err(Error::Unavailable)));
        assert_eq!(f.coordinator.phase(&alice()), FetchPhase::Closed);
    }

    #[tokio::test]
    async fn test_persisted_cooldown_survives_restart() {
        let f = fixture();
        f.coordinator.request(&alice(), FetchOptions::default()).await.unwrap();

        // A new coordinator over the same store has no slots yet
        let (events, _) = broadcast::channel(8);
        let restarted = FetchCoordinator::new(
            Arc::clone(&f.store),
            f.network.clone(),
            f.clock.clone(),
            FetchConfig::default(),
            HostEnvironment::MainApp,
            events,
        );
        let result = restarted.request(&alice(), FetchOptions::default()).await.unwrap();
        assert_eq!(result.source, FetchSource::Cache);
        assert_eq!(f.network.calls(), 1);
    }

    #[tokio::test]
    async fn test_phone_and_uuid_requests_share_one_fetch() {
        let f = fixture_with(HostEnvironment::MainApp, Duration::from_millis(50));
        f.network.push(Err(FetchError::NotFound));
        let phone = Address::from_phone("+15551234").unwrap();
        let both = Address::new(Some(Uuid::from_u128(7)), Some("+15551234".into())).unwrap();

        let a = f.coordinator.request(&phone, FetchOptions::default());
        let b = f.coordinator.request(&both, FetchOptions::default());
        assert!(a.same_fetch(&b));
        assert_eq!(
            f.coordinator.phase(&Address::from_uuid(Uuid::from_u128(7))),
            FetchPhase::InFlight
        );

        let (ra, rb) = tokio::join!(a, b);
        assert_eq!(ra.unwrap_err(), rb.unwrap_err());
        assert_eq!(f.network.calls(), 1);
        assert_eq!(f.coordinator.phase(&both), FetchPhase::BackingOff);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_tasks_one_fetch_and_consistent_cache_hits() {
        let f = fixture_with(HostEnvironment::MainApp, Duration::from_millis(20));
        let coordinator = Arc::new(f.coordinator);

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move {
                    loop {
                        let fetched = coordinator
                            .request(&alice(), FetchOptions::default())
                            .await
                            .unwrap();
                        // A result labelled with fetch 1 carries fetch 1's record
                        assert_eq!(fetched.sequence, 1);
                        assert_eq!(fetched.record.given_name.as_deref(), Some("Ada"));
                        if fetched.source == FetchSource::Cache {
                            return;
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(f.network.calls(), 1);
        assert_eq!(coordinator.phase(&alice()), FetchPhase::Cooling);
    }

    #[tokio::test]
    async fn test_cancel_after_commit_started_keeps_result() {
        let f = fixture_with(HostEnvironment::MainApp, Duration::from_millis(20));
        let mut events = f.store_events();
        let handle = f.coordinator.request(&alice(), FetchOptions::default());

        // The network has answered and the commit began
        {
            let key = f.coordinator.inner.aliases.lock().find(&alice()).unwrap();
            let mut shard = f.coordinator.inner.shard(&key).lock();
            match shard.get_mut(&key).map(|slot| &mut slot.state) {
                Some(SlotState::InFlight(flight)) => flight.committing = true,
                _ => panic!("fetch should be in flight"),
            }
        }
        drop(handle);
        assert_eq!(f.coordinator.phase(&alice()), FetchPhase::InFlight);

        let fetched = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let ProfileEvent::ProfileFetched { sequence, .. } = events.recv().await.unwrap() {
                    return sequence;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(fetched, 1);

        let record = f.store.get_cached(&alice()).unwrap().unwrap();
        assert_eq!(record.given_name.as_deref(), Some("Ada"));
        assert_eq!(f.coordinator.phase(&alice()), FetchPhase::Cooling);
    }

    impl Fixture {
        fn store_events(&self) -> broadcast::Receiver<ProfileEvent> {
            self.coordinator.inner.events.subscribe()
        }
    }
}
