//! End-to-end scenarios against the public `ProfileManager` surface:
//!
//! - local profile lifecycle
//! - coalesced and throttled remote fetches
//! - whitelist sync round-trips without echoes
//! - merging a phone-only peer into its UUID record
//! - back-off after a failed fetch

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use profile_core::profiles::{OpenedProfile, ProfileEnvelope};
use profile_core::time::ManualClock;
use profile_core::{
    Address, Error, FetchError, FetchOptions, FetchPhase, FetchSource, ProfileConfig, ProfileKey,
    ProfileManager, ProfileNetwork, SyncEvent, WhitelistEntry,
};

// ---------------------------------------------------------------------------
// Helper: a network that replays queued responses after a fixed delay
// ---------------------------------------------------------------------------

struct QueuedNetwork {
    responses: Mutex<VecDeque<Result<Vec<u8>, FetchError>>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl QueuedNetwork {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    fn push(&self, response: Result<Vec<u8>, FetchError>) {
        self.responses.lock().push_back(response);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProfileNetwork for QueuedNetwork {
    async fn fetch_profile(&self, _address: &Address) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.responses
            .lock()
            .pop_front()
            .unwrap_or(Err(FetchError::NotFound))
    }

    async fn upload_profile(&self, _envelope: Vec<u8>) -> Result<(), FetchError> {
        Ok(())
    }
}

fn local() -> Address {
    Address::from_uuid(Uuid::from_u128(0x10CA1))
}

fn setup(delay: Duration) -> (ProfileManager, Arc<QueuedNetwork>, Arc<ManualClock>) {
    let network = QueuedNetwork::new(delay);
    let clock = Arc::new(ManualClock::new());
    let manager = ProfileManager::with_clock(
        ProfileConfig::default(),
        local(),
        network.clone(),
        clock.clone(),
    )
    .unwrap();
    (manager, network, clock)
}

fn sealed(key: &ProfileKey, given: &str) -> Vec<u8> {
    let profile = OpenedProfile {
        given_name: Some(given.into()),
        uuid_capable: true,
        ..Default::default()
    };
    ProfileEnvelope::seal(key, &profile)
        .unwrap()
        .to_bytes()
        .unwrap()
}

fn known_peer(manager: &ProfileManager, address: &Address) -> ProfileKey {
    let key = ProfileKey::generate();
    manager
        .write(|tx| manager.set_profile_key(key.clone(), address, false, tx))
        .unwrap();
    key
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn fresh_install_local_profile() {
    let (manager, _, _) = setup(Duration::ZERO);
    assert!(!manager.has_local_profile().unwrap());
    assert!(manager.local_full_name().unwrap().is_none());

    manager
        .write(|tx| manager.set_profile_name(Some("Ada".into()), None, &local(), true, tx))
        .unwrap();

    assert!(manager.has_local_profile().unwrap());
    assert!(manager.has_profile_name().unwrap());
    assert_eq!(manager.local_full_name().unwrap().as_deref(), Some("Ada"));
    assert!(manager.local_profile_exists().unwrap());
}

#[tokio::test]
async fn concurrent_fetches_share_one_round_trip() {
    let (manager, network, _) = setup(Duration::from_millis(100));
    let peer = Address::from_uuid(Uuid::from_u128(0x01));
    let key = known_peer(&manager, &peer);
    network.push(Ok(sealed(&key, "Grace")));

    let first = manager.fetch_profile(&peer, FetchOptions::default());
    let second = manager.fetch_profile(&peer, FetchOptions::default());
    assert!(first.same_fetch(&second));

    let mut probe = tokio_test::task::spawn(first.clone());
    tokio_test::assert_pending!(probe.poll());
    drop(probe);
    assert_eq!(manager.fetch_phase(&peer), FetchPhase::InFlight);

    let (a, b) = tokio::join!(first, second);
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.record.given_name.as_deref(), Some("Grace"));
    assert_eq!(network.calls(), 1);
}

#[tokio::test]
async fn cooldown_serves_cached_record() {
    let (manager, network, clock) = setup(Duration::from_millis(10));
    let peer = Address::from_uuid(Uuid::from_u128(0x01));
    let key = known_peer(&manager, &peer);
    network.push(Ok(sealed(&key, "Grace")));
    manager
        .fetch_profile(&peer, FetchOptions::default())
        .await
        .unwrap();

    clock.advance(Duration::from_secs(60));
    let cached = manager
        .fetch_profile(&peer, FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(network.calls(), 1);
    assert_eq!(cached.source, FetchSource::Cache);
    assert_eq!(cached.record.given_name.as_deref(), Some("Grace"));

    network.push(Ok(sealed(&key, "Grace H.")));
    let forced = manager
        .update_profile_for_address_promise(&peer, false, true)
        .await
        .unwrap();
    assert_eq!(network.calls(), 2);
    assert_eq!(forced.source, FetchSource::Network);
    assert!(forced.sequence > cached.sequence);
    assert_eq!(forced.record.given_name.as_deref(), Some("Grace H."));
}

#[test]
fn whitelist_sync_round_trip_has_no_echo() {
    let (manager, _, _) = setup(Duration::ZERO);
    let mut outbound = manager.take_outbound_sync().unwrap();
    let bob = Address::from_uuid(Uuid::from_u128(0xB0B));

    assert!(manager.whitelist_user(&bob).unwrap());
    let event = outbound.try_recv().unwrap();
    assert_eq!(event, SyncEvent::WhitelistUserAdded { address: bob.clone() });
    assert!(outbound.try_recv().is_err());

    assert!(!manager.apply_inbound_sync(event).unwrap());

    let entries = manager.read(|tx| manager.profile_whitelist(tx)).unwrap();
    assert_eq!(entries, vec![WhitelistEntry::User(bob)]);
    assert!(outbound.try_recv().is_err());
}

#[test]
fn merge_moves_phone_record_and_whitelist_to_uuid() {
    let (manager, _, _) = setup(Duration::ZERO);
    let phone = Address::from_phone("+15551234").unwrap();
    let uuid = Address::from_uuid(Uuid::from_u128(0x02));

    manager
        .write(|tx| {
            manager.set_profile_name(Some("Linus".into()), None, &phone, false, tx)?;
            manager.add_user_to_profile_whitelist(&phone, false, tx)
        })
        .unwrap();

    let merged = manager.merge_addresses(&phone, &uuid).unwrap();
    assert_eq!(merged.address.uuid(), uuid.uuid());
    assert_eq!(merged.address.phone_number(), Some("+15551234"));

    let by_uuid = manager.profile_for_address(&uuid).unwrap().unwrap();
    assert_eq!(by_uuid.given_name.as_deref(), Some("Linus"));

    manager
        .read(|tx| {
            assert!(manager.is_user_in_profile_whitelist(&uuid, tx)?);
            assert_eq!(manager.profile_whitelist(tx)?.len(), 1);
            Ok(())
        })
        .unwrap();

    // Merging again changes nothing
    let again = manager.merge_addresses(&uuid, &phone).unwrap();
    assert_eq!(again.address.canonical_key(), merged.address.canonical_key());
}

#[tokio::test]
async fn failed_fetch_backs_off() {
    let (manager, network, _) = setup(Duration::ZERO);
    let peer = Address::from_uuid(Uuid::from_u128(0x03));
    known_peer(&manager, &peer);
    network.push(Err(FetchError::Network("connection reset".into())));

    let first = manager
        .fetch_profile(&peer, FetchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(first, Error::Network(_)));
    assert_eq!(manager.fetch_phase(&peer), FetchPhase::BackingOff);

    let retry = manager
        .fetch_profile(&peer, FetchOptions::default())
        .await
        .unwrap_err();
    assert_eq!(retry, first);
    assert_eq!(network.calls(), 1);
}
